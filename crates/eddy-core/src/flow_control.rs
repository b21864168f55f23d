use crate::limits::{WindowConfig, WINDOW_UPDATE_THRESHOLD};
use crate::rtt::RttProvider;
use crate::types::ByteCount;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Connection-level veto on per-stream receive window growth. Receives
/// the proposed size delta and returns whether the increase may happen.
pub type WindowIncreaseGate = Box<dyn Fn(ByteCount) -> bool + Send + Sync>;

/// Tracks send and receive windows for one stream (or for the connection
/// as a whole) and auto-tunes the receive window against the RTT.
///
/// Send-side state is owned by the send path and unsynchronized. The
/// receive side sits behind a mutex: the stream-local reader and the
/// connection-level aggregator both account delivered bytes.
pub struct FlowController {
    // Send side.
    bytes_sent: ByteCount,
    send_window: ByteCount,
    last_blocked_at: ByteCount,

    // Receive side.
    recv: Mutex<ReceiveState>,
    rtt: Arc<dyn RttProvider>,
    allow_window_increase: Option<WindowIncreaseGate>,
}

struct ReceiveState {
    /// Bytes delivered to the application.
    bytes_read: ByteCount,
    /// Highest end offset observed from the peer.
    highest_received: ByteCount,
    /// The absolute receive ceiling we have advertised.
    receive_window: ByteCount,
    receive_window_size: ByteCount,
    max_receive_window_size: ByteCount,
    epoch_start_time: Option<Instant>,
    epoch_start_offset: ByteCount,
}

impl FlowController {
    pub fn new(config: WindowConfig, rtt: Arc<dyn RttProvider>) -> Self {
        Self {
            bytes_sent: 0,
            send_window: config.initial_send_window,
            last_blocked_at: 0,
            recv: Mutex::new(ReceiveState {
                bytes_read: 0,
                highest_received: 0,
                receive_window: config.initial_receive_window_size,
                receive_window_size: config.initial_receive_window_size,
                max_receive_window_size: config.max_receive_window_size,
                epoch_start_time: None,
                epoch_start_offset: 0,
            }),
            rtt,
            allow_window_increase: None,
        }
    }

    /// Installs the connection-level gate consulted before the receive
    /// window is allowed to grow.
    pub fn with_window_increase_gate(
        mut self,
        gate: impl Fn(ByteCount) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.allow_window_increase = Some(Box::new(gate));
        self
    }

    pub fn add_bytes_sent(&mut self, n: ByteCount) {
        self.bytes_sent = self.bytes_sent.saturating_add(n);
    }

    /// Called when the peer raises its advertised limit. Idempotent;
    /// stale offsets never shrink the window.
    pub fn update_send_window(&mut self, offset: ByteCount) {
        if offset > self.send_window {
            self.send_window = offset;
        }
    }

    pub fn send_window_size(&self) -> ByteCount {
        // Data can be queued before the peer's transport parameters
        // arrive; until then the send window is behind what was sent.
        if self.bytes_sent > self.send_window {
            return 0;
        }
        self.send_window - self.bytes_sent
    }

    /// Reports window exhaustion at most once per distinct send window:
    /// the first call after the window empties returns the blocked
    /// offset, later calls return `None` until the peer raises the limit.
    pub fn is_newly_blocked(&mut self) -> Option<ByteCount> {
        if self.send_window_size() != 0 || self.send_window == self.last_blocked_at {
            return None;
        }
        self.last_blocked_at = self.send_window;
        debug!("send blocked: offset={}", self.send_window);
        Some(self.send_window)
    }

    /// Accounts bytes delivered to the application. The first delivered
    /// byte starts the auto-tuning epoch, as if a window update had just
    /// been sent.
    pub fn add_bytes_read(&self, n: ByteCount, now: Instant) {
        let mut recv = self.recv.lock();
        if recv.bytes_read == 0 {
            recv.start_epoch(now);
        }
        recv.bytes_read = recv.bytes_read.saturating_add(n);
    }

    /// True once enough of the advertised window has been consumed that
    /// an update is worth sending to the peer.
    pub fn has_window_update(&self) -> bool {
        self.recv.lock().has_window_update()
    }

    /// Advances the receive window if an update is due and returns the
    /// new absolute ceiling. Returned offsets are strictly increasing.
    pub fn get_window_update(&self, now: Instant) -> Option<ByteCount> {
        let mut recv = self.recv.lock();
        if !recv.has_window_update() {
            return None;
        }
        recv.maybe_adjust_window_size(
            now,
            self.rtt.as_ref(),
            self.allow_window_increase.as_deref(),
        );
        recv.receive_window = recv.bytes_read.saturating_add(recv.receive_window_size);
        debug!(
            "window update: offset={} window_size={}",
            recv.receive_window, recv.receive_window_size
        );
        Some(recv.receive_window)
    }

    /// Records the highest end offset seen from the peer. Monotonic.
    pub fn update_highest_received(&self, offset: ByteCount) {
        let mut recv = self.recv.lock();
        if offset > recv.highest_received {
            recv.highest_received = offset;
        }
    }

    /// True if the peer wrote past the ceiling we advertised. The caller
    /// must terminate the connection.
    pub fn check_flow_control_violation(&self) -> bool {
        let recv = self.recv.lock();
        if recv.highest_received > recv.receive_window {
            warn!(
                "flow control violated: highest_received={} receive_window={}",
                recv.highest_received, recv.receive_window
            );
            return true;
        }
        false
    }

    pub fn receive_window_size(&self) -> ByteCount {
        self.recv.lock().receive_window_size
    }
}

impl ReceiveState {
    fn has_window_update(&self) -> bool {
        let bytes_remaining = self.receive_window - self.bytes_read;
        let threshold =
            (self.receive_window_size as f64 * (1.0 - WINDOW_UPDATE_THRESHOLD)) as ByteCount;
        bytes_remaining <= threshold
    }

    /// Grows the window when updates are being consumed faster than one
    /// would replenish within a small multiple of the RTT. Always starts
    /// a new measurement epoch afterwards.
    fn maybe_adjust_window_size(
        &mut self,
        now: Instant,
        rtt: &dyn RttProvider,
        allow_increase: Option<&(dyn Fn(ByteCount) -> bool + Send + Sync)>,
    ) {
        let read_in_epoch = self.bytes_read - self.epoch_start_offset;
        if read_in_epoch <= self.receive_window_size / 2 {
            return;
        }
        let rtt = rtt.smoothed_rtt();
        if rtt.is_zero() {
            return;
        }
        let Some(epoch_start) = self.epoch_start_time else {
            self.start_epoch(now);
            return;
        };

        let fraction = read_in_epoch as f64 / self.receive_window_size as f64;
        if now.duration_since(epoch_start) < rtt.mul_f64(4.0 * fraction) {
            // The window empties too fast; try to double it.
            let new_size = self
                .receive_window_size
                .saturating_mul(2)
                .min(self.max_receive_window_size);
            if new_size > self.receive_window_size
                && allow_increase.is_none_or(|allow| allow(new_size - self.receive_window_size))
            {
                debug!(
                    "auto-tuning receive window: {} -> {}",
                    self.receive_window_size, new_size
                );
                self.receive_window_size = new_size;
            }
        }
        self.start_epoch(now);
    }

    fn start_epoch(&mut self, now: Instant) {
        self.epoch_start_time = Some(now);
        self.epoch_start_offset = self.bytes_read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoRtt, StaticRtt};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn config(initial_size: ByteCount, max_size: ByteCount) -> WindowConfig {
        WindowConfig {
            initial_send_window: 0,
            initial_receive_window_size: initial_size,
            max_receive_window_size: max_size,
        }
    }

    fn controller(initial_size: ByteCount, max_size: ByteCount) -> FlowController {
        FlowController::new(
            config(initial_size, max_size),
            Arc::new(StaticRtt(Duration::from_millis(100))),
        )
    }

    #[test]
    fn send_window_is_empty_during_handshake() {
        let mut fc = controller(100, 400);
        assert_eq!(fc.send_window_size(), 0);
        fc.add_bytes_sent(10);
        assert_eq!(fc.send_window_size(), 0);
    }

    #[test]
    fn update_send_window_is_monotonic() {
        let mut fc = controller(100, 400);
        fc.update_send_window(1000);
        assert_eq!(fc.send_window_size(), 1000);
        fc.update_send_window(500);
        assert_eq!(fc.send_window_size(), 1000);
    }

    #[test]
    fn blocked_is_reported_once_per_send_window() {
        let mut fc = controller(100, 400);
        fc.update_send_window(1000);
        fc.add_bytes_sent(1000);
        assert_eq!(fc.is_newly_blocked(), Some(1000));
        assert_eq!(fc.is_newly_blocked(), None);

        fc.update_send_window(2000);
        assert_eq!(fc.is_newly_blocked(), None, "window no longer exhausted");
        fc.add_bytes_sent(1000);
        assert_eq!(fc.is_newly_blocked(), Some(2000));
        assert_eq!(fc.is_newly_blocked(), None);
    }

    #[test]
    fn no_window_update_below_threshold() {
        let fc = controller(100, 400);
        fc.add_bytes_read(24, Instant::now());
        assert!(!fc.has_window_update());
        assert_eq!(fc.get_window_update(Instant::now()), None);
    }

    #[test]
    fn window_update_advances_the_ceiling() {
        let fc = FlowController::new(config(100, 400), Arc::new(NoRtt));
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        assert!(fc.has_window_update());
        // No RTT estimate yet, so the size must not change.
        assert_eq!(fc.get_window_update(t0), Some(176));
        assert_eq!(fc.receive_window_size(), 100);
    }

    #[test]
    fn window_doubles_when_consumed_faster_than_rtt_allows() {
        let fc = controller(100, 400);
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        // 76% of the window in 10ms, far below 4 * 0.76 * 100ms.
        let update = fc.get_window_update(t0 + Duration::from_millis(10));
        assert_eq!(update, Some(76 + 200));
        assert_eq!(fc.receive_window_size(), 200);
    }

    #[test]
    fn window_growth_respects_the_cap() {
        let fc = controller(100, 150);
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        let update = fc.get_window_update(t0 + Duration::from_millis(10));
        assert_eq!(update, Some(76 + 150));
        assert_eq!(fc.receive_window_size(), 150);
    }

    #[test]
    fn slow_consumption_leaves_the_window_size_alone() {
        let fc = controller(100, 400);
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        // 4 * 0.76 * 100ms = 304ms; consuming slower than that is fine.
        let update = fc.get_window_update(t0 + Duration::from_millis(400));
        assert_eq!(update, Some(176));
        assert_eq!(fc.receive_window_size(), 100);
    }

    #[test]
    fn no_auto_tune_below_half_window_consumed() {
        let fc = controller(100, 400);
        let t0 = Instant::now();
        fc.add_bytes_read(25, t0);
        let update = fc.get_window_update(t0 + Duration::from_millis(1));
        assert_eq!(update, Some(125));
        assert_eq!(fc.receive_window_size(), 100);
    }

    #[test]
    fn gate_can_veto_window_growth() {
        let seen_delta = Arc::new(AtomicU64::new(0));
        let recorded = Arc::clone(&seen_delta);
        let fc = FlowController::new(
            config(100, 400),
            Arc::new(StaticRtt(Duration::from_millis(100))),
        )
        .with_window_increase_gate(move |delta| {
            recorded.store(delta, Ordering::SeqCst);
            false
        });
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        let update = fc.get_window_update(t0 + Duration::from_millis(10));
        assert_eq!(update, Some(176));
        assert_eq!(fc.receive_window_size(), 100);
        assert_eq!(seen_delta.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn window_updates_are_strictly_increasing() {
        let fc = FlowController::new(config(100, 400), Arc::new(NoRtt));
        let t0 = Instant::now();
        let mut last = 0;
        let mut read_total = 0;
        for _ in 0..10 {
            fc.add_bytes_read(80, t0);
            read_total += 80;
            let update = fc
                .get_window_update(t0)
                .expect("80% consumed must trigger an update");
            assert!(update > last, "updates must advance: {update} <= {last}");
            assert_eq!(update, read_total + 100);
            last = update;
            assert_eq!(fc.get_window_update(t0), None, "no duplicate update");
        }
    }

    #[test]
    fn violation_check_fires_past_the_advertised_ceiling() {
        let fc = controller(100, 400);
        fc.update_highest_received(100);
        assert!(!fc.check_flow_control_violation());
        fc.update_highest_received(101);
        assert!(fc.check_flow_control_violation());
        // Monotonic: a lower offset cannot clear the violation.
        fc.update_highest_received(50);
        assert!(fc.check_flow_control_violation());
    }

    #[test]
    fn epoch_restarts_after_each_adjustment() {
        let fc = controller(100, 400);
        let t0 = Instant::now();
        fc.add_bytes_read(76, t0);
        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(fc.get_window_update(t1), Some(76 + 200));

        // 100 more bytes read in the new epoch: not above half of the
        // doubled window, so no further growth.
        fc.add_bytes_read(100, t1);
        let t2 = t1 + Duration::from_millis(10);
        assert_eq!(fc.get_window_update(t2), Some(176 + 200));
        assert_eq!(fc.receive_window_size(), 200);
    }
}
