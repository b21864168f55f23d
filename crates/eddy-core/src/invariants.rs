use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::error;

/// Rate-limits invariant reports so a violated invariant on the per-packet
/// hot path cannot flood the log. Under `cfg(test)` or the
/// `invariant-panic` feature a report is always a panic.
pub struct InvariantReporter {
    interval_us: u64,
    last_log_at: AtomicU64,
}

impl InvariantReporter {
    pub const fn new(interval_us: u64) -> Self {
        Self {
            interval_us,
            last_log_at: AtomicU64::new(0),
        }
    }

    fn should_log(&self, now_us: u64) -> bool {
        loop {
            let last = self.last_log_at.load(Ordering::Relaxed);
            if now_us.saturating_sub(last) < self.interval_us && last != 0 {
                return false;
            }
            if self
                .last_log_at
                .compare_exchange(last, now_us.max(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn report<M, F>(&self, message: M, log: F)
    where
        M: FnOnce() -> String,
        F: FnOnce(&str),
    {
        let message = message();
        if self.should_log(monotonic_micros()) {
            log(&message);
        }
        #[cfg(any(test, feature = "invariant-panic"))]
        panic!("{}", message);
    }
}

/// Microseconds on a process-local monotonic clock.
fn monotonic_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_micros() as u64
}

static INVARIANT_REPORTER: InvariantReporter = InvariantReporter::new(1_000_000);

pub(crate) fn report_invariant<F>(message: F)
where
    F: FnOnce() -> String,
{
    INVARIANT_REPORTER.report(message, |msg| error!("{}", msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "boom")]
    fn report_panics_in_test_builds() {
        let reporter = InvariantReporter::new(1_000_000);
        reporter.report(|| "boom".to_string(), |_| {});
    }
}
