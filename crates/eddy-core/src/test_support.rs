//! Shared helpers for unit and integration tests.

use crate::frame_sorter::ReleaseHandle;
use crate::rtt::RttProvider;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// RTT source that always reports the same smoothed value.
pub struct StaticRtt(pub Duration);

impl RttProvider for StaticRtt {
    fn smoothed_rtt(&self) -> Duration {
        self.0
    }
}

/// RTT source with no estimate yet (smoothed RTT of zero).
pub struct NoRtt;

impl RttProvider for NoRtt {
    fn smoothed_rtt(&self) -> Duration {
        Duration::ZERO
    }
}

/// Counts release-handle firings so tests can assert the exactly-once
/// contract: handles issued minus handles fired must equal the number of
/// payloads still referenced somewhere.
#[derive(Clone, Default)]
pub struct ReleaseCounter {
    issued: Arc<AtomicUsize>,
    fired: Arc<AtomicUsize>,
}

impl ReleaseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ReleaseHandle {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let fired = Arc::clone(&self.fired);
        ReleaseHandle::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.issued() - self.fired()
    }
}
