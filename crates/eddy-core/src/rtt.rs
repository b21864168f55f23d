use std::time::Duration;

/// Round-trip estimate consumed by receive-window auto-tuning.
///
/// The estimator itself lives in the enclosing transport; the flow
/// controller only ever asks for the current smoothed value.
pub trait RttProvider: Send + Sync {
    /// Current smoothed RTT. A zero duration means no estimate exists
    /// yet, and auto-tuning stays inactive.
    fn smoothed_rtt(&self) -> Duration;
}
