use crate::types::ByteCount;
use std::sync::OnceLock;

/// Gap-list length at which reassembly gives up and the connection must
/// be closed. A peer that sends pathologically fragmented data grows the
/// gap list; bounding it bounds both memory and per-push scan work.
const DEFAULT_MAX_SORTER_GAPS: usize = 64;

/// Cut segments shorter than this are copied into a tight buffer so the
/// (possibly much larger) source allocation can be released.
pub const MIN_FRAME_BUFFER_SIZE: usize = 128;

/// Fraction of the receive window that must be consumed before a window
/// update is emitted (0.25 consumed-threshold; equivalently an update is
/// due once remaining capacity drops to 75% of the window or less).
pub const WINDOW_UPDATE_THRESHOLD: f64 = 0.25;

const DEFAULT_INITIAL_RECEIVE_WINDOW_SIZE: ByteCount = 512 * 1024;
const DEFAULT_MAX_RECEIVE_WINDOW_SIZE: ByteCount = 6 * 1024 * 1024;

pub fn max_sorter_gaps() -> usize {
    static MAX_GAPS: OnceLock<usize> = OnceLock::new();
    *MAX_GAPS.get_or_init(|| {
        std::env::var("EDDY_MAX_SORTER_GAPS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_SORTER_GAPS)
    })
}

pub fn initial_receive_window_size() -> ByteCount {
    static INITIAL_WINDOW: OnceLock<ByteCount> = OnceLock::new();
    *INITIAL_WINDOW.get_or_init(|| {
        std::env::var("EDDY_INITIAL_RECEIVE_WINDOW")
            .ok()
            .and_then(|value| value.parse::<ByteCount>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INITIAL_RECEIVE_WINDOW_SIZE)
    })
}

pub fn max_receive_window_size() -> ByteCount {
    static MAX_WINDOW: OnceLock<ByteCount> = OnceLock::new();
    *MAX_WINDOW.get_or_init(|| {
        std::env::var("EDDY_MAX_RECEIVE_WINDOW")
            .ok()
            .and_then(|value| value.parse::<ByteCount>().ok())
            .unwrap_or(DEFAULT_MAX_RECEIVE_WINDOW_SIZE)
    })
}

/// Construction parameters for a flow controller.
///
/// `initial_send_window` is zero by default: during connection
/// establishment data may be queued before the peer's transport
/// parameters arrive, and until then the send window is empty.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub initial_send_window: ByteCount,
    pub initial_receive_window_size: ByteCount,
    pub max_receive_window_size: ByteCount,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial_send_window: 0,
            initial_receive_window_size: initial_receive_window_size(),
            max_receive_window_size: max_receive_window_size(),
        }
    }
}
