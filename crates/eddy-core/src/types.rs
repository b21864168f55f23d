/// Count of stream bytes, also used as a zero-based stream offset.
pub type ByteCount = u64;

/// Sentinel offset for "open-ended": the tail gap of a frame sorter runs
/// to this value, and no real segment may reach it. Arithmetic that could
/// exceed it saturates.
pub const MAX_BYTE_COUNT: ByteCount = u64::MAX;
