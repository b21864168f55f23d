//! Receive-path primitives for a QUIC-style stream transport.
//!
//! Two components, both invoked once per received segment:
//! - [`frame_sorter`] reassembles a contiguous byte stream from
//!   out-of-order, overlapping, duplicated segments and delivers it in
//!   order exactly once.
//! - [`flow_control`] accounts bytes sent/received against the peer's
//!   windows, raises the blocked signal, and auto-tunes the receive
//!   window against the measured RTT.
//!
//! The crate is sans-io: the wire parser that produces segments, the
//! stream object that consumes reassembled bytes, and the RTT estimator
//! all live in the enclosing transport.

pub mod flow_control;
pub mod frame_sorter;
pub mod invariants;
pub mod limits;
pub mod rtt;
pub mod test_support;
pub mod types;
