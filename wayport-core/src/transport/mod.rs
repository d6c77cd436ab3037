//! Transport layer for control connections
//!
//! Control connections run over plain TCP. Reads go through a `FramedRead`
//! with [`TunnelCodec`](wayport_protocol::TunnelCodec); writes go through the
//! connection's single [`writer`] task.

pub mod socket_tuning;
pub mod tcp;
pub mod writer;

pub use writer::{run_frame_writer, FrameQueue, FrameSink, Outbound};
