//! Stream health monitoring
//!
//! Tracks whether the stream is up, detects RTP sequence gaps and decoder
//! stalls, and turns each into a rate-limited keyframe request. The state
//! lives in [`HealthState`] so the repair tasks can share it.

mod monitor;
mod state;

pub use monitor::{HealthSnapshot, LinkState, PacketReport, StreamHealth, TickReport};
pub use state::{HealthState, PendingFlag};
