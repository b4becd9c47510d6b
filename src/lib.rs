//! Low-latency receiver core for digital FPV video links.
//!
//! fpv-rx sits between a transport that delivers H.265/H.264 access units and
//! a hardware decoder feeding a display plane. It keeps the picture live under
//! radio loss by asking the sender for keyframes whenever the stream is
//! damaged, and keeps glass-to-glass latency flat by always presenting the
//! newest decoded frame.
//!
//! # Features
//!
//! - **Frame Buffer Pool**: one generation of decoder buffers, each bound to a
//!   display surface, rebuilt atomically on format changes
//! - **Mailbox Handoff**: single-slot, overwrite-on-arrival decode→display
//!   handoff; the decoder never waits for vblank
//! - **Stream Health**: link up/down, RTP gap and decode-stall detection
//! - **Keyframe Repair**: rate-limited, confirmed UDP keyframe requests
//!
//! # Quick Start
//!
//! The decoder, the allocator and the display are platform backends
//! implementing the traits in [`backend`].
//!
//! ```rust,no_run
//! use fpv_rx::backend::{DisplaySink, HardwareDecoder, SurfaceAllocator};
//! use fpv_rx::{AccessUnit, Receiver, ReceiverConfig, StreamSource};
//! use futures::{Stream, StreamExt};
//!
//! async fn run<D, A, K, U>(decoder: D, allocator: A, display: K, units: U) -> fpv_rx::Result<()>
//! where
//!     D: HardwareDecoder + 'static,
//!     A: SurfaceAllocator + 'static,
//!     K: DisplaySink + 'static,
//!     U: Stream<Item = AccessUnit> + Send + Unpin + 'static,
//! {
//!     let config = ReceiverConfig::load("/etc/fpv-rx.yaml")?;
//!     config.init_logging()?;
//!
//!     let receiver = Receiver::start(&config, StreamSource::new(units), decoder, allocator, display)?;
//!     let mut link = Box::pin(receiver.link_updates());
//!     while let Some(state) = link.next().await {
//!         println!("Link {:?}", state);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Keyframe detection
//!
//! ```rust
//! use fpv_rx::{CodecFamily, nal};
//!
//! let idr = [0, 0, 0, 1, 0x26, 0x01, 0xAF];
//! assert_eq!(nal::find_keyframe(&idr, CodecFamily::H265), Some(19));
//! assert!(!nal::contains_keyframe(&idr, CodecFamily::H264));
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Frame pipeline
pub mod backend;
pub mod mailbox;
pub mod nal;
pub mod pipeline;
pub mod pool;

// Resilience engine
pub mod health;
pub mod repair;

// Task orchestration
pub mod driver;
pub mod receiver;
pub mod source;

// Core exports
pub use error::*;
pub use types::{AccessUnit, AllocationHandle, CodecFamily, HardwareIdentity, PictureFormat, PixelFormat, SurfaceId};

// Main API exports
pub use config::{HealthTiming, ReceiverConfig, RepairTiming};
pub use health::{HealthSnapshot, LinkState, StreamHealth};
pub use mailbox::{Delivery, Mailbox, PendingFrame};
pub use pool::{BufferSlot, FramePool};
pub use receiver::{Receiver, ReceiverSummary};
pub use repair::{KeyframeRequester, RepairReason, RequestOutcome};
pub use source::{AccessUnitSource, StreamSource};
