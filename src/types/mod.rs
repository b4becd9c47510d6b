//! Core value types shared by the frame pipeline and the resilience engine.
//!
//! ## Overview
//!
//! - [`AccessUnit`] is one elementary-stream access unit as delivered by the
//!   transport, with zero-copy payload sharing via `Arc`
//! - [`CodecFamily`] selects how NAL headers are interpreted
//! - [`PictureFormat`] describes a decoder buffer generation
//! - [`HardwareIdentity`], [`SurfaceId`] and [`AllocationHandle`] are the opaque
//!   tokens exchanged with the decoder, the display and the allocator
//! - [`seq_distance`] compares 16-bit RTP sequence numbers with wraparound
//!
//! ## Usage Example
//!
//! ```rust
//! use fpv_rx::types::{AccessUnit, CodecFamily};
//!
//! let unit = AccessUnit::new(vec![0, 0, 0, 1, 0x65, 0x88], 3000).with_rtp_sequence(7);
//! assert_eq!(unit.rtp_sequence, Some(7));
//! assert!(CodecFamily::H264.is_keyframe(CodecFamily::H264.nal_type(0x65)));
//! ```

mod access_unit;
mod codec;
mod picture;
mod sequence;

pub use access_unit::AccessUnit;
pub use codec::CodecFamily;
pub use picture::{AllocationHandle, HardwareIdentity, PictureFormat, PixelFormat, SurfaceId};
pub use sequence::{seq_after, seq_distance};
