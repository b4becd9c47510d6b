//! Hardware collaborator contracts
//!
//! The receiver core never talks to hardware directly. The decoder, the buffer
//! allocator and the display are reached through these traits so platform
//! backends (MPP/V4L2 decoders, DRM/KMS planes, DMA heaps) can be plugged in
//! and tests can substitute fakes.

use crate::Result;
use crate::types::{AllocationHandle, HardwareIdentity, PictureFormat, SurfaceId};

/// Outcome of submitting a compressed packet to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The decoder took the packet
    Accepted,
    /// Transient back-pressure: drain output and submit again
    Busy,
}

/// Events emitted by the decoder on its output side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    /// A new buffer generation is needed before the next picture
    FormatChanged(PictureFormat),

    /// A decoded picture living in the buffer identified by `hardware_identity`
    Picture { hardware_identity: HardwareIdentity, pts: u64 },
}

/// One buffer handed to the decoder as part of its external buffer supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalBuffer {
    /// Index of the slot within the pool generation
    pub slot_index: usize,
    /// Decoder-visible identity of the memory
    pub hardware_identity: HardwareIdentity,
    /// Size of the allocation in bytes
    pub size: usize,
}

/// Hardware video decoder
pub trait HardwareDecoder: Send {
    /// Submit one compressed access unit
    fn submit(&mut self, data: &[u8], pts: u64) -> Result<SubmitOutcome>;

    /// Poll the next output event without blocking
    ///
    /// Returns:
    /// - `Ok(Some(event))` - A format change or a decoded picture
    /// - `Ok(None)` - Nothing ready yet
    /// - `Err(e)` - Decoder failure
    fn poll_event(&mut self) -> Result<Option<DecoderEvent>>;

    /// Install a complete buffer generation as the decoder's output supply
    fn register_buffers(&mut self, buffers: &[ExternalBuffer]) -> Result<()>;
}

/// Memory returned by [`SurfaceAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Token needed to release the memory
    pub handle: AllocationHandle,
    /// Identity the decoder will report for pictures in this memory
    pub hardware_identity: HardwareIdentity,
    /// Size in bytes
    pub size: usize,
}

/// Allocates picture memory and binds it to display surfaces
///
/// Binding and unbinding happen on the decode stage while the display stage
/// commits surfaces through [`DisplaySink`]; implementations backed by a single
/// DRM device must tolerate that split.
pub trait SurfaceAllocator: Send {
    /// Allocate `size` bytes of decoder-accessible memory
    fn allocate(&mut self, size: usize) -> Result<Allocation>;

    /// Create a display surface covering `format.width × format.height`
    fn bind_surface(&mut self, allocation: &Allocation, format: &PictureFormat) -> Result<SurfaceId>;

    /// Remove a display surface
    fn unbind_surface(&mut self, surface: SurfaceId);

    /// Release memory obtained from [`SurfaceAllocator::allocate`]
    fn release(&mut self, handle: AllocationHandle);
}

/// Display subsystem presenting surfaces on screen
pub trait DisplaySink: Send {
    /// Present `surface` with the next atomic commit
    fn commit(&mut self, surface: SurfaceId) -> Result<()>;
}
