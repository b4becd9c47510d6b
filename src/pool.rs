//! Hardware frame-buffer pool
//!
//! The pool owns one *generation* of picture buffers at a time: N buffers of
//! identical geometry, each bound to a display surface and registered with the
//! decoder. A format change replaces the whole generation. Teardown always
//! completes before the next generation is allocated, so at most one
//! generation's surfaces are bound at any moment, and a failed rebuild leaves
//! no pool at all rather than a partial one.

use tracing::{debug, error, info, trace};

use crate::{ReceiverError, Result};
use crate::backend::{Allocation, ExternalBuffer, HardwareDecoder, SurfaceAllocator};
use crate::config::DEFAULT_POOL_SIZE;
use crate::types::{AllocationHandle, HardwareIdentity, PictureFormat, SurfaceId};

/// One entry of a pool generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlot {
    /// Position within the generation
    pub slot_index: usize,
    /// Decoder identity of the memory, unique within the generation
    pub hardware_identity: HardwareIdentity,
    /// Display surface presenting this buffer
    pub display_surface_id: SurfaceId,
    /// Token releasing the memory
    pub allocation_handle: AllocationHandle,
}

/// Fixed-capacity pool of hardware picture buffers
pub struct FramePool<A: SurfaceAllocator> {
    allocator: A,
    capacity: usize,
    slots: Vec<BufferSlot>,
    format: Option<PictureFormat>,
    generation: u64,
}

impl<A: SurfaceAllocator> FramePool<A> {
    /// Create an empty pool with the default capacity
    pub fn new(allocator: A) -> Self {
        Self::with_capacity(allocator, DEFAULT_POOL_SIZE)
    }

    /// Create an empty pool holding `capacity` buffers per generation
    pub fn with_capacity(allocator: A, capacity: usize) -> Self {
        Self { allocator, capacity, slots: Vec::with_capacity(capacity), format: None, generation: 0 }
    }

    /// Replace the current generation with one matching `format`.
    ///
    /// Tears down the previous generation, allocates and binds `capacity`
    /// buffers of [`PictureFormat::buffer_size`] bytes and registers them with
    /// `decoder`. Any failure is fatal: whatever was built is torn down again
    /// and the error is returned with the pool left empty.
    pub fn rebuild<D>(&mut self, format: PictureFormat, decoder: &mut D) -> Result<&[BufferSlot]>
    where
        D: HardwareDecoder + ?Sized,
    {
        self.teardown();

        let size = format.buffer_size();
        debug!(
            width = format.width,
            height = format.height,
            hor_stride = format.hor_stride,
            ver_stride = format.ver_stride,
            size,
            capacity = self.capacity,
            "Allocating buffer generation"
        );

        let mut built = Vec::with_capacity(self.capacity);
        let outcome = self.build_slots(&format, size, &mut built).and_then(|()| {
            let buffers: Vec<ExternalBuffer> = built
                .iter()
                .map(|slot| ExternalBuffer {
                    slot_index: slot.slot_index,
                    hardware_identity: slot.hardware_identity,
                    size,
                })
                .collect();
            decoder.register_buffers(&buffers)
        });

        if let Err(e) = outcome {
            error!("Buffer generation failed after {} slots: {}", built.len(), e);
            self.slots = built;
            self.teardown();
            return Err(e);
        }

        self.slots = built;
        self.format = Some(format);
        self.generation += 1;

        info!(
            generation = self.generation,
            "Buffer pool ready: {} x {}x{} ({:?})",
            self.slots.len(),
            format.width,
            format.height,
            format.pixel_format
        );

        Ok(&self.slots)
    }

    fn build_slots(
        &mut self,
        format: &PictureFormat,
        size: usize,
        built: &mut Vec<BufferSlot>,
    ) -> Result<()> {
        for slot_index in 0..self.capacity {
            let allocation = self.allocator.allocate(size)?;
            if let Some(owner) = built.iter().find(|slot| slot.hardware_identity == allocation.hardware_identity) {
                let reason = format!(
                    "hardware identity {} already belongs to slot {}",
                    allocation.hardware_identity, owner.slot_index
                );
                self.allocator.release(allocation.handle);
                return Err(ReceiverError::allocation_failed(slot_index, reason));
            }
            let surface = match self.allocator.bind_surface(&allocation, format) {
                Ok(surface) => surface,
                Err(e) => {
                    self.allocator.release(allocation.handle);
                    return Err(e);
                }
            };
            trace!(slot_index, identity = %allocation.hardware_identity, %surface, "Slot bound");
            built.push(slot_from(slot_index, &allocation, surface));
        }
        Ok(())
    }

    /// Map a decoder identity to its slot index.
    ///
    /// This is a linear scan, O(N) in the pool capacity. With N ≤ 24 the scan
    /// is cheaper than hashing; raising the capacity substantially should come
    /// with a different lookup.
    pub fn resolve(&self, hardware_identity: HardwareIdentity) -> Option<usize> {
        self.slots.iter().position(|slot| slot.hardware_identity == hardware_identity)
    }

    /// Slot at `index` in the current generation
    pub fn slot(&self, index: usize) -> Option<&BufferSlot> {
        self.slots.get(index)
    }

    /// All slots of the current generation
    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    /// Unbind every surface and release every allocation. Idempotent.
    pub fn teardown(&mut self) {
        if self.slots.is_empty() {
            self.format = None;
            return;
        }

        debug!(generation = self.generation, "Tearing down {} buffer slots", self.slots.len());
        for slot in self.slots.drain(..) {
            self.allocator.unbind_surface(slot.display_surface_id);
            self.allocator.release(slot.allocation_handle);
        }
        self.format = None;
    }

    /// Format of the current generation, if one exists
    pub fn format(&self) -> Option<PictureFormat> {
        self.format
    }

    /// Number of completed generations
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers per generation
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live slots (0 or capacity)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no generation is live
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Access the allocator backend
    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<A: SurfaceAllocator> Drop for FramePool<A> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn slot_from(slot_index: usize, allocation: &Allocation, surface: SurfaceId) -> BufferSlot {
    BufferSlot {
        slot_index,
        hardware_identity: allocation.hardware_identity,
        display_surface_id: surface,
        allocation_handle: allocation.handle,
    }
}
