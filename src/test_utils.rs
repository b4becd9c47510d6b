//! Test doubles for the hardware collaborators and the repair transport
//!
//! These fakes record every interaction behind shared state so a test can hand
//! a clone to the code under test and inspect the effects afterwards. They are
//! also compiled for benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::{
    Allocation, DecoderEvent, DisplaySink, ExternalBuffer, HardwareDecoder, SubmitOutcome, SurfaceAllocator,
};
use crate::repair::RepairTransport;
use crate::types::{AccessUnit, AllocationHandle, HardwareIdentity, PictureFormat, SurfaceId};
use crate::{ReceiverError, Result};

/// H.265 IDR_W_RADL slice (NAL type 19)
pub const H265_IDR: &[u8] = &[0, 0, 0, 1, 0x26, 0x01, 0xAF, 0x10, 0x42];
/// H.265 TRAIL_R slice
pub const H265_TRAIL: &[u8] = &[0, 0, 0, 1, 0x02, 0x01, 0xD0, 0x22, 0x11];
/// H.264 IDR slice
pub const H264_IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x21];
/// H.264 non-IDR slice
pub const H264_P: &[u8] = &[0, 0, 1, 0x41, 0x9A, 0x02, 0x04];

/// Install a test-friendly `tracing` subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
}

/// Build an H.265 access unit, keyframe or not
pub fn h265_unit(pts: u64, keyframe: bool) -> AccessUnit {
    AccessUnit::new(if keyframe { H265_IDR } else { H265_TRAIL }, pts)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AllocatorState {
    next_handle: u64,
    next_surface: u32,
    live: HashSet<AllocationHandle>,
    bound: HashSet<SurfaceId>,
    max_bound: usize,
    last_size: Option<usize>,
    allocations: usize,
    bindings: usize,
    fail_allocation_after: Option<usize>,
    fail_binding_after: Option<usize>,
    duplicate_identity_at: Option<usize>,
}

/// In-memory [`SurfaceAllocator`] counting live allocations and surfaces
#[derive(Debug, Clone, Default)]
pub struct FakeAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every allocation after `n` successful ones
    pub fn fail_allocation_after(&self, n: usize) {
        lock(&self.state).fail_allocation_after = Some(n);
    }

    /// Fail every surface binding after `n` successful ones
    pub fn fail_binding_after(&self, n: usize) {
        lock(&self.state).fail_binding_after = Some(n);
    }

    /// Give allocation number `n` (zero-based) the identity of the first one
    pub fn duplicate_identity_at(&self, n: usize) {
        lock(&self.state).duplicate_identity_at = Some(n);
    }

    pub fn live_allocations(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn bound_surfaces(&self) -> usize {
        lock(&self.state).bound.len()
    }

    /// Highest number of simultaneously bound surfaces ever observed
    pub fn max_bound_surfaces(&self) -> usize {
        lock(&self.state).max_bound
    }

    pub fn last_allocation_size(&self) -> Option<usize> {
        lock(&self.state).last_size
    }
}

impl SurfaceAllocator for FakeAllocator {
    fn allocate(&mut self, size: usize) -> Result<Allocation> {
        let mut state = lock(&self.state);
        if state.fail_allocation_after.is_some_and(|n| state.allocations >= n) {
            return Err(ReceiverError::allocation_failed(state.allocations, "fake heap exhausted"));
        }
        let identity = match state.duplicate_identity_at {
            Some(n) if n == state.allocations => HardwareIdentity(0x1000 + state.next_handle + 1 - n as u64),
            _ => HardwareIdentity(0x1000 + state.next_handle + 1),
        };
        state.allocations += 1;
        state.next_handle += 1;
        let handle = AllocationHandle(state.next_handle);
        state.live.insert(handle);
        state.last_size = Some(size);
        Ok(Allocation { handle, hardware_identity: identity, size })
    }

    fn bind_surface(&mut self, _allocation: &Allocation, _format: &PictureFormat) -> Result<SurfaceId> {
        let mut state = lock(&self.state);
        if state.fail_binding_after.is_some_and(|n| state.bindings >= n) {
            return Err(ReceiverError::binding_failed(state.bindings, Some("fake plane rejected buffer".into())));
        }
        state.bindings += 1;
        state.next_surface += 1;
        let surface = SurfaceId(state.next_surface);
        state.bound.insert(surface);
        state.max_bound = state.max_bound.max(state.bound.len());
        Ok(surface)
    }

    fn unbind_surface(&mut self, surface: SurfaceId) {
        lock(&self.state).bound.remove(&surface);
    }

    fn release(&mut self, handle: AllocationHandle) {
        lock(&self.state).live.remove(&handle);
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DecoderScript {
    events: VecDeque<DecoderEvent>,
    busy: usize,
    fail_submits: usize,
    submitted: Vec<u64>,
    registered: Vec<ExternalBuffer>,
    registrations: usize,
    auto_format: Option<PictureFormat>,
    announced: bool,
    awaiting_buffers: Vec<u64>,
    pictures: usize,
}

/// Scripted [`HardwareDecoder`]
///
/// Events can be queued by hand, or the decoder can run in *auto* mode where
/// it announces a format on the first submit and then returns one picture per
/// submitted packet, cycling through the registered buffers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDecoder {
    script: Arc<Mutex<DecoderScript>>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto mode producing pictures of `format`
    pub fn auto(format: PictureFormat) -> Self {
        let decoder = Self::new();
        lock(&decoder.script).auto_format = Some(format);
        decoder
    }

    /// Queue an event for `poll_event`
    pub fn push_event(&self, event: DecoderEvent) {
        lock(&self.script).events.push_back(event);
    }

    /// Announce a new format in auto mode; pictures resume after registration
    pub fn change_format(&self, format: PictureFormat) {
        let mut script = lock(&self.script);
        script.auto_format = Some(format);
        script.registered.clear();
        script.events.push_back(DecoderEvent::FormatChanged(format));
    }

    /// Answer the next `n` submits with [`SubmitOutcome::Busy`]
    pub fn busy_for(&self, n: usize) {
        lock(&self.script).busy = n;
    }

    /// Fail the next `n` submits
    pub fn fail_submits(&self, n: usize) {
        lock(&self.script).fail_submits = n;
    }

    /// PTS of every accepted packet
    pub fn submitted(&self) -> Vec<u64> {
        lock(&self.script).submitted.clone()
    }

    /// Buffers from the most recent registration
    pub fn registered(&self) -> Vec<ExternalBuffer> {
        lock(&self.script).registered.clone()
    }

    pub fn registrations(&self) -> usize {
        lock(&self.script).registrations
    }

    /// Pictures emitted in auto mode
    pub fn pictures(&self) -> usize {
        lock(&self.script).pictures
    }
}

impl DecoderScript {
    fn emit_picture(&mut self, pts: u64) {
        if self.registered.is_empty() {
            self.awaiting_buffers.push(pts);
            return;
        }
        let buffer = self.registered[self.pictures % self.registered.len()];
        self.pictures += 1;
        self.events.push_back(DecoderEvent::Picture { hardware_identity: buffer.hardware_identity, pts });
    }
}

impl HardwareDecoder for ScriptedDecoder {
    fn submit(&mut self, _data: &[u8], pts: u64) -> Result<SubmitOutcome> {
        let mut script = lock(&self.script);
        if script.fail_submits > 0 {
            script.fail_submits -= 1;
            return Err(ReceiverError::decoder_error("submit"));
        }
        if script.busy > 0 {
            script.busy -= 1;
            return Ok(SubmitOutcome::Busy);
        }
        script.submitted.push(pts);

        if let Some(format) = script.auto_format {
            if !script.announced {
                script.announced = true;
                script.events.push_back(DecoderEvent::FormatChanged(format));
            }
            script.emit_picture(pts);
        }
        Ok(SubmitOutcome::Accepted)
    }

    fn poll_event(&mut self) -> Result<Option<DecoderEvent>> {
        Ok(lock(&self.script).events.pop_front())
    }

    fn register_buffers(&mut self, buffers: &[ExternalBuffer]) -> Result<()> {
        let mut script = lock(&self.script);
        script.registered = buffers.to_vec();
        script.registrations += 1;
        for pts in std::mem::take(&mut script.awaiting_buffers) {
            script.emit_picture(pts);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DisplayLog {
    commits: Vec<SurfaceId>,
    fail_next: usize,
    commit_delay: Duration,
}

/// [`DisplaySink`] recording every committed surface
#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    log: Arc<Mutex<DisplayLog>>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block each commit for `delay`, like a display waiting for vblank
    pub fn with_commit_delay(self, delay: Duration) -> Self {
        lock(&self.log).commit_delay = delay;
        self
    }

    /// Fail the next `n` commits
    pub fn fail_next(&self, n: usize) {
        lock(&self.log).fail_next = n;
    }

    pub fn commits(&self) -> Vec<SurfaceId> {
        lock(&self.log).commits.clone()
    }
}

impl DisplaySink for RecordingDisplay {
    fn commit(&mut self, surface: SurfaceId) -> Result<()> {
        let delay = {
            let mut log = lock(&self.log);
            if log.fail_next > 0 {
                log.fail_next -= 1;
                return Err(ReceiverError::Display { surface, source: Some("fake commit rejected".into()) });
            }
            log.commits.push(surface);
            log.commit_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repair transport
// ---------------------------------------------------------------------------

/// One datagram captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub at: Instant,
    pub target: SocketAddr,
    pub payload: Vec<u8>,
}

/// [`RepairTransport`] that records instead of sending
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentDatagram>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Successfully sent datagrams in order
    pub fn sent(&self) -> Vec<SentDatagram> {
        lock(&self.sent).clone()
    }

    /// Send attempts including failures
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl RepairTransport for RecordingTransport {
    async fn send(&self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(ReceiverError::Repair {
                target,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "fake network down"),
            });
        }
        lock(&self.sent).push(SentDatagram { at: Instant::now(), target, payload: payload.to_vec() });
        Ok(())
    }
}
