//! Decode stage: submit, drain, rebuild, hand off

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{DecoderEvent, HardwareDecoder, SubmitOutcome, SurfaceAllocator};
use crate::health::StreamHealth;
use crate::mailbox::Mailbox;
use crate::pool::FramePool;
use crate::types::{AccessUnit, HardwareIdentity};
use crate::{ReceiverError, Result};

/// Submit attempts before a unit is dropped under back-pressure
const MAX_BUSY_RETRIES: u32 = 8;

/// Accepted packets remembered for decode-time attribution
const MAX_IN_FLIGHT: usize = 32;

/// Counters kept by the decode stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub submitted: u64,
    pub busy_retries: u64,
    pub dropped_units: u64,
    pub decoder_errors: u64,
    pub keyframes: u64,
    pub pictures: u64,
    pub unknown_buffers: u64,
    pub rebuilds: u64,
}

/// Owns the decoder and the buffer pool; runs on the ingest task
pub struct DecodeStage<D: HardwareDecoder, A: SurfaceAllocator> {
    decoder: D,
    pool: FramePool<A>,
    mailbox: Arc<Mailbox>,
    health: Arc<StreamHealth>,
    in_flight: VecDeque<(u64, Instant)>,
    stats: DecodeStats,
}

impl<D: HardwareDecoder, A: SurfaceAllocator> DecodeStage<D, A> {
    pub fn new(decoder: D, pool: FramePool<A>, mailbox: Arc<Mailbox>, health: Arc<StreamHealth>) -> Self {
        Self { decoder, pool, mailbox, health, in_flight: VecDeque::with_capacity(MAX_IN_FLIGHT), stats: DecodeStats::default() }
    }

    /// Decode one access unit.
    ///
    /// Decoder failures are logged and turned into an integrity repair
    /// request. Only pool failures are returned, and they are fatal.
    pub fn feed(&mut self, unit: &AccessUnit) -> Result<()> {
        self.submit(unit)?;

        if let Some(nal_type) = self.health.requester().observe_access_unit(&unit.data) {
            self.stats.keyframes += 1;
            trace!(pts = unit.pts, nal_type, "Keyframe access unit");
        }

        self.drain()
    }

    fn submit(&mut self, unit: &AccessUnit) -> Result<()> {
        for attempt in 0..=MAX_BUSY_RETRIES {
            match self.decoder.submit(&unit.data, unit.pts) {
                Ok(SubmitOutcome::Accepted) => {
                    self.stats.submitted += 1;
                    if self.in_flight.len() == MAX_IN_FLIGHT {
                        self.in_flight.pop_front();
                    }
                    self.in_flight.push_back((unit.pts, Instant::now()));
                    return Ok(());
                }
                Ok(SubmitOutcome::Busy) => {
                    self.stats.busy_retries += 1;
                    trace!(pts = unit.pts, attempt, "Decoder busy, draining");
                    self.drain()?;
                }
                Err(e) => {
                    self.on_decoder_error(e);
                    return Ok(());
                }
            }
        }

        self.stats.dropped_units += 1;
        warn!(pts = unit.pts, bytes = unit.len(), "Decoder stayed busy, dropping access unit");
        Ok(())
    }

    /// Process every pending decoder event
    pub fn drain(&mut self) -> Result<()> {
        loop {
            let event = match self.decoder.poll_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.on_decoder_error(e);
                    return Ok(());
                }
            };

            match event {
                DecoderEvent::FormatChanged(format) => {
                    info!(
                        width = format.width,
                        height = format.height,
                        pixel_format = ?format.pixel_format,
                        "Decoder format changed"
                    );
                    // The pending frame points into the generation about to be unbound
                    if let Some(stale) = self.mailbox.discard_pending() {
                        debug!(surface = %stale.display_surface_id, "Discarded frame from previous generation");
                    }
                    self.pool.rebuild(format, &mut self.decoder)?;
                    self.stats.rebuilds += 1;
                }
                DecoderEvent::Picture { hardware_identity, pts } => self.present(hardware_identity, pts),
            }
        }
    }

    fn present(&mut self, hardware_identity: HardwareIdentity, pts: u64) {
        let Some(slot) = self.pool.resolve(hardware_identity).and_then(|index| self.pool.slot(index)) else {
            self.stats.unknown_buffers += 1;
            let err = ReceiverError::UnknownBuffer { identity: hardware_identity };
            error!(pts, generation = self.pool.generation(), "Dropping picture: {}", err);
            debug_assert!(false, "decoder returned unknown buffer {hardware_identity}");
            return;
        };
        let surface = slot.display_surface_id;

        let decoded_at = self.accept_time(pts).unwrap_or_else(Instant::now);
        self.mailbox.post(surface, decoded_at);
        self.health.on_frame_decoded();
        self.stats.pictures += 1;
        trace!(pts, %surface, "Picture posted");
    }

    fn accept_time(&mut self, pts: u64) -> Option<Instant> {
        let index = self.in_flight.iter().position(|(p, _)| *p == pts)?;
        self.in_flight.remove(index).map(|(_, at)| at)
    }

    fn on_decoder_error(&mut self, e: ReceiverError) {
        self.stats.decoder_errors += 1;
        let requested = self.health.request_integrity_repair();
        warn!(requested, "Decoder error: {}", e);
    }

    /// Release the buffer pool; pictures can no longer be presented
    pub fn teardown(&mut self) {
        debug!(stats = ?self.stats, "Decode stage teardown");
        self.mailbox.discard_pending();
        self.pool.teardown();
        self.in_flight.clear();
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn pool(&self) -> &FramePool<A> {
        &self.pool
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn health(&self) -> &Arc<StreamHealth> {
        &self.health
    }
}
