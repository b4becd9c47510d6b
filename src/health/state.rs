//! Shared stream health state
//!
//! Every field is independently atomic so the packet path, the decode path and
//! the tick can touch it without a common lock. Timestamps are stored as
//! milliseconds since a monotonic origin, offset by one so that zero means
//! "never". The RTP sequence and its timestamp share one word so readers
//! never see a sequence paired with another packet's time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const RTP_VALID: u64 = 1 << 63;
const RTP_STAMP_MASK: u64 = (1 << 40) - 1;
const PENDING_BIT: u64 = 1;

/// Which confirmation flag a repair sequence is tracked by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFlag {
    /// `stream_keyframe_pending`
    Stream,
    /// `record_keyframe_pending`
    Record,
}

/// Confirmation flag of one tracked reason.
///
/// `word` holds the pending bit and, above it, the generation of the request
/// that last raised it. `confirmed` is the newest generation a keyframe
/// answered.
#[derive(Debug, Default)]
struct PendingSlot {
    word: AtomicU64,
    confirmed: AtomicU64,
}

/// Process-wide health state for one reception session
#[derive(Debug)]
pub struct HealthState {
    origin: Instant,
    stream_up: AtomicBool,
    last_packet: AtomicU64,
    last_decoded: AtomicU64,
    last_rtp: AtomicU64,
    last_integrity_request: AtomicU64,
    last_gap_request: AtomicU64,
    last_stall_request: AtomicU64,
    stream_keyframe_pending: PendingSlot,
    record_keyframe_pending: PendingSlot,
    record_request_deferred: AtomicBool,
    lost_packets: AtomicU64,
    sender: Mutex<Option<SocketAddr>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a fresh state anchored at the current monotonic time
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    /// Create a fresh state anchored at `origin`
    pub fn with_origin(origin: Instant) -> Self {
        Self {
            origin,
            stream_up: AtomicBool::new(false),
            last_packet: AtomicU64::new(0),
            last_decoded: AtomicU64::new(0),
            last_rtp: AtomicU64::new(0),
            last_integrity_request: AtomicU64::new(0),
            last_gap_request: AtomicU64::new(0),
            last_stall_request: AtomicU64::new(0),
            stream_keyframe_pending: PendingSlot::default(),
            record_keyframe_pending: PendingSlot::default(),
            record_request_deferred: AtomicBool::new(false),
            lost_packets: AtomicU64::new(0),
            sender: Mutex::new(None),
        }
    }

    /// Forget everything learned about the current source
    pub fn reset(&self) {
        self.stream_up.store(false, Ordering::Relaxed);
        for slot in [
            &self.last_packet,
            &self.last_decoded,
            &self.last_rtp,
            &self.last_integrity_request,
            &self.last_gap_request,
            &self.last_stall_request,
            &self.lost_packets,
        ] {
            slot.store(0, Ordering::Relaxed);
        }
        // Generations survive a reset so sequences still running cannot match a later request
        self.stream_keyframe_pending.word.fetch_and(!PENDING_BIT, Ordering::AcqRel);
        self.record_keyframe_pending.word.fetch_and(!PENDING_BIT, Ordering::AcqRel);
        self.record_request_deferred.store(false, Ordering::Relaxed);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64 + 1
    }

    fn age(&self, slot: &AtomicU64, now: Instant) -> Option<Duration> {
        match slot.load(Ordering::Relaxed) {
            0 => None,
            stamp => Some(Duration::from_millis(self.stamp(now).saturating_sub(stamp))),
        }
    }

    /// Claim a cooldown slot: succeeds when it was never claimed or the last
    /// claim is at least `cooldown` old, recording `now` on success.
    fn claim(&self, slot: &AtomicU64, now: Instant, cooldown: Duration) -> bool {
        let stamp = self.stamp(now);
        let cooldown_ms = cooldown.as_millis() as u64;
        slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            (last == 0 || stamp.saturating_sub(last) >= cooldown_ms).then_some(stamp)
        })
        .is_ok()
    }

    // --- link state -------------------------------------------------------

    /// Whether the stream is currently considered up
    pub fn is_stream_up(&self) -> bool {
        self.stream_up.load(Ordering::Acquire)
    }

    /// Transition down → up; returns false if already up
    pub(crate) fn mark_up(&self) -> bool {
        self.stream_up.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Transition up → down; returns false if already down
    pub(crate) fn mark_down(&self) -> bool {
        self.stream_up.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn record_packet(&self, now: Instant) {
        self.last_packet.store(self.stamp(now), Ordering::Release);
    }

    /// Time since the last packet, if any arrived
    pub fn packet_age(&self, now: Instant) -> Option<Duration> {
        self.age(&self.last_packet, now)
    }

    pub(crate) fn record_decoded(&self, now: Instant) {
        self.last_decoded.store(self.stamp(now), Ordering::Release);
    }

    /// Time since the last decoded picture, if any
    pub fn decoded_age(&self, now: Instant) -> Option<Duration> {
        self.age(&self.last_decoded, now)
    }

    // --- sender -----------------------------------------------------------

    /// Last-hop sender of the stream
    pub fn sender(&self) -> Option<SocketAddr> {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_sender(&self, sender: SocketAddr) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    // --- RTP sequence -----------------------------------------------------

    /// Last RTP sequence number and how long ago it was recorded
    pub fn rtp_sequence(&self, now: Instant) -> Option<(u16, Duration)> {
        let packed = self.last_rtp.load(Ordering::Acquire);
        if packed & RTP_VALID == 0 {
            return None;
        }
        let seq = ((packed >> 40) & 0xFFFF) as u16;
        let stamp = packed & RTP_STAMP_MASK;
        Some((seq, Duration::from_millis(self.stamp(now).saturating_sub(stamp))))
    }

    pub(crate) fn set_rtp_sequence(&self, seq: u16, now: Instant) {
        let packed = RTP_VALID | ((seq as u64) << 40) | (self.stamp(now) & RTP_STAMP_MASK);
        self.last_rtp.store(packed, Ordering::Release);
    }

    pub(crate) fn clear_rtp_sequence(&self) {
        self.last_rtp.store(0, Ordering::Release);
    }

    pub(crate) fn add_lost_packets(&self, lost: u64) {
        self.lost_packets.fetch_add(lost, Ordering::Relaxed);
    }

    /// Packets reported lost by sequence gaps since the last reset
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets.load(Ordering::Relaxed)
    }

    // --- cooldowns --------------------------------------------------------

    pub(crate) fn claim_gap_request(&self, now: Instant, cooldown: Duration) -> bool {
        self.claim(&self.last_gap_request, now, cooldown)
    }

    pub(crate) fn claim_stall_request(&self, now: Instant, cooldown: Duration) -> bool {
        self.claim(&self.last_stall_request, now, cooldown)
    }

    pub(crate) fn claim_integrity_request(&self, now: Instant, cooldown: Duration) -> bool {
        self.claim(&self.last_integrity_request, now, cooldown)
    }

    // --- confirmation flags -----------------------------------------------

    fn flag(&self, flag: PendingFlag) -> &PendingSlot {
        match flag {
            PendingFlag::Stream => &self.stream_keyframe_pending,
            PendingFlag::Record => &self.record_keyframe_pending,
        }
    }

    /// Whether a keyframe is awaited for `flag`
    pub fn is_pending(&self, flag: PendingFlag) -> bool {
        self.flag(flag).word.load(Ordering::Acquire) & PENDING_BIT != 0
    }

    /// Raise `flag` on behalf of a new request and return the request's generation.
    pub(crate) fn set_pending(&self, flag: PendingFlag) -> u64 {
        let next = |word: u64| ((word >> 1).wrapping_add(1) << 1) | PENDING_BIT;
        let previous = self
            .flag(flag)
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| Some(next(word)))
            .unwrap_or_else(|word| word);
        next(previous) >> 1
    }

    /// Generation of the request that last raised `flag`
    pub fn pending_generation(&self, flag: PendingFlag) -> u64 {
        self.flag(flag).word.load(Ordering::Acquire) >> 1
    }

    /// Whether request `generation` still waits for its keyframe.
    ///
    /// False once a keyframe answered it or a newer request, or once the flag
    /// was dropped by a reset or by the owning sequence giving up.
    pub fn is_awaiting(&self, flag: PendingFlag, generation: u64) -> bool {
        let slot = self.flag(flag);
        self.is_pending(flag) && slot.confirmed.load(Ordering::Acquire) < generation
    }

    /// A keyframe arrived: clear `flag` for every outstanding request.
    ///
    /// Returns whether it was set.
    pub(crate) fn clear_pending(&self, flag: PendingFlag) -> bool {
        let slot = self.flag(flag);
        let word = slot.word.fetch_and(!PENDING_BIT, Ordering::AcqRel);
        if word & PENDING_BIT == 0 {
            return false;
        }
        slot.confirmed.fetch_max(word >> 1, Ordering::AcqRel);
        true
    }

    /// Drop `flag` without confirmation, only if request `generation` still owns it
    pub(crate) fn clear_pending_if(&self, flag: PendingFlag, generation: u64) -> bool {
        let raised = (generation << 1) | PENDING_BIT;
        self.flag(flag)
            .word
            .compare_exchange(raised, generation << 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a stream-up keyframe is awaited
    pub fn stream_keyframe_pending(&self) -> bool {
        self.is_pending(PendingFlag::Stream)
    }

    /// Whether a recording-start keyframe is awaited
    pub fn record_keyframe_pending(&self) -> bool {
        self.is_pending(PendingFlag::Record)
    }

    /// Whether a recording request is waiting for a sender address
    pub fn record_request_deferred(&self) -> bool {
        self.record_request_deferred.load(Ordering::Acquire)
    }

    pub(crate) fn set_record_deferred(&self) {
        self.record_request_deferred.store(true, Ordering::Release);
    }

    /// Clear the deferred recording request; returns whether it was set
    pub(crate) fn take_record_deferred(&self) -> bool {
        self.record_request_deferred.swap(false, Ordering::AcqRel)
    }
}
