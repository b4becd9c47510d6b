//! Keyframe request protocol
//!
//! When the picture is damaged or missing the receiver asks the sender for a
//! fresh keyframe by sending short UDP datagrams to the last-known sender
//! address. A request is a *sequence* of bursts; each burst repeats one random
//! three-letter token a few times so a single lost datagram does not lose the
//! request, and the token lets the sender collapse the repeats.
//!
//! Requests for reasons that expect a visible result (`stream-up`,
//! `record-start`) are *tracked*: they set a pending flag that the decode path
//! clears as soon as a keyframe actually arrives, and the remaining bursts are
//! skipped. Every other reason fires once.
//!
//! Sequences run as detached tasks on the Tokio runtime that created the
//! [`KeyframeRequester`] and never block the ingest path.

mod reason;
mod transport;

pub use reason::RepairReason;
pub use transport::{RepairTransport, UdpRepairTransport};

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::{ReceiverConfig, RepairTiming};
use crate::health::{HealthState, PendingFlag};
use crate::nal::find_keyframe;
use crate::types::CodecFamily;
use crate::{ReceiverError, Result};

/// What [`KeyframeRequester::request`] did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Repair is switched off; nothing changed
    Disabled,
    /// No sender known yet; the request will be retried on the next packet
    Deferred,
    /// No sender known and the reason is not deferrable; dropped
    NoSender,
    /// A repeat sequence was spawned
    Dispatched,
}

/// Issues keyframe requests and tracks their confirmation
pub struct KeyframeRequester {
    state: Arc<HealthState>,
    transport: Arc<dyn RepairTransport>,
    codec: CodecFamily,
    port: u16,
    timing: RepairTiming,
    enabled: AtomicBool,
    dispatched: AtomicU64,
    tracker: TaskTracker,
    runtime: Handle,
}

impl std::fmt::Debug for KeyframeRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyframeRequester")
            .field("codec", &self.codec)
            .field("port", &self.port)
            .field("enabled", &self.is_enabled())
            .field("dispatched", &self.dispatched_sequences())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl KeyframeRequester {
    /// Create a requester bound to the current Tokio runtime.
    ///
    /// Fails with [`ReceiverError::NoRuntime`] outside a runtime, since repair
    /// sequences are spawned onto it.
    pub fn new(state: Arc<HealthState>, transport: Arc<dyn RepairTransport>, config: &ReceiverConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| ReceiverError::NoRuntime { operation: "KeyframeRequester::new".to_string() })?;

        Ok(Self {
            state,
            transport,
            codec: config.codec,
            port: config.repair_port,
            timing: RepairTiming::default(),
            enabled: AtomicBool::new(config.keyframe_requests),
            dispatched: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            runtime,
        })
    }

    /// Override burst pacing
    pub fn with_timing(mut self, timing: RepairTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Flip the global kill-switch. Sequences already running finish normally.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(enabled, "Keyframe requests toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Codec family used for keyframe confirmation
    pub fn codec(&self) -> CodecFamily {
        self.codec
    }

    /// Shared health state
    pub fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    /// Number of repeat sequences spawned so far
    pub fn dispatched_sequences(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Number of repeat sequences still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Request a keyframe.
    ///
    /// Tracked reasons raise their pending flag even when no sender is known,
    /// so a keyframe arriving by other means still counts as confirmation.
    pub fn request(&self, reason: RepairReason, repeat_count: u32, allow_deferred: bool) -> RequestOutcome {
        if !self.is_enabled() {
            trace!(%reason, "Keyframe requests disabled");
            return RequestOutcome::Disabled;
        }

        let tracking = reason.tracking().map(|flag| (flag, self.state.set_pending(flag)));

        let Some(sender) = self.state.sender() else {
            if allow_deferred {
                self.state.set_record_deferred();
                info!(%reason, "Sender unknown, deferring keyframe request");
                return RequestOutcome::Deferred;
            }
            debug!(%reason, "Sender unknown, dropping keyframe request");
            return RequestOutcome::NoSender;
        };

        let target = SocketAddr::new(sender.ip(), self.port);
        let id = self.dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(%reason, %target, repeat_count, sequence = id, "Dispatching keyframe request");

        let sequence = RepeatSequence {
            id,
            reason,
            tracking,
            target,
            repeat_count,
            timing: self.timing,
            state: Arc::clone(&self.state),
            transport: Arc::clone(&self.transport),
        };
        self.tracker.spawn_on(sequence.run(), &self.runtime);

        RequestOutcome::Dispatched
    }

    /// Re-issue a deferred recording request, if one is waiting.
    ///
    /// Returns `None` when nothing was deferred.
    pub fn retry_deferred(&self, repeat_count: u32) -> Option<RequestOutcome> {
        if !self.is_enabled() || !self.state.take_record_deferred() {
            return None;
        }
        Some(self.request(RepairReason::RecordStartDeferred, repeat_count, false))
    }

    /// Check an access unit for a keyframe while any tracked request is open.
    ///
    /// Clears the matching pending flags and returns the keyframe's NAL type.
    pub fn observe_access_unit(&self, data: &[u8]) -> Option<u8> {
        if !self.is_enabled() {
            return None;
        }
        let stream = self.state.stream_keyframe_pending();
        let record = self.state.record_keyframe_pending();
        if !stream && !record {
            return None;
        }

        let nal_type = find_keyframe(data, self.codec)?;

        if stream && self.state.clear_pending(PendingFlag::Stream) {
            info!(nal_type, codec = %self.codec, "Stream-up keyframe confirmed");
        }
        if record && self.state.clear_pending(PendingFlag::Record) {
            self.state.take_record_deferred();
            info!(nal_type, codec = %self.codec, "Recording keyframe confirmed");
        }
        Some(nal_type)
    }

    /// Wait for every dispatched sequence to finish.
    ///
    /// New requests after shutdown are still accepted and tracked.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        debug!(dispatched = self.dispatched_sequences(), "Keyframe requester drained");
    }
}

/// One detached request: `repeat_count` bursts to a fixed target
struct RepeatSequence {
    id: u64,
    reason: RepairReason,
    /// Flag and request generation for tracked reasons
    tracking: Option<(PendingFlag, u64)>,
    target: SocketAddr,
    repeat_count: u32,
    timing: RepairTiming,
    state: Arc<HealthState>,
    transport: Arc<dyn RepairTransport>,
}

impl RepeatSequence {
    async fn run(self) {
        let gap = if self.reason.is_recording() { self.timing.record_burst_gap } else { self.timing.burst_gap };

        for burst in 0..self.repeat_count {
            if burst > 0 {
                tokio::time::sleep(gap).await;
            }
            if let Some((flag, generation)) = self.tracking {
                if !self.state.is_awaiting(flag, generation) {
                    debug!(reason = %self.reason, sequence = self.id, burst, "Confirmed, skipping remaining bursts");
                    return;
                }
            }
            self.send_burst(burst).await;
        }

        // A newer request of the same kind owns the flag from the moment it raised it
        if let Some((flag, generation)) = self.tracking {
            if self.state.clear_pending_if(flag, generation) {
                info!(
                    reason = %self.reason,
                    sequence = self.id,
                    bursts = self.repeat_count,
                    "No keyframe after all bursts, giving up"
                );
            }
        }
    }

    async fn send_burst(&self, burst: u32) {
        let token = random_token();
        let mut payload = [b'\n'; 4];
        payload[..3].copy_from_slice(&token);

        for datagram in 0..self.timing.datagrams_per_burst {
            if datagram > 0 {
                tokio::time::sleep(self.timing.datagram_spacing).await;
            }
            match self.transport.send(self.target, &payload).await {
                Ok(()) => trace!(
                    reason = %self.reason,
                    sequence = self.id,
                    burst,
                    datagram,
                    token = %String::from_utf8_lossy(&token),
                    "Keyframe request sent"
                ),
                Err(e) => warn!(reason = %self.reason, target = %self.target, "Keyframe request failed: {}", e),
            }
        }
    }
}

fn random_token() -> [u8; 3] {
    let mut rng = rand::rng();
    [rng.random_range(b'a'..=b'z'), rng.random_range(b'a'..=b'z'), rng.random_range(b'a'..=b'z')]
}
