//! Stream health state machine

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::state::HealthState;
use crate::config::HealthTiming;
use crate::repair::{KeyframeRequester, RepairReason, RequestOutcome};
use crate::types::{AccessUnit, seq_after, seq_distance};

/// Link state published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    #[default]
    Down,
}

/// What a single packet did to the health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketReport {
    /// This packet brought the stream up
    pub came_up: bool,
    /// Same sequence number as the previous packet
    pub duplicate: bool,
    /// Packets skipped by this packet's sequence number
    pub lost_packets: u16,
    /// An `rtp-gap` request was triggered
    pub gap_request: bool,
    /// The sequence base was replaced after a long reorder
    pub rebased: bool,
}

/// What a health tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// The stream was declared down
    pub went_down: bool,
    /// A `decode-stall` request was triggered
    pub stall_request: bool,
}

/// Point-in-time view of the health state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub link: LinkState,
    pub sender: Option<SocketAddr>,
    pub last_packet_age_ms: Option<u64>,
    pub last_decoded_age_ms: Option<u64>,
    pub last_rtp_sequence: Option<u16>,
    pub lost_packets: u64,
    pub stream_keyframe_pending: bool,
    pub record_keyframe_pending: bool,
    pub record_request_deferred: bool,
    pub repair_enabled: bool,
    pub repair_sequences: u64,
}

/// Stream health monitor
///
/// Packet observations come from the ingest path, decoded-picture
/// observations from the decode stage and ticks from a periodic timer. All
/// three may run concurrently.
pub struct StreamHealth {
    state: Arc<HealthState>,
    requester: Arc<KeyframeRequester>,
    timing: HealthTiming,
    link: watch::Sender<LinkState>,
}

impl StreamHealth {
    /// Create a monitor sharing `requester`'s health state
    pub fn new(requester: Arc<KeyframeRequester>, timing: HealthTiming) -> Self {
        let (link, _) = watch::channel(LinkState::Down);
        Self { state: Arc::clone(requester.state()), requester, timing, link }
    }

    pub fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    pub fn requester(&self) -> &Arc<KeyframeRequester> {
        &self.requester
    }

    pub fn timing(&self) -> &HealthTiming {
        &self.timing
    }

    /// Subscribe to link state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Observe an access unit's network metadata
    pub fn on_access_unit(&self, unit: &AccessUnit) -> PacketReport {
        self.on_packet_at(Instant::now(), unit.sender, unit.rtp_sequence)
    }

    /// Observe a packet now
    pub fn on_packet(&self, sender: Option<SocketAddr>, rtp_sequence: Option<u16>) -> PacketReport {
        self.on_packet_at(Instant::now(), sender, rtp_sequence)
    }

    /// Observe a packet received at `now`.
    ///
    /// The first packet while down brings the stream up and requests a
    /// tracked `stream-up` keyframe. A deferred recording request is re-issued
    /// as soon as a packet names its sender.
    pub fn on_packet_at(&self, now: Instant, sender: Option<SocketAddr>, rtp_sequence: Option<u16>) -> PacketReport {
        let mut report = PacketReport::default();

        self.state.record_packet(now);
        if let Some(sender) = sender {
            self.state.set_sender(sender);
            if self.state.record_request_deferred() {
                if let Some(outcome) = self.requester.retry_deferred(self.timing.record_start_bursts) {
                    debug!(?outcome, %sender, "Re-issued deferred recording request");
                }
            }
        }

        if self.state.mark_up() {
            info!(sender = ?self.state.sender(), "Stream up");
            self.state.clear_rtp_sequence();
            self.link.send_replace(LinkState::Up);
            self.requester.request(RepairReason::StreamUp, self.timing.stream_up_bursts, false);
            report.came_up = true;
        }

        if let Some(seq) = rtp_sequence {
            self.track_sequence(now, seq, &mut report);
        }
        report
    }

    fn track_sequence(&self, now: Instant, seq: u16, report: &mut PacketReport) {
        let Some((last, age)) = self.state.rtp_sequence(now) else {
            self.state.set_rtp_sequence(seq, now);
            return;
        };

        match seq_distance(seq, last) {
            0 => report.duplicate = true,
            1 => self.state.set_rtp_sequence(seq, now),
            diff if diff < self.timing.reorder_threshold => {
                let lost = diff - 1;
                report.lost_packets = lost;
                self.state.add_lost_packets(lost as u64);
                self.state.set_rtp_sequence(seq, now);

                if self.requester.is_enabled() && self.state.claim_gap_request(now, self.timing.gap_cooldown) {
                    debug!(lost, last, seq, "RTP gap");
                    self.requester.request(RepairReason::RtpGap, 1, false);
                    report.gap_request = true;
                } else {
                    trace!(lost, last, seq, "RTP gap within cooldown");
                }
            }
            _ => {
                if age > self.timing.rebase_after {
                    debug!(last, seq, age_ms = age.as_millis() as u64, "Rebasing RTP sequence");
                    self.state.set_rtp_sequence(seq, now);
                    report.rebased = true;
                } else {
                    trace!(last, seq, late = !seq_after(seq, last), "Ignoring reordered packet");
                }
            }
        }
    }

    /// Record that a picture was decoded now
    pub fn on_frame_decoded(&self) {
        self.on_frame_decoded_at(Instant::now());
    }

    /// Record that a picture was decoded at `now`
    pub fn on_frame_decoded_at(&self, now: Instant) {
        self.state.record_decoded(now);
    }

    /// Periodic evaluation at the current time
    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Periodic evaluation at `now`: link-down and decode-stall detection.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        if !self.state.is_stream_up() {
            return report;
        }

        let packet_age = self.state.packet_age(now);
        if let Some(silence) = packet_age.filter(|age| *age > self.timing.down_after) {
            if self.state.mark_down() {
                info!(silence_ms = silence.as_millis() as u64, "Stream down");
                self.state.clear_rtp_sequence();
                self.link.send_replace(LinkState::Down);
                report.went_down = true;
            }
            return report;
        }

        let (Some(decoded_age), Some(packet_age)) = (self.state.decoded_age(now), packet_age) else {
            return report;
        };
        if decoded_age > self.timing.stall_after
            && packet_age <= self.timing.stall_packet_window
            && self.requester.is_enabled()
            && self.state.claim_stall_request(now, self.timing.stall_cooldown)
        {
            info!(
                decoded_age_ms = decoded_age.as_millis() as u64,
                packet_age_ms = packet_age.as_millis() as u64,
                "Decoder stalled while packets arrive"
            );
            self.requester.request(RepairReason::DecodeStall, 1, false);
            report.stall_request = true;
        }
        report
    }

    /// Integrity repair requested by the decoder's error path, now
    pub fn request_integrity_repair(&self) -> bool {
        self.request_integrity_repair_at(Instant::now())
    }

    /// Integrity repair at `now`; returns whether a request was triggered.
    ///
    /// Ignored while the stream is down and rate-limited while up.
    pub fn request_integrity_repair_at(&self, now: Instant) -> bool {
        if !self.state.is_stream_up() || !self.requester.is_enabled() {
            return false;
        }
        if !self.state.claim_integrity_request(now, self.timing.integrity_cooldown) {
            trace!("Integrity request within cooldown");
            return false;
        }
        debug!("Integrity repair requested");
        self.requester.request(RepairReason::Integrity, 1, false);
        true
    }

    /// Ask for a keyframe to start a recording on.
    ///
    /// Deferred until a sender is known if necessary.
    pub fn request_recording_keyframe(&self) -> RequestOutcome {
        self.requester.request(RepairReason::RecordStart, self.timing.record_start_bursts, true)
    }

    /// Forget the current source entirely, e.g. after reconnecting
    pub fn reset(&self) {
        self.state.reset();
        self.link.send_if_modified(|link| std::mem::replace(link, LinkState::Down) != LinkState::Down);
        info!("Stream health reset");
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Snapshot of the health state as seen at `now`
    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            link: if self.state.is_stream_up() { LinkState::Up } else { LinkState::Down },
            sender: self.state.sender(),
            last_packet_age_ms: self.state.packet_age(now).map(|age| age.as_millis() as u64),
            last_decoded_age_ms: self.state.decoded_age(now).map(|age| age.as_millis() as u64),
            last_rtp_sequence: self.state.rtp_sequence(now).map(|(seq, _)| seq),
            lost_packets: self.state.lost_packets(),
            stream_keyframe_pending: self.state.stream_keyframe_pending(),
            record_keyframe_pending: self.state.record_keyframe_pending(),
            record_request_deferred: self.state.record_request_deferred(),
            repair_enabled: self.requester.is_enabled(),
            repair_sequences: self.requester.dispatched_sequences(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiverConfig;
    use crate::repair::RepairTransport;
    use crate::test_utils::{RecordingTransport, init_tracing};
    use proptest::prelude::*;
    use std::time::Duration;

    fn sender() -> Option<SocketAddr> {
        Some("192.168.1.20:5600".parse().unwrap())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn monitor(transport: &Arc<RecordingTransport>) -> StreamHealth {
        init_tracing();
        let state = Arc::new(HealthState::new());
        let transport: Arc<dyn RepairTransport> = transport.clone();
        let requester = KeyframeRequester::new(state, transport, &ReceiverConfig::default()).unwrap();
        StreamHealth::new(Arc::new(requester), HealthTiming::default())
    }

    #[tokio::test(start_paused = true)]
    async fn first_packet_brings_stream_up() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let mut link = health.subscribe();
        let t0 = Instant::now();

        let report = health.on_packet_at(t0, sender(), Some(100));
        assert!(report.came_up);
        assert!(health.state().is_stream_up());
        assert!(health.state().stream_keyframe_pending());
        assert!(link.has_changed().unwrap());
        assert_eq!(*link.borrow_and_update(), LinkState::Up);

        let report = health.on_packet_at(t0 + ms(5), sender(), Some(101));
        assert!(!report.came_up);
        assert_eq!(health.requester().dispatched_sequences(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_takes_stream_down_once_then_back_up() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        // Up without a sender: the stream-up request has nowhere to go
        health.on_packet_at(t0, None, Some(1));
        assert!(transport.sent().is_empty());

        assert!(!health.tick_at(t0 + ms(1000)).went_down);
        assert!(health.tick_at(t0 + ms(1300)).went_down);
        assert!(!health.tick_at(t0 + ms(1500)).went_down);
        assert_eq!(health.link_state(), LinkState::Down);
        assert_eq!(health.state().rtp_sequence(t0 + ms(1500)), None);

        let report = health.on_packet_at(t0 + ms(1600), sender(), Some(2));
        assert!(report.came_up);
        assert_eq!(health.link_state(), LinkState::Up);

        health.requester().shutdown().await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 9);
        assert!(sent[3].at - sent[2].at >= ms(100));
        assert!(sent[6].at - sent[5].at >= ms(100));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_gaps_count_losses_and_trigger_requests() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), Some(10));
        assert!(health.on_packet_at(t0 + ms(1), sender(), Some(10)).duplicate);

        let report = health.on_packet_at(t0 + ms(2), sender(), Some(14));
        assert_eq!(report.lost_packets, 3);
        assert!(report.gap_request);

        let report = health.on_packet_at(t0 + ms(3), sender(), Some(20));
        assert_eq!(report.lost_packets, 5);
        assert!(!report.gap_request);

        let report = health.on_packet_at(t0 + ms(600), sender(), Some(22));
        assert!(report.gap_request);
        assert_eq!(health.state().lost_packets(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_wraps_without_loss() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), Some(65535));
        let report = health.on_packet_at(t0 + ms(1), sender(), Some(0));
        assert_eq!(report.lost_packets, 0);
        assert!(!report.gap_request);
        assert_eq!(health.state().rtp_sequence(t0 + ms(1)).map(|(seq, _)| seq), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn reordered_packets_rebase_only_when_stale() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), Some(5000));
        let report = health.on_packet_at(t0 + ms(10), sender(), Some(4990));
        assert!(!report.rebased);
        assert_eq!(report.lost_packets, 0);
        assert_eq!(health.state().rtp_sequence(t0 + ms(10)).map(|(seq, _)| seq), Some(5000));

        let report = health.on_packet_at(t0 + ms(1100), sender(), Some(4990));
        assert!(report.rebased);
        assert_eq!(health.state().rtp_sequence(t0 + ms(1100)).map(|(seq, _)| seq), Some(4990));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_is_detected_and_rate_limited() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), None);
        health.on_frame_decoded_at(t0);

        let mut stalls = Vec::new();
        for step in 1..=40u64 {
            let now = t0 + ms(step * 50);
            health.on_packet_at(now, sender(), None);
            if step % 4 == 0 && health.tick_at(now).stall_request {
                stalls.push(step * 50);
            }
        }

        // Decoded age first exceeds 700 ms at the 800 ms tick; the next
        // triggers follow the 700 ms cooldown on the 200 ms tick grid.
        assert_eq!(stalls, vec![800, 1600]);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_needs_recent_packets() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), None);
        health.on_frame_decoded_at(t0);

        // Packets stopped 600 ms ago: not a decoder stall, just silence
        assert!(!health.tick_at(t0 + ms(800)).stall_request);
        health.on_packet_at(t0 + ms(900), sender(), None);
        assert!(health.tick_at(t0 + ms(1000)).stall_request);
    }

    #[tokio::test(start_paused = true)]
    async fn integrity_requests_are_rate_limited_while_up() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        assert!(!health.request_integrity_repair_at(t0));

        health.on_packet_at(t0, sender(), None);
        assert!(health.request_integrity_repair_at(t0 + ms(10)));
        assert!(!health.request_integrity_repair_at(t0 + ms(300)));
        assert!(health.request_integrity_repair_at(t0 + ms(400)));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_repair_keeps_cooldowns_unclaimed() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();
        health.requester().set_enabled(false);

        health.on_packet_at(t0, sender(), Some(1));
        assert!(!health.on_packet_at(t0 + ms(1), sender(), Some(5)).gap_request);
        assert!(!health.request_integrity_repair_at(t0 + ms(2)));

        health.requester().set_enabled(true);
        assert!(health.on_packet_at(t0 + ms(3), sender(), Some(9)).gap_request);
        assert!(health.request_integrity_repair_at(t0 + ms(4)));

        health.requester().shutdown().await;
        // Only the two requests made after re-enabling produced traffic
        assert_eq!(transport.sent().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_recording_request_fires_once_sender_is_known() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        assert_eq!(health.request_recording_keyframe(), RequestOutcome::Deferred);
        assert!(health.state().record_request_deferred());

        health.on_packet_at(t0, None, None);
        assert!(health.state().record_request_deferred());

        health.on_packet_at(t0 + ms(10), sender(), None);
        assert!(!health.state().record_request_deferred());
        // stream-up had no sender to go to; only record-start-deferred left
        assert_eq!(health.requester().dispatched_sequences(), 1);
        assert!(health.state().record_keyframe_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_source() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), Some(7));
        health.reset();

        let snapshot = health.snapshot(t0);
        assert_eq!(snapshot.link, LinkState::Down);
        assert_eq!(snapshot.sender, None);
        assert_eq!(snapshot.last_rtp_sequence, None);
        assert_eq!(health.link_state(), LinkState::Down);

        assert!(health.on_packet_at(t0 + ms(5), sender(), Some(8)).came_up);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reflects_state() {
        let transport = Arc::new(RecordingTransport::new());
        let health = monitor(&transport);
        let t0 = Instant::now();

        health.on_packet_at(t0, sender(), Some(1));
        health.on_packet_at(t0 + ms(20), sender(), Some(4));
        health.on_frame_decoded_at(t0 + ms(30));

        let snapshot = health.snapshot(t0 + ms(100));
        assert_eq!(snapshot.link, LinkState::Up);
        assert_eq!(snapshot.sender, sender());
        assert_eq!(snapshot.last_packet_age_ms, Some(80));
        assert_eq!(snapshot.last_decoded_age_ms, Some(70));
        assert_eq!(snapshot.last_rtp_sequence, Some(4));
        assert_eq!(snapshot.lost_packets, 2);
        assert!(snapshot.stream_keyframe_pending);
        assert_eq!(snapshot.repair_sequences, 2);

        let yaml = serde_yaml_ng::to_string(&snapshot).unwrap();
        assert!(yaml.contains("link: up"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn gap_requests_respect_cooldown(steps in prop::collection::vec((1u64..200, 2u16..50), 1..60)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
            runtime.block_on(async {
                let transport = Arc::new(RecordingTransport::new());
                let health = monitor(&transport);
                let t0 = Instant::now();

                let mut now = t0;
                let mut seq = 0u16;
                health.on_packet_at(now, sender(), Some(seq));

                let mut fired = Vec::new();
                for (advance, jump) in steps {
                    now += ms(advance);
                    seq = seq.wrapping_add(jump);
                    if health.on_packet_at(now, sender(), Some(seq)).gap_request {
                        fired.push(now);
                    }
                }

                for pair in fired.windows(2) {
                    prop_assert!(pair[1] - pair[0] >= ms(500));
                }
                Ok(())
            })?;
        }
    }
}
