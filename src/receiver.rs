//! Assembled receiver: tasks, threads and shared state wired together

use futures::Stream;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::backend::{DisplaySink, HardwareDecoder, SurfaceAllocator};
use crate::config::{DEFAULT_POOL_SIZE, HealthTiming, ReceiverConfig};
use crate::driver::{Driver, IngestSummary};
use crate::health::{HealthSnapshot, HealthState, LinkState, StreamHealth};
use crate::mailbox::Mailbox;
use crate::pipeline::{DecodeStage, DisplayStage, DisplayStats};
use crate::pool::FramePool;
use crate::repair::{KeyframeRequester, RepairTransport, RequestOutcome, UdpRepairTransport};
use crate::source::AccessUnitSource;

/// What the receiver's tasks reported when they finished
#[derive(Debug)]
pub struct ReceiverSummary {
    /// `None` if the ingest task panicked
    pub ingest: Option<IngestSummary>,
    /// `None` if the display thread panicked
    pub display: Option<DisplayStats>,
}

/// Running FPV receiver
///
/// Owns the ingest task, the health ticker and the display thread. Dropping
/// the receiver cancels ingestion; [`Receiver::shutdown`] additionally waits
/// for every task and in-flight repair sequence.
pub struct Receiver {
    health: Arc<StreamHealth>,
    mailbox: Arc<Mailbox>,
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    ingest: Option<JoinHandle<IngestSummary>>,
    ticker: Option<JoinHandle<()>>,
    display: Option<std::thread::JoinHandle<DisplayStats>>,
}

impl Receiver {
    /// Start a receiver sending repair requests over UDP.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S, D, A, K>(config: &ReceiverConfig, source: S, decoder: D, allocator: A, display: K) -> Result<Self>
    where
        S: AccessUnitSource,
        D: HardwareDecoder + 'static,
        A: SurfaceAllocator + 'static,
        K: DisplaySink + 'static,
    {
        Self::start_with_transport(config, source, decoder, allocator, display, Arc::new(UdpRepairTransport::new()))
    }

    /// Start a receiver with a custom repair transport
    pub fn start_with_transport<S, D, A, K>(
        config: &ReceiverConfig,
        source: S,
        decoder: D,
        allocator: A,
        display: K,
        transport: Arc<dyn RepairTransport>,
    ) -> Result<Self>
    where
        S: AccessUnitSource,
        D: HardwareDecoder + 'static,
        A: SurfaceAllocator + 'static,
        K: DisplaySink + 'static,
    {
        let state = Arc::new(HealthState::new());
        let requester = Arc::new(KeyframeRequester::new(state, transport, config)?);
        let health = Arc::new(StreamHealth::new(requester, HealthTiming::default()));
        let link = health.subscribe();
        let mailbox = Arc::new(Mailbox::new());

        // Display first: if its thread cannot start, nothing else is running yet
        let display = DisplayStage::new(display, Arc::clone(&mailbox)).spawn()?;

        let pool = FramePool::with_capacity(allocator, DEFAULT_POOL_SIZE);
        let stage = DecodeStage::new(decoder, pool, Arc::clone(&mailbox), Arc::clone(&health));
        let channels = Driver::spawn(source, stage, Arc::clone(&mailbox));

        info!(
            codec = %config.codec,
            repair_port = config.repair_port,
            keyframe_requests = config.keyframe_requests,
            "Receiver started"
        );

        Ok(Self {
            health,
            mailbox,
            link,
            cancel: channels.cancel,
            ingest: Some(channels.ingest),
            ticker: Some(channels.ticker),
            display: Some(display),
        })
    }

    /// Link state changes as a stream
    ///
    /// Yields the current state immediately, then every transition.
    pub fn link_updates(&self) -> impl Stream<Item = LinkState> + 'static {
        WatchStream::new(self.link.clone())
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn health(&self) -> &Arc<StreamHealth> {
        &self.health
    }

    pub fn requester(&self) -> &Arc<KeyframeRequester> {
        self.health.requester()
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Health snapshot at the current time
    pub fn snapshot(&self) -> HealthSnapshot {
        self.health.snapshot(tokio::time::Instant::now())
    }

    /// Ask for a keyframe to start a recording on
    pub fn request_recording_keyframe(&self) -> RequestOutcome {
        self.health.request_recording_keyframe()
    }

    /// Whether ingestion has stopped
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop ingestion and wait for every task to finish
    pub async fn shutdown(mut self) -> ReceiverSummary {
        info!("Receiver shutting down");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the source to end on its own, then clean up
    pub async fn wait(mut self) -> ReceiverSummary {
        self.join().await
    }

    async fn join(&mut self) -> ReceiverSummary {
        let ingest = match self.ingest.take() {
            Some(handle) => handle.await.map_err(|e| error!("Ingest task failed: {}", e)).ok(),
            None => None,
        };

        // The ingest task signals end-of-stream on every exit path, but make
        // sure the display thread is released even if it panicked.
        self.mailbox.signal_end_of_stream();

        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                error!("Health ticker failed: {}", e);
            }
        }

        let display_stats = match self.display.take() {
            Some(handle) => match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(stats)) => Some(stats),
                Ok(Err(_)) => {
                    error!("Display thread panicked");
                    None
                }
                Err(e) => {
                    error!("Failed to join display thread: {}", e);
                    None
                }
            },
            None => None,
        };

        self.health.requester().shutdown().await;
        debug!(?ingest, display = ?display_stats, "Receiver stopped");
        ReceiverSummary { ingest, display: display_stats }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        debug!("Dropping receiver");
        // Cancel tasks on drop for clean shutdown
        self.cancel.cancel();
        self.mailbox.signal_end_of_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IngestEnd;
    use crate::source::StreamSource;
    use crate::test_utils::{
        FakeAllocator, RecordingDisplay, RecordingTransport, ScriptedDecoder, h265_unit, init_tracing,
    };
    use crate::types::{AccessUnit, PictureFormat, PixelFormat};
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct Parts {
        tx: mpsc::Sender<AccessUnit>,
        decoder: ScriptedDecoder,
        allocator: FakeAllocator,
        display: RecordingDisplay,
        transport: Arc<RecordingTransport>,
        receiver: Receiver,
    }

    fn start(config: ReceiverConfig) -> Parts {
        init_tracing();
        let (tx, rx) = mpsc::channel(16);
        let decoder = ScriptedDecoder::auto(PictureFormat::new(1280, 720, PixelFormat::Nv12));
        let allocator = FakeAllocator::new();
        let display = RecordingDisplay::new();
        let transport = Arc::new(RecordingTransport::new());

        let receiver = Receiver::start_with_transport(
            &config,
            StreamSource::new(ReceiverStream::new(rx)),
            decoder.clone(),
            allocator.clone(),
            display.clone(),
            transport.clone(),
        )
        .unwrap();

        Parts { tx, decoder, allocator, display, transport, receiver }
    }

    fn unit(pts: u64) -> AccessUnit {
        h265_unit(pts, pts == 1).with_sender("127.0.0.1:5600".parse().unwrap()).with_rtp_sequence(pts as u16)
    }

    #[tokio::test]
    async fn stream_flows_to_display() {
        let parts = start(ReceiverConfig::default());
        let requester = Arc::clone(parts.receiver.requester());
        let mut link = Box::pin(parts.receiver.link_updates());
        assert_eq!(link.next().await, Some(LinkState::Down));

        for pts in 1..=3 {
            parts.tx.send(unit(pts)).await.unwrap();
        }
        assert_eq!(link.next().await, Some(LinkState::Up));
        // A frame still pending at end of stream is discarded with its pool
        while parts.display.commits().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        drop(parts.tx);

        let summary = parts.receiver.wait().await;
        let ingest = summary.ingest.unwrap();
        assert!(matches!(ingest.end, IngestEnd::EndOfStream));
        assert_eq!(ingest.units, 3);
        assert_eq!(ingest.decode.keyframes, 1);
        assert_eq!(parts.decoder.submitted(), vec![1, 2, 3]);

        let display = summary.display.unwrap();
        assert!(display.presented >= 1);
        assert_eq!(display.presented as usize, parts.display.commits().len());

        assert_eq!(parts.allocator.live_allocations(), 0);
        assert_eq!(parts.allocator.max_bound_surfaces(), DEFAULT_POOL_SIZE);

        // The first unit carried a keyframe, confirming stream-up before the
        // repair sequence got to its first burst
        assert_eq!(requester.dispatched_sequences(), 1);
        assert!(!requester.state().stream_keyframe_pending());
        assert!(parts.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_keyframe_triggers_repair_bursts() {
        let parts = start(ReceiverConfig::default());
        let requester = Arc::clone(parts.receiver.requester());

        let trail = h265_unit(7, false).with_sender("127.0.0.1:5600".parse().unwrap());
        parts.tx.send(trail).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2000)).await;
        drop(parts.tx);

        parts.receiver.wait().await;
        let sent = parts.transport.sent();
        assert_eq!(sent.len(), 9);
        assert!(sent.iter().all(|d| d.target == "127.0.0.1:11223".parse().unwrap()));
        assert!(!requester.state().stream_keyframe_pending());
    }

    #[tokio::test]
    async fn disabled_repair_sends_nothing() {
        let parts = start(ReceiverConfig { keyframe_requests: false, ..ReceiverConfig::default() });
        let requester = Arc::clone(parts.receiver.requester());

        parts.tx.send(unit(2)).await.unwrap();
        parts.tx.send(unit(5)).await.unwrap();
        drop(parts.tx);

        let summary = parts.receiver.wait().await;

        assert_eq!(summary.ingest.map(|i| i.units), Some(2));
        assert_eq!(requester.dispatched_sequences(), 0);
        assert!(parts.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_idle_source() {
        let parts = start(ReceiverConfig::default());
        let summary = parts.receiver.shutdown().await;

        assert!(matches!(summary.ingest.map(|i| i.end), Some(IngestEnd::Cancelled)));
        assert_eq!(summary.display.map(|d| d.presented), Some(0));
        drop(parts.tx);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (_tx, rx) = mpsc::channel::<AccessUnit>(1);
        let result = Receiver::start(
            &ReceiverConfig::default(),
            StreamSource::new(ReceiverStream::new(rx)),
            ScriptedDecoder::new(),
            FakeAllocator::new(),
            RecordingDisplay::new(),
        );
        assert!(matches!(result, Err(crate::ReceiverError::NoRuntime { .. })));
    }
}
