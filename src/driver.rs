//! Driver spawns and manages the receiver's async tasks

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::ReceiverError;
use crate::backend::{HardwareDecoder, SurfaceAllocator};
use crate::health::StreamHealth;
use crate::mailbox::Mailbox;
use crate::pipeline::{DecodeStage, DecodeStats};
use crate::source::AccessUnitSource;

/// Consecutive source errors tolerated before ingestion stops
const MAX_ERRORS: u32 = 10;

/// Why ingestion stopped
#[derive(Debug)]
pub enum IngestEnd {
    /// The source reported end of stream
    EndOfStream,
    /// The cancellation token fired
    Cancelled,
    /// The source kept failing or failed permanently
    SourceFailed(ReceiverError),
    /// The decode stage hit an unrecoverable pool error
    Fatal(ReceiverError),
}

/// Result of the ingest task
#[derive(Debug)]
pub struct IngestSummary {
    pub units: u64,
    pub decode: DecodeStats,
    pub end: IngestEnd,
}

/// Handles to the spawned driver tasks
pub struct DriverChannels {
    /// Ingest task: source → health → decode stage
    pub ingest: JoinHandle<IngestSummary>,
    /// Periodic health tick
    pub ticker: JoinHandle<()>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Driver spawns and manages the ingest and health tasks
///
/// The ingest task owns the source and the decode stage. Each access unit is
/// first shown to the health monitor, then decoded. When ingestion ends for
/// any reason the mailbox receives end-of-stream and the ticker stops.
pub struct Driver;

impl Driver {
    /// Spawn driver tasks on the current runtime
    pub fn spawn<S, D, A>(source: S, stage: DecodeStage<D, A>, mailbox: Arc<Mailbox>) -> DriverChannels
    where
        S: AccessUnitSource,
        D: HardwareDecoder + 'static,
        A: SurfaceAllocator + 'static,
    {
        let cancel = CancellationToken::new();
        let health = Arc::clone(stage.health());

        let ticker = tokio::spawn(Self::ticker_task(health, cancel.clone()));
        let ingest = tokio::spawn(Self::ingest_task(source, stage, mailbox, cancel.clone()));

        DriverChannels { ingest, ticker, cancel }
    }

    async fn ingest_task<S, D, A>(
        mut source: S,
        mut stage: DecodeStage<D, A>,
        mailbox: Arc<Mailbox>,
        cancel: CancellationToken,
    ) -> IngestSummary
    where
        S: AccessUnitSource,
        D: HardwareDecoder,
        A: SurfaceAllocator,
    {
        info!("Ingest task started");
        let health = Arc::clone(stage.health());
        let mut units = 0u64;
        let mut error_count = 0u32;

        let end = loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Ingest cancelled");
                    break IngestEnd::Cancelled;
                }
                result = source.next_unit() => result,
            };

            match result {
                Ok(Some(unit)) => {
                    units += 1;
                    error_count = 0;
                    trace!(unit = units, pts = unit.pts, bytes = unit.len(), "Access unit");

                    health.on_access_unit(&unit);
                    if let Err(e) = stage.feed(&unit) {
                        error!("Decode stage failed: {}", e);
                        break IngestEnd::Fatal(e);
                    }
                }
                Ok(None) => {
                    info!("Source ended after {} access units", units);
                    break IngestEnd::EndOfStream;
                }
                Err(e) if !e.is_retryable() => {
                    error!("Source failed permanently: {}", e);
                    break IngestEnd::SourceFailed(e);
                }
                Err(e) => {
                    // Transient source failures are retried
                    error_count += 1;
                    error!("Source error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many source errors, shutting down");
                        break IngestEnd::SourceFailed(e);
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => break IngestEnd::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        mailbox.signal_end_of_stream();
        cancel.cancel();
        stage.teardown();

        info!(units, end = ?end, "Ingest task ended");
        IngestSummary { units, decode: stage.stats(), end }
    }

    async fn ticker_task(health: Arc<StreamHealth>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(health.timing().tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_ms = health.timing().tick_interval.as_millis() as u64, "Health ticker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    health.tick();
                }
            }
        }
        debug!("Health ticker stopped");
    }
}
