//! Display stage: present the newest decoded picture

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::DisplaySink;
use crate::mailbox::{Delivery, Mailbox};
use crate::{ReceiverError, Result};

/// Name of the display thread
pub const DISPLAY_THREAD_NAME: &str = "fpv-display";

/// Counters returned when the display stage ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayStats {
    /// Successful commits
    pub presented: u64,
    /// Commits the display rejected
    pub commit_errors: u64,
    /// Largest decode-to-commit latency observed
    pub max_latency: Duration,
    total_latency: Duration,
}

impl DisplayStats {
    /// Mean decode-to-commit latency over presented frames
    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.presented) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_latency / n,
            Err(_) => Duration::ZERO,
        }
    }
}

/// Blocking consumer of the [`Mailbox`]
pub struct DisplayStage<S: DisplaySink> {
    sink: S,
    mailbox: Arc<Mailbox>,
}

impl<S: DisplaySink> DisplayStage<S> {
    pub fn new(sink: S, mailbox: Arc<Mailbox>) -> Self {
        Self { sink, mailbox }
    }

    /// Present frames until end-of-stream.
    ///
    /// A failed commit is logged and the loop continues with the next frame.
    pub fn run(mut self) -> DisplayStats {
        let mut stats = DisplayStats::default();
        debug!("Display stage started");

        loop {
            let frame = match self.mailbox.take() {
                Delivery::Frame(frame) => frame,
                Delivery::EndOfStream => break,
            };

            let latency = frame.decode_timestamp.elapsed();
            match self.sink.commit(frame.display_surface_id) {
                Ok(()) => {
                    stats.presented += 1;
                    stats.total_latency += latency;
                    stats.max_latency = stats.max_latency.max(latency);
                }
                Err(e) => {
                    stats.commit_errors += 1;
                    warn!(surface = %frame.display_surface_id, "Display commit failed: {}", e);
                }
            }
        }

        info!(
            presented = stats.presented,
            commit_errors = stats.commit_errors,
            dropped = self.mailbox.dropped_frames(),
            mean_latency_us = stats.mean_latency().as_micros() as u64,
            "Display stage ended"
        );
        stats
    }
}

impl<S: DisplaySink + 'static> DisplayStage<S> {
    /// Run the stage on a dedicated OS thread
    pub fn spawn(self) -> Result<JoinHandle<DisplayStats>> {
        thread::Builder::new()
            .name(DISPLAY_THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|source| ReceiverError::Thread { name: DISPLAY_THREAD_NAME.to_string(), source })
    }
}
