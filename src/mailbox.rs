//! Single-slot handoff from the decode stage to the display stage
//!
//! The decode stage never waits for the display: posting overwrites whatever
//! frame is still pending, so the display always presents the newest picture
//! and a slow commit drops frames instead of adding latency.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::SurfaceId;

/// The frame waiting to be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFrame {
    /// Surface to commit
    pub display_surface_id: SurfaceId,
    /// When the decoder accepted the packet this picture came from
    pub decode_timestamp: Instant,
}

/// What [`Mailbox::take`] hands to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The most recently posted frame
    Frame(PendingFrame),
    /// The stream finished and no frame is pending
    EndOfStream,
}

#[derive(Debug, Default)]
struct MailboxState {
    pending: Option<PendingFrame>,
    end_of_stream: bool,
    posted: u64,
    dropped: u64,
}

/// Overwrite-on-arrival single-slot mailbox
#[derive(Debug, Default)]
pub struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl Mailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a frame, replacing any frame not yet taken, and wake one consumer.
    pub fn post(&self, display_surface_id: SurfaceId, decode_timestamp: Instant) {
        let mut state = self.lock();
        let frame = PendingFrame { display_surface_id, decode_timestamp };
        if let Some(previous) = state.pending.replace(frame) {
            state.dropped += 1;
            trace!(dropped = %previous.display_surface_id, "Overwrote unpresented frame");
        }
        state.posted += 1;
        drop(state);
        self.ready.notify_one();
    }

    /// Block until a frame is pending or the stream has ended.
    ///
    /// A frame pending at end-of-stream is still delivered; termination is
    /// reported on the following call.
    pub fn take(&self) -> Delivery {
        let mut state = self.lock();
        loop {
            if let Some(delivery) = Self::try_deliver(&mut state) {
                return delivery;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Mailbox::take`] but gives up after `timeout`, returning `None`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(delivery) = Self::try_deliver(&mut state) {
                return Some(delivery);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn try_deliver(state: &mut MailboxState) -> Option<Delivery> {
        if let Some(frame) = state.pending.take() {
            return Some(Delivery::Frame(frame));
        }
        state.end_of_stream.then_some(Delivery::EndOfStream)
    }

    /// Mark the stream finished and wake every waiting consumer.
    pub fn signal_end_of_stream(&self) {
        let mut state = self.lock();
        if !state.end_of_stream {
            debug!(posted = state.posted, dropped = state.dropped, "Mailbox end of stream");
        }
        state.end_of_stream = true;
        drop(state);
        self.ready.notify_all();
    }

    /// Drop the pending frame, if any, without presenting it.
    ///
    /// Must be called before the surface it refers to is unbound.
    pub fn discard_pending(&self) -> Option<PendingFrame> {
        let mut state = self.lock();
        let discarded = state.pending.take();
        if let Some(frame) = discarded {
            state.dropped += 1;
            trace!(surface = %frame.display_surface_id, "Discarded pending frame");
        }
        discarded
    }

    /// Whether a frame is waiting to be taken
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Whether end-of-stream has been signalled
    pub fn is_finished(&self) -> bool {
        self.lock().end_of_stream
    }

    /// Frames overwritten before the display took them
    pub fn dropped_frames(&self) -> u64 {
        self.lock().dropped
    }

    /// Frames posted in total
    pub fn posted_frames(&self) -> u64 {
        self.lock().posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn take_returns_latest_post() {
        let mailbox = Mailbox::new();
        let now = Instant::now();
        mailbox.post(SurfaceId(1), now);
        mailbox.post(SurfaceId(2), now);
        mailbox.post(SurfaceId(3), now);

        match mailbox.take() {
            Delivery::Frame(frame) => assert_eq!(frame.display_surface_id, SurfaceId(3)),
            Delivery::EndOfStream => panic!("Expected a frame"),
        }
        assert_eq!(mailbox.dropped_frames(), 2);
        assert_eq!(mailbox.posted_frames(), 3);
    }

    #[test]
    fn pending_frame_drains_before_end_of_stream() {
        let mailbox = Mailbox::new();
        mailbox.post(SurfaceId(7), Instant::now());
        mailbox.signal_end_of_stream();

        assert!(matches!(mailbox.take(), Delivery::Frame(f) if f.display_surface_id == SurfaceId(7)));
        assert_eq!(mailbox.take(), Delivery::EndOfStream);
        assert_eq!(mailbox.take(), Delivery::EndOfStream);
    }

    #[test]
    fn end_of_stream_wakes_blocked_consumer() {
        let mailbox = Arc::new(Mailbox::new());
        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.take())
        };

        thread::sleep(Duration::from_millis(50));
        mailbox.signal_end_of_stream();

        assert_eq!(consumer.join().unwrap(), Delivery::EndOfStream);
        assert!(mailbox.is_finished());
    }

    #[test]
    fn post_wakes_blocked_consumer() {
        let mailbox = Arc::new(Mailbox::new());
        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.take())
        };

        thread::sleep(Duration::from_millis(50));
        mailbox.post(SurfaceId(4), Instant::now());

        assert!(matches!(consumer.join().unwrap(), Delivery::Frame(f) if f.display_surface_id == SurfaceId(4)));
    }

    #[test]
    fn discarded_frame_is_never_delivered() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.discard_pending(), None);

        mailbox.post(SurfaceId(5), Instant::now());
        assert_eq!(mailbox.discard_pending().map(|f| f.display_surface_id), Some(SurfaceId(5)));
        assert_eq!(mailbox.take_timeout(Duration::ZERO), None);
        assert_eq!(mailbox.dropped_frames(), 1);

        mailbox.post(SurfaceId(6), Instant::now());
        assert!(matches!(mailbox.take(), Delivery::Frame(f) if f.display_surface_id == SurfaceId(6)));
    }

    #[test]
    fn take_timeout_expires_when_idle() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.take_timeout(Duration::from_millis(20)), None);

        mailbox.post(SurfaceId(1), Instant::now());
        assert!(matches!(mailbox.take_timeout(Duration::from_millis(20)), Some(Delivery::Frame(_))));
    }

    proptest! {
        #[test]
        fn only_the_most_recent_post_is_delivered(ids in prop::collection::vec(any::<u32>(), 1..32)) {
            let mailbox = Mailbox::new();
            let now = Instant::now();
            for id in &ids {
                mailbox.post(SurfaceId(*id), now);
            }

            let last = *ids.last().unwrap();
            prop_assert_eq!(
                mailbox.take_timeout(Duration::ZERO),
                Some(Delivery::Frame(PendingFrame { display_surface_id: SurfaceId(last), decode_timestamp: now }))
            );
            prop_assert_eq!(mailbox.take_timeout(Duration::ZERO), None);
            prop_assert_eq!(mailbox.dropped_frames(), ids.len() as u64 - 1);
        }
    }
}
