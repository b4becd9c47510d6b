//! Access unit sources feeding the receiver

use futures::{Stream, StreamExt};

use crate::Result;
use crate::types::AccessUnit;

/// Trait for access unit sources
///
/// Sources abstract over the transport and demux layer (RTP depacketizer,
/// file replay, test vectors) and handle their own pacing internally.
#[async_trait::async_trait]
pub trait AccessUnitSource: Send + 'static {
    /// Get the next access unit
    ///
    /// Returns:
    /// - `Ok(Some(unit))` - New access unit available
    /// - `Ok(None)` - Stream ended (normal termination)
    /// - `Err(e)` - Error occurred; the ingest loop retries with backoff when
    ///   [`ReceiverError::is_retryable`](crate::ReceiverError::is_retryable)
    async fn next_unit(&mut self) -> Result<Option<AccessUnit>>;
}

/// Adapts any [`Stream`] of access units into an [`AccessUnitSource`]
pub struct StreamSource<S> {
    inner: S,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = AccessUnit> + Send + Unpin + 'static,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait::async_trait]
impl<S> AccessUnitSource for StreamSource<S>
where
    S: Stream<Item = AccessUnit> + Send + Unpin + 'static,
{
    async fn next_unit(&mut self) -> Result<Option<AccessUnit>> {
        Ok(self.inner.next().await)
    }
}
