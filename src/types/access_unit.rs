//! Access unit packets delivered by the transport

use std::net::SocketAddr;
use std::sync::Arc;

/// One elementary-stream access unit as delivered by the transport/demux layer.
///
/// This is the fundamental data unit that flows into the receiver. Health
/// tracking, decoding and keyframe confirmation are all derived from it.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Annex-B payload (zero-copy via Arc)
    pub data: Arc<[u8]>,

    /// Presentation timestamp handed to the decoder
    pub pts: u64,

    /// Network address the unit was received from, if known
    pub sender: Option<SocketAddr>,

    /// RTP-style 16-bit sequence number, if the transport carries one
    pub rtp_sequence: Option<u16>,
}

impl AccessUnit {
    /// Create a new access unit without network metadata
    pub fn new(data: impl Into<Arc<[u8]>>, pts: u64) -> Self {
        Self { data: data.into(), pts, sender: None, rtp_sequence: None }
    }

    /// Attach the originating sender address
    pub fn with_sender(mut self, sender: SocketAddr) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Attach the RTP sequence number of the packet carrying this unit
    pub fn with_rtp_sequence(mut self, seq: u16) -> Self {
        self.rtp_sequence = Some(seq);
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
