//! Frame pipeline stages
//!
//! The decode stage runs on the ingest task and owns the decoder and the
//! buffer pool. The display stage runs on its own OS thread, blocked on the
//! [`Mailbox`](crate::mailbox::Mailbox) until the decode stage posts a frame.

mod decode;
mod display;

pub use decode::{DecodeStage, DecodeStats};
pub use display::{DISPLAY_THREAD_NAME, DisplayStage, DisplayStats};
