//! Events delivered from an engine socket to the session that owns it.
//!
//! The reader task in [`crate::processor`] turns raw frames into
//! [`UpstreamEvent`]s; a session consumes them through
//! [`crate::upstream::JobEvents`].

use crate::messages::{ComfyUIMessage, PreviewImage};

/// One item read from the engine socket.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// A parsed JSON message.
    Message(ComfyUIMessage),

    /// A binary preview frame.
    Preview(PreviewImage),

    /// The engine closed the socket, or the reader stopped.
    Closed { reason: Option<String> },

    /// The socket failed while receiving.
    Error(String),
}

impl UpstreamEvent {
    /// Whether no further events will follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpstreamEvent::Closed { .. } | UpstreamEvent::Error(_))
    }
}
