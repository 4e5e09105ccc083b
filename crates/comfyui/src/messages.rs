//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum. Binary frames carry
//! preview images and are decoded by [`parse_preview`].

use serde::Deserialize;

/// Binary event type ComfyUI uses for preview images.
const BINARY_EVENT_PREVIEW_IMAGE: u32 = 1;

/// Size of the binary frame header (event type + image format).
const BINARY_HEADER_LEN: usize = 8;

/// All known ComfyUI WebSocket message types.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The whole prompt finished successfully (newer ComfyUI versions).
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// The prompt was interrupted on the engine side.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

impl ComfyUIMessage {
    /// The prompt this message is about, when the engine says so.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::Status(_) => None,
            ComfyUIMessage::ExecutionStart(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionCached(d) => Some(&d.prompt_id),
            ComfyUIMessage::Executing(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Executed(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionSuccess(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionInterrupted(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionError(d) => Some(&d.prompt_id),
        }
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Image encoding of a preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
    Other(u32),
}

impl PreviewFormat {
    fn from_code(code: u32) -> Self {
        match code {
            1 => PreviewFormat::Jpeg,
            2 => PreviewFormat::Png,
            other => PreviewFormat::Other(other),
        }
    }

    /// Wire code as sent in the frame header.
    pub fn code(&self) -> u32 {
        match self {
            PreviewFormat::Jpeg => 1,
            PreviewFormat::Png => 2,
            PreviewFormat::Other(code) => *code,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            PreviewFormat::Jpeg => "image/jpeg",
            PreviewFormat::Png => "image/png",
            PreviewFormat::Other(_) => "application/octet-stream",
        }
    }
}

/// A latent preview sent as a binary frame while a sampler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub format: PreviewFormat,
    /// Encoded image bytes, header stripped.
    pub data: Vec<u8>,
}

/// Decode a binary frame.
///
/// Layout: 4-byte big-endian event type, 4-byte big-endian image format,
/// then the encoded image. Returns `None` for short frames and for
/// event types other than preview images.
pub fn parse_preview(frame: &[u8]) -> Option<PreviewImage> {
    if frame.len() < BINARY_HEADER_LEN {
        return None;
    }
    let event_type = u32::from_be_bytes(frame[0..4].try_into().ok()?);
    if event_type != BINARY_EVENT_PREVIEW_IMAGE {
        return None;
    }
    let format = u32::from_be_bytes(frame[4..8].try_into().ok()?);

    Some(PreviewImage {
        format: PreviewFormat::from_code(format),
        data: frame[BINARY_HEADER_LEN..].to_vec(),
    })
}
