//! Client wire protocol.
//!
//! Inbound: `{"job": {...}, "jobName": "..."}`, the older
//! `{"workflow": {...}, "workflowName": "..."}`, or a bare job object.
//! Outbound: `{"type": ..., "data": ...}` text frames plus binary preview
//! frames carrying the image format code ahead of the image bytes.

use axum::body::Bytes;
use axum::extract::ws::Message;
use comfyrelay_comfyui::history::{ImageRef, OutputImage};
use comfyrelay_comfyui::messages::PreviewImage;
use comfyrelay_core::client_events::*;
use comfyrelay_core::progress::ProgressState;
use comfyrelay_core::workflow_graph::{parse_job, Job, JobStructure};
use serde::Serialize;
use serde_json::json;

use crate::error::RelayError;

/// Path of the image proxy, relative to the relay origin.
pub const VIEW_PATH: &str = "/api/v1/view";

/// A job request received from a client.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// The job exactly as sent, forwarded to the engine untouched.
    pub raw: serde_json::Value,
    pub job: Job,
    pub job_name: String,
}

/// Parse one inbound text frame.
pub fn parse_client_request(text: &str) -> Result<ClientRequest, RelayError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RelayError::MalformedClientMessage(format!("not valid JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| RelayError::MalformedClientMessage("expected a JSON object".into()))?;

    let (raw, name) = if let Some(job) = obj.get("job") {
        (job.clone(), obj.get("jobName"))
    } else if let Some(workflow) = obj.get("workflow") {
        (workflow.clone(), obj.get("workflowName"))
    } else {
        (value.clone(), None)
    };

    let job_name = name
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_JOB_NAME)
        .to_string();

    let job = parse_job(&raw).map_err(|e| RelayError::MalformedClientMessage(e.to_string()))?;

    Ok(ClientRequest { raw, job, job_name })
}

/// Image reference as clients see it.
#[derive(Debug, Clone, Serialize)]
pub struct ClientImage {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl From<&ImageRef> for ClientImage {
    fn from(image: &ImageRef) -> Self {
        Self {
            filename: image.filename.clone(),
            subfolder: image.subfolder.clone(),
            kind: image.kind.clone(),
            url: view_url(image),
        }
    }
}

/// Proxy URL for an engine image.
pub fn view_url(image: &ImageRef) -> String {
    format!(
        "{VIEW_PATH}?filename={}&subfolder={}&type={}",
        urlencoding::encode(&image.filename),
        urlencoding::encode(&image.subfolder),
        urlencoding::encode(&image.kind),
    )
}

fn client_images(images: &[OutputImage]) -> Vec<ClientImage> {
    images.iter().map(|i| ClientImage::from(&i.image)).collect()
}

fn envelope(kind: &str, data: serde_json::Value) -> Message {
    Message::Text(json!({ "type": kind, "data": data }).to_string().into())
}

pub fn workflow_structure(structure: &JobStructure, output_node_count: usize, job_id: &str) -> Message {
    envelope(
        MSG_TYPE_WORKFLOW_STRUCTURE,
        json!({
            "totalNodes": structure.total_nodes,
            "outputNodeCount": output_node_count,
            "hasDependencies": structure.has_dependencies,
            "nodeTypes": structure.node_types,
            "jobId": job_id,
            "maxDepth": structure.max_depth,
        }),
    )
}

pub fn total_images(count: usize) -> Message {
    envelope(MSG_TYPE_TOTAL_IMAGES, json!(count))
}

pub fn execution_started(job_id: &str, job_name: &str) -> Message {
    envelope(
        MSG_TYPE_EXECUTION_STARTED,
        json!({ "jobId": job_id, "jobName": job_name }),
    )
}

pub fn executing(node: &str) -> Message {
    envelope(MSG_TYPE_EXECUTING, json!({ "node": node }))
}

pub fn progress(value: i32, max: i32) -> Message {
    envelope(MSG_TYPE_PROGRESS, json!({ "value": value, "max": max }))
}

pub fn overall_progress(state: &ProgressState) -> Message {
    envelope(
        MSG_TYPE_OVERALL_PROGRESS,
        json!({
            "ratio": state.overall_ratio,
            "percent": state.percent(),
            "completedNodes": state.completed_nodes,
            "totalNodes": state.total_nodes,
            "completedLevels": state.completed_levels,
        }),
    )
}

pub fn cached_nodes(nodes: &[String]) -> Message {
    envelope(MSG_TYPE_CACHED_NODES, json!({ "nodes": nodes }))
}

pub fn output(node: &str, images: &[OutputImage]) -> Message {
    envelope(
        MSG_TYPE_OUTPUT,
        json!({ "node": node, "images": client_images(images) }),
    )
}

pub fn completed(job_id: &str, cached: bool, images: &[OutputImage]) -> Message {
    envelope(
        MSG_TYPE_COMPLETED,
        json!({ "jobId": job_id, "cached": cached, "images": client_images(images) }),
    )
}

/// Preview images go out as a 4-byte big-endian format code (1 JPEG,
/// 2 PNG) followed by the encoded bytes.
pub fn preview(image: &PreviewImage) -> Message {
    let mut frame = Vec::with_capacity(4 + image.data.len());
    frame.extend_from_slice(&image.format.code().to_be_bytes());
    frame.extend_from_slice(&image.data);
    Message::Binary(Bytes::from(frame))
}
