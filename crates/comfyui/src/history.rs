//! Output images recorded in the engine history.
//!
//! `GET /history/{prompt_id}` returns
//! `{prompt_id: {"outputs": {node_id: {"images": [...]}}, ...}}`.
//! The same `{"images": [...]}` shape is carried by `executed` messages.
//! The entry's `status` block records how the job ended, including the
//! engine's `execution_error` / `execution_interrupted` messages.

use serde::{Deserialize, Serialize};

/// Location of one image inside the engine's storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage bucket: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

/// An image together with the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub node_id: String,
    pub image: ImageRef,
}

/// Why a recorded job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub interrupted: bool,
    pub message: String,
    pub exception_type: Option<String>,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
}

/// All images a finished job produced, in node order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutputs {
    pub images: Vec<OutputImage>,
    /// Set when the history marks the job as failed.
    pub failure: Option<JobFailure>,
}

impl JobOutputs {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Extract the images from one node's output object.
///
/// Entries that do not look like image references are skipped.
pub fn images_from_output(node_id: &str, output: &serde_json::Value) -> Vec<OutputImage> {
    output
        .get("images")
        .and_then(|v| v.as_array())
        .map(|images| {
            images
                .iter()
                .filter_map(|img| serde_json::from_value::<ImageRef>(img.clone()).ok())
                .map(|image| OutputImage {
                    node_id: node_id.to_string(),
                    image,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Collect a job's images from a history response.
///
/// A job absent from the history yields empty outputs.
pub fn parse_history(prompt_id: &str, history: &serde_json::Value) -> JobOutputs {
    let Some(entry) = history.get(prompt_id) else {
        return JobOutputs::default();
    };

    let images = entry
        .get("outputs")
        .and_then(|o| o.as_object())
        .map(|outputs| {
            outputs
                .iter()
                .flat_map(|(node_id, output)| images_from_output(node_id, output))
                .collect()
        })
        .unwrap_or_default();

    JobOutputs {
        images,
        failure: entry.get("status").and_then(failure_from_status),
    }
}

/// Read a failure out of a history `status` block.
///
/// `{"status_str": "error", "messages": [["execution_error", {...}], ...]}`
fn failure_from_status(status: &serde_json::Value) -> Option<JobFailure> {
    let messages = status
        .get("messages")
        .and_then(|m| m.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let field = |data: &serde_json::Value, key: &str| {
        data.get(key).and_then(|v| v.as_str()).map(str::to_string)
    };

    for pair in messages {
        let (Some(kind), Some(data)) = (pair.get(0).and_then(|k| k.as_str()), pair.get(1)) else {
            continue;
        };
        match kind {
            "execution_error" => {
                return Some(JobFailure {
                    interrupted: false,
                    message: field(data, "exception_message")
                        .unwrap_or_else(|| "Execution failed".to_string()),
                    exception_type: field(data, "exception_type"),
                    node_id: field(data, "node_id"),
                    node_type: field(data, "node_type"),
                });
            }
            "execution_interrupted" => {
                return Some(JobFailure {
                    interrupted: true,
                    message: "Execution was interrupted".to_string(),
                    exception_type: None,
                    node_id: field(data, "node_id"),
                    node_type: field(data, "node_type"),
                });
            }
            _ => {}
        }
    }

    (status.get("status_str").and_then(|s| s.as_str()) == Some("error")).then(|| JobFailure {
        interrupted: false,
        message: "Execution failed".to_string(),
        exception_type: None,
        node_id: None,
        node_type: None,
    })
}
