//! Typed view of the ComfyUI `GET /queue` response.
//!
//! ComfyUI reports each queue item as a positional array:
//! `[number, prompt_id, prompt, extra_data, outputs_to_execute, ...]`.
//! Only the first two positions are required here; the rest are kept
//! when present.

use serde::Deserialize;

/// One running or pending queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Server-assigned queue number.
    pub number: i64,
    pub prompt_id: String,
    /// The submitted prompt, if the engine echoed it back.
    pub prompt: Option<serde_json::Value>,
    /// Output node ids the engine intends to execute.
    pub output_node_ids: Vec<String>,
}

/// Snapshot of the engine queue.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawQueue")]
pub struct QueueState {
    pub running: Vec<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

#[derive(Deserialize)]
struct RawQueue {
    #[serde(default)]
    queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<serde_json::Value>>,
}

impl TryFrom<RawQueue> for QueueState {
    type Error = String;

    fn try_from(raw: RawQueue) -> Result<Self, Self::Error> {
        Ok(Self {
            running: parse_entries(raw.queue_running)?,
            pending: parse_entries(raw.queue_pending)?,
        })
    }
}

fn parse_entries(items: Vec<Vec<serde_json::Value>>) -> Result<Vec<QueueEntry>, String> {
    items.into_iter().map(parse_entry).collect()
}

fn parse_entry(mut item: Vec<serde_json::Value>) -> Result<QueueEntry, String> {
    if item.len() < 2 {
        return Err(format!("queue item has {} fields, expected at least 2", item.len()));
    }

    let number = item[0]
        .as_i64()
        .ok_or_else(|| format!("queue number is not an integer: {}", item[0]))?;
    let prompt_id = item[1]
        .as_str()
        .ok_or_else(|| format!("prompt id is not a string: {}", item[1]))?
        .to_string();

    let output_node_ids = item
        .get(4)
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let prompt = if item.len() > 2 {
        Some(item.swap_remove(2))
    } else {
        None
    };

    Ok(QueueEntry {
        number,
        prompt_id,
        prompt,
        output_node_ids,
    })
}

impl QueueState {
    /// Nothing running and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|e| e.prompt_id == prompt_id)
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        self.pending.iter().any(|e| e.prompt_id == prompt_id)
    }

    /// Find a job anywhere in the queue.
    pub fn find(&self, prompt_id: &str) -> Option<&QueueEntry> {
        self.running
            .iter()
            .chain(self.pending.iter())
            .find(|e| e.prompt_id == prompt_id)
    }
}
