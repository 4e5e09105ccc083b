/// Identifier of a node inside a job (the key of the job object).
pub type NodeId = String;

/// Engine-assigned identifier of a submitted job (ComfyUI `prompt_id`).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
