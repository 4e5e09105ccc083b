//! WebSocket message type constants for the client-facing relay protocol.
//!
//! Every outbound text frame is `{"type": <one of these>, "data": ...}`.
//! Used by `api/src/relay` when translating engine events.

/// Job name used when the client did not supply one.
pub const DEFAULT_JOB_NAME: &str = "Unknown";

/// Structural metadata of a live job, sent once before any progress.
pub const MSG_TYPE_WORKFLOW_STRUCTURE: &str = "workflow_structure";

/// Number of output images the job is expected to produce.
pub const MSG_TYPE_TOTAL_IMAGES: &str = "total_images";

/// The engine started executing the job.
pub const MSG_TYPE_EXECUTION_STARTED: &str = "execution_started";

/// The engine moved on to a specific node.
pub const MSG_TYPE_EXECUTING: &str = "executing";

/// Step progress of the node currently executing (`value` of `max`).
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// Estimated completion of the whole job.
pub const MSG_TYPE_OVERALL_PROGRESS: &str = "overall_progress";

/// Nodes the engine skipped because their outputs were cached.
pub const MSG_TYPE_CACHED_NODES: &str = "cached_nodes";

/// A node produced output images.
pub const MSG_TYPE_OUTPUT: &str = "output";

/// The job finished; carries every output image reference.
pub const MSG_TYPE_COMPLETED: &str = "completed";

/// Terminal or request-level failure.
pub const MSG_TYPE_ERROR: &str = "error";
