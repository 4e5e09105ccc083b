//! Domain core for the ComfyUI relay.
//!
//! Holds the job model, dependency-graph analysis, and the progress
//! estimator. Nothing in here performs I/O; the `comfyui` and `api`
//! crates feed it engine events and forward its results to clients.

pub mod client_events;
pub mod error;
pub mod progress;
pub mod types;
pub mod workflow_graph;
