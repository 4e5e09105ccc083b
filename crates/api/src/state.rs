use std::sync::Arc;

use comfyrelay_comfyui::api::EngineApi;
use comfyrelay_comfyui::upstream::UpstreamConnector;

use crate::config::{RelayConfig, ServerConfig};
use crate::relay::JobNameRegistry;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Engine endpoints and session limits.
    pub relay: Arc<RelayConfig>,
    /// WebSocket connection manager (browser clients).
    pub ws_manager: Arc<WsManager>,
    /// Opens one engine connection per relayed job.
    pub upstream: Arc<dyn UpstreamConnector>,
    /// Engine REST API, used for image proxying.
    pub engine: Arc<dyn EngineApi>,
    /// Names of submitted jobs, claimed when the engine starts them.
    pub job_names: Arc<JobNameRegistry>,
}
