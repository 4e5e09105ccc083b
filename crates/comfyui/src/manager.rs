//! Engine connection manager.
//!
//! [`ComfyUIManager`] owns the shared REST client and the socket
//! configuration for one engine. Every [`UpstreamConnector::open`] call
//! dials a fresh socket with its own `clientId` and spawns a reader task
//! that feeds the returned [`UpstreamConnection`].
//!
//! Reader tasks are tracked so [`ComfyUIManager::shutdown`] can stop
//! them all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{ComfyUIApi, EngineApi};
use crate::client::ComfyUIClient;
use crate::processor::process_messages;
use crate::upstream::{UpstreamConnection, UpstreamConnector, UpstreamError, EVENT_CHANNEL_CAPACITY};

/// How long shutdown waits for reader tasks to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Hands out per-session connections to a single engine.
///
/// Created once at application startup. The returned `Arc` can be
/// cheaply cloned into request handlers.
pub struct ComfyUIManager {
    client: ComfyUIClient,
    api: Arc<ComfyUIApi>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    readers: TaskTracker,
}

impl ComfyUIManager {
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Arc<Self> {
        let client = ComfyUIClient::new(ws_url, api_url);
        let api = Arc::new(ComfyUIApi::new(client.api_url().to_string()));

        Arc::new(Self {
            client,
            api,
            cancel: CancellationToken::new(),
            readers: TaskTracker::new(),
        })
    }

    /// Shared REST client, also used for image proxying.
    pub fn api(&self) -> Arc<ComfyUIApi> {
        Arc::clone(&self.api)
    }

    pub fn api_url(&self) -> &str {
        self.client.api_url()
    }

    pub fn ws_url(&self) -> &str {
        self.client.ws_url()
    }

    /// Number of reader tasks still running.
    pub fn active_connections(&self) -> usize {
        self.readers.len()
    }

    /// Stop all readers and wait for them to close their sockets.
    pub async fn shutdown(&self) {
        tracing::info!(active = self.active_connections(), "Shutting down ComfyUI manager");
        self.cancel.cancel();
        self.readers.close();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.readers.wait())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for engine readers to stop");
        }

        tracing::info!("ComfyUI manager shut down complete");
    }
}

#[async_trait]
impl UpstreamConnector for ComfyUIManager {
    async fn open(&self) -> Result<UpstreamConnection, UpstreamError> {
        if self.cancel.is_cancelled() {
            return Err(UpstreamError::Closed);
        }

        let conn = self.client.connect().await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = self.cancel.child_token();

        self.readers.spawn(process_messages(
            conn.ws_stream,
            conn.client_id.clone(),
            tx,
            reader.clone(),
        ));

        let api: Arc<dyn EngineApi> = self.api.clone();
        Ok(UpstreamConnection::new(conn.client_id, api, rx, reader))
    }
}
