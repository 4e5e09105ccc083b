//! Per-session upstream connection to the engine.
//!
//! An [`UpstreamConnection`] bundles the engine socket's event feed with
//! the REST API used to submit and inspect jobs under the same
//! `clientId`. Dropping it stops the socket reader.

use std::sync::Arc;

use async_trait::async_trait;
use comfyrelay_core::types::JobId;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::api::{ComfyUIApiError, EngineApi};
use crate::client::ComfyUIClientError;
use crate::events::UpstreamEvent;
use crate::history::JobOutputs;
use crate::queue::QueueState;

/// Capacity of the reader-to-session event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors raised while talking to the engine on behalf of a session.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Connect(#[from] ComfyUIClientError),

    #[error("Job submission failed: {0}")]
    SubmissionFailed(#[source] ComfyUIApiError),

    #[error("Engine query failed: {0}")]
    Query(#[source] ComfyUIApiError),

    #[error("Engine stream error: {0}")]
    Stream(String),

    #[error("Engine connection closed")]
    Closed,
}

/// Opens upstream connections. One call per client job.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self) -> Result<UpstreamConnection, UpstreamError>;
}

/// A live socket plus the API handle bound to its `clientId`.
pub struct UpstreamConnection {
    client_id: String,
    api: Arc<dyn EngineApi>,
    events: mpsc::Receiver<UpstreamEvent>,
    _reader: DropGuard,
}

impl UpstreamConnection {
    /// Wrap an event feed. `reader` is cancelled when the connection drops.
    pub fn new(
        client_id: String,
        api: Arc<dyn EngineApi>,
        events: mpsc::Receiver<UpstreamEvent>,
        reader: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            api,
            events,
            _reader: reader.drop_guard(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Submit `job` and return the engine-assigned job id.
    pub async fn submit(&self, job: &serde_json::Value) -> Result<JobId, UpstreamError> {
        let response = self
            .api
            .submit(job, &self.client_id)
            .await
            .map_err(UpstreamError::SubmissionFailed)?;

        tracing::info!(
            client_id = %self.client_id,
            prompt_id = %response.prompt_id,
            number = response.number,
            "Job submitted to engine",
        );
        Ok(response.prompt_id)
    }

    pub async fn queue_state(&self) -> Result<QueueState, UpstreamError> {
        self.api.queue().await.map_err(UpstreamError::Query)
    }

    pub async fn outputs(&self, job_id: &str) -> Result<JobOutputs, UpstreamError> {
        self.api.history(job_id).await.map_err(UpstreamError::Query)
    }

    /// Take every event the reader has buffered so far, without waiting.
    pub fn drain_buffered(&mut self) -> Vec<UpstreamEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Restrict the event feed to `job_id`.
    pub fn subscribe(self, job_id: impl Into<JobId>) -> JobEvents {
        JobEvents {
            job_id: job_id.into(),
            conn: self,
            finished: false,
        }
    }
}

/// Events for one submitted job.
///
/// Messages tagged with another job id are dropped. Untagged messages
/// pass through since the socket is private to this session.
pub struct JobEvents {
    job_id: JobId,
    conn: UpstreamConnection,
    finished: bool,
}

impl JobEvents {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn connection(&self) -> &UpstreamConnection {
        &self.conn
    }

    /// Next event for this job.
    ///
    /// Once a terminal event has been returned, or the reader is gone,
    /// this keeps returning `Closed`.
    pub async fn next(&mut self) -> UpstreamEvent {
        if self.finished {
            return UpstreamEvent::Closed { reason: None };
        }

        loop {
            let Some(event) = self.conn.events.recv().await else {
                self.finished = true;
                return UpstreamEvent::Closed { reason: None };
            };

            if let UpstreamEvent::Message(msg) = &event {
                if let Some(other) = msg.prompt_id().filter(|id| *id != self.job_id) {
                    tracing::trace!(job_id = %self.job_id, other = %other, "Dropping message for another job");
                    continue;
                }
            }

            if event.is_terminal() {
                self.finished = true;
            }
            return event;
        }
    }
}
