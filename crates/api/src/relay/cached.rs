//! Cache-hit detection right after submission.
//!
//! When the engine already holds every output of a job it finishes the
//! job without running anything, so no progress events ever arrive. The
//! queue snapshot taken just after submission tells the two cases apart.
//! A job that failed before the snapshot is missing from the queue too, so
//! buffered engine events and the history status are checked before replay.

use comfyrelay_comfyui::events::UpstreamEvent;
use comfyrelay_comfyui::messages::ComfyUIMessage;
use comfyrelay_comfyui::queue::QueueState;
use comfyrelay_comfyui::upstream::UpstreamConnection;

use crate::error::RelayError;
use crate::relay::protocol;
use crate::ws::manager::WsSender;

/// Whether the queue snapshot means the engine served `job_id` from cache.
///
/// A job listed as running or pending is live. Anything else, including
/// an idle engine, means the job already finished from cache.
pub fn is_cache_hit(job_id: &str, queue: &QueueState) -> bool {
    !queue.is_running(job_id) && !queue.is_pending(job_id)
}

/// Replays stored outputs of a cached job to the client.
pub struct CachedResultDispatcher<'a> {
    connection: &'a mut UpstreamConnection,
    client: &'a WsSender,
}

impl<'a> CachedResultDispatcher<'a> {
    pub fn new(connection: &'a mut UpstreamConnection, client: &'a WsSender) -> Self {
        Self { connection, client }
    }

    /// Send `completed` from history when the job was a cache hit.
    ///
    /// Returns `false` without sending anything when the job is queued
    /// or running. A job the engine already failed or interrupted is an
    /// [`RelayError::ExecutionFailed`].
    pub async fn maybe_serve_cached(
        &mut self,
        job_id: &str,
        queue: &QueueState,
    ) -> Result<bool, RelayError> {
        if !is_cache_hit(job_id, queue) {
            return Ok(false);
        }

        if let Some(err) = self.buffered_failure(job_id) {
            return Err(err);
        }

        let outputs = self.connection.outputs(job_id).await?;
        if let Some(failure) = outputs.failure {
            return Err(failure.into());
        }

        tracing::info!(
            job_id = %job_id,
            images = outputs.images.len(),
            "Serving cached job outputs",
        );

        let _ = self
            .client
            .send(protocol::completed(job_id, true, &outputs.images));
        Ok(true)
    }

    /// An error or interruption for `job_id` already sitting in the feed.
    fn buffered_failure(&mut self, job_id: &str) -> Option<RelayError> {
        self.connection
            .drain_buffered()
            .into_iter()
            .find_map(|event| match event {
                UpstreamEvent::Message(ComfyUIMessage::ExecutionError(data))
                    if data.prompt_id == job_id =>
                {
                    Some(RelayError::execution_error(
                        data.exception_message,
                        Some(data.exception_type.as_str()),
                        Some(data.node_id.as_str()),
                        data.node_type.as_deref(),
                    ))
                }
                UpstreamEvent::Message(ComfyUIMessage::ExecutionInterrupted(data))
                    if data.prompt_id == job_id =>
                {
                    Some(RelayError::interrupted(
                        data.node_id.as_deref(),
                        data.node_type.as_deref(),
                    ))
                }
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comfyrelay_comfyui::queue::QueueEntry;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry {
            number: 0,
            prompt_id: id.into(),
            prompt: None,
            output_node_ids: Vec::new(),
        }
    }

    #[test]
    fn empty_queue_is_a_cache_hit() {
        assert!(is_cache_hit("p", &QueueState::default()));
    }

    #[test]
    fn running_or_pending_job_is_live() {
        let running = QueueState {
            running: vec![entry("p")],
            pending: Vec::new(),
        };
        assert!(!is_cache_hit("p", &running));

        let pending = QueueState {
            running: vec![entry("other")],
            pending: vec![entry("p")],
        };
        assert!(!is_cache_hit("p", &pending));
    }

    #[test]
    fn absent_job_behind_another_is_a_cache_hit() {
        let queue = QueueState {
            running: vec![entry("other")],
            pending: vec![entry("third")],
        };
        assert!(is_cache_hit("p", &queue));
    }

    #[test]
    fn pending_job_on_idle_engine_is_live() {
        let queue = QueueState {
            running: Vec::new(),
            pending: vec![entry("p")],
        };
        assert!(!is_cache_hit("p", &queue));
    }
}
