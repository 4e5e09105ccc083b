//! Per-job relay session.
//!
//! A [`RelaySession`] owns one upstream connection for one client job. It
//! submits the job, decides between cached replay and live streaming, and
//! translates engine events into client frames until the job completes,
//! fails, or the client goes away.
//!
//! ```text
//! Opening -> Submitted -> CachedReplay -> Completed
//!                      -> Streaming    -> Completed
//! any non-terminal state -> Errored -> Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use comfyrelay_comfyui::events::UpstreamEvent;
use comfyrelay_comfyui::history::{images_from_output, OutputImage};
use comfyrelay_comfyui::messages::ComfyUIMessage;
use comfyrelay_comfyui::queue::QueueState;
use comfyrelay_comfyui::upstream::{JobEvents, UpstreamConnector, UpstreamError};
use comfyrelay_core::client_events::DEFAULT_JOB_NAME;
use comfyrelay_core::progress::{ProgressEstimator, ProgressEvent, ProgressState};
use comfyrelay_core::types::JobId;
use comfyrelay_core::workflow_graph::{analyze, parse_job, DependencyGraph, Job, JobStructure};
use tokio::time::{sleep_until, Instant};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::cached::CachedResultDispatcher;
use crate::relay::job_names::{JobNameGuard, JobNameRegistry};
use crate::relay::protocol::{self, ClientRequest};
use crate::ws::manager::WsSender;

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Submitted,
    CachedReplay,
    Streaming,
    Completed,
    Errored,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Closed)
    }
}

/// What a streamed engine event means for the session.
enum Step {
    Continue,
    Finished,
}

/// One client job relayed to the engine.
pub struct RelaySession {
    session_id: String,
    client: WsSender,
    connector: Arc<dyn UpstreamConnector>,
    job_names: Arc<JobNameRegistry>,
    config: Arc<RelayConfig>,
    request: ClientRequest,
    job_id: Option<JobId>,
    job_name: Option<JobNameGuard>,
    state: SessionState,
}

impl RelaySession {
    pub fn new(
        client: WsSender,
        connector: Arc<dyn UpstreamConnector>,
        job_names: Arc<JobNameRegistry>,
        config: Arc<RelayConfig>,
        request: ClientRequest,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            client,
            connector,
            job_names,
            config,
            request,
            job_id: None,
            job_name: None,
            state: SessionState::Opening,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state and return it.
    ///
    /// Any failure is reported to the client as exactly one `error` frame.
    pub async fn run(mut self) -> SessionState {
        tracing::info!(
            session_id = %self.session_id,
            job_name = %self.request.job_name,
            nodes = self.request.job.len(),
            "Relay session started",
        );

        if let Err(err) = self.drive().await {
            tracing::warn!(
                session_id = %self.session_id,
                job_id = ?self.job_id,
                state = ?self.state,
                error = %err,
                "Relay session failed",
            );
            self.transition(SessionState::Errored);
            let _ = self.client.send(err.to_client_message());
            self.transition(SessionState::Closed);
        }

        drop(self.job_name.take());

        tracing::info!(
            session_id = %self.session_id,
            job_id = ?self.job_id,
            state = ?self.state,
            "Relay session finished",
        );
        self.state
    }

    async fn drive(&mut self) -> Result<(), RelayError> {
        // No job id exists yet, so a failed connect is a failed submission.
        let mut connection = self
            .connector
            .open()
            .await
            .map_err(|e| RelayError::SubmissionFailed(e.to_string()))?;
        let job_id = connection.submit(&self.request.raw).await?;
        self.job_id = Some(job_id.clone());
        self.job_name = Some(
            self.job_names
                .register(&job_id, &self.request.job_name)
                .await,
        );
        self.transition(SessionState::Submitted);

        let queue = connection.queue_state().await?;
        let mut dispatcher = CachedResultDispatcher::new(&mut connection, &self.client);
        if dispatcher.maybe_serve_cached(&job_id, &queue).await? {
            self.transition(SessionState::CachedReplay);
            self.transition(SessionState::Completed);
            return Ok(());
        }

        self.transition(SessionState::Streaming);
        let events = connection.subscribe(job_id.clone());
        self.stream(events, &job_id, &queue).await
    }

    /// Live path: structure first, then translated events until done.
    async fn stream(
        &mut self,
        mut events: JobEvents,
        job_id: &str,
        queue: &QueueState,
    ) -> Result<(), RelayError> {
        let entry = queue.find(job_id);
        let job = entry
            .and_then(|e| e.prompt.as_ref())
            .and_then(|prompt| parse_job(prompt).ok())
            .unwrap_or_else(|| self.request.job.clone());

        let graph = analyze(&job);
        if graph.has_cycles() {
            tracing::warn!(
                session_id = %self.session_id,
                job_id = %job_id,
                cycles = ?graph.cycles(),
                "Job contains dependency cycles, progress will be approximate",
            );
        }

        let output_nodes = match entry {
            Some(e) if !e.output_node_ids.is_empty() => e.output_node_ids.len(),
            _ => count_sinks(&job, &graph),
        };
        let structure = JobStructure::describe(&job, &graph);
        let _ = self
            .client
            .send(protocol::workflow_structure(&structure, output_nodes, job_id));
        let _ = self.client.send(protocol::total_images(output_nodes));

        let estimator = ProgressEstimator::new(graph);
        let mut progress = estimator.initial_state();
        let mut images: Vec<OutputImage> = Vec::new();

        let execution_deadline = Instant::now() + self.config.execution_timeout;
        let mut start_deadline = Some(Instant::now() + self.config.start_timeout);

        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = sleep_until(execution_deadline) => {
                    return Err(RelayError::Timeout(format!(
                        "after {} running the job",
                        humanize(self.config.execution_timeout)
                    )));
                }
                _ = sleep_until(start_deadline.unwrap_or(execution_deadline)), if start_deadline.is_some() => {
                    return Err(RelayError::Timeout(format!(
                        "after {} waiting for the engine to start the job",
                        humanize(self.config.start_timeout)
                    )));
                }
            };

            let message = match event {
                UpstreamEvent::Message(message) => message,
                UpstreamEvent::Preview(preview) => {
                    let _ = self.client.send(protocol::preview(&preview));
                    continue;
                }
                UpstreamEvent::Closed { reason } => {
                    tracing::warn!(job_id = %job_id, ?reason, "Engine closed the connection mid-job");
                    return Err(UpstreamError::Closed.into());
                }
                UpstreamEvent::Error(err) => return Err(UpstreamError::Stream(err).into()),
            };

            if message.prompt_id().is_some() {
                start_deadline = None;
            }

            match self
                .translate(message, job_id, &estimator, &mut progress, &mut images)
                .await?
            {
                Step::Continue => {}
                Step::Finished => break,
            }
        }

        estimator.update(&mut progress, &ProgressEvent::Finished);
        let _ = self.client.send(protocol::overall_progress(&progress));

        if images.is_empty() {
            match events.connection().outputs(job_id).await {
                Ok(outputs) => images = outputs.images,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not read job history");
                }
            }
        }

        let _ = self.client.send(protocol::completed(job_id, false, &images));
        self.transition(SessionState::Completed);
        Ok(())
    }

    /// Forward one engine message and fold it into the progress state.
    async fn translate(
        &self,
        message: ComfyUIMessage,
        job_id: &str,
        estimator: &ProgressEstimator,
        progress: &mut ProgressState,
        images: &mut Vec<OutputImage>,
    ) -> Result<Step, RelayError> {
        match message {
            ComfyUIMessage::Status(data) => {
                tracing::trace!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "Engine queue status",
                );
            }
            ComfyUIMessage::ExecutionStart(_) => {
                let name = self
                    .job_names
                    .take(job_id)
                    .await
                    .unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());
                tracing::info!(job_id = %job_id, job_name = %name, "Engine started job");
                let _ = self.client.send(protocol::execution_started(job_id, &name));
            }
            ComfyUIMessage::ExecutionCached(data) => {
                tracing::debug!(job_id = %job_id, nodes = data.nodes.len(), "Engine reused cached nodes");
                let _ = self.client.send(protocol::cached_nodes(&data.nodes));
            }
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => {
                    let _ = self.client.send(protocol::executing(&node));
                    estimator.update(progress, &ProgressEvent::NodeStarted(node));
                    let _ = self.client.send(protocol::overall_progress(progress));
                }
                None => return Ok(Step::Finished),
            },
            ComfyUIMessage::Progress(data) => {
                let _ = self.client.send(protocol::progress(data.value, data.max));
                estimator.update(
                    progress,
                    &ProgressEvent::Step {
                        value: f64::from(data.value),
                        max: f64::from(data.max),
                    },
                );
                let _ = self.client.send(protocol::overall_progress(progress));
            }
            ComfyUIMessage::Executed(data) => {
                let produced = images_from_output(&data.node, &data.output);
                if !produced.is_empty() {
                    let _ = self.client.send(protocol::output(&data.node, &produced));
                    images.extend(produced);
                }
            }
            ComfyUIMessage::ExecutionSuccess(_) => return Ok(Step::Finished),
            ComfyUIMessage::ExecutionInterrupted(data) => {
                return Err(RelayError::interrupted(
                    data.node_id.as_deref(),
                    data.node_type.as_deref(),
                ));
            }
            ComfyUIMessage::ExecutionError(data) => {
                return Err(RelayError::execution_error(
                    data.exception_message,
                    Some(data.exception_type.as_str()),
                    Some(data.node_id.as_str()),
                    data.node_type.as_deref(),
                ));
            }
        }
        Ok(Step::Continue)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            session_id = %self.session_id,
            from = ?self.state,
            to = ?next,
            "Relay session state change",
        );
        self.state = next;
    }
}

/// Nodes nothing else depends on.
fn count_sinks(job: &Job, graph: &DependencyGraph) -> usize {
    job.keys()
        .filter(|id| graph.node(id).is_some_and(|n| n.dependents.is_empty()))
        .count()
}

fn humanize(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}
