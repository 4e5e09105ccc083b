use axum::extract::ws::Message;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use comfyrelay_comfyui::api::ComfyUIApiError;
use comfyrelay_comfyui::history::JobFailure;
use comfyrelay_comfyui::upstream::UpstreamError;
use comfyrelay_core::client_events::MSG_TYPE_ERROR;
use comfyrelay_core::error::CoreError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `comfyrelay_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The engine rejected or failed a proxied request.
    #[error(transparent)]
    Engine(#[from] ComfyUIApiError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Engine errors ---
            AppError::Engine(err) => classify_engine_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Classify an engine error into an HTTP status, error code, and message.
///
/// - Engine 404 maps to 404.
/// - Any other engine status or a transport failure maps to 502.
fn classify_engine_error(err: &ComfyUIApiError) -> (StatusCode, &'static str, String) {
    match err {
        ComfyUIApiError::ApiError { status: 404, .. } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        other => {
            tracing::warn!(error = %other, "Engine request failed");
            (
                StatusCode::BAD_GATEWAY,
                "ENGINE_ERROR",
                "The generation engine could not serve the request".to_string(),
            )
        }
    }
}

/// Failures reported to a relay client as an `error` frame.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The engine refused the job.
    #[error("Job submission failed: {0}")]
    SubmissionFailed(String),

    /// The engine connection failed or went away.
    #[error(transparent)]
    Upstream(UpstreamError),

    /// The client sent something that is not a job.
    #[error("Malformed client message: {0}")]
    MalformedClientMessage(String),

    /// The engine reported an execution error or interruption.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        message: String,
        details: Option<String>,
    },

    /// A session deadline passed.
    #[error("Timed out {0}")]
    Timeout(String),
}

impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::SubmissionFailed(source) => RelayError::SubmissionFailed(source.to_string()),
            other => RelayError::Upstream(other),
        }
    }
}

impl From<JobFailure> for RelayError {
    fn from(failure: JobFailure) -> Self {
        if failure.interrupted {
            return RelayError::interrupted(failure.node_id.as_deref(), failure.node_type.as_deref());
        }
        RelayError::execution_error(
            failure.message,
            failure.exception_type.as_deref(),
            failure.node_id.as_deref(),
            failure.node_type.as_deref(),
        )
    }
}

impl RelayError {
    /// The engine raised `message` while running the job.
    pub fn execution_error(
        message: String,
        exception_type: Option<&str>,
        node_id: Option<&str>,
        node_type: Option<&str>,
    ) -> Self {
        let node = node_id.map(|id| describe_node(id, node_type));
        let details = match (exception_type, node) {
            (Some(kind), Some(node)) => Some(format!("{kind} in {node}")),
            (Some(kind), None) => Some(kind.to_string()),
            (None, node) => node,
        };
        RelayError::ExecutionFailed { message, details }
    }

    /// The job was interrupted before it finished.
    pub fn interrupted(node_id: Option<&str>, node_type: Option<&str>) -> Self {
        RelayError::ExecutionFailed {
            message: "Execution was interrupted".to_string(),
            details: node_id.map(|id| describe_node(id, node_type)),
        }
    }

    /// Client-facing `(message, details)` pair.
    fn describe(&self) -> (String, Option<String>) {
        match self {
            RelayError::SubmissionFailed(details) => (
                "Failed to queue prompt. Please check your workflow configuration.".to_string(),
                Some(details.clone()),
            ),
            RelayError::Upstream(err) => (
                "Lost connection to the generation engine".to_string(),
                Some(err.to_string()),
            ),
            RelayError::MalformedClientMessage(details) => {
                ("Invalid job message".to_string(), Some(details.clone()))
            }
            RelayError::ExecutionFailed { message, details } => (message.clone(), details.clone()),
            RelayError::Timeout(what) => (format!("Timed out {what}"), None),
        }
    }

    /// Build the `error` text frame sent to the client.
    pub fn to_client_message(&self) -> Message {
        let (message, details) = self.describe();
        let mut data = json!({ "message": message });
        if let Some(details) = details {
            data["details"] = json!(details);
        }
        Message::Text(json!({ "type": MSG_TYPE_ERROR, "data": data }).to_string().into())
    }
}

fn describe_node(node_id: &str, node_type: Option<&str>) -> String {
    match node_type {
        Some(kind) => format!("node {node_id} ({kind})"),
        None => format!("node {node_id}"),
    }
}
