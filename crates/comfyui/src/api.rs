//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, queue inspection,
//! history retrieval, image download) using [`reqwest`]. The
//! [`EngineApi`] trait is the seam the relay talks through so that it can
//! be driven by a fake engine in tests.

use async_trait::async_trait;
use serde::Deserialize;

use crate::history::{parse_history, ImageRef, JobOutputs};
use crate::queue::QueueState;

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Raw image bytes fetched through `/view`.
#[derive(Debug, Clone)]
pub struct ViewedImage {
    pub bytes: Vec<u8>,
    /// `Content-Type` reported by the engine, if any.
    pub content_type: Option<String>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The body was valid HTTP but not the shape we expected.
    #[error("Unexpected ComfyUI response: {0}")]
    InvalidResponse(String),
}

/// Operations the relay needs from the engine's HTTP surface.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Queue a job for execution under `client_id`.
    async fn submit(
        &self,
        job: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Current running and pending queue items.
    async fn queue(&self) -> Result<QueueState, ComfyUIApiError>;

    /// Images recorded for a finished job.
    async fn history(&self, prompt_id: &str) -> Result<JobOutputs, ComfyUIApiError>;

    /// Download one stored image.
    async fn view(&self, image: &ImageRef) -> Result<ViewedImage, ComfyUIApiError>;
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let value: serde_json::Value = Self::parse_response(response).await?;
        if value.get("prompt_id").and_then(|v| v.as_str()).is_none() {
            return Err(ComfyUIApiError::InvalidResponse(format!(
                "no prompt_id in submission response: {value}"
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    /// Fetch the queue via `GET /queue`.
    pub async fn get_queue(&self) -> Result<QueueState, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let value: serde_json::Value = Self::parse_response(response).await?;
        serde_json::from_value(value).map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON
    /// contains output file paths, node results, and timing data.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an image via `GET /view`.
    pub async fn view_image(&self, image: &ImageRef) -> Result<ViewedImage, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();

        Ok(ViewedImage {
            bytes,
            content_type,
        })
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl EngineApi for ComfyUIApi {
    async fn submit(
        &self,
        job: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submit_workflow(job, client_id).await
    }

    async fn queue(&self) -> Result<QueueState, ComfyUIApiError> {
        self.get_queue().await
    }

    async fn history(&self, prompt_id: &str) -> Result<JobOutputs, ComfyUIApiError> {
        let history = self.get_history(prompt_id).await?;
        Ok(parse_history(prompt_id, &history))
    }

    async fn view(&self, image: &ImageRef) -> Result<ViewedImage, ComfyUIApiError> {
        self.view_image(image).await
    }
}
