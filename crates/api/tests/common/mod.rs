#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::Message;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use comfyrelay_api::config::{RelayConfig, ServerConfig};
use comfyrelay_api::relay::protocol::{parse_client_request, ClientRequest};
use comfyrelay_api::relay::JobNameRegistry;
use comfyrelay_api::router::build_app_router;
use comfyrelay_api::state::AppState;
use comfyrelay_api::ws::WsManager;
use comfyrelay_comfyui::api::{ComfyUIApiError, EngineApi, SubmitResponse, ViewedImage};
use comfyrelay_comfyui::events::UpstreamEvent;
use comfyrelay_comfyui::history::{ImageRef, JobOutputs, OutputImage};
use comfyrelay_comfyui::messages::parse_message;
use comfyrelay_comfyui::queue::{QueueEntry, QueueState};
use comfyrelay_comfyui::upstream::{UpstreamConnection, UpstreamConnector, UpstreamError};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const JOB_ID: &str = "job-1";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
    }
}

pub fn relay_config() -> RelayConfig {
    RelayConfig {
        comfyui_api_url: "http://engine.test:8188".to_string(),
        comfyui_ws_url: "ws://engine.test:8188".to_string(),
        start_timeout: Duration::from_secs(120),
        execution_timeout: Duration::from_secs(1800),
        job_name_capacity: 16,
        job_name_ttl: Duration::from_secs(3600),
    }
}

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

/// Scripted stand-in for the engine's REST surface.
#[derive(Default)]
pub struct FakeEngine {
    pub reject_submission: bool,
    pub queue: QueueState,
    pub history: JobOutputs,
    pub submitted: Mutex<Vec<(serde_json::Value, String)>>,
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn submit(
        &self,
        job: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        if self.reject_submission {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: r#"{"error":"invalid prompt"}"#.to_string(),
            });
        }
        self.submitted
            .lock()
            .unwrap()
            .push((job.clone(), client_id.to_string()));
        Ok(SubmitResponse {
            prompt_id: JOB_ID.to_string(),
            number: 1,
        })
    }

    async fn queue(&self) -> Result<QueueState, ComfyUIApiError> {
        Ok(self.queue.clone())
    }

    async fn history(&self, _prompt_id: &str) -> Result<JobOutputs, ComfyUIApiError> {
        Ok(self.history.clone())
    }

    async fn view(&self, image: &ImageRef) -> Result<ViewedImage, ComfyUIApiError> {
        if image.filename == "missing.png" {
            return Err(ComfyUIApiError::ApiError {
                status: 404,
                body: String::new(),
            });
        }
        Ok(ViewedImage {
            bytes: image.filename.as_bytes().to_vec(),
            content_type: Some("image/png".to_string()),
        })
    }
}

/// Hands out one connection whose socket replays `script`.
///
/// With `hold_open` the socket never closes after the script ends.
pub struct FakeConnector {
    pub engine: Arc<FakeEngine>,
    pub script: Vec<UpstreamEvent>,
    pub hold_open: bool,
    pub refuse: bool,
    pub readers: Mutex<Vec<CancellationToken>>,
    senders: Mutex<Vec<mpsc::Sender<UpstreamEvent>>>,
}

impl FakeConnector {
    pub fn new(engine: FakeEngine, script: Vec<UpstreamEvent>) -> Self {
        Self {
            engine: Arc::new(engine),
            script,
            hold_open: false,
            refuse: false,
            readers: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn open(&self) -> Result<UpstreamConnection, UpstreamError> {
        if self.refuse {
            return Err(UpstreamError::Stream("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.script.len() + 1);
        for event in &self.script {
            tx.try_send(event.clone()).expect("script fits the channel");
        }
        if self.hold_open {
            self.senders.lock().unwrap().push(tx);
        }

        let reader = CancellationToken::new();
        self.readers.lock().unwrap().push(reader.clone());
        let api: Arc<dyn EngineApi> = self.engine.clone();
        Ok(UpstreamConnection::new("fake-client".to_string(), api, rx, reader))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Parse an engine text frame into an upstream event.
pub fn engine(json: &str) -> UpstreamEvent {
    UpstreamEvent::Message(parse_message(json).expect("valid engine message"))
}

/// Three-node chain: loader -> sampler -> save.
pub fn chain_job() -> serde_json::Value {
    serde_json::json!({
        "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "m.safetensors" } },
        "2": { "class_type": "KSampler", "inputs": { "model": ["1", 0], "steps": 4 } },
        "3": { "class_type": "SaveImage", "inputs": { "images": ["2", 0] } }
    })
}

pub fn chain_request(name: &str) -> ClientRequest {
    let text = serde_json::json!({ "job": chain_job(), "jobName": name }).to_string();
    parse_client_request(&text).expect("valid request")
}

/// A queue with the test job running.
pub fn running_queue() -> QueueState {
    QueueState {
        running: vec![QueueEntry {
            number: 1,
            prompt_id: JOB_ID.to_string(),
            prompt: Some(chain_job()),
            output_node_ids: vec!["3".to_string()],
        }],
        pending: Vec::new(),
    }
}

pub fn output_image(node: &str, filename: &str) -> OutputImage {
    OutputImage {
        node_id: node.to_string(),
        image: ImageRef {
            filename: filename.to_string(),
            subfolder: String::new(),
            kind: "output".to_string(),
        },
    }
}

/// Collect everything sent to a client so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Decode the JSON text frames, skipping binary ones.
pub fn text_frames(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Text(t) => Some(serde_json::from_str(t.as_str()).expect("JSON frame")),
            _ => None,
        })
        .collect()
}

pub fn frame_types(frames: &[serde_json::Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| f["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Build the full application router with all middleware layers, backed
/// by `engine` and `connector`.
pub fn build_test_app(engine: Arc<FakeEngine>, connector: Arc<FakeConnector>) -> Router {
    let config = test_config();
    let relay = relay_config();

    let state = AppState {
        config: Arc::new(config.clone()),
        job_names: Arc::new(JobNameRegistry::new(relay.job_name_capacity, relay.job_name_ttl)),
        relay: Arc::new(relay),
        ws_manager: Arc::new(WsManager::new()),
        upstream: connector,
        engine,
    };

    build_app_router(state, &config)
}

pub fn default_app() -> Router {
    let connector = Arc::new(FakeConnector::new(FakeEngine::default(), Vec::new()));
    build_test_app(Arc::new(FakeEngine::default()), connector)
}

/// Send a GET request through the router.
pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn assert_status(response: &Response, status: StatusCode) {
    assert_eq!(response.status(), status, "unexpected status");
}
