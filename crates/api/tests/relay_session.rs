//! Relay session behaviour against a scripted engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use comfyrelay_api::config::RelayConfig;
use comfyrelay_api::relay::{JobNameRegistry, RelaySession, SessionState};
use comfyrelay_comfyui::events::UpstreamEvent;
use comfyrelay_comfyui::history::{JobFailure, JobOutputs};
use comfyrelay_comfyui::messages::{PreviewFormat, PreviewImage};
use comfyrelay_comfyui::queue::QueueState;
use common::*;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

struct Harness {
    connector: Arc<FakeConnector>,
    job_names: Arc<JobNameRegistry>,
    rx: mpsc::UnboundedReceiver<Message>,
    session: RelaySession,
}

fn harness(connector: FakeConnector, config: RelayConfig) -> Harness {
    let connector = Arc::new(connector);
    let job_names = Arc::new(JobNameRegistry::new(16, Duration::from_secs(3600)));
    let (tx, rx) = mpsc::unbounded_channel();
    let session = RelaySession::new(
        tx,
        connector.clone(),
        job_names.clone(),
        Arc::new(config),
        chain_request("portrait"),
    );
    Harness {
        connector,
        job_names,
        rx,
        session,
    }
}

fn live_engine() -> FakeEngine {
    FakeEngine {
        queue: running_queue(),
        ..FakeEngine::default()
    }
}

fn errors(frames: &[serde_json::Value]) -> Vec<&serde_json::Value> {
    frames.iter().filter(|f| f["type"] == "error").collect()
}

// ---------------------------------------------------------------------------
// Cached replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cached_job_is_replayed_without_progress() {
    let fake = FakeEngine {
        queue: QueueState::default(),
        history: JobOutputs {
            images: vec![output_image("3", "cached_00001_.png")],
            ..JobOutputs::default()
        },
        ..FakeEngine::default()
    };
    let mut h = harness(FakeConnector::new(fake, Vec::new()), relay_config());

    let state = h.session.run().await;
    assert_eq!(state, SessionState::Completed);
    assert!(state.is_terminal());

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(frame_types(&frames), vec!["completed"]);

    let data = &frames[0]["data"];
    assert_eq!(data["jobId"], JOB_ID);
    assert_eq!(data["cached"], true);
    assert_eq!(data["images"][0]["filename"], "cached_00001_.png");
    assert_eq!(
        data["images"][0]["url"],
        "/api/v1/view?filename=cached_00001_.png&subfolder=&type=output"
    );
    assert_eq!(h.job_names.len().await, 0);
}

#[tokio::test]
async fn job_that_failed_before_the_queue_check_is_not_cached() {
    let fake = FakeEngine {
        queue: QueueState::default(),
        ..FakeEngine::default()
    };
    let script = vec![
        engine_start(),
        engine(
            r#"{"type":"execution_error","data":{"prompt_id":"job-1","node_id":"2","node_type":"KSampler","exception_message":"CUDA out of memory","exception_type":"torch.OutOfMemoryError"}}"#,
        ),
    ];
    let mut h = harness(FakeConnector::new(fake, script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(frame_types(&frames), vec!["error"]);
    assert_eq!(frames[0]["data"]["message"], "CUDA out of memory");
    assert!(frames[0]["data"]["details"]
        .as_str()
        .unwrap()
        .contains("node 2 (KSampler)"));
    assert_eq!(h.job_names.len().await, 0);
}

#[tokio::test]
async fn interruption_recorded_in_history_is_not_cached() {
    let fake = FakeEngine {
        queue: QueueState::default(),
        history: JobOutputs {
            images: Vec::new(),
            failure: Some(JobFailure {
                interrupted: true,
                message: "Execution was interrupted".to_string(),
                exception_type: None,
                node_id: Some("2".to_string()),
                node_type: None,
            }),
        },
        ..FakeEngine::default()
    };
    let mut h = harness(FakeConnector::new(fake, Vec::new()), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(frame_types(&frames), vec!["error"]);
    assert_eq!(frames[0]["data"]["message"], "Execution was interrupted");
    assert_eq!(frames[0]["data"]["details"], "node 2");
}

// ---------------------------------------------------------------------------
// Live streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_job_streams_structure_then_progress_then_completion() {
    let script = vec![
        engine(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#),
        engine(r#"{"type":"execution_start","data":{"prompt_id":"job-1"}}"#),
        engine(r#"{"type":"execution_cached","data":{"prompt_id":"job-1","nodes":["1"]}}"#),
        engine(r#"{"type":"executing","data":{"node":"2","prompt_id":"job-1"}}"#),
        engine(r#"{"type":"progress","data":{"value":2,"max":4,"prompt_id":"job-1","node":"2"}}"#),
        UpstreamEvent::Preview(PreviewImage {
            format: PreviewFormat::Jpeg,
            data: vec![0xFF, 0xD8, 0xFF],
        }),
        engine(r#"{"type":"progress","data":{"value":4,"max":4,"prompt_id":"job-1","node":"2"}}"#),
        engine(r#"{"type":"executing","data":{"node":"3","prompt_id":"job-1"}}"#),
        engine(
            r#"{"type":"executed","data":{"node":"3","prompt_id":"job-1","output":{"images":[{"filename":"out_00001_.png","subfolder":"","type":"output"}]}}}"#,
        ),
        engine(r#"{"type":"executing","data":{"node":null,"prompt_id":"job-1"}}"#),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    let state = h.session.run().await;
    assert_eq!(state, SessionState::Completed);

    let messages = drain(&mut h.rx);
    let binary: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Binary(b) => Some(b.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(binary, vec![vec![0, 0, 0, 1, 0xFF, 0xD8, 0xFF]]);

    let frames = text_frames(&messages);
    let types = frame_types(&frames);
    assert_eq!(&types[..2], &["workflow_structure", "total_images"]);
    assert_eq!(types.last().map(String::as_str), Some("completed"));
    assert!(errors(&frames).is_empty());

    let structure = &frames[0]["data"];
    assert_eq!(structure["totalNodes"], 3);
    assert_eq!(structure["outputNodeCount"], 1);
    assert_eq!(structure["hasDependencies"], true);
    assert_eq!(structure["maxDepth"], 2);
    assert_eq!(structure["jobId"], JOB_ID);
    assert_eq!(structure["nodeTypes"]["KSampler"], 1);
    assert_eq!(frames[1]["data"], 1);

    let started = frames.iter().find(|f| f["type"] == "execution_started").unwrap();
    assert_eq!(started["data"]["jobName"], "portrait");
    assert_eq!(started["data"]["jobId"], JOB_ID);

    let cached = frames.iter().find(|f| f["type"] == "cached_nodes").unwrap();
    assert_eq!(cached["data"]["nodes"], serde_json::json!(["1"]));

    let ratios: Vec<f64> = frames
        .iter()
        .filter(|f| f["type"] == "overall_progress")
        .map(|f| f["data"]["ratio"].as_f64().unwrap())
        .collect();
    assert!(ratios.windows(2).all(|w| w[0] <= w[1]), "ratios regressed: {ratios:?}");
    assert_eq!(ratios.last().copied(), Some(1.0));

    let output = frames.iter().find(|f| f["type"] == "output").unwrap();
    assert_eq!(output["data"]["node"], "3");

    let completed = frames.last().unwrap();
    assert_eq!(completed["data"]["cached"], false);
    assert_eq!(completed["data"]["images"][0]["filename"], "out_00001_.png");

    // The job went to the engine untouched, under the connection's client id.
    let submitted = h.connector.engine.submitted.lock().unwrap().clone();
    assert_eq!(submitted, vec![(chain_job(), "fake-client".to_string())]);
    assert_eq!(h.job_names.len().await, 0);
}

#[tokio::test]
async fn no_progress_is_sent_before_structure() {
    let script = vec![
        engine(r#"{"type":"executing","data":{"node":"1","prompt_id":"job-1"}}"#),
        engine(r#"{"type":"execution_success","data":{"prompt_id":"job-1"}}"#),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Completed);

    let types = frame_types(&text_frames(&drain(&mut h.rx)));
    let first_progress = types
        .iter()
        .position(|t| t == "overall_progress" || t == "progress")
        .unwrap();
    let structure = types.iter().position(|t| t == "workflow_structure").unwrap();
    assert!(structure < first_progress);
}

#[tokio::test]
async fn completion_falls_back_to_history_images() {
    let fake = FakeEngine {
        queue: running_queue(),
        history: JobOutputs {
            images: vec![output_image("3", "from_history.png")],
            ..JobOutputs::default()
        },
        ..FakeEngine::default()
    };
    let script = vec![
        engine_start(),
        engine(r#"{"type":"execution_success","data":{"prompt_id":"job-1"}}"#),
    ];
    let mut h = harness(FakeConnector::new(fake, script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Completed);

    let frames = text_frames(&drain(&mut h.rx));
    let completed = frames.last().unwrap();
    assert_eq!(completed["type"], "completed");
    assert_eq!(completed["data"]["images"][0]["filename"], "from_history.png");
}

#[tokio::test]
async fn other_jobs_events_are_ignored() {
    let script = vec![
        engine(
            r#"{"type":"execution_error","data":{"prompt_id":"someone-else","node_id":"9","exception_message":"boom","exception_type":"RuntimeError"}}"#,
        ),
        engine_start(),
        engine(r#"{"type":"executing","data":{"node":null,"prompt_id":"job-1"}}"#),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Completed);
    assert!(errors(&text_frames(&drain(&mut h.rx))).is_empty());
}

fn engine_start() -> UpstreamEvent {
    engine(r#"{"type":"execution_start","data":{"prompt_id":"job-1"}}"#)
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_close_mid_stream_sends_one_error() {
    let script = vec![
        engine_start(),
        engine(r#"{"type":"executing","data":{"node":"2","prompt_id":"job-1"}}"#),
        engine(r#"{"type":"progress","data":{"value":1,"max":4,"prompt_id":"job-1"}}"#),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(errors(&frames).len(), 1);
    assert_eq!(frames.last().unwrap()["type"], "error");
    assert!(!frame_types(&frames).contains(&"completed".to_string()));
    assert_eq!(h.job_names.len().await, 0);
}

#[tokio::test]
async fn upstream_stream_error_sends_one_error() {
    let script = vec![engine_start(), UpstreamEvent::Error("connection reset".into())];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    let errs = errors(&frames);
    assert_eq!(errs.len(), 1);
    assert!(errs[0]["data"]["details"]
        .as_str()
        .unwrap()
        .contains("connection reset"));
}

#[tokio::test]
async fn execution_error_is_reported_with_node_details() {
    let script = vec![
        engine_start(),
        engine(
            r#"{"type":"execution_error","data":{"prompt_id":"job-1","node_id":"2","node_type":"KSampler","exception_message":"CUDA out of memory","exception_type":"torch.OutOfMemoryError"}}"#,
        ),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    let errs = errors(&frames);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0]["data"]["message"], "CUDA out of memory");
    assert!(errs[0]["data"]["details"]
        .as_str()
        .unwrap()
        .contains("node 2 (KSampler)"));
}

#[tokio::test]
async fn interruption_is_an_error() {
    let script = vec![
        engine_start(),
        engine(r#"{"type":"execution_interrupted","data":{"prompt_id":"job-1","node_id":"2"}}"#),
    ];
    let mut h = harness(FakeConnector::new(live_engine(), script), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);
    assert_eq!(errors(&text_frames(&drain(&mut h.rx))).len(), 1);
}

#[tokio::test]
async fn rejected_submission_sends_error_and_nothing_else() {
    let fake = FakeEngine {
        reject_submission: true,
        ..FakeEngine::default()
    };
    let mut h = harness(FakeConnector::new(fake, Vec::new()), relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(frame_types(&frames), vec!["error"]);
    assert!(frames[0]["data"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to queue prompt"));
    assert!(frames[0]["data"]["details"]
        .as_str()
        .unwrap()
        .contains("invalid prompt"));
    assert_eq!(h.job_names.len().await, 0);
}

#[tokio::test]
async fn refused_connection_sends_error() {
    let mut connector = FakeConnector::new(FakeEngine::default(), Vec::new());
    connector.refuse = true;
    let mut h = harness(connector, relay_config());

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    assert_eq!(frame_types(&frames), vec!["error"]);
    assert!(frames[0]["data"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to queue prompt"));
    assert!(frames[0]["data"]["details"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn job_that_never_starts_times_out() {
    let mut connector = FakeConnector::new(live_engine(), Vec::new());
    connector.hold_open = true;
    let config = RelayConfig {
        start_timeout: Duration::from_secs(5),
        ..relay_config()
    };
    let mut h = harness(connector, config);

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    let errs = errors(&frames);
    assert_eq!(errs.len(), 1);
    assert!(errs[0]["data"]["message"]
        .as_str()
        .unwrap()
        .contains("waiting for the engine to start"));
}

#[tokio::test(start_paused = true)]
async fn long_running_job_hits_execution_timeout() {
    let mut connector = FakeConnector::new(live_engine(), vec![engine_start()]);
    connector.hold_open = true;
    let config = RelayConfig {
        start_timeout: Duration::from_secs(5),
        execution_timeout: Duration::from_secs(60),
        ..relay_config()
    };
    let mut h = harness(connector, config);

    assert_eq!(h.session.run().await, SessionState::Closed);

    let frames = text_frames(&drain(&mut h.rx));
    let errs = errors(&frames);
    assert_eq!(errs.len(), 1);
    assert!(errs[0]["data"]["message"]
        .as_str()
        .unwrap()
        .contains("running the job"));
}

// ---------------------------------------------------------------------------
// Client disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aborting_a_session_releases_the_upstream_connection() {
    let mut connector = FakeConnector::new(live_engine(), Vec::new());
    connector.hold_open = true;
    let mut h = harness(connector, relay_config());

    let mut sessions = JoinSet::new();
    sessions.spawn(h.session.run());

    // Wait until the session is streaming.
    let first = h.rx.recv().await.expect("structure frame");
    assert!(matches!(first, Message::Text(_)));
    assert_eq!(h.job_names.len().await, 1);

    sessions.abort_all();
    let joined = sessions.join_next().await.expect("one task");
    assert!(joined.unwrap_err().is_cancelled());

    {
        let readers = h.connector.readers.lock().unwrap();
        assert_eq!(readers.len(), 1);
        assert!(readers[0].is_cancelled());
    }
    assert_eq!(h.job_names.len().await, 0);
}
