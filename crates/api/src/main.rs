use std::net::SocketAddr;
use std::sync::Arc;

use comfyrelay_comfyui::manager::ComfyUIManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrelay_api::config::{RelayConfig, ServerConfig};
use comfyrelay_api::relay::JobNameRegistry;
use comfyrelay_api::router::build_app_router;
use comfyrelay_api::state::AppState;
use comfyrelay_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyrelay_api=debug,comfyrelay_comfyui=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let relay = RelayConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    tracing::info!(
        api_url = %relay.comfyui_api_url,
        ws_url = %relay.comfyui_ws_url,
        start_timeout_secs = relay.start_timeout.as_secs(),
        execution_timeout_secs = relay.execution_timeout.as_secs(),
        "Loaded relay configuration",
    );

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());

    // --- Heartbeat ---
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));

    // --- ComfyUI manager ---
    let comfyui_manager =
        ComfyUIManager::new(relay.comfyui_ws_url.clone(), relay.comfyui_api_url.clone());
    tracing::info!(
        api_url = comfyui_manager.api_url(),
        ws_url = comfyui_manager.ws_url(),
        "ComfyUI manager started",
    );

    // --- Job names ---
    let job_names = Arc::new(JobNameRegistry::new(
        relay.job_name_capacity,
        relay.job_name_ttl,
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        relay: Arc::new(relay),
        ws_manager: Arc::clone(&ws_manager),
        upstream: comfyui_manager.clone(),
        engine: comfyui_manager.api(),
        job_names,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    // Engine sockets go after the clients they serve.
    comfyui_manager.shutdown().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
