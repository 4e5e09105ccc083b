use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinSet;

use crate::relay::protocol::parse_client_request;
use crate::relay::{RelaySession, SessionState};
use crate::state::AppState;

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with `WsManager` and
/// every job message it sends starts a relay session.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager`.
///   2. Spawns a sender task that forwards messages from the manager channel.
///   3. Starts a relay session per inbound job on the current task.
///   4. On disconnect aborts running sessions and cleans up.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let ws_manager = state.ws_manager.clone();
    let mut rx = ws_manager.add(conn_id.clone()).await;
    let Some(client) = ws_manager.sender(&conn_id).await else {
        tracing::warn!(conn_id = %conn_id, "Connection vanished before it was used");
        return;
    };

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    let mut sessions: JoinSet<SessionState> = JoinSet::new();

    while let Some(result) = stream.next().await {
        while let Some(done) = sessions.try_join_next() {
            log_session_end(&conn_id, done);
        }

        match result {
            Ok(Message::Text(text)) => match parse_client_request(text.as_str()) {
                Ok(request) => {
                    let session = RelaySession::new(
                        client.clone(),
                        state.upstream.clone(),
                        state.job_names.clone(),
                        state.relay.clone(),
                        request,
                    );
                    tracing::debug!(
                        conn_id = %conn_id,
                        session_id = %session.session_id(),
                        "Starting relay session",
                    );
                    sessions.spawn(session.run());
                }
                Err(err) => {
                    tracing::debug!(conn_id = %conn_id, error = %err, "Rejected client message");
                    let _ = client.send(err.to_client_message());
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Dropping a session drops its upstream connection, which closes the
    // engine socket.
    let running = sessions.len();
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}

    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, aborted_sessions = running, "WebSocket disconnected");
}

fn log_session_end(conn_id: &str, result: Result<SessionState, tokio::task::JoinError>) {
    match result {
        Ok(state) => tracing::debug!(conn_id, ?state, "Relay session ended"),
        Err(e) => tracing::warn!(conn_id, error = %e, "Relay session task failed"),
    }
}
