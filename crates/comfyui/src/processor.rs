//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants and forwards them as
//! [`UpstreamEvent`]s to the owning session.
//!
//! [`ComfyUIMessage`]: crate::messages::ComfyUIMessage

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::EngineSocket;
use crate::events::UpstreamEvent;
use crate::messages::{parse_message, parse_preview};

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a receive error, the
/// receiver is dropped, or `cancel` fires. Closing and erroring both
/// end with exactly one terminal event on `tx`. On cancellation the
/// socket is closed and no terminal event is sent.
pub async fn process_messages(
    mut ws_stream: EngineSocket,
    client_id: String,
    tx: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(client_id = %client_id, "Closing engine socket");
                let _ = ws_stream.close(None).await;
                return;
            }
            frame = ws_stream.next() => frame,
        };

        let event = match frame {
            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                Ok(msg) => UpstreamEvent::Message(msg),
                Err(e) => {
                    tracing::debug!(
                        client_id = %client_id,
                        error = %e,
                        "Skipping unrecognised engine message",
                    );
                    continue;
                }
            },
            Some(Ok(Message::Binary(data))) => match parse_preview(&data) {
                Some(preview) => UpstreamEvent::Preview(preview),
                None => {
                    tracing::trace!(client_id = %client_id, len = data.len(), "Ignoring binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(client_id = %client_id, ?frame, "Engine WebSocket closed");
                UpstreamEvent::Closed {
                    reason: frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty()),
                }
            }
            Some(Err(e)) => {
                tracing::error!(client_id = %client_id, error = %e, "Engine WebSocket receive error");
                UpstreamEvent::Error(e.to_string())
            }
            None => UpstreamEvent::Closed { reason: None },
        };

        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            tracing::debug!(client_id = %client_id, "Session dropped, stopping reader");
            let _ = ws_stream.close(None).await;
            return;
        }
        if terminal {
            return;
        }
    }
}
