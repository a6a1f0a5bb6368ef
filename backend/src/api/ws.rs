// =============================================================================
// WebSocket Handler: push-based chart snapshots
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate full ChartSnapshot on connect.
//   2. A fresh snapshot every `push_interval` whenever the pipeline version
//      has changed since the last push (bursts of revisions coalesce).
//
// Clients may send a text frame `{"symbol": "...", "timeframe": "..."}` to
// change the selection; a rejected request is answered with an error frame.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::rest::SelectionRequest;
use crate::app_state::AppState;
use crate::error::PipelineError;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Push loop**: every tick, send a new snapshot if the version moved.
///   2. **Recv loop**: selection requests, Ping/Pong, Close.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let clients = state.ws_client_connected();
    info!(clients, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut last_sent_version = match send_snapshot(&mut sender, &state).await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "Failed to send initial WebSocket snapshot");
            cleanup(&state);
            return;
        }
    };

    let mut push_interval = interval(state.push_interval);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                if state.chart.series().version != last_sent_version {
                    match send_snapshot(&mut sender, &state).await {
                        Ok(version) => last_sent_version = version,
                        Err(e) => {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_selection_request(&state, &text) {
                            warn!(error = %e, "WebSocket selection request rejected");
                            let frame = serde_json::json!({
                                "error": e.kind(),
                                "message": e.to_string(),
                            });
                            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

fn handle_selection_request(state: &AppState, text: &str) -> Result<(), PipelineError> {
    let req: SelectionRequest = serde_json::from_str(text)
        .map_err(|e| PipelineError::InvalidSelection(format!("malformed request: {e}")))?;
    let selection = req.into_selection()?;
    state.chart.set_selection(selection.clone())?;
    info!(selection = %selection, "selection changed via WebSocket");
    Ok(())
}

/// Serialize and send the current snapshot. Returns the version sent.
async fn send_snapshot<S>(sender: &mut S, state: &AppState) -> Result<u64, axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = state.chart.series();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.version, "WebSocket snapshot sent");
        }
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize snapshot");
        }
    }
    Ok(snapshot.version)
}

fn cleanup(state: &AppState) {
    let clients = state.ws_client_disconnected();
    info!(clients, "WebSocket connection closed — cleanup complete");
}
