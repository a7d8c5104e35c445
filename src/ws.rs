use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{stream::StreamExt, SinkExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{start_stream, stop_stream, AppState, StartOutcome};
use crate::transcoder::TranscodeEvent;

const OUTGOING_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    StartStream {
        #[serde(default)]
        stream_id: Option<String>,
        source: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    StreamStarted {
        stream_id: String,
        output_location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        already_active: Option<bool>,
    },
    StreamProgress {
        frames: u64,
        fps: f64,
        bitrate: f64,
    },
    #[serde(rename_all = "camelCase")]
    StreamError {
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    StreamEnded { stream_id: String },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection, one client. Streams the connection starts belong to it:
/// when the socket goes away, every one of them is killed and cleaned so a
/// closed browser tab cannot leave an orphaned transcoder behind.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    info!("Push channel client connected: {}", client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTGOING_QUEUE);

    // Single writer task; forwarders and the request loop all queue into it,
    // which preserves per-stream event ordering.
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize push message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut owned_streams: Vec<String> = Vec::new();

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::StartStream { stream_id, source }) => {
                    let id = stream_id.unwrap_or_else(|| client_id.clone());
                    handle_start_request(&state, &id, &source, &out_tx, &mut owned_streams)
                        .await;
                }
                Err(e) => {
                    debug!("Unparsable message from client {}: {}", client_id, e);
                    let _ = out_tx
                        .send(ServerMessage::StreamError {
                            stream_id: None,
                            message: format!("invalid request: {}", e),
                        })
                        .await;
                }
            },
            Ok(Message::Close(_)) => {
                info!("Push channel client {} closed", client_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Push channel error for client {}: {}", client_id, e);
                break;
            }
        }
    }

    // Connection teardown owns the streams this client started
    for id in owned_streams {
        info!(
            "Client {} disconnected, stopping stream '{}'",
            client_id, id
        );
        stop_stream(&state, &id).await;
    }
    send_task.abort();
    info!("Push channel client disconnected: {}", client_id);
}

async fn handle_start_request(
    state: &AppState,
    stream_id: &str,
    source: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    owned_streams: &mut Vec<String>,
) {
    if source.trim().is_empty() {
        let _ = out_tx
            .send(ServerMessage::StreamError {
                stream_id: Some(stream_id.to_string()),
                message: "source is required".to_string(),
            })
            .await;
        return;
    }

    match start_stream(state, stream_id, source).await {
        Ok(StartOutcome::Started {
            output_location,
            events,
        }) => {
            owned_streams.push(stream_id.to_string());
            // Queued ahead of the forwarder's first event, so
            // stream-started always precedes stream-progress
            let _ = out_tx
                .send(ServerMessage::StreamStarted {
                    stream_id: stream_id.to_string(),
                    output_location,
                    already_active: None,
                })
                .await;
            spawn_event_forwarder(stream_id.to_string(), events, out_tx.clone());
        }
        Ok(StartOutcome::AlreadyActive { output_location }) => {
            let _ = out_tx
                .send(ServerMessage::StreamStarted {
                    stream_id: stream_id.to_string(),
                    output_location,
                    already_active: Some(true),
                })
                .await;
        }
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::StreamError {
                    stream_id: Some(stream_id.to_string()),
                    message: e.to_string(),
                })
                .await;
        }
    }
}

/// Relay wrapper events to one client. stream-ended and stream-error are
/// terminal: the forwarder exits and nothing further is pushed for this
/// stream on this connection.
fn spawn_event_forwarder(
    stream_id: String,
    mut events: broadcast::Receiver<TranscodeEvent>,
    out_tx: mpsc::Sender<ServerMessage>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TranscodeEvent::Started) => {}
                Ok(TranscodeEvent::Progress {
                    frames,
                    fps,
                    bitrate_kbps,
                }) => {
                    if out_tx
                        .send(ServerMessage::StreamProgress {
                            frames,
                            fps,
                            bitrate: bitrate_kbps,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(TranscodeEvent::Errored { message, detail }) => {
                    let message = match detail {
                        Some(detail) => format!("{} ({})", message, detail),
                        None => message,
                    };
                    let _ = out_tx
                        .send(ServerMessage::StreamError {
                            stream_id: Some(stream_id.clone()),
                            message,
                        })
                        .await;
                    break;
                }
                Ok(TranscodeEvent::Ended) => {
                    let _ = out_tx
                        .send(ServerMessage::StreamEnded {
                            stream_id: stream_id.clone(),
                        })
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        "Push forwarder for stream '{}' lagged by {} events",
                        stream_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Push forwarder for stream '{}' finished", stream_id);
    });
}
