//! Stream WebSocket endpoint
//!
//! `WS /stream/{serial}`: server-to-client binary messages, one
//! Annex-B unit each. Client frames are ignored. Late joiners receive the
//! cached GOP before any live unit (hub prefill contract).

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use super::routes::AppState;

/// 1000: normal closure
const CLOSE_NORMAL: u16 = 1000;
/// 1011: server error
const CLOSE_ERROR: u16 = 1011;

pub async fn handler(
    ws: WebSocketUpgrade,
    Path(serial): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, state, serial))
}

async fn session(mut socket: WebSocket, state: AppState, serial: String) {
    if !state.tracker.is_online(&serial) {
        let _ = socket.send(close_frame(CLOSE_ERROR, "device_offline")).await;
        return;
    }

    let worker = match state.registry.get_or_create_worker(&serial, None).await {
        Ok(worker) => worker,
        Err(e) => {
            tracing::warn!(serial = %serial, error = %e, "Stream session setup failed");
            let _ = socket.send(close_frame(CLOSE_ERROR, e.wire_code())).await;
            return;
        }
    };

    let mut subscription = match worker.subscribe().await {
        Ok(sub) => sub,
        Err(e) => {
            let _ = socket.send(close_frame(CLOSE_ERROR, e.wire_code())).await;
            return;
        }
    };

    tracing::info!(serial = %serial, subscriber = subscription.id, "Stream client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            maybe_unit = subscription.recv() => {
                match maybe_unit {
                    Some(unit) => {
                        if sender.send(Message::Binary(unit.bytes.to_vec())).await.is_err() {
                            // Transport error removes this subscriber only
                            break;
                        }
                    }
                    None => {
                        // Hub closed. A device that is still online means the
                        // worker died underneath us; otherwise it is a normal
                        // stop (idle reap, unplug, shutdown).
                        let frame = if state.tracker.is_online(&serial) {
                            close_frame(CLOSE_ERROR, "stream ended unexpectedly")
                        } else {
                            close_frame(CLOSE_NORMAL, "stream ended")
                        };
                        let _ = sender.send(frame).await;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Client frames are ignored on this channel
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(serial = %serial, "Stream client disconnected");
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
