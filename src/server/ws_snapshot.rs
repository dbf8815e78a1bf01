//! Snapshot WebSocket endpoint
//!
//! `WS /snapshot/{serial}`: the connection holds one snapshot
//! channel open (decoder runs while connected). Text JSON requests produce
//! a `capture_result` JSON message immediately followed by one binary
//! message with the JPEG payload, or a typed error message.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::{CaptureRequest, CaptureResult};

use super::routes::AppState;

const CLOSE_ERROR: u16 = 1011;

/// Client request frame
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Capture {
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        quality: Option<u8>,
        #[serde(default)]
        save: Option<bool>,
    },
}

/// Server reply before the binary JPEG payload
#[derive(Debug, Serialize)]
struct CaptureResultMessage<'a> {
    r#type: &'static str,
    capture_id: &'a str,
    serial: &'a str,
    width: u32,
    height: u32,
    captured_at: String,
    path: Option<&'a str>,
    bytes: usize,
}

impl<'a> CaptureResultMessage<'a> {
    fn from_result(result: &'a CaptureResult) -> Self {
        Self {
            r#type: "capture_result",
            capture_id: &result.capture_id,
            serial: &result.serial,
            width: result.width,
            height: result.height,
            captured_at: iso8601(result.captured_at),
            path: result.path.as_deref(),
            bytes: result.bytes,
        }
    }
}

/// Server error frame
#[derive(Debug, Serialize)]
struct ErrorMessage<'a> {
    r#type: &'static str,
    code: &'a str,
    message: String,
    capture_id: Option<&'a str>,
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Path(serial): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, state, serial))
}

async fn session(mut socket: WebSocket, state: AppState, serial: String) {
    if !state.tracker.is_online(&serial) {
        close(&mut socket, "device_offline").await;
        return;
    }

    let pipeline = match state.registry.get_or_create_snapshot(&serial).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::warn!(serial = %serial, error = %e, "Snapshot session setup failed");
            close(&mut socket, e.wire_code()).await;
            return;
        }
    };

    let handle = match pipeline.attach().await {
        Ok(handle) => handle,
        Err(e) => {
            close(&mut socket, e.wire_code()).await;
            return;
        }
    };
    tracing::info!(serial = %serial, "Snapshot client connected");

    while let Some(incoming) = socket.recv().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Capture {
                format,
                quality,
                save,
            }) => {
                if let Some(format) = format.as_deref() {
                    if !format.eq_ignore_ascii_case("jpeg") {
                        send_error(
                            &mut socket,
                            "unsupported_format",
                            format!("format {} is not supported", format),
                        )
                        .await;
                        continue;
                    }
                }

                let request = CaptureRequest {
                    quality,
                    save_to_disk: save.unwrap_or(false),
                };
                match pipeline.capture(request).await {
                    Ok((result, jpeg)) => {
                        let reply = CaptureResultMessage::from_result(&result);
                        let json = match serde_json::to_string(&reply) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(error = %e, "capture_result serialization failed");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                        if socket.send(Message::Binary(jpeg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        send_error(&mut socket, e.wire_code(), e.to_string()).await;
                    }
                }
            }
            Err(_) => {
                send_error(
                    &mut socket,
                    "bad_request",
                    "unknown message type".to_string(),
                )
                .await;
            }
        }
    }

    pipeline.detach(handle).await;
    tracing::info!(serial = %serial, "Snapshot client disconnected");
}

async fn send_error(socket: &mut WebSocket, code: &str, message: String) {
    let frame = ErrorMessage {
        r#type: "error",
        code,
        message,
        capture_id: None,
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

async fn close(socket: &mut WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_ERROR,
            reason: reason.to_string().into(),
        })))
        .await;
}
