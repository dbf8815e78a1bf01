//! HTTP router
//!
//! REST endpoints for device listing and session metrics, an SSE stream of
//! device-change events, and the two WebSocket endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::Stream;
use tower_http::cors::{Any, CorsLayer};

use crate::device::DeviceTracker;
use crate::registry::SessionRegistry;
use crate::server::settings::Settings;

use super::{ws_snapshot, ws_stream};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub tracker: Arc<DeviceTracker>,
    pub settings: Arc<Settings>,
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    let cors = if state.settings.cors_allow_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .settings
            .cors_allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/devices", get(list_devices))
        .route("/api/sessions", get(list_sessions))
        .route("/api/events", get(device_events))
        .route("/stream/:serial", get(ws_stream::handler))
        .route("/snapshot/:serial", get(ws_snapshot::handler))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tracker.devices())
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.metrics().await)
}

/// SSE stream: `event: devices` with the full current set on every change
///
/// The first event fires immediately so late joiners are current without
/// waiting for a change.
async fn device_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = state.tracker.devices();
    let rx = state.tracker.subscribe();

    let stream = futures::stream::unfold(
        (Some(initial), rx),
        |(initial, mut rx)| async move {
            let devices = match initial {
                Some(devices) => devices,
                None => rx.recv().await?,
            };
            let event = Event::default()
                .event("devices")
                .json_data(&devices)
                .unwrap_or_else(|_| Event::default().event("devices").data("[]"));
            Some((Ok(event), (None, rx)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
