//! HTTP/WebSocket boundary
//!
//! Environment-driven settings, the axum router, and the stream/snapshot
//! WebSocket endpoints. The wire contracts live here; everything stateful
//! is delegated to the registry, tracker, and pipelines.

pub mod routes;
pub mod settings;
pub mod ws_snapshot;
pub mod ws_stream;

pub use routes::{router, AppState};
pub use settings::Settings;
