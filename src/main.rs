//! Service entry point
//!
//! Wires settings, the debug bridge, the session registry, and the device
//! tracker into the HTTP server, and tears everything down within the
//! shutdown deadline on ctrl-c.

use std::sync::Arc;

use droidcast_rs::adb::AdbBridge;
use droidcast_rs::device::DeviceTracker;
use droidcast_rs::{router, AppState, SessionRegistry, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("droidcast_rs=info")),
        )
        .init();

    let settings = Settings::from_env();
    tracing::info!(addr = %settings.bind_addr, "Starting droidcast");

    let bridge = AdbBridge::new();
    let registry = SessionRegistry::new(bridge.clone(), settings.registry_options());
    let tracker = DeviceTracker::spawn(bridge);

    let state = AppState {
        registry: Arc::clone(&registry),
        tracker: Arc::clone(&tracker),
        settings: Arc::new(settings),
    };

    let listener = tokio::net::TcpListener::bind(state.settings.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Kill subprocesses and drop port forwards before exiting
    state.registry.stop_all().await;
    state.tracker.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}
