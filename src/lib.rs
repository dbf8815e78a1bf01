//! droidcast-rs: live Android screen broadcasting
//!
//! Android devices run a prebuilt device-side encoder agent (pushed over
//! the debug bridge) that writes raw H.264 to a local abstract socket. This
//! crate discovers devices, drives one capture session per device, reframes
//! the byte stream into self-contained Annex-B units, fans each unit out to
//! any number of WebSocket viewers with at-most-once delivery, and produces
//! on-demand JPEG snapshots from a decoded copy of the stream.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<SessionRegistry>
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!       CaptureWorker (per device)      SnapshotPipeline (per device)
//!       adb push / forward / spawn      refcounted decoder subprocess
//!              │                               ▲
//!        TCP read loop                         │ hub subscription
//!              ▼                               │ (GOP prefill + live)
//!       UnitExtractor ──▶ BroadcastHub ────────┤
//!       (Annex-B/AVCC)    GopCache + queues    │
//!                              │               ▼
//!              ┌───────────────┤        latest frame ──▶ JPEG
//!              ▼               ▼
//!        WS /stream      WS /stream ...        WS /snapshot
//! ```
//!
//! # Delivery guarantees
//!
//! - Per subscriber, units arrive in emission order; a slow subscriber
//!   drops units (counted) rather than stalling the producer.
//! - A late joiner always receives a decoder-initializing prefix
//!   `(SPS, PPS, IDR, ..)` before any live unit, when one is cached.
//! - At most one capture worker, one port forward, and one decoder
//!   subprocess exist per device serial.

pub mod adb;
pub mod device;
pub mod error;
pub mod media;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod stream;

pub use error::{Error, Result};
pub use registry::{RegistryOptions, SessionRegistry};
pub use server::{router, AppState, Settings};
pub use stream::{CaptureConfig, CaptureWorker};
