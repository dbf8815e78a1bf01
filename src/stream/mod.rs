//! Capture and broadcast
//!
//! Per-device capture workers drive the device-side encoder agent over the
//! debug bridge and fan the resulting H.264 units out through a broadcast
//! hub with bounded per-subscriber queues.

pub mod config;
pub mod hub;
pub mod worker;

pub use config::{CaptureConfig, VideoCodec};
pub use hub::{BroadcastHub, HubStats, StreamSubscription, SubscriberId, SubscriberStats};
pub use worker::{CaptureWorker, WorkerOptions, WorkerSnapshot, WorkerState};
