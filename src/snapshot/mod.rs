//! On-demand JPEG snapshots
//!
//! A per-device pipeline that keeps the newest decoded frame in memory
//! while at least one snapshot channel is attached, and encodes it to JPEG
//! on request. The decoder is an external subprocess fed from the device's
//! broadcast hub.

pub mod decoder;
pub mod frame;
pub mod jpeg;
pub mod pipeline;

pub use frame::{FrameStore, LatestFrame};
pub use pipeline::{
    CaptureRequest, CaptureResult, PipelineMetrics, PipelineOptions, SnapshotHandle,
    SnapshotPipeline,
};
