//! Device tracking
//!
//! Device records, tracking-stream snapshots, and the tracker that keeps
//! the process-wide device set current.

pub mod model;
pub mod tracker;

pub use model::{Device, DeviceSetSnapshot, DeviceState};
pub use tracker::DeviceTracker;
