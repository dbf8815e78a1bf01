//! Debug-bridge driver
//!
//! The only component that talks to the external `adb` tool: file push,
//! port forwarding, remote process spawn, shell probes, and the restartable
//! device tracking stream.

pub mod bridge;
pub mod track;

pub use bridge::{AdbBridge, DeviceProcessHandle};
pub use track::DeviceEvents;
