//! Session registry
//!
//! Device-keyed index of capture workers and snapshot pipelines with
//! get-or-create semantics, per-device stop, deadline-bounded stop-all,
//! and read-only metrics.

pub mod metrics;
pub mod store;

pub use metrics::{SessionMetrics, SubscriberDrops};
pub use store::{RegistryOptions, SessionRegistry};
