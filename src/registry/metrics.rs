//! Per-device session metrics
//!
//! Read-only snapshots for external observability (`/api/sessions`).

use serde::Serialize;

use crate::stream::{WorkerSnapshot, WorkerState};

/// Per-subscriber drop counter
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberDrops {
    pub subscriber_id: u64,
    pub dropped_units: u64,
}

/// Combined stream + snapshot metrics for one device
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub serial: String,
    pub worker_state: &'static str,
    pub stream_subscribers: usize,
    pub snapshot_channels: u32,
    pub bytes_ingested: u64,
    pub units_broadcast: u64,
    pub dropped_units: u64,
    pub subscriber_drops: Vec<SubscriberDrops>,
    pub decoder_running: bool,
    /// Milliseconds since the IDR heading the cached GOP, if any
    pub last_idr_age_ms: Option<u64>,
}

pub(crate) fn worker_state_str(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Stopped => "stopped",
        WorkerState::Starting => "starting",
        WorkerState::Running => "running",
        WorkerState::Stopping => "stopping",
    }
}

impl SessionMetrics {
    pub(crate) fn from_parts(
        worker: WorkerSnapshot,
        snapshot_channels: u32,
        decoder_running: bool,
    ) -> Self {
        Self {
            serial: worker.serial,
            worker_state: worker_state_str(worker.state),
            stream_subscribers: worker.hub.subscriber_count,
            snapshot_channels,
            bytes_ingested: worker.bytes_ingested,
            units_broadcast: worker.hub.units_published,
            dropped_units: worker.hub.dropped_units,
            subscriber_drops: worker
                .subscribers
                .iter()
                .map(|s| SubscriberDrops {
                    subscriber_id: s.id,
                    dropped_units: s.drop_count,
                })
                .collect(),
            decoder_running,
            last_idr_age_ms: worker
                .last_idr_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_strings() {
        assert_eq!(worker_state_str(WorkerState::Stopped), "stopped");
        assert_eq!(worker_state_str(WorkerState::Running), "running");
    }
}
