//! Session registry
//!
//! Process-wide index of capture workers and snapshot pipelines, keyed by
//! device serial. Guarantees at-most-one worker (and so one port forward)
//! and at-most-one snapshot pipeline per serial.
//!
//! The registry-wide lock covers only map mutations; operations on an
//! existing entry run on a cloned `Arc` with the lock released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adb::AdbBridge;
use crate::error::Result;
use crate::snapshot::{PipelineOptions, SnapshotPipeline};
use crate::stream::{CaptureConfig, CaptureWorker, WorkerOptions};

use super::metrics::SessionMetrics;

/// Registry-level configuration
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub worker: WorkerOptions,
    pub pipeline: PipelineOptions,
    pub default_config: CaptureConfig,
    /// Budget for `stop_all` before escalating to kill
    pub shutdown_deadline: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            pipeline: PipelineOptions::default(),
            default_config: CaptureConfig::default(),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

struct Entries {
    workers: HashMap<String, Arc<CaptureWorker>>,
    snapshots: HashMap<String, Arc<SnapshotPipeline>>,
}

/// Process-wide session index
pub struct SessionRegistry {
    bridge: AdbBridge,
    options: RegistryOptions,
    entries: tokio::sync::Mutex<Entries>,
}

impl SessionRegistry {
    pub fn new(bridge: AdbBridge, options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            options,
            entries: tokio::sync::Mutex::new(Entries {
                workers: HashMap::new(),
                snapshots: HashMap::new(),
            }),
        })
    }

    /// Get the worker for `serial`, creating and starting one if absent
    ///
    /// An existing worker is returned as-is; `config` only seeds a new one
    /// (use `update_config` on the worker to change a live session). If a
    /// newly created worker fails to start, it is not retained.
    pub async fn get_or_create_worker(
        &self,
        serial: &str,
        config: Option<CaptureConfig>,
    ) -> Result<Arc<CaptureWorker>> {
        let worker = {
            let mut entries = self.entries.lock().await;
            if let Some(existing) = entries.workers.get(serial) {
                return Ok(Arc::clone(existing));
            }
            let worker = CaptureWorker::new(
                serial,
                self.bridge.clone(),
                config.unwrap_or_else(|| self.options.default_config.clone()),
                self.options.worker.clone(),
            );
            entries
                .workers
                .insert(serial.to_string(), Arc::clone(&worker));
            worker
        };

        if let Err(e) = worker.start().await {
            tracing::warn!(serial = %serial, error = %e, "Worker failed to start, dropping it");
            let mut entries = self.entries.lock().await;
            if entries
                .workers
                .get(serial)
                .is_some_and(|w| Arc::ptr_eq(w, &worker))
            {
                entries.workers.remove(serial);
            }
            return Err(e);
        }
        Ok(worker)
    }

    /// Get the snapshot pipeline for `serial`, creating one if absent
    ///
    /// Implicitly ensures the worker exists (and is running).
    pub async fn get_or_create_snapshot(&self, serial: &str) -> Result<Arc<SnapshotPipeline>> {
        {
            let entries = self.entries.lock().await;
            if let Some(existing) = entries.snapshots.get(serial) {
                return Ok(Arc::clone(existing));
            }
        }

        let worker = self.get_or_create_worker(serial, None).await?;

        let mut entries = self.entries.lock().await;
        // A racing creator may have won; return theirs
        if let Some(existing) = entries.snapshots.get(serial) {
            return Ok(Arc::clone(existing));
        }
        let pipeline = SnapshotPipeline::new(serial, worker, self.options.pipeline.clone());
        entries
            .snapshots
            .insert(serial.to_string(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Look up an existing worker without creating one
    pub async fn worker(&self, serial: &str) -> Option<Arc<CaptureWorker>> {
        self.entries.lock().await.workers.get(serial).cloned()
    }

    /// Stop and remove both sessions for one device
    pub async fn stop(&self, serial: &str) {
        let (worker, pipeline) = {
            let mut entries = self.entries.lock().await;
            (
                entries.workers.remove(serial),
                entries.snapshots.remove(serial),
            )
        };
        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        if let Some(worker) = worker {
            worker.stop().await;
        }
        tracing::info!(serial = %serial, "Sessions stopped and removed");
    }

    /// Stop everything within the shutdown deadline
    ///
    /// Subprocess kills and port-forward removal happen inside the worker
    /// and pipeline stop paths; anything that overruns the deadline is
    /// abandoned (its children die with the process).
    pub async fn stop_all(&self) {
        let (workers, pipelines) = {
            let mut entries = self.entries.lock().await;
            (
                entries.workers.drain().collect::<Vec<_>>(),
                entries.snapshots.drain().collect::<Vec<_>>(),
            )
        };

        let total = workers.len() + pipelines.len();
        if total == 0 {
            return;
        }
        tracing::info!(sessions = total, "Stopping all sessions");

        let shutdown = async {
            for (_, pipeline) in pipelines {
                pipeline.shutdown().await;
            }
            for (_, worker) in workers {
                worker.stop().await;
            }
        };

        if tokio::time::timeout(self.options.shutdown_deadline, shutdown)
            .await
            .is_err()
        {
            tracing::warn!(
                deadline = ?self.options.shutdown_deadline,
                "Shutdown deadline exceeded, abandoning remaining sessions"
            );
        }
    }

    /// Read-only metrics for every registered device
    pub async fn metrics(&self) -> Vec<SessionMetrics> {
        let (workers, snapshots) = {
            let entries = self.entries.lock().await;
            (
                entries
                    .workers
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect::<Vec<_>>(),
                entries
                    .snapshots
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect::<HashMap<_, _>>(),
            )
        };

        let mut out = Vec::with_capacity(workers.len());
        for (serial, worker) in workers {
            let (channels, decoder_running) = match snapshots.get(&serial) {
                Some(p) => (p.channel_count().await, p.decoder_running()),
                None => (0, false),
            };
            out.push(SessionMetrics::from_parts(
                worker.snapshot(),
                channels,
                decoder_running,
            ));
        }
        out.sort_by(|a, b| a.serial.cmp(&b.serial));
        out
    }

    /// Number of registered workers
    pub async fn session_count(&self) -> usize {
        self.entries.lock().await.workers.len()
    }
}
