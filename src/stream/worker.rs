//! Per-device capture worker
//!
//! Owns the full upstream path for one device: agent jar push, port
//! forward, agent spawn, the TCP read loop feeding the unit extractor, and
//! the broadcast hub that fans units out to subscribers.
//!
//! # State machine
//!
//! ```text
//!    Stopped ──start()──▶ Starting ──TCP connected──▶ Running
//!       ▲                    │                          │
//!       │                    │fatal                     │idle timeout / stop()
//!       │                    ▼                          ▼
//!       └──────────────── Stopping ◀────────────────────┘
//! ```
//!
//! Transitions are serialized by one lifecycle mutex; `start` and `stop` are
//! idempotent. A transient read error terminates the worker — restarting is
//! the registry's call.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::adb::{AdbBridge, DeviceProcessHandle};
use crate::error::{Error, Result};
use crate::media::UnitExtractor;
use crate::stream::config::CaptureConfig;
use crate::stream::hub::{BroadcastHub, HubStats, StreamSubscription, SubscriberStats};

/// Where the agent jar lives on the device
const AGENT_REMOTE_PATH: &str = "/data/local/tmp/scrcpy-server.jar";
/// Entry class inside the agent jar
const AGENT_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";
/// Agent protocol version, passed as the first argument
const AGENT_VERSION: &str = "3.3.4";
/// Device-local abstract socket the agent listens on
const AGENT_SOCKET: &str = "scrcpy";
/// Read size for the TCP loop
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Tunables handed down from the registry
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Host path of the prebuilt encoder agent jar
    pub agent_path: PathBuf,
    /// Stop after the subscriber count has been zero this long
    pub idle_timeout: Duration,
    /// Minimum continuous prefill emptiness before a 0→1 restart
    pub min_restart_wait: Duration,
    /// GOP cache byte cap
    pub gop_cap_bytes: usize,
    /// Per-subscriber queue depth
    pub subscriber_queue_depth: usize,
    /// TCP connect retry budget
    pub connect_attempts: u32,
    /// Delay between connect attempts
    pub connect_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            agent_path: PathBuf::from("./vendor/scrcpy-server.jar"),
            idle_timeout: Duration::from_secs(5),
            min_restart_wait: Duration::from_secs(2),
            gop_cap_bytes: crate::media::DEFAULT_GOP_CAP_BYTES,
            subscriber_queue_depth: 256,
            connect_attempts: 10,
            connect_delay: Duration::from_millis(500),
        }
    }
}

/// Resources owned while the worker is up
struct ActiveSession {
    host_port: u16,
    agent: DeviceProcessHandle,
    read_task: JoinHandle<()>,
    idle_task: JoinHandle<()>,
}

/// Capture worker for one device
pub struct CaptureWorker {
    serial: String,
    bridge: AdbBridge,
    options: WorkerOptions,
    hub: Arc<BroadcastHub>,
    /// Serializes start/stop/update_config
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    state: Mutex<WorkerState>,
    config: Mutex<CaptureConfig>,
    bytes_ingested: AtomicU64,
}

/// Point-in-time worker metrics
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub serial: String,
    pub state: WorkerState,
    pub bytes_ingested: u64,
    pub hub: HubStats,
    pub subscribers: Vec<SubscriberStats>,
    pub last_idr_at: Option<Instant>,
}

impl CaptureWorker {
    pub fn new(
        serial: impl Into<String>,
        bridge: AdbBridge,
        config: CaptureConfig,
        options: WorkerOptions,
    ) -> Arc<Self> {
        let hub = BroadcastHub::new(options.gop_cap_bytes, options.subscriber_queue_depth);
        Arc::new(Self {
            serial: serial.into(),
            bridge,
            options,
            hub,
            lifecycle: tokio::sync::Mutex::new(None),
            state: Mutex::new(WorkerState::Stopped),
            config: Mutex::new(config),
            bytes_ingested: AtomicU64::new(0),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn config(&self) -> CaptureConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Start capturing; idempotent while already running
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut session = self.lifecycle.lock().await;
        if session.is_some() {
            return Ok(());
        }
        self.set_state(WorkerState::Starting);

        match self.start_locked().await {
            Ok(active) => {
                *session = Some(active);
                self.set_state(WorkerState::Running);
                tracing::info!(serial = %self.serial, "Capture worker running");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_locked(self: &Arc<Self>) -> Result<ActiveSession> {
        let config = self.config();
        config.validate()?;

        self.push_agent_if_needed().await?;

        let host_port = self
            .bridge
            .forward_port(&self.serial, 0, AGENT_SOCKET)
            .await?;

        let mut agent_args = vec![
            AGENT_VERSION.to_string(),
            "tunnel_forward=true".to_string(),
            "audio=false".to_string(),
            "control=false".to_string(),
            "cleanup=false".to_string(),
            "raw_stream=true".to_string(),
        ];
        agent_args.extend(config.to_agent_args());

        let agent = match self
            .bridge
            .spawn_device_process(&self.serial, AGENT_REMOTE_PATH, AGENT_MAIN_CLASS, &agent_args)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                self.bridge.unforward_port(&self.serial, host_port).await;
                return Err(e);
            }
        };

        let stream = match self.connect_with_retry(host_port).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut agent = agent;
                agent.kill().await;
                self.bridge.unforward_port(&self.serial, host_port).await;
                return Err(e);
            }
        };

        self.hub.reset_cache();

        let read_task = {
            let worker = Arc::downgrade(self);
            let serial = self.serial.clone();
            tokio::spawn(async move {
                read_loop(worker, serial, stream).await;
            })
        };
        let idle_task = {
            let worker = Arc::downgrade(self);
            let idle_timeout = self.options.idle_timeout;
            tokio::spawn(async move {
                idle_watchdog(worker, idle_timeout).await;
            })
        };

        Ok(ActiveSession {
            host_port,
            agent,
            read_task,
            idle_task,
        })
    }

    /// Push the agent jar unless the device already holds the same bytes
    async fn push_agent_if_needed(&self) -> Result<()> {
        let local = &self.options.agent_path;
        if !local.exists() {
            return Err(Error::EncoderSpawnFailed {
                serial: self.serial.clone(),
                reason: format!("agent jar not found at {}", local.display()),
            });
        }

        let remote = self.bridge.remote_md5(&self.serial, AGENT_REMOTE_PATH).await;
        if let (Some(remote), Some(local_md5)) = (remote, local_md5(local).await) {
            if remote == local_md5 {
                tracing::debug!(serial = %self.serial, "Agent jar already on device, skipping push");
                return Ok(());
            }
        }

        self.bridge
            .push_file(&self.serial, local, AGENT_REMOTE_PATH)
            .await
    }

    async fn connect_with_retry(&self, port: u16) -> Result<TcpStream> {
        for attempt in 0..self.options.connect_attempts {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(serial = %self.serial, port, attempt, "Connected to agent");
                    return Ok(stream);
                }
                Err(_) if attempt + 1 < self.options.connect_attempts => {
                    tokio::time::sleep(self.options.connect_delay).await;
                }
                Err(e) => {
                    tracing::warn!(serial = %self.serial, port, error = %e, "Agent connect failed");
                }
            }
        }
        Err(Error::TcpConnectFailed {
            serial: self.serial.clone(),
            port,
        })
    }

    /// Stop capturing; idempotent. Failures are logged, not propagated.
    pub async fn stop(self: &Arc<Self>) {
        let mut session = self.lifecycle.lock().await;
        let Some(mut active) = session.take() else {
            return;
        };
        self.set_state(WorkerState::Stopping);
        tracing::info!(serial = %self.serial, "Stopping capture worker");

        active.read_task.abort();
        active.idle_task.abort();
        active.agent.kill().await;
        self.bridge.unforward_port(&self.serial, active.host_port).await;
        self.hub.close_all();

        self.set_state(WorkerState::Stopped);
        tracing::info!(serial = %self.serial, "Capture worker stopped");
    }

    /// Replace the config and restart the encoder with it
    ///
    /// Subscribers stay connected; the prefill cache resets and they pick up
    /// a fresh GOP at the next IDR (a visible glitch is expected).
    pub async fn update_config(self: &Arc<Self>, config: CaptureConfig) -> Result<()> {
        config.validate()?;
        let was_running = {
            let session = self.lifecycle.lock().await;
            session.is_some()
        };
        *self.config.lock().expect("config lock poisoned") = config;
        if was_running {
            self.stop().await;
            self.start().await?;
        }
        Ok(())
    }

    /// Subscribe to the broadcast, starting the worker if needed
    ///
    /// On a 0→1 transition where no join prefix exists and none has existed
    /// for `min_restart_wait`, the encoder is restarted so the new subscriber
    /// starts at `(SPS, PPS, IDR)` instead of waiting for the next keyframe.
    pub async fn subscribe(self: &Arc<Self>) -> Result<StreamSubscription> {
        if !self.is_running() {
            self.start().await?;
        } else if self.subscriber_count() == 0 && !self.hub.has_prefill() {
            let empty_for = self.hub.prefill_empty_for().unwrap_or(Duration::ZERO);
            if empty_for >= self.options.min_restart_wait {
                tracing::info!(
                    serial = %self.serial,
                    empty_for = ?empty_for,
                    "Restarting encoder for first subscriber without a join prefix"
                );
                self.stop().await;
                self.start().await?;
            }
        }
        Ok(self.hub.subscribe())
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            serial: self.serial.clone(),
            state: self.state(),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            hub: self.hub.stats(),
            subscribers: self.hub.subscriber_stats(),
            last_idr_at: self.hub.last_idr_at(),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}

/// TCP read loop: bytes → extractor → hub
async fn read_loop(worker: Weak<CaptureWorker>, serial: String, mut stream: TcpStream) {
    let mut extractor = UnitExtractor::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(serial = %serial, "Agent closed the stream");
                break;
            }
            Ok(n) => {
                let Some(worker) = worker.upgrade() else {
                    return;
                };
                worker.bytes_ingested.fetch_add(n as u64, Ordering::Relaxed);
                for unit in extractor.push(&buf[..n]) {
                    worker.hub.publish(unit);
                }
            }
            Err(e) => {
                tracing::warn!(serial = %serial, error = %e, "Stream read error");
                break;
            }
        }
    }

    // EOF or error: tear the worker down from a fresh task so aborting the
    // read task inside stop() cannot cancel the stop itself.
    if let Some(worker) = worker.upgrade() {
        tokio::spawn(async move {
            worker.stop().await;
        });
    }
}

/// Stops the worker once the subscriber count has been zero for the timeout
async fn idle_watchdog(worker: Weak<CaptureWorker>, idle_timeout: Duration) {
    let mut last_active = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let Some(worker) = worker.upgrade() else {
            return;
        };
        if worker.state() != WorkerState::Running {
            return;
        }
        if worker.subscriber_count() > 0 {
            last_active = Instant::now();
        } else if last_active.elapsed() >= idle_timeout {
            tracing::info!(serial = %worker.serial, "Idle timeout, stopping capture worker");
            tokio::spawn(async move {
                worker.stop().await;
            });
            return;
        }
    }
}

/// MD5 of a local file via the host `md5sum` tool; `None` when unavailable
async fn local_md5(path: &std::path::Path) -> Option<String> {
    let output = tokio::process::Command::new("md5sum")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()
        .map(|s| s.to_string())
}
