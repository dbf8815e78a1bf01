//! Snapshot pipeline
//!
//! Keeps a decoded copy of the newest frame for one device, but only while
//! someone wants it: decoding is expensive, so the decoder subprocess runs
//! exactly while at least one snapshot channel is attached (refcount 0→1
//! starts it, 1→0 tears it down, no idle grace).
//!
//! The pipeline subscribes to the device's broadcast hub, so a fresh decoder
//! is always fed a complete GOP (prefill) before live units. `capture`
//! encodes the latest frame to JPEG on the blocking pool, serialized per
//! device by a depth-1 semaphore.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::h264::{sps_dimensions, SpsDimensions};
use crate::media::{H264Unit, NalUnitKind};
use crate::snapshot::decoder::{read_frames, DecoderProcess};
use crate::snapshot::frame::{yuv420_frame_len, FrameStore, LatestFrame};
use crate::snapshot::jpeg::encode_jpeg;
use crate::stream::{CaptureWorker, StreamSubscription};

/// Pipeline tunables
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Decoder executable (a stock ffmpeg)
    pub decoder_program: String,
    /// Where `save` captures land
    pub capture_output_dir: PathBuf,
    /// JPEG quality when the request carries none
    pub default_quality: u8,
    /// Wait for the first frame after a cold attach
    pub capture_wait_cold: Duration,
    /// Wait for a fresh frame when one already exists
    pub capture_wait_warm: Duration,
    /// Oldest frame the warm fallback may return
    pub max_frame_age: Duration,
    /// Restart the decoder after this long without output while fed
    pub decoder_stall: Duration,
    /// Grace before killing the decoder on detach
    pub decoder_shutdown_grace: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            decoder_program: crate::snapshot::decoder::DEFAULT_DECODER_PROGRAM.to_string(),
            capture_output_dir: PathBuf::from("./captures"),
            default_quality: 80,
            capture_wait_cold: Duration::from_millis(6000),
            capture_wait_warm: Duration::from_millis(2000),
            max_frame_age: Duration::from_millis(1000),
            decoder_stall: Duration::from_millis(5000),
            decoder_shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// One snapshot request
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// JPEG quality 1-100; `None` uses the configured default
    pub quality: Option<u8>,
    /// Also persist the JPEG under the capture output directory
    pub save_to_disk: bool,
}

/// Metadata for one produced snapshot
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub capture_id: String,
    pub serial: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub path: Option<String>,
    pub bytes: usize,
}

/// Proof of one attached snapshot channel
#[derive(Debug)]
pub struct SnapshotHandle {
    id: u64,
}

struct ActiveDecoder {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct AttachState {
    refcount: u32,
    next_handle: u64,
    session: Option<ActiveDecoder>,
}

/// Snapshot pipeline for one device
pub struct SnapshotPipeline {
    serial: String,
    worker: Arc<CaptureWorker>,
    options: PipelineOptions,
    store: Arc<FrameStore>,
    /// Guards the 0→1 and 1→0 transitions
    attach_state: tokio::sync::Mutex<AttachState>,
    /// Depth 1: JPEG encodes are serialized per device
    encode_sem: tokio::sync::Semaphore,
    decoder_alive: Arc<AtomicBool>,
    decoders_spawned: Arc<AtomicU64>,
}

impl SnapshotPipeline {
    pub fn new(
        serial: impl Into<String>,
        worker: Arc<CaptureWorker>,
        options: PipelineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            worker,
            options,
            store: Arc::new(FrameStore::new()),
            attach_state: tokio::sync::Mutex::new(AttachState {
                refcount: 0,
                next_handle: 1,
                session: None,
            }),
            encode_sem: tokio::sync::Semaphore::new(1),
            decoder_alive: Arc::new(AtomicBool::new(false)),
            decoders_spawned: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Attach a snapshot channel; the first one starts the decoder
    ///
    /// Also ensures the capture worker is running: the decoder is fed from
    /// a broadcast subscription.
    pub async fn attach(self: &Arc<Self>) -> Result<SnapshotHandle> {
        let mut state = self.attach_state.lock().await;

        if state.refcount == 0 {
            let subscription = self.worker.subscribe().await?;

            let cancel = CancellationToken::new();
            let task = {
                let pipeline = Arc::downgrade(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    decoder_session(pipeline, subscription, cancel).await;
                })
            };
            state.session = Some(ActiveDecoder { cancel, task });
        }

        state.refcount += 1;
        let id = state.next_handle;
        state.next_handle += 1;
        tracing::info!(serial = %self.serial, channels = state.refcount, "Snapshot channel attached");
        Ok(SnapshotHandle { id })
    }

    /// Detach a snapshot channel; the last one tears the decoder down
    pub async fn detach(&self, handle: SnapshotHandle) {
        let _ = handle.id;
        let mut state = self.attach_state.lock().await;
        if state.refcount == 0 {
            return;
        }
        state.refcount -= 1;
        tracing::info!(serial = %self.serial, channels = state.refcount, "Snapshot channel detached");

        if state.refcount == 0 {
            if let Some(active) = state.session.take() {
                active.cancel.cancel();
                let join_budget = self.options.decoder_shutdown_grace + Duration::from_secs(2);
                if tokio::time::timeout(join_budget, active.task).await.is_err() {
                    tracing::warn!(serial = %self.serial, "Decoder session did not wind down in time");
                }
            }
            self.store.clear();
        }
    }

    /// Number of attached snapshot channels
    pub async fn channel_count(&self) -> u32 {
        self.attach_state.lock().await.refcount
    }

    /// Force-release every channel and stop the decoder (registry shutdown)
    pub async fn shutdown(&self) {
        let mut state = self.attach_state.lock().await;
        state.refcount = 0;
        if let Some(active) = state.session.take() {
            active.cancel.cancel();
            let join_budget = self.options.decoder_shutdown_grace + Duration::from_secs(2);
            if tokio::time::timeout(join_budget, active.task).await.is_err() {
                tracing::warn!(serial = %self.serial, "Decoder session did not wind down in time");
            }
        }
        self.store.clear();
    }

    /// Whether a decoder subprocess is currently alive
    pub fn decoder_running(&self) -> bool {
        self.decoder_alive.load(Ordering::Relaxed)
    }

    /// Total decoder subprocesses spawned over this pipeline's lifetime
    pub fn decoders_spawned(&self) -> u64 {
        self.decoders_spawned.load(Ordering::Relaxed)
    }

    /// Produce one JPEG snapshot of the latest decoded frame
    pub async fn capture(&self, request: CaptureRequest) -> Result<(CaptureResult, Vec<u8>)> {
        let quality = request
            .quality
            .unwrap_or(self.options.default_quality)
            .clamp(1, 100);

        let frame = self.wait_for_frame().await?;

        let jpeg = {
            let _permit = self
                .encode_sem
                .acquire()
                .await
                .map_err(|_| Error::Internal("encode semaphore closed".into()))?;
            let frame = Arc::clone(&frame);
            tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
                .await
                .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))??
        };

        let capture_id = Uuid::new_v4().to_string();
        let path = if request.save_to_disk {
            Some(
                self.save_jpeg(&capture_id, frame.captured_at, &jpeg)
                    .await?,
            )
        } else {
            None
        };

        let result = CaptureResult {
            capture_id,
            serial: self.serial.clone(),
            width: frame.width,
            height: frame.height,
            captured_at: frame.captured_at,
            path,
            bytes: jpeg.len(),
        };
        tracing::info!(
            serial = %self.serial,
            capture_id = %result.capture_id,
            bytes = result.bytes,
            saved = request.save_to_disk,
            "Capture produced"
        );
        Ok((result, jpeg))
    }

    /// Wait policy: cold attaches wait long for the first frame; warm paths
    /// prefer a frame newer than the request and fall back to the existing
    /// frame only while it is recent.
    async fn wait_for_frame(&self) -> Result<Arc<LatestFrame>> {
        let mut rx = self.store.watch();

        let Some(existing) = self.store.latest() else {
            if self.channel_count().await == 0 {
                return Err(Error::NoFrame);
            }
            // Cold: decoder warming up
            return tokio::time::timeout(self.options.capture_wait_cold, async move {
                loop {
                    rx.changed()
                        .await
                        .map_err(|_| Error::Internal("frame store gone".into()))?;
                    let frame = rx.borrow().clone();
                    if let Some(frame) = frame {
                        return Ok(frame);
                    }
                }
            })
            .await
            .map_err(|_| Error::CaptureTimeout)?;
        };

        // Warm: ask for a frame newer than now
        let target_seq = existing.seq;
        let fresh = tokio::time::timeout(self.options.capture_wait_warm, async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let frame = rx.borrow().clone();
                if let Some(frame) = frame {
                    if frame.seq > target_seq {
                        return Some(frame);
                    }
                }
            }
        })
        .await;

        if let Ok(Some(frame)) = fresh {
            return Ok(frame);
        }

        // No new frame in time; the last one is acceptable while recent
        let age_ms = (Utc::now() - existing.captured_at).num_milliseconds();
        if age_ms >= 0 && (age_ms as u128) <= self.options.max_frame_age.as_millis() {
            tracing::debug!(serial = %self.serial, age_ms, "Capture falling back to latest frame");
            return Ok(existing);
        }
        Err(Error::CaptureTimeout)
    }

    /// Atomic write: temp file in the target directory, then rename
    async fn save_jpeg(
        &self,
        capture_id: &str,
        captured_at: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<String> {
        let dir = self.options.capture_output_dir.join(&self.serial);
        tokio::fs::create_dir_all(&dir).await?;

        let stamp = captured_at.format("%Y%m%dT%H%M%SZ");
        let final_path = dir.join(format!("{}_{}.jpg", stamp, capture_id));
        let tmp_path = dir.join(format!(".{}.tmp", capture_id));

        tokio::fs::write(&tmp_path, jpeg).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(final_path.to_string_lossy().into_owned())
    }

    /// Snapshot-side metrics for the registry
    pub async fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            channel_count: self.channel_count().await,
            decoder_running: self.decoder_running(),
            decoders_spawned: self.decoders_spawned(),
            latest_frame_seq: self.store.latest().map(|f| f.seq),
        }
    }

    #[cfg(test)]
    fn store(&self) -> &FrameStore {
        &self.store
    }
}

/// Snapshot-side metrics
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub channel_count: u32,
    pub decoder_running: bool,
    pub decoders_spawned: u64,
    pub latest_frame_seq: Option<u64>,
}

/// Shared counters between the feed side and the stall watchdog
struct SessionProgress {
    units_fed: AtomicU64,
    last_output: Mutex<std::time::Instant>,
}

/// Supervises one attach-session: spawns the decoder, feeds it broadcast
/// units, assembles its output into frames, and restarts it on stalls,
/// write failures, or picture-size changes.
async fn decoder_session(
    pipeline: Weak<SnapshotPipeline>,
    mut subscription: StreamSubscription,
    cancel: CancellationToken,
) {
    // A unit that must be re-fed to a fresh decoder (the SPS that triggered
    // a restart would otherwise be lost).
    let mut carry_over: Option<H264Unit> = None;

    'session: loop {
        let Some(p) = pipeline.upgrade() else { return };
        let serial = p.serial.clone();

        let mut process = match DecoderProcess::spawn(&p.options.decoder_program, &serial) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(serial = %serial, error = %e, "Decoder spawn failed, snapshot pipeline inert");
                p.decoder_alive.store(false, Ordering::Relaxed);
                return;
            }
        };
        p.decoders_spawned.fetch_add(1, Ordering::Relaxed);
        p.decoder_alive.store(true, Ordering::Relaxed);

        let mut stdin = process.stdin.take().expect("decoder stdin piped");
        let stdout = process.stdout.take().expect("decoder stdout piped");

        let dims: Arc<Mutex<Option<SpsDimensions>>> = Arc::new(Mutex::new(None));
        let progress = Arc::new(SessionProgress {
            units_fed: AtomicU64::new(0),
            last_output: Mutex::new(std::time::Instant::now()),
        });

        let output_task = {
            let dims = Arc::clone(&dims);
            let store = Arc::clone(&p.store);
            let progress = Arc::clone(&progress);
            tokio::spawn(async move {
                let frame_len = {
                    let dims = Arc::clone(&dims);
                    move || {
                        dims.lock()
                            .expect("dims lock poisoned")
                            .map(|d| yuv420_frame_len(d.width, d.height))
                            .unwrap_or(0)
                    }
                };
                read_frames(stdout, frame_len, |frame| {
                    let Some(d) = *dims.lock().expect("dims lock poisoned") else {
                        return;
                    };
                    *progress.last_output.lock().expect("progress lock poisoned") =
                        std::time::Instant::now();
                    store.publish(d.width, d.height, Bytes::from(frame));
                })
                .await;
            })
        };

        // The dimensions the decoder instance was started against
        let mut session_dims: Option<SpsDimensions> = None;
        let stall_after = p.options.decoder_stall;
        let grace = p.options.decoder_shutdown_grace;
        drop(p);

        let mut stall_tick = tokio::time::interval(Duration::from_millis(250));
        stall_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Feed the unit a previous session could not process
        if let Some(unit) = carry_over.take() {
            if let NalUnitKind::Sps = unit.kind {
                if let Ok(d) = sps_dimensions(unit.payload()) {
                    *dims.lock().expect("dims lock poisoned") = Some(d);
                    session_dims = Some(d);
                }
            }
            if stdin.write_all(&unit.bytes).await.is_err() {
                carry_over = Some(unit);
                teardown(stdin, process, output_task, grace).await;
                continue 'session;
            }
            progress.units_fed.fetch_add(1, Ordering::Relaxed);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    teardown(stdin, process, output_task, grace).await;
                    if let Some(p) = pipeline.upgrade() {
                        p.decoder_alive.store(false, Ordering::Relaxed);
                    }
                    return;
                }

                maybe_unit = subscription.recv() => {
                    let Some(unit) = maybe_unit else {
                        // Hub closed: the worker stopped or restarted.
                        // Re-subscribe; the prefill re-seeds the decoder.
                        let Some(p) = pipeline.upgrade() else {
                            teardown(stdin, process, output_task, grace).await;
                            return;
                        };
                        match p.worker.subscribe().await {
                            Ok(sub) => {
                                subscription = sub;
                                continue;
                            }
                            Err(e) => {
                                tracing::warn!(serial = %serial, error = %e, "Lost stream and could not re-subscribe");
                                teardown(stdin, process, output_task, grace).await;
                                p.decoder_alive.store(false, Ordering::Relaxed);
                                return;
                            }
                        }
                    };

                    if unit.kind == NalUnitKind::Sps {
                        if let Ok(d) = sps_dimensions(unit.payload()) {
                            if let Some(prev) = session_dims {
                                if prev != d {
                                    tracing::info!(
                                        serial = %serial,
                                        from = ?prev, to = ?d,
                                        "Picture size changed, restarting decoder"
                                    );
                                    carry_over = Some(unit);
                                    teardown(stdin, process, output_task, grace).await;
                                    if let Some(p) = pipeline.upgrade() {
                                        p.store.clear();
                                    }
                                    continue 'session;
                                }
                            } else {
                                session_dims = Some(d);
                                *dims.lock().expect("dims lock poisoned") = Some(d);
                            }
                        }
                    }

                    if stdin.write_all(&unit.bytes).await.is_err() {
                        tracing::warn!(serial = %serial, "Decoder stdin closed, restarting");
                        teardown(stdin, process, output_task, grace).await;
                        match resubscribe(&pipeline).await {
                            Some(sub) => subscription = sub,
                            None => return,
                        }
                        continue 'session;
                    }
                    progress.units_fed.fetch_add(1, Ordering::Relaxed);
                }

                _ = stall_tick.tick() => {
                    let fed = progress.units_fed.load(Ordering::Relaxed);
                    let silent_for = progress
                        .last_output
                        .lock()
                        .expect("progress lock poisoned")
                        .elapsed();
                    if fed > 0 && silent_for >= stall_after {
                        tracing::warn!(serial = %serial, silent_for = ?silent_for, "Decoder stalled, restarting");
                        teardown(stdin, process, output_task, grace).await;
                        match resubscribe(&pipeline).await {
                            Some(sub) => subscription = sub,
                            None => return,
                        }
                        continue 'session;
                    }
                }
            }
        }
    }
}

async fn teardown(
    stdin: tokio::process::ChildStdin,
    process: DecoderProcess,
    output_task: JoinHandle<()>,
    grace: Duration,
) {
    // EOF on stdin is the graceful exit signal
    drop(stdin);
    process.shutdown(grace).await;
    // stdout hits EOF once the child dies; abort covers a wedged reader
    output_task.abort();
}

/// Fresh hub subscription so a restarted decoder starts at an IDR
async fn resubscribe(pipeline: &Weak<SnapshotPipeline>) -> Option<StreamSubscription> {
    let p = pipeline.upgrade()?;
    match p.worker.subscribe().await {
        Ok(sub) => Some(sub),
        Err(e) => {
            tracing::warn!(serial = %p.serial, error = %e, "Re-subscribe after decoder restart failed");
            p.decoder_alive.store(false, Ordering::Relaxed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    use crate::adb::AdbBridge;
    use crate::media::h264::testutil::{annexb_unit, build_sps};
    use crate::stream::{CaptureConfig, WorkerOptions};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snap-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Worker wired to a stub adb and an in-process TCP "agent"
    async fn running_worker(dir: &Path) -> (Arc<CaptureWorker>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let agent = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut bytes = Vec::new();
                let sps = build_sps(66, 0, 0, None); // 16x16
                bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
                bytes.extend_from_slice(&sps);
                bytes.extend(annexb_unit(0x68, &[0xEE]));
                bytes.extend(annexb_unit(0x65, &[0x11; 8]));
                bytes.extend(annexb_unit(0x41, &[0x22; 8]));
                bytes.extend(annexb_unit(0x41, &[0x33; 8]));
                if sock.write_all(&bytes).await.is_err() {
                    continue;
                }
                let _ = sock.flush().await;
                // Keep the connection open; next accept happens if the
                // worker reconnects after a restart.
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        let adb = write_script(
            dir,
            "adb",
            &format!(
                "case \"$*\" in\n  *\"forward tcp:0\"*) printf '{}' ;;\n  *) exit 0 ;;\nesac",
                port
            ),
        );
        let jar = dir.join("agent.jar");
        std::fs::write(&jar, b"fake agent").unwrap();

        let worker = CaptureWorker::new(
            "emulator-5554",
            AdbBridge::with_binary(adb.to_string_lossy().into_owned()),
            CaptureConfig::default(),
            WorkerOptions {
                agent_path: jar,
                idle_timeout: Duration::from_secs(60),
                connect_attempts: 20,
                connect_delay: Duration::from_millis(25),
                ..WorkerOptions::default()
            },
        );
        (worker, agent)
    }

    fn idle_pipeline(options: PipelineOptions) -> Arc<SnapshotPipeline> {
        let worker = CaptureWorker::new(
            "emulator-5554",
            AdbBridge::with_binary("/nonexistent"),
            CaptureConfig::default(),
            WorkerOptions::default(),
        );
        SnapshotPipeline::new("emulator-5554", worker, options)
    }

    fn gray_frame_bytes() -> Bytes {
        Bytes::from(vec![128u8; yuv420_frame_len(16, 16)])
    }

    #[tokio::test]
    async fn test_capture_without_frames_or_channels_is_no_frame() {
        let pipeline = idle_pipeline(PipelineOptions::default());
        let err = pipeline.capture(CaptureRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::NoFrame));
    }

    #[tokio::test]
    async fn test_capture_prefers_fresh_frame() {
        let pipeline = idle_pipeline(PipelineOptions {
            capture_wait_warm: Duration::from_secs(2),
            ..PipelineOptions::default()
        });
        pipeline.store().publish(16, 16, gray_frame_bytes());

        let p = Arc::clone(&pipeline);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.store().publish(16, 16, gray_frame_bytes());
        });

        let (result, jpeg) = pipeline.capture(CaptureRequest::default()).await.unwrap();
        assert_eq!(&jpeg[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!((result.width, result.height), (16, 16));
        assert_eq!(result.bytes, jpeg.len());
        // The fresh frame, not the stale one
        assert_eq!(pipeline.store().latest().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_capture_falls_back_to_recent_frame() {
        let pipeline = idle_pipeline(PipelineOptions {
            capture_wait_warm: Duration::from_millis(80),
            max_frame_age: Duration::from_secs(10),
            ..PipelineOptions::default()
        });
        pipeline.store().publish(16, 16, gray_frame_bytes());

        let (result, _jpeg) = pipeline.capture(CaptureRequest::default()).await.unwrap();
        assert_eq!(result.serial, "emulator-5554");
    }

    #[tokio::test]
    async fn test_capture_times_out_on_stale_frame() {
        let pipeline = idle_pipeline(PipelineOptions {
            capture_wait_warm: Duration::from_millis(50),
            max_frame_age: Duration::from_millis(30),
            ..PipelineOptions::default()
        });
        pipeline.store().publish(16, 16, gray_frame_bytes());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let err = pipeline.capture(CaptureRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::CaptureTimeout));
    }

    #[tokio::test]
    async fn test_capture_save_to_disk_atomic_layout() {
        let dir = test_dir();
        let pipeline = idle_pipeline(PipelineOptions {
            capture_wait_warm: Duration::from_millis(50),
            max_frame_age: Duration::from_secs(10),
            capture_output_dir: dir.clone(),
            ..PipelineOptions::default()
        });
        pipeline.store().publish(16, 16, gray_frame_bytes());

        let (result, jpeg) = pipeline
            .capture(CaptureRequest {
                quality: Some(90),
                save_to_disk: true,
            })
            .await
            .unwrap();

        let path = PathBuf::from(result.path.as_ref().unwrap());
        assert!(path.starts_with(dir.join("emulator-5554")));
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.ends_with(&format!("{}.jpg", result.capture_id)));
        assert_eq!(std::fs::read(&path).unwrap(), jpeg);

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.join("emulator-5554"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_single_decoder_across_channels() {
        let dir = test_dir();
        let (worker, agent) = running_worker(&dir).await;

        let spawn_log = dir.join("spawns.log");
        let decoder = write_script(
            &dir,
            "decoder",
            &format!("echo $$ >> '{}'\nexec cat > /dev/null", spawn_log.display()),
        );

        let pipeline = SnapshotPipeline::new(
            "emulator-5554",
            Arc::clone(&worker),
            PipelineOptions {
                decoder_program: decoder.to_string_lossy().into_owned(),
                decoder_stall: Duration::from_secs(60),
                ..PipelineOptions::default()
            },
        );

        let h1 = pipeline.attach().await.unwrap();
        let h2 = pipeline.attach().await.unwrap();
        let h3 = pipeline.attach().await.unwrap();
        assert_eq!(pipeline.channel_count().await, 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pipeline.decoder_running());
        let spawns = std::fs::read_to_string(&spawn_log).unwrap();
        assert_eq!(spawns.lines().count(), 1, "one decoder for three channels");

        // Two detaches keep the decoder alive
        pipeline.detach(h1).await;
        pipeline.detach(h2).await;
        assert!(pipeline.decoder_running());

        // The last detach tears it down
        pipeline.detach(h3).await;
        assert!(!pipeline.decoder_running());
        assert_eq!(pipeline.decoders_spawned(), 1);

        worker.stop().await;
        agent.abort();
    }

    #[tokio::test]
    async fn test_decoded_frames_reach_capture() {
        let dir = test_dir();
        let (worker, agent) = running_worker(&dir).await;

        // Stand-in decoder: one 16x16 yuv420p frame of zeros, then swallow
        // the feed. The brief sleep lets the SPS set the frame size first.
        let decoder = write_script(
            &dir,
            "decoder",
            "sleep 0.3\nhead -c 384 /dev/zero\nexec cat > /dev/null",
        );

        let pipeline = SnapshotPipeline::new(
            "emulator-5554",
            Arc::clone(&worker),
            PipelineOptions {
                decoder_program: decoder.to_string_lossy().into_owned(),
                capture_wait_cold: Duration::from_secs(10),
                decoder_stall: Duration::from_secs(60),
                ..PipelineOptions::default()
            },
        );

        let handle = pipeline.attach().await.unwrap();

        let (result, jpeg) = pipeline.capture(CaptureRequest::default()).await.unwrap();
        assert_eq!(&jpeg[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!((result.width, result.height), (16, 16));

        pipeline.detach(handle).await;
        worker.stop().await;
        agent.abort();
    }

    #[tokio::test]
    async fn test_stalled_decoder_restarts() {
        let dir = test_dir();
        let (worker, agent) = running_worker(&dir).await;

        // Never emits a frame: the stall watchdog must restart it
        let decoder = write_script(&dir, "decoder", "exec cat > /dev/null");

        let pipeline = SnapshotPipeline::new(
            "emulator-5554",
            Arc::clone(&worker),
            PipelineOptions {
                decoder_program: decoder.to_string_lossy().into_owned(),
                decoder_stall: Duration::from_millis(300),
                decoder_shutdown_grace: Duration::from_millis(100),
                ..PipelineOptions::default()
            },
        );

        let handle = pipeline.attach().await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.decoders_spawned() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(
            pipeline.decoders_spawned() >= 2,
            "stall watchdog never restarted the decoder"
        );

        pipeline.detach(handle).await;
        worker.stop().await;
        agent.abort();
    }
}
