//! External H.264 decoder driver
//!
//! Drives one decoder subprocess per device: Annex-B units go into its
//! stdin, raw planar `yuv420p` frames come out of its stdout. The stdout
//! reader parses frame boundaries incrementally (`width * height * 1.5`
//! bytes each) and keeps only the latest frame, so a slow JPEG path can
//! never make the child's output buffer grow without bound.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};

/// Default decoder invocation, matching a stock ffmpeg build
pub const DEFAULT_DECODER_PROGRAM: &str = "ffmpeg";

/// Arguments for low-latency H.264 to rawvideo decoding
fn decoder_args() -> Vec<&'static str> {
    vec![
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-fflags",
        "+genpts+discardcorrupt",
        "-flags",
        "low_delay",
        "-probesize",
        "32",
        "-analyzeduration",
        "0",
        "-f",
        "h264",
        "-i",
        "pipe:0",
        "-vsync",
        "passthrough",
        "-pix_fmt",
        "yuv420p",
        "-f",
        "rawvideo",
        "-flush_packets",
        "1",
        "pipe:1",
    ]
}

/// A running decoder subprocess
#[derive(Debug)]
pub struct DecoderProcess {
    child: Child,
    /// Taken by the feed task
    pub stdin: Option<ChildStdin>,
    /// Taken by the output task
    pub stdout: Option<ChildStdout>,
}

impl DecoderProcess {
    /// Spawn the decoder for one device
    pub fn spawn(program: &str, serial: &str) -> Result<Self> {
        let mut child = Command::new(program)
            .args(decoder_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DecoderSpawnFailed {
                serial: serial.to_string(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // Drain stderr so the child never blocks on it; decoder noise is
        // only interesting at debug level.
        if let Some(stderr) = child.stderr.take() {
            let serial = serial.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(serial = %serial, "decoder: {}", line);
                }
            });
        }

        tracing::info!(serial = %serial, program = %program, "Decoder started");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Graceful shutdown: close stdin, wait up to `grace`, then kill
    pub async fn shutdown(mut self, grace: Duration) {
        drop(self.stdin.take());
        drop(self.stdout.take());

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(status = ?status.code(), "Decoder exited");
            }
            _ => {
                tracing::debug!("Decoder did not exit in grace period, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Whether the child has already exited
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Incremental splitter of the decoder's raw output into whole frames
///
/// Keeps only the newest complete frame per `push` call; intermediate
/// frames inside one read are dropped, which is exactly the latest-only
/// contract.
#[derive(Debug, Default)]
pub struct RawFrameAssembler {
    buf: Vec<u8>,
}

impl RawFrameAssembler {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed decoder output; returns the newest complete frame, if any
    pub fn push(&mut self, chunk: &[u8], frame_len: usize) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        if frame_len == 0 {
            return None;
        }

        let mut latest = None;
        while self.buf.len() >= frame_len {
            let frame: Vec<u8> = self.buf.drain(..frame_len).collect();
            latest = Some(frame);
        }
        latest
    }

    /// Drop buffered bytes (dimension change)
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Read loop body shared by the pipeline's output task
///
/// Reads up to 256 KiB at a time and yields whole frames to `on_frame`.
/// `frame_len` may start at zero (dimensions unknown); bytes buffer until
/// the caller learns the size from the stream's SPS.
pub async fn read_frames(
    stdout: ChildStdout,
    mut frame_len: impl FnMut() -> usize,
    mut on_frame: impl FnMut(Vec<u8>),
) {
    let mut reader = stdout;
    let mut assembler = RawFrameAssembler::new();
    let mut chunk = vec![0u8; 256 * 1024];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(frame) = assembler.push(&chunk[..n], frame_len()) {
                    on_frame(frame);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Decoder stdout read error");
                break;
            }
        }
    }
}
