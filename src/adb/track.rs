//! Device tracking stream
//!
//! Subscribes to `adb track-devices`: a long-lived connection over which the
//! bridge sends the full device list every time it changes, each payload
//! prefixed by a 4-hex-digit length. The stream is restarted internally with
//! exponential backoff when the bridge drops it; this is the only place in
//! the driver that retries.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::bridge::AdbBridge;
use crate::device::model::DeviceSetSnapshot;

/// Initial reconnect delay
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
/// Reconnect delay cap
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Receiving side of the tracking stream
pub struct DeviceEvents {
    rx: mpsc::Receiver<DeviceSetSnapshot>,
}

impl DeviceEvents {
    /// Next full device-set snapshot; `None` only after `stop` drops the task
    pub async fn recv(&mut self) -> Option<DeviceSetSnapshot> {
        self.rx.recv().await
    }
}

impl AdbBridge {
    /// Start the restartable tracking stream
    ///
    /// The background task lives until the returned receiver is dropped.
    pub fn track_devices(&self) -> DeviceEvents {
        let (tx, rx) = mpsc::channel(16);
        let adb = self.binary().to_string();

        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                match run_track_session(&adb, &tx).await {
                    Ok(()) => {
                        // Bridge closed the stream cleanly; reconnect fast
                        backoff = BACKOFF_INITIAL;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, delay = ?backoff, "track-devices disconnected, reconnecting");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        });

        DeviceEvents { rx }
    }
}

/// Run one `adb track-devices` session until EOF or error
async fn run_track_session(
    adb: &str,
    tx: &mpsc::Sender<DeviceSetSnapshot>,
) -> std::io::Result<()> {
    let mut child = Command::new(adb)
        .arg("track-devices")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("no stdout from track-devices"))?;

    tracing::info!("track-devices stream started");

    loop {
        // 4 ASCII hex digits give the payload length
        let mut len_hex = [0u8; 4];
        if read_exact_or_eof(&mut stdout, &mut len_hex).await? {
            break;
        }
        let len = usize::from_str_radix(std::str::from_utf8(&len_hex).unwrap_or(""), 16)
            .map_err(|_| std::io::Error::other("bad track-devices length prefix"))?;

        let mut payload = vec![0u8; len];
        if len > 0 && read_exact_or_eof(&mut stdout, &mut payload).await? {
            break;
        }

        let snapshot = DeviceSetSnapshot::parse(&String::from_utf8_lossy(&payload));
        if tx.send(snapshot).await.is_err() {
            // Receiver gone: stop tracking entirely
            let _ = child.kill().await;
            return Ok(());
        }
    }

    let _ = child.kill().await;
    Ok(())
}

/// Fill `buf` completely; returns `true` on clean EOF at a frame boundary
async fn read_exact_or_eof(
    reader: &mut (impl AsyncReadExt + Unpin),
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(true);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated track-devices frame",
            ));
        }
        filled += n;
    }
    Ok(false)
}
