//! Debug-bridge driver
//!
//! Thin effect layer over the `adb` executable. Every other component talks
//! to devices only through this module: file push, port forwarding, remote
//! process spawn, shell probes, and the device tracking stream (see
//! [`super::track`]).
//!
//! Operations surface the first error to the caller without retry; only the
//! tracking stream reconnects internally.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// Handle to the adb binary
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: String,
}

impl AdbBridge {
    pub fn new() -> Self {
        Self::with_binary("adb")
    }

    /// Use a specific adb binary (tests point this at a stub script)
    pub fn with_binary(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    /// Run `adb -s <serial> <args..>` to completion
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<(i32, String, String)> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::BridgeUnreachable(format!("{}: {}", self.adb_path, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((output.status.code().unwrap_or(-1), stdout, stderr))
    }

    /// Classify a failed adb invocation by its stderr
    fn classify(serial: &str, stderr: &str) -> Error {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("offline") || lower.contains("not found") {
            Error::DeviceOffline(serial.to_string())
        } else {
            Error::BridgeUnreachable(stderr.trim().to_string())
        }
    }

    /// Push a local file to the device
    pub async fn push_file(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let local_str = local.to_string_lossy();
        let (code, _out, err) = self
            .run(Some(serial), &["push", &local_str, remote])
            .await?;
        if code != 0 {
            return Err(Self::classify(serial, &err));
        }
        tracing::debug!(serial = %serial, remote = %remote, "Pushed file to device");
        Ok(())
    }

    /// MD5 of a file on the device, if the remote toolbox supports it
    ///
    /// Used to skip redundant agent pushes. `None` when the file is missing
    /// or the probe fails; callers push unconditionally in that case.
    pub async fn remote_md5(&self, serial: &str, remote: &str) -> Option<String> {
        let (code, out, _err) = self
            .run(Some(serial), &["shell", "md5sum", remote])
            .await
            .ok()?;
        if code != 0 {
            return None;
        }
        out.split_whitespace().next().map(|s| s.to_string())
    }

    /// Forward a host TCP port to a device-local abstract socket
    ///
    /// `host_port == 0` requests an ephemeral port; adb prints the chosen
    /// port, which is returned. Re-binding an existing forward replaces it.
    pub async fn forward_port(
        &self,
        serial: &str,
        host_port: u16,
        abstract_name: &str,
    ) -> Result<u16> {
        let local = format!("tcp:{}", host_port);
        let remote = format!("localabstract:{}", abstract_name);
        let (code, out, err) = self
            .run(Some(serial), &["forward", &local, &remote])
            .await?;
        if code != 0 {
            let lower = err.to_ascii_lowercase();
            if lower.contains("in use") || lower.contains("cannot bind") {
                return Err(Error::PortInUse(host_port));
            }
            return Err(Self::classify(serial, &err));
        }

        let bound = if host_port == 0 {
            out.trim()
                .parse::<u16>()
                .map_err(|_| Error::BridgeUnreachable(format!("bad forward reply: {:?}", out)))?
        } else {
            host_port
        };
        tracing::debug!(serial = %serial, port = bound, socket = %abstract_name, "Port forward installed");
        Ok(bound)
    }

    /// Remove a host port forward; best-effort, missing forwards ignored
    pub async fn unforward_port(&self, serial: &str, host_port: u16) {
        let local = format!("tcp:{}", host_port);
        match self
            .run(Some(serial), &["forward", "--remove", &local])
            .await
        {
            Ok((0, ..)) => {
                tracing::debug!(serial = %serial, port = host_port, "Port forward removed");
            }
            Ok((_, _, err)) => {
                tracing::debug!(serial = %serial, port = host_port, error = %err.trim(), "Port unforward ignored");
            }
            Err(e) => {
                tracing::debug!(serial = %serial, port = host_port, error = %e, "Port unforward failed");
            }
        }
    }

    /// Spawn a detached process on the device via `app_process`
    ///
    /// The child inherits no host stdio; its stdout/stderr are captured
    /// line-buffered and logged.
    pub async fn spawn_device_process(
        &self,
        serial: &str,
        classpath: &str,
        main_class: &str,
        args: &[String],
    ) -> Result<DeviceProcessHandle> {
        let mut cmd = Command::new(&self.adb_path);
        cmd.arg("-s")
            .arg(serial)
            .arg("shell")
            .arg(format!("CLASSPATH={}", classpath))
            .arg("app_process")
            .arg("/")
            .arg(main_class);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::EncoderSpawnFailed {
            serial: serial.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            let serial = serial.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(serial = %serial, "agent: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let serial = serial.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(serial = %serial, "agent: {}", line);
                }
            });
        }

        tracing::info!(serial = %serial, class = %main_class, "Device process spawned");
        Ok(DeviceProcessHandle { child })
    }

    /// Run an arbitrary shell command on the device
    pub async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let (code, out, err) = self.run(Some(serial), &full).await?;
        if code != 0 {
            return Err(Self::classify(serial, &err));
        }
        Ok(out)
    }

    /// Fetch a system property from the device
    pub async fn getprop(&self, serial: &str, prop: &str) -> Result<String> {
        Ok(self.shell(serial, &["getprop", prop]).await?.trim().to_string())
    }

    pub(crate) fn binary(&self) -> &str {
        &self.adb_path
    }
}

impl Default for AdbBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a process running on the device
pub struct DeviceProcessHandle {
    child: Child,
}

impl DeviceProcessHandle {
    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Kill the process; already-exited processes are not an error
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Device process kill ignored");
        }
    }

    /// Whether the process has already exited
    pub fn try_wait(&mut self) -> Option<i32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .map(|s| s.code().unwrap_or(-1))
    }
}
