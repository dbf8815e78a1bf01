//! Runtime configuration
//!
//! All knobs come from environment variables with sane defaults, so the
//! service runs bare in a container. No config files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::RegistryOptions;
use crate::snapshot::PipelineOptions;
use crate::stream::WorkerOptions;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address (`DROIDCAST_BIND_ADDR`)
    pub bind_addr: SocketAddr,
    /// CORS origins, `*` for any (`CORS_ALLOW_ORIGINS`, comma separated)
    pub cors_allow_origins: Vec<String>,
    /// Saved JPEG directory (`CAPTURE_OUTPUT_DIR`)
    pub capture_output_dir: PathBuf,
    /// Default JPEG quality 1-100 (`CAPTURE_JPEG_QUALITY_DEFAULT`)
    pub capture_jpeg_quality_default: u8,
    /// Worker idle stop (`STREAM_IDLE_TIMEOUT_SECONDS`)
    pub stream_idle_timeout: Duration,
    /// GOP cache byte cap (`GOP_CAP_BYTES`)
    pub gop_cap_bytes: usize,
    /// Per-subscriber queue depth (`SUBSCRIBER_QUEUE_DEPTH`)
    pub subscriber_queue_depth: usize,
    /// Decoder stall watchdog (`DECODER_STALL_MS`)
    pub decoder_stall: Duration,
    /// stop_all budget (`SHUTDOWN_DEADLINE_SECONDS`)
    pub shutdown_deadline: Duration,
    /// Host path of the encoder agent jar (`ENCODER_AGENT_PATH`)
    pub encoder_agent_path: PathBuf,
    /// Decoder executable (`DECODER_PROGRAM`)
    pub decoder_program: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().expect("valid default addr"),
            cors_allow_origins: vec!["*".to_string()],
            capture_output_dir: PathBuf::from("./captures"),
            capture_jpeg_quality_default: 80,
            stream_idle_timeout: Duration::from_secs(5),
            gop_cap_bytes: 4 * 1024 * 1024,
            subscriber_queue_depth: 256,
            decoder_stall: Duration::from_millis(5000),
            shutdown_deadline: Duration::from_secs(10),
            encoder_agent_path: PathBuf::from("./vendor/scrcpy-server.jar"),
            decoder_program: "ffmpeg".to_string(),
        }
    }
}

impl Settings {
    /// Read from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from an arbitrary lookup (tests pass a map)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let parse_u64 = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr: lookup("DROIDCAST_BIND_ADDR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            cors_allow_origins: lookup("CORS_ALLOW_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_allow_origins),
            capture_output_dir: lookup("CAPTURE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.capture_output_dir),
            capture_jpeg_quality_default: lookup("CAPTURE_JPEG_QUALITY_DEFAULT")
                .and_then(|v| v.parse::<u8>().ok())
                .map(|q| q.clamp(1, 100))
                .unwrap_or(defaults.capture_jpeg_quality_default),
            stream_idle_timeout: Duration::from_secs(parse_u64(
                "STREAM_IDLE_TIMEOUT_SECONDS",
                defaults.stream_idle_timeout.as_secs(),
            )),
            gop_cap_bytes: parse_u64("GOP_CAP_BYTES", defaults.gop_cap_bytes as u64) as usize,
            subscriber_queue_depth: parse_u64(
                "SUBSCRIBER_QUEUE_DEPTH",
                defaults.subscriber_queue_depth as u64,
            ) as usize,
            decoder_stall: Duration::from_millis(parse_u64(
                "DECODER_STALL_MS",
                defaults.decoder_stall.as_millis() as u64,
            )),
            shutdown_deadline: Duration::from_secs(parse_u64(
                "SHUTDOWN_DEADLINE_SECONDS",
                defaults.shutdown_deadline.as_secs(),
            )),
            encoder_agent_path: lookup("ENCODER_AGENT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.encoder_agent_path),
            decoder_program: lookup("DECODER_PROGRAM").unwrap_or(defaults.decoder_program),
        }
    }

    /// Derive the registry configuration
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            worker: WorkerOptions {
                agent_path: self.encoder_agent_path.clone(),
                idle_timeout: self.stream_idle_timeout,
                gop_cap_bytes: self.gop_cap_bytes,
                subscriber_queue_depth: self.subscriber_queue_depth,
                ..WorkerOptions::default()
            },
            pipeline: PipelineOptions {
                decoder_program: self.decoder_program.clone(),
                capture_output_dir: self.capture_output_dir.clone(),
                default_quality: self.capture_jpeg_quality_default,
                decoder_stall: self.decoder_stall,
                ..PipelineOptions::default()
            },
            default_config: crate::stream::CaptureConfig::default(),
            shutdown_deadline: self.shutdown_deadline,
        }
    }
}
