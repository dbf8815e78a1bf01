//! Error types for the broadcast core
//!
//! One taxonomy for the whole crate. Errors are recovered locally whenever
//! possible (queue drops, decoder restarts, GOP cache resets) and surfaced
//! only when they preclude further useful work for that caller. No variant
//! is fatal to the process.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// The adb binary is missing or not responding
    #[error("debug bridge unreachable: {0}")]
    BridgeUnreachable(String),

    /// Operation targeted a device that is not online
    #[error("device {0} is offline")]
    DeviceOffline(String),

    /// The host-side port forward could not be installed
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// The device-side encoder agent did not start
    #[error("encoder agent failed to start on {serial}: {reason}")]
    EncoderSpawnFailed { serial: String, reason: String },

    /// The forwarded TCP port never accepted within the retry budget
    #[error("could not connect to forwarded port {port} for {serial}")]
    TcpConnectFailed { serial: String, port: u16 },

    /// The external H.264 decoder subprocess failed to start
    #[error("decoder failed to start for {serial}: {reason}")]
    DecoderSpawnFailed { serial: String, reason: String },

    /// No decoded frame became available within the capture wait window
    #[error("timed out waiting for a decoded frame")]
    CaptureTimeout,

    /// A frame was requested before the decoder produced any output
    #[error("no decoded frame available")]
    NoFrame,

    /// JPEG encoding failed
    #[error("jpeg encoding failed: {0}")]
    JpegEncode(String),

    /// Media parsing error
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Uncategorized fault; the responsible worker or pipeline stops
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from H.264 parsing and unit extraction
#[derive(Debug, Error)]
pub enum MediaError {
    /// SPS payload too short or malformed
    #[error("invalid sequence parameter set")]
    InvalidSps,

    /// Codec other than H.264 requested where only H.264 is implemented
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
}

impl Error {
    /// Wire error code for the snapshot/stream WebSocket protocol
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::BridgeUnreachable(_) => "bridge_unreachable",
            Error::DeviceOffline(_) => "device_offline",
            Error::PortInUse(_) => "port_in_use",
            Error::EncoderSpawnFailed { .. } => "encoder_spawn_failed",
            Error::TcpConnectFailed { .. } => "tcp_connect_failed",
            Error::DecoderSpawnFailed { .. } => "decoder_spawn_failed",
            Error::CaptureTimeout => "capture_timeout",
            Error::NoFrame => "no_frame",
            Error::JpegEncode(_) => "internal_error",
            Error::Media(_) => "internal_error",
            Error::Io(_) => "internal_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(Error::CaptureTimeout.wire_code(), "capture_timeout");
        assert_eq!(Error::NoFrame.wire_code(), "no_frame");
        assert_eq!(
            Error::DeviceOffline("emulator-5554".into()).wire_code(),
            "device_offline"
        );
        assert_eq!(
            Error::Internal("boom".into()).wire_code(),
            "internal_error"
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::TcpConnectFailed {
            serial: "emulator-5554".into(),
            port: 27183,
        };
        let msg = err.to_string();
        assert!(msg.contains("27183"));
        assert!(msg.contains("emulator-5554"));
    }
}
