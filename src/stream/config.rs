//! Capture configuration
//!
//! Immutable per-session encoder settings. Changing a running session's
//! settings goes through `CaptureWorker::update_config`, which replaces the
//! record and restarts the encoder agent.

use crate::error::{MediaError, Result};

/// Video codec requested from the device-side encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }
}

/// Encoder settings for one capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Short-edge pixel cap (e.g. 720, 1080)
    pub max_edge_pixels: u32,
    /// Maximum frame rate
    pub max_fps: u32,
    /// Target bit rate in bits per second
    pub bit_rate_bps: u32,
    /// Requested codec; only H.264 has an extractor
    pub codec: VideoCodec,
    /// Requested keyframe period in seconds
    pub idr_interval_seconds: u32,
    /// Ask the encoder to repeat SPS/PPS at every IDR
    pub prepend_headers_on_sync: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_edge_pixels: 720,
            max_fps: 30,
            bit_rate_bps: 2_000_000,
            codec: VideoCodec::H264,
            idr_interval_seconds: 2,
            prepend_headers_on_sync: true,
        }
    }
}

impl CaptureConfig {
    /// 720p / 15 fps / 1 Mbps, for constrained links
    pub fn low_bandwidth() -> Self {
        Self {
            max_edge_pixels: 720,
            max_fps: 15,
            bit_rate_bps: 1_000_000,
            ..Self::default()
        }
    }

    /// 1080p / 30 fps / 4 Mbps
    pub fn balanced() -> Self {
        Self {
            max_edge_pixels: 1080,
            max_fps: 30,
            bit_rate_bps: 4_000_000,
            ..Self::default()
        }
    }

    /// 1080p / 60 fps / 8 Mbps
    pub fn high_quality() -> Self {
        Self {
            max_edge_pixels: 1080,
            max_fps: 60,
            bit_rate_bps: 8_000_000,
            ..Self::default()
        }
    }

    /// Reject configurations the core cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.codec != VideoCodec::H264 {
            // The unit extractor only understands H.264 NAL framing.
            return Err(MediaError::UnsupportedCodec(self.codec.as_str().into()).into());
        }
        Ok(())
    }

    /// Key/value arguments for the device-side encoder agent
    pub fn to_agent_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("max_size={}", self.max_edge_pixels),
            format!("max_fps={}", self.max_fps),
            format!("video_bit_rate={}", self.bit_rate_bps),
        ];
        if self.codec != VideoCodec::H264 {
            args.push(format!("video_codec={}", self.codec.as_str()));
        }
        if self.idr_interval_seconds > 0 {
            args.push(format!("idr_interval={}", self.idr_interval_seconds));
        }
        if self.prepend_headers_on_sync {
            args.push("prepend_headers=true".into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.max_edge_pixels, 720);
        assert_eq!(config.max_fps, 30);
        assert_eq!(config.bit_rate_bps, 2_000_000);
        assert_eq!(config.codec, VideoCodec::H264);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let low = CaptureConfig::low_bandwidth();
        assert_eq!((low.max_edge_pixels, low.max_fps), (720, 15));
        assert_eq!(low.bit_rate_bps, 1_000_000);

        let balanced = CaptureConfig::balanced();
        assert_eq!((balanced.max_edge_pixels, balanced.max_fps), (1080, 30));

        let high = CaptureConfig::high_quality();
        assert_eq!((high.max_edge_pixels, high.max_fps), (1080, 60));
        assert_eq!(high.bit_rate_bps, 8_000_000);
    }

    #[test]
    fn test_non_h264_rejected() {
        let config = CaptureConfig {
            codec: VideoCodec::H265,
            ..CaptureConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_args() {
        let args = CaptureConfig::default().to_agent_args();
        assert!(args.contains(&"max_size=720".to_string()));
        assert!(args.contains(&"max_fps=30".to_string()));
        assert!(args.contains(&"video_bit_rate=2000000".to_string()));
        // h264 is the agent default and is not passed explicitly
        assert!(!args.iter().any(|a| a.starts_with("video_codec")));
    }
}
