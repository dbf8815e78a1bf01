//! H.264 media handling
//!
//! This module provides:
//! - NAL unit model and classification
//! - Streaming Annex-B / AVCC unit extraction
//! - SPS picture-size parsing
//! - GOP caching for late-joiner support

pub mod extractor;
pub mod gop;
pub mod h264;

pub use extractor::UnitExtractor;
pub use gop::{GopCache, DEFAULT_GOP_CAP_BYTES};
pub use h264::{sps_dimensions, H264Unit, NalUnitKind, SpsDimensions};
