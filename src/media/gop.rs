//! GOP cache for late-joiner support
//!
//! A subscriber joining mid-stream needs a self-sufficient prefix before any
//! live unit: the current parameter sets, the most recent IDR, and every
//! frame since that IDR. Without it the browser-side decoder shows nothing
//! until the next natural keyframe.
//!
//! The cache tracks:
//! 1. The latest SPS and PPS seen on the stream
//! 2. AUD/SEI units observed since the last VCL unit (they precede an IDR
//!    and some decoders want them replayed in place)
//! 3. The current GOP: `[SPS, PPS, prefix.., IDR, frames..]`
//!
//! When a GOP outgrows the byte cap it is no longer a useful join prefix, so
//! it is discarded and the cache waits for the next IDR to reseed.

use std::time::Instant;

use super::h264::{H264Unit, NalUnitKind};

/// Default byte cap for the cached GOP (4 MiB)
pub const DEFAULT_GOP_CAP_BYTES: usize = 4 * 1024 * 1024;

/// Cap on buffered AUD/SEI units between VCL units
const PREFIX_CAP_UNITS: usize = 16;

/// Cache of the units a late joiner must receive first
#[derive(Debug)]
pub struct GopCache {
    latest_sps: Option<H264Unit>,
    latest_pps: Option<H264Unit>,
    /// AUD/SEI seen since the last VCL unit
    prefix_before_vcl: Vec<H264Unit>,
    /// `[SPS, PPS, prefix.., IDR, frames..]` or empty while awaiting an IDR
    current_gop: Vec<H264Unit>,
    gop_size_bytes: usize,
    gop_cap_bytes: usize,
    /// When the cache last transitioned to (or started) empty
    empty_since: Instant,
    last_idr_at: Option<Instant>,
}

impl GopCache {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_GOP_CAP_BYTES)
    }

    pub fn with_cap(gop_cap_bytes: usize) -> Self {
        Self {
            latest_sps: None,
            latest_pps: None,
            prefix_before_vcl: Vec::new(),
            current_gop: Vec::new(),
            gop_size_bytes: 0,
            gop_cap_bytes,
            empty_since: Instant::now(),
            last_idr_at: None,
        }
    }

    /// Update the cache with one emitted unit
    pub fn observe(&mut self, unit: &H264Unit) {
        match unit.kind {
            NalUnitKind::Sps => {
                let changed = self
                    .latest_sps
                    .as_ref()
                    .map(|prev| prev.bytes != unit.bytes)
                    .unwrap_or(false);
                self.latest_sps = Some(unit.clone());
                self.prefix_before_vcl.clear();
                if changed && !self.current_gop.is_empty() {
                    // Resolution or profile changed; the cached GOP decodes
                    // against the old parameter sets. Next IDR reseeds.
                    self.discard_gop();
                }
            }
            NalUnitKind::Pps => {
                self.latest_pps = Some(unit.clone());
            }
            NalUnitKind::Aud | NalUnitKind::Sei => {
                self.prefix_before_vcl.push(unit.clone());
                if self.prefix_before_vcl.len() > PREFIX_CAP_UNITS {
                    let excess = self.prefix_before_vcl.len() - PREFIX_CAP_UNITS;
                    self.prefix_before_vcl.drain(..excess);
                }
            }
            NalUnitKind::Idr => {
                let (Some(sps), Some(pps)) = (&self.latest_sps, &self.latest_pps) else {
                    // Cannot form a self-sufficient GOP without parameter sets
                    self.prefix_before_vcl.clear();
                    return;
                };

                let mut gop = Vec::with_capacity(3 + self.prefix_before_vcl.len());
                gop.push(sps.clone());
                gop.push(pps.clone());
                gop.append(&mut self.prefix_before_vcl);
                gop.push(unit.clone());

                self.gop_size_bytes = gop.iter().map(H264Unit::len).sum();
                self.current_gop = gop;
                self.last_idr_at = Some(unit.generated_at);
                self.enforce_cap();
            }
            NalUnitKind::NonIdr => {
                self.prefix_before_vcl.clear();
                if self.current_gop.is_empty() {
                    return; // awaiting IDR
                }
                self.gop_size_bytes += unit.len();
                self.current_gop.push(unit.clone());
                self.enforce_cap();
            }
            // Emitted to subscribers but never cached
            NalUnitKind::Other => {}
        }
    }

    /// Read-only snapshot of the current GOP (empty while awaiting IDR)
    pub fn snapshot_prefill(&self) -> Vec<H264Unit> {
        self.current_gop.clone()
    }

    /// Whether a complete join prefix is available
    pub fn has_gop(&self) -> bool {
        !self.current_gop.is_empty()
    }

    /// How long the cache has been without a join prefix; `None` when one
    /// is available
    pub fn empty_for(&self) -> Option<std::time::Duration> {
        if self.current_gop.is_empty() {
            Some(self.empty_since.elapsed())
        } else {
            None
        }
    }

    pub fn gop_size_bytes(&self) -> usize {
        self.gop_size_bytes
    }

    pub fn gop_unit_count(&self) -> usize {
        self.current_gop.len()
    }

    /// Stamp of the IDR heading the current GOP
    pub fn last_idr_at(&self) -> Option<Instant> {
        self.last_idr_at
    }

    /// Drop everything, including parameter sets (worker restart)
    pub fn reset(&mut self) {
        self.latest_sps = None;
        self.latest_pps = None;
        self.prefix_before_vcl.clear();
        self.discard_gop();
    }

    fn enforce_cap(&mut self) {
        if self.gop_size_bytes > self.gop_cap_bytes {
            tracing::debug!(
                gop_bytes = self.gop_size_bytes,
                cap = self.gop_cap_bytes,
                "GOP cache exceeded cap, awaiting next IDR"
            );
            self.discard_gop();
        }
    }

    fn discard_gop(&mut self) {
        if !self.current_gop.is_empty() {
            self.empty_since = Instant::now();
        }
        self.current_gop.clear();
        self.gop_size_bytes = 0;
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}
