//! H.264/AVC NAL unit model
//!
//! The device-side encoder agent emits a raw H.264 byte stream. Depending on
//! the device and encoder it arrives in one of two framings:
//!
//! - Annex-B: NAL units separated by `00 00 01` / `00 00 00 01` start codes
//! - AVCC: each NAL prefixed by a 4-byte big-endian length
//!
//! Everything downstream of the extractor works on Annex-B units, so this
//! module defines the unit type, its classification by the 5-bit NAL type in
//! the first payload byte, and an SPS parser for the coded picture size.

use std::time::Instant;

use bytes::Bytes;

use crate::error::{MediaError, Result};

/// 3-byte Annex-B start code
pub const START_CODE_SHORT: &[u8] = &[0x00, 0x00, 0x01];
/// 4-byte Annex-B start code
pub const START_CODE_LONG: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// NAL unit classification
///
/// Only the kinds the broadcast path cares about are distinguished; anything
/// else is `Other` and passes through uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitKind {
    /// Non-IDR slice (P/B frame)
    NonIdr,
    /// IDR slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Any other NAL type
    Other,
}

impl NalUnitKind {
    /// Classify from the NAL header byte (`payload[0] & 0x1F`)
    pub fn from_header_byte(b: u8) -> Self {
        match b & 0x1F {
            1 => NalUnitKind::NonIdr,
            5 => NalUnitKind::Idr,
            6 => NalUnitKind::Sei,
            7 => NalUnitKind::Sps,
            8 => NalUnitKind::Pps,
            9 => NalUnitKind::Aud,
            _ => NalUnitKind::Other,
        }
    }

    /// Whether this is a VCL (picture-carrying) unit
    pub fn is_vcl(&self) -> bool {
        matches!(self, NalUnitKind::Idr | NalUnitKind::NonIdr)
    }

    /// Whether this is SPS or PPS
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitKind::Sps | NalUnitKind::Pps)
    }
}

/// A single Annex-B framed NAL unit
///
/// `bytes` always begins with a start code. Cloning is cheap: the payload is
/// reference-counted via `Bytes`, so fan-out to many subscribers shares one
/// allocation.
#[derive(Debug, Clone)]
pub struct H264Unit {
    /// Unit classification
    pub kind: NalUnitKind,
    /// Annex-B bytes: start code followed by the NAL payload
    pub bytes: Bytes,
    /// Monotonic instant at which the extractor closed this unit
    pub generated_at: Instant,
}

impl H264Unit {
    /// Wrap already Annex-B framed bytes into a unit
    ///
    /// Returns `None` if the bytes do not start with a start code or carry
    /// no payload byte to classify.
    pub fn from_annexb(bytes: Bytes) -> Option<Self> {
        let payload = strip_start_code(&bytes)?;
        if payload.is_empty() {
            return None;
        }
        Some(Self {
            kind: NalUnitKind::from_header_byte(payload[0]),
            bytes,
            generated_at: Instant::now(),
        })
    }

    /// Length of the Annex-B framing in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the unit carries no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The NAL payload without the start code
    pub fn payload(&self) -> &[u8] {
        strip_start_code(&self.bytes).unwrap_or(&[])
    }
}

/// Strip the leading start code, returning the payload slice
pub fn strip_start_code(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.starts_with(START_CODE_LONG) {
        Some(&bytes[4..])
    } else if bytes.starts_with(START_CODE_SHORT) {
        Some(&bytes[3..])
    } else {
        None
    }
}

/// Coded picture dimensions from an SPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsDimensions {
    pub width: u32,
    pub height: u32,
}

/// Parse the coded picture size from an SPS NAL payload
///
/// `payload` is the NAL without start code (first byte is the NAL header).
/// Only the fields up to the frame cropping offsets are read; the profiles
/// that carry `chroma_format_idc` (High and friends) are handled.
pub fn sps_dimensions(payload: &[u8]) -> Result<SpsDimensions> {
    if payload.len() < 4 || payload[0] & 0x1F != 7 {
        return Err(MediaError::InvalidSps.into());
    }

    // Strip emulation-prevention bytes (00 00 03 -> 00 00) before bit reading.
    let rbsp = unescape_rbsp(&payload[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint flags + reserved
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bits(1)?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        let seq_scaling_matrix_present = r.read_bits(1)?;
        if seq_scaling_matrix_present == 1 {
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                let present = r.read_bits(1)?;
                if present == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bits(1)?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycles = r.read_ue()?;
        for _ in 0..cycles {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_bits(1)?;
    if frame_mbs_only_flag == 0 {
        r.read_bits(1)?; // mb_adaptive_frame_field_flag
    }
    r.read_bits(1)?; // direct_8x8_inference_flag

    let mut width = (pic_width_in_mbs_minus1 + 1) * 16;
    let mut height = (pic_height_in_map_units_minus1 + 1) * 16 * (2 - frame_mbs_only_flag);

    let frame_cropping_flag = r.read_bits(1)?;
    if frame_cropping_flag == 1 {
        let crop_left = r.read_ue()?;
        let crop_right = r.read_ue()?;
        let crop_top = r.read_ue()?;
        let crop_bottom = r.read_ue()?;
        // 4:2:0 crop units: 2 horizontally, 2 * (2 - frame_mbs_only) vertically
        width = width.saturating_sub((crop_left + crop_right) * 2);
        height = height.saturating_sub((crop_top + crop_bottom) * 2 * (2 - frame_mbs_only_flag));
    }

    if width == 0 || height == 0 {
        return Err(MediaError::InvalidSps.into());
    }

    Ok(SpsDimensions { width, height })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<()> {
    let mut last_scale: i64 = 8;
    let mut next_scale: i64 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta as i64 + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Remove H.264 emulation-prevention bytes (`00 00 03` becomes `00 00`)
fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// MSB-first bit reader over a byte slice
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bits(&mut self, n: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            let byte = self
                .data
                .get(self.pos / 8)
                .ok_or(MediaError::InvalidSps)?;
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }

    /// Unsigned exp-Golomb
    fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;
        loop {
            if self.read_bits(1)? == 1 {
                break;
            }
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(MediaError::InvalidSps.into());
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let rest = self.read_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + rest)
    }

    /// Signed exp-Golomb
    fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()?;
        let k = (ue as i64 + 1) / 2;
        Ok(if ue % 2 == 1 { k as i32 } else { -(k as i32) })
    }
}

/// Test-only helpers shared across module tests
#[cfg(test)]
pub mod testutil {
    /// Annex-B frame a payload
    pub fn annexb_unit(header: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x00, 0x01, header];
        v.extend_from_slice(payload);
        v
    }

    /// Build a minimal baseline-profile SPS payload (header byte included)
    pub fn build_sps(
        profile: u8,
        width_mbs_minus1: u32,
        height_map_units_minus1: u32,
        crop: Option<(u32, u32, u32, u32)>,
    ) -> Vec<u8> {
        let mut bits = BitWriter::new();
        bits.put_bits(profile as u32, 8);
        bits.put_bits(0, 8); // constraint flags
        bits.put_bits(31, 8); // level_idc
        bits.put_ue(0); // seq_parameter_set_id
        bits.put_ue(4); // log2_max_frame_num_minus4
        bits.put_ue(2); // pic_order_cnt_type
        bits.put_ue(1); // max_num_ref_frames
        bits.put_bits(0, 1); // gaps_in_frame_num_value_allowed_flag
        bits.put_ue(width_mbs_minus1);
        bits.put_ue(height_map_units_minus1);
        bits.put_bits(1, 1); // frame_mbs_only_flag
        bits.put_bits(0, 1); // direct_8x8_inference_flag
        match crop {
            Some((l, r, t, b)) => {
                bits.put_bits(1, 1);
                bits.put_ue(l);
                bits.put_ue(r);
                bits.put_ue(t);
                bits.put_ue(b);
            }
            None => bits.put_bits(0, 1),
        }
        bits.put_bits(0, 1); // vui_parameters_present_flag

        let mut payload = vec![0x67];
        payload.extend_from_slice(&bits.finish());
        payload
    }

    pub struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        pub fn new() -> Self {
            Self {
                bytes: vec![0],
                bit: 0,
            }
        }

        pub fn put_bits(&mut self, value: u32, n: u32) {
            for i in (0..n).rev() {
                if self.bit == 8 {
                    self.bytes.push(0);
                    self.bit = 0;
                }
                let b = ((value >> i) & 1) as u8;
                let last = self.bytes.len() - 1;
                self.bytes[last] |= b << (7 - self.bit);
                self.bit += 1;
            }
        }

        pub fn put_ue(&mut self, value: u32) {
            let coded = value + 1;
            let len = 32 - coded.leading_zeros();
            self.put_bits(0, len - 1);
            self.put_bits(coded, len);
        }

        pub fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_sps;
    use super::*;

    #[test]
    fn test_kind_from_header_byte() {
        assert_eq!(NalUnitKind::from_header_byte(0x65), NalUnitKind::Idr);
        assert_eq!(NalUnitKind::from_header_byte(0x67), NalUnitKind::Sps);
        assert_eq!(NalUnitKind::from_header_byte(0x68), NalUnitKind::Pps);
        assert_eq!(NalUnitKind::from_header_byte(0x41), NalUnitKind::NonIdr);
        assert_eq!(NalUnitKind::from_header_byte(0x06), NalUnitKind::Sei);
        assert_eq!(NalUnitKind::from_header_byte(0x09), NalUnitKind::Aud);
        assert_eq!(NalUnitKind::from_header_byte(0x0C), NalUnitKind::Other);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(NalUnitKind::Idr.is_vcl());
        assert!(NalUnitKind::NonIdr.is_vcl());
        assert!(!NalUnitKind::Sps.is_vcl());
        assert!(NalUnitKind::Sps.is_parameter_set());
        assert!(NalUnitKind::Pps.is_parameter_set());
        assert!(!NalUnitKind::Aud.is_parameter_set());
    }

    #[test]
    fn test_unit_from_annexb() {
        let unit = H264Unit::from_annexb(Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84,
        ]))
        .unwrap();
        assert_eq!(unit.kind, NalUnitKind::Idr);
        assert_eq!(unit.payload(), &[0x65, 0x88, 0x84]);

        let short =
            H264Unit::from_annexb(Bytes::from_static(&[0x00, 0x00, 0x01, 0x67, 0x42])).unwrap();
        assert_eq!(short.kind, NalUnitKind::Sps);
        assert_eq!(short.payload(), &[0x67, 0x42]);
    }

    #[test]
    fn test_unit_rejects_missing_start_code() {
        assert!(H264Unit::from_annexb(Bytes::from_static(&[0x65, 0x88])).is_none());
        // Start code with nothing after it cannot be classified
        assert!(H264Unit::from_annexb(Bytes::from_static(&[0x00, 0x00, 0x00, 0x01])).is_none());
    }

    #[test]
    fn test_strip_start_code() {
        assert_eq!(
            strip_start_code(&[0x00, 0x00, 0x01, 0xAA]),
            Some(&[0xAA][..])
        );
        assert_eq!(
            strip_start_code(&[0x00, 0x00, 0x00, 0x01, 0xBB]),
            Some(&[0xBB][..])
        );
        assert_eq!(strip_start_code(&[0x01, 0x02]), None);
    }

    #[test]
    fn test_unescape_rbsp() {
        assert_eq!(
            unescape_rbsp(&[0x00, 0x00, 0x03, 0x01]),
            vec![0x00, 0x00, 0x01]
        );
        // 03 not preceded by two zeros is kept
        assert_eq!(unescape_rbsp(&[0x00, 0x03, 0x00]), vec![0x00, 0x03, 0x00]);
    }

    #[test]
    fn test_sps_dimensions_baseline_1280x720() {
        // 80x45 macroblocks, frame_mbs_only, no cropping
        let sps = build_sps(66, 79, 44, None);
        let dims = sps_dimensions(&sps).unwrap();
        assert_eq!(dims.width, 1280);
        assert_eq!(dims.height, 720);
    }

    #[test]
    fn test_sps_dimensions_with_cropping() {
        // 1920x1080: 120x68 macroblocks = 1920x1088, bottom crop of 4 units
        let sps = build_sps(66, 119, 67, Some((0, 0, 0, 4)));
        let dims = sps_dimensions(&sps).unwrap();
        assert_eq!(dims.width, 1920);
        assert_eq!(dims.height, 1080);
    }

    #[test]
    fn test_sps_dimensions_rejects_non_sps() {
        assert!(sps_dimensions(&[0x65, 0x00, 0x00, 0x00]).is_err());
        assert!(sps_dimensions(&[0x67]).is_err());
    }

}
