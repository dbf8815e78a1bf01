//! Streaming NAL unit extraction
//!
//! Pure parser, no I/O: arbitrary byte chunks in, ordered Annex-B units out.
//! Handles both upstream framings:
//!
//! - Annex-B input is split on start codes; the bytes after the last start
//!   code stay buffered until the next start code closes them.
//! - AVCC input (4-byte big-endian length prefixes) is detected once at
//!   stream head and each unit is rewritten to `00 00 00 01` + payload.
//!
//! Leading garbage before the first recognizable boundary is dropped
//! silently. The internal buffer is bounded; on overflow the oldest bytes
//! are discarded.

use bytes::{Bytes, BytesMut};

use super::h264::{H264Unit, START_CODE_LONG, START_CODE_SHORT};

/// Upper bound for buffered bytes not yet attributed to a closed unit
const DEFAULT_MAX_BUFFER_BYTES: usize = 512 * 1024;
/// Largest NAL length considered plausible for AVCC detection
const DEFAULT_MAX_NAL_BYTES: usize = 4 * 1024 * 1024;
/// How far into the buffer to hunt for an AVCC alignment
const DEFAULT_SCAN_LIMIT_BYTES: usize = 64;

/// Detected input framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Not yet decided
    Unknown,
    /// Start-code separated; sticky once a start code is seen
    AnnexB,
    /// Length-prefixed; every unit is rewritten to Annex-B
    Avcc,
}

/// Incremental H.264 unit extractor
#[derive(Debug)]
pub struct UnitExtractor {
    buf: BytesMut,
    framing: Framing,
    max_buffer_bytes: usize,
    max_nal_bytes: usize,
    scan_limit_bytes: usize,
}

impl UnitExtractor {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            framing: Framing::Unknown,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_nal_bytes: DEFAULT_MAX_NAL_BYTES,
            scan_limit_bytes: DEFAULT_SCAN_LIMIT_BYTES,
        }
    }

    /// Feed a chunk and drain every unit it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<H264Unit> {
        if !chunk.is_empty() {
            self.buf.extend_from_slice(chunk);
            if self.buf.len() > self.max_buffer_bytes {
                let cut = self.buf.len() - self.max_buffer_bytes;
                let _ = self.buf.split_to(cut);
            }
        }

        if self.framing == Framing::Unknown {
            self.detect_framing();
        }

        match self.framing {
            Framing::Unknown => Vec::new(),
            Framing::AnnexB => self.extract_annexb(),
            Framing::Avcc => self.extract_avcc(),
        }
    }

    /// Bytes currently buffered and not yet emitted
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Decide the framing from the buffer head, discarding leading garbage
    fn detect_framing(&mut self) {
        if let Some(idx) = find_start_code(&self.buf) {
            if idx > 0 {
                let _ = self.buf.split_to(idx);
            }
            self.framing = Framing::AnnexB;
            return;
        }

        // No start code anywhere: look for an AVCC alignment near the head.
        let scan_to = self.scan_limit_bytes.min(self.buf.len().saturating_sub(4));
        for i in 0..=scan_to {
            if self.looks_like_avcc_at(i) {
                if i > 0 {
                    let _ = self.buf.split_to(i);
                }
                self.framing = Framing::Avcc;
                return;
            }
        }
    }

    /// Plausibility check for a length-prefixed NAL at `offset`
    ///
    /// Requires the full unit in the buffer, a sane length, a valid NAL type
    /// byte, and, when more bytes follow, a sane length for the next unit as
    /// well (two consecutive plausible units confirm AVCC).
    fn looks_like_avcc_at(&self, offset: usize) -> bool {
        let Some(len) = self.avcc_len_at(offset) else {
            return false;
        };
        let next = offset + 4 + len;
        if next + 4 <= self.buf.len() {
            // Enough trailing bytes that a second prefix must be present
            return self.avcc_len_at(next).is_some();
        }
        // Buffer ends at (or just inside) the first unit: accept on one
        next <= self.buf.len()
    }

    /// Read and validate a length prefix at `offset`; `None` if implausible
    /// or the unit is incomplete
    fn avcc_len_at(&self, offset: usize) -> Option<usize> {
        if offset + 5 > self.buf.len() {
            return None;
        }
        let len = u32::from_be_bytes([
            self.buf[offset],
            self.buf[offset + 1],
            self.buf[offset + 2],
            self.buf[offset + 3],
        ]) as usize;
        if len == 0 || len > self.max_nal_bytes {
            return None;
        }
        if offset + 4 + len > self.buf.len() {
            return None;
        }
        // NAL type 0 is reserved
        if self.buf[offset + 4] & 0x1F == 0 {
            return None;
        }
        Some(len)
    }

    fn extract_annexb(&mut self) -> Vec<H264Unit> {
        let mut out = Vec::new();

        loop {
            // The buffer is aligned to a start code; find where the next
            // unit begins to close the current one.
            let head_len = start_code_len(&self.buf);
            if head_len == 0 {
                // Garbage crept in (e.g. after a buffer overflow cut);
                // realign to the next start code.
                match find_start_code(&self.buf) {
                    Some(idx) => {
                        let _ = self.buf.split_to(idx);
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        break;
                    }
                }
            }

            match find_start_code(&self.buf[head_len..]) {
                Some(rel) => {
                    let unit_bytes: Bytes = self.buf.split_to(head_len + rel).freeze();
                    if let Some(unit) = H264Unit::from_annexb(unit_bytes) {
                        out.push(unit);
                    }
                }
                None => break, // tail stays pending until the next start code
            }
        }

        out
    }

    fn extract_avcc(&mut self) -> Vec<H264Unit> {
        let mut out = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len == 0 || len > self.max_nal_bytes {
                // Lost sync: advance one byte and try to realign. A start
                // code at the new head means the upstream switched framings.
                let _ = self.buf.split_to(1);
                if start_code_len(&self.buf) > 0 {
                    self.framing = Framing::AnnexB;
                    out.extend(self.extract_annexb());
                    break;
                }
                continue;
            }
            if self.buf.len() < 4 + len {
                break;
            }

            let _ = self.buf.split_to(4);
            let payload = self.buf.split_to(len);
            let mut annexb = BytesMut::with_capacity(4 + len);
            annexb.extend_from_slice(START_CODE_LONG);
            annexb.extend_from_slice(&payload);
            if let Some(unit) = H264Unit::from_annexb(annexb.freeze()) {
                out.push(unit);
            }
        }

        out
    }
}

impl Default for UnitExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the first start code in `data`, if any
fn find_start_code(data: &[u8]) -> Option<usize> {
    let n = data.len();
    let mut i = 0;
    while i + 3 <= n {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some(i);
            }
            if i + 4 <= n && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Length of the start code at the head of `data` (0 if none)
fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(START_CODE_LONG) {
        4
    } else if data.starts_with(START_CODE_SHORT) {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::NalUnitKind;

    fn annexb(header: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x00, 0x01, header];
        v.extend_from_slice(payload);
        v
    }

    fn avcc(header: u8, payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() + 1) as u32;
        let mut v = len.to_be_bytes().to_vec();
        v.push(header);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_annexb_extracts_complete_units() {
        let mut ex = UnitExtractor::new();

        let sps = annexb(0x67, &[0x01, 0x02]);
        let idr = annexb(0x65, &[0x03, 0x04]);
        let non_idr = annexb(0x61, &[0x05]);

        let mut input = sps.clone();
        input.extend_from_slice(&idr);
        input.extend_from_slice(&non_idr);

        let out = ex.push(&input);

        // The last unit stays pending until the next start code closes it.
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].bytes[..], &sps[..]);
        assert_eq!(&out[1].bytes[..], &idr[..]);
        assert_eq!(out[0].kind, NalUnitKind::Sps);
        assert_eq!(out[1].kind, NalUnitKind::Idr);
        assert_eq!(ex.pending_bytes(), non_idr.len());
    }

    #[test]
    fn test_annexb_roundtrip_any_chunking() {
        // The emitted sequence must not depend on how the bytes were split.
        let units: Vec<Vec<u8>> = vec![
            annexb(0x67, &[0x11, 0x22, 0x33]),
            annexb(0x68, &[0x44]),
            annexb(0x65, &[0x55; 40]),
            annexb(0x41, &[0x66; 17]),
            annexb(0x41, &[0x77; 3]),
        ];
        let stream: Vec<u8> = units.iter().flatten().copied().collect();
        // Closing sentinel so the final unit gets emitted
        let mut full = stream.clone();
        full.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);

        for chunk_size in [1, 2, 3, 7, 16, 64, full.len()] {
            let mut ex = UnitExtractor::new();
            let mut out = Vec::new();
            for chunk in full.chunks(chunk_size) {
                out.extend(ex.push(chunk));
            }
            assert_eq!(out.len(), units.len(), "chunk_size={}", chunk_size);
            for (got, want) in out.iter().zip(units.iter()) {
                assert_eq!(&got.bytes[..], &want[..]);
            }
        }
    }

    #[test]
    fn test_avcc_converts_to_annexb() {
        let mut ex = UnitExtractor::new();

        let sps_payload = [0x11, 0x22, 0x33];
        let idr_payload = [0x44, 0x55];
        let mut input = avcc(0x67, &sps_payload);
        input.extend_from_slice(&avcc(0x65, &idr_payload));

        // Feed in two chunks to exercise buffering.
        let out1 = ex.push(&input[..5]);
        let out2 = ex.push(&input[5..]);

        assert!(out1.is_empty());
        assert_eq!(out2.len(), 2);
        assert_eq!(&out2[0].bytes[..], &annexb(0x67, &sps_payload)[..]);
        assert_eq!(&out2[1].bytes[..], &annexb(0x65, &idr_payload)[..]);
    }

    #[test]
    fn test_avcc_roundtrip_any_chunking() {
        let payloads: Vec<(u8, Vec<u8>)> = vec![
            (0x67, vec![0xAA; 9]),
            (0x68, vec![0xBB; 2]),
            (0x65, vec![0xCC; 33]),
            (0x41, vec![0xDD; 12]),
        ];
        let mut stream = Vec::new();
        for (h, p) in &payloads {
            stream.extend_from_slice(&avcc(*h, p));
        }

        for chunk_size in [1, 3, 5, 11, stream.len()] {
            let mut ex = UnitExtractor::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                out.extend(ex.push(chunk));
            }
            assert_eq!(out.len(), payloads.len(), "chunk_size={}", chunk_size);
            for (got, (h, p)) in out.iter().zip(payloads.iter()) {
                assert_eq!(&got.bytes[..], &annexb(*h, p)[..]);
            }
        }
    }

    #[test]
    fn test_leading_garbage_before_annexb() {
        let mut ex = UnitExtractor::new();

        let mut input = vec![0x58; 9];
        let sps = annexb(0x67, &[0x01]);
        let idr = annexb(0x65, &[0x02]);
        let tail = annexb(0x61, &[0x03]);
        input.extend_from_slice(&sps);
        input.extend_from_slice(&idr);
        input.extend_from_slice(&tail);

        let out = ex.push(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].bytes[..], &sps[..]);
        assert_eq!(&out[1].bytes[..], &idr[..]);
    }

    #[test]
    fn test_leading_garbage_before_avcc() {
        let mut ex = UnitExtractor::new();

        let mut input = vec![0x58; 9];
        input.extend_from_slice(&avcc(0x67, &[0xAA]));

        let out = ex.push(&input);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].bytes[..], &annexb(0x67, &[0xAA])[..]);
    }

    #[test]
    fn test_garbage_only_emits_nothing() {
        let mut ex = UnitExtractor::new();
        assert!(ex.push(&[0x42; 32]).is_empty());
        assert!(ex.push(&[]).is_empty());
    }

    #[test]
    fn test_three_byte_start_codes() {
        let mut ex = UnitExtractor::new();
        let input = [
            0x00, 0x00, 0x01, 0x67, 0xAA, // SPS, short start code
            0x00, 0x00, 0x01, 0x68, 0xBB, // PPS
            0x00, 0x00, 0x00, 0x01, // sentinel
        ];
        let out = ex.push(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, NalUnitKind::Sps);
        assert_eq!(out[1].kind, NalUnitKind::Pps);
        assert_eq!(&out[0].bytes[..], &[0x00, 0x00, 0x01, 0x67, 0xAA]);
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let mut ex = UnitExtractor::new();
        // A start code locks Annex-B mode, then an endless unit floods the
        // buffer past its cap.
        ex.push(&[0x00, 0x00, 0x00, 0x01, 0x41]);
        for _ in 0..80 {
            ex.push(&[0x00; 8192]);
        }
        assert!(ex.pending_bytes() <= DEFAULT_MAX_BUFFER_BYTES);
    }
}
