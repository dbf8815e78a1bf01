//! JPEG encoding of decoded frames
//!
//! Converts one planar YUV 4:2:0 frame to RGB (BT.601 full range, matching
//! what the decoder emits for `yuv420p`) and encodes it with the `image`
//! crate. CPU-bound; callers run it on the blocking pool.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::error::{Error, Result};
use crate::snapshot::frame::{yuv420_frame_len, LatestFrame};

/// Encode a frame to JPEG at the given quality (1-100)
pub fn encode_jpeg(frame: &LatestFrame, quality: u8) -> Result<Vec<u8>> {
    let quality = quality.clamp(1, 100);
    let rgb = yuv420p_to_rgb(frame.width, frame.height, &frame.data)?;

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| Error::JpegEncode(e.to_string()))?;
    Ok(out)
}

/// Planar YUV 4:2:0 to packed RGB888
fn yuv420p_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let expected = yuv420_frame_len(width, height);
    if data.len() < expected {
        return Err(Error::JpegEncode(format!(
            "frame too short: {} < {}",
            data.len(),
            expected
        )));
    }

    let y_plane = &data[..w * h];
    let u_plane = &data[w * h..w * h + (w / 2) * (h / 2)];
    let v_plane = &data[w * h + (w / 2) * (h / 2)..expected];

    let mut rgb = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32;
            let chroma_idx = (row / 2) * (w / 2) + col / 2;
            let u = u_plane[chroma_idx] as f32 - 128.0;
            let v = v_plane[chroma_idx] as f32 - 128.0;

            let r = y + 1.402 * v;
            let g = y - 0.344_136 * u - 0.714_136 * v;
            let b = y + 1.772 * u;

            let base = (row * w + col) * 3;
            rgb[base] = r.clamp(0.0, 255.0) as u8;
            rgb[base + 1] = g.clamp(0.0, 255.0) as u8;
            rgb[base + 2] = b.clamp(0.0, 255.0) as u8;
        }
    }
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    fn gray_frame(width: u32, height: u32, luma: u8) -> LatestFrame {
        let len = yuv420_frame_len(width, height);
        let mut data = vec![128u8; len];
        for b in data[..(width * height) as usize].iter_mut() {
            *b = luma;
        }
        LatestFrame {
            width,
            height,
            data: Bytes::from(data),
            captured_at: Utc::now(),
            seq: 1,
        }
    }

    #[test]
    fn test_jpeg_header() {
        let frame = gray_frame(16, 16, 200);
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert!(jpeg.len() > 2);
        assert_eq!(&jpeg[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_quality_changes_size() {
        let frame = noisy_frame(64, 64);
        let low = encode_jpeg(&frame, 10).unwrap();
        let high = encode_jpeg(&frame, 95).unwrap();
        assert!(high.len() > low.len());
    }

    #[test]
    fn test_quality_clamped() {
        let frame = gray_frame(16, 16, 100);
        // 0 would panic inside the encoder; the clamp protects it
        assert!(encode_jpeg(&frame, 0).is_ok());
        assert!(encode_jpeg(&frame, 100).is_ok());
    }

    #[test]
    fn test_short_frame_rejected() {
        let frame = LatestFrame {
            width: 64,
            height: 64,
            data: Bytes::from(vec![0u8; 10]),
            captured_at: Utc::now(),
            seq: 1,
        };
        assert!(matches!(
            encode_jpeg(&frame, 80),
            Err(Error::JpegEncode(_))
        ));
    }

    #[test]
    fn test_gray_converts_to_gray_rgb() {
        // Neutral chroma (128) must give r == g == b == y
        let rgb = yuv420p_to_rgb(4, 4, &{
            let mut d = vec![128u8; yuv420_frame_len(4, 4)];
            for b in d[..16].iter_mut() {
                *b = 77;
            }
            d
        })
        .unwrap();
        assert_eq!(&rgb[..3], &[77, 77, 77]);
    }

    fn noisy_frame(width: u32, height: u32) -> LatestFrame {
        let len = yuv420_frame_len(width, height);
        let data: Vec<u8> = (0..len).map(|i| (i * 97 % 251) as u8).collect();
        LatestFrame {
            width,
            height,
            data: Bytes::from(data),
            captured_at: Utc::now(),
            seq: 1,
        }
    }
}
