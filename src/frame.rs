use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, Rgb};

/// Widest edge an image is allowed before being handed to the embedder.
pub const EMBED_MAX_WIDTH: u32 = 384;
/// JPEG quality used for embedding and analysis uploads.
pub const EMBED_JPEG_QUALITY: u8 = 60;

/// Raw decoded frame (RGB24).
#[derive(Clone)]
pub struct Frame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Byte length of an RGB24 frame with the given dimensions.
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    /// Downscale by a percentage factor with an area-preserving filter.
    /// `percent >= 100` returns the frame unchanged.
    pub fn downscale_percent(self, percent: u32) -> Result<Frame> {
        if percent >= 100 {
            return Ok(self);
        }
        let new_width = (self.width * percent / 100).max(1);
        let new_height = (self.height * percent / 100).max(1);
        self.resized(new_width, new_height)
    }

    fn resized(self, new_width: u32, new_height: u32) -> Result<Frame> {
        let img: ImageBuffer<Rgb<u8>, _> =
            ImageBuffer::from_raw(self.width, self.height, self.rgb)
                .ok_or_else(|| anyhow!("invalid frame dimensions"))?;

        let resized = image::imageops::resize(
            &img,
            new_width,
            new_height,
            image::imageops::FilterType::Triangle,
        );

        Ok(Frame {
            rgb: resized.into_raw(),
            width: new_width,
            height: new_height,
        })
    }

    /// Encode as JPEG, clamping width to `max_width` first so embedding
    /// uploads stay lightweight.
    pub fn to_jpeg(&self, max_width: u32, quality: u8) -> Result<Vec<u8>> {
        let frame = if self.width > max_width {
            let scale = max_width as f32 / self.width as f32;
            let new_height = ((self.height as f32 * scale) as u32).max(1);
            self.clone().resized(max_width, new_height)?
        } else {
            self.clone()
        };

        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder.encode(
            &frame.rgb,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(buffer)
    }
}

/// A single sampled frame from one source. Immutable after creation and
/// consumed exactly once by the ingest worker.
#[derive(Clone)]
pub struct Snapshot {
    pub source_id: String,
    pub frame: Frame,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(source_id: impl Into<String>, frame: Frame) -> Self {
        Self {
            source_id: source_id.into(),
            frame,
            captured_at: Utc::now(),
        }
    }

    /// Capture time as unix seconds, the form stored in vector payloads.
    pub fn timestamp(&self) -> f64 {
        self.captured_at.timestamp_millis() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            rgb: vec![value; Frame::expected_len(width, height)],
            width,
            height,
        }
    }

    #[test]
    fn downscale_percent_scales_dimensions() {
        let frame = solid_frame(200, 100, 128);
        let scaled = frame.downscale_percent(50).expect("downscale");
        assert_eq!((scaled.width, scaled.height), (100, 50));
        assert_eq!(scaled.rgb.len(), Frame::expected_len(100, 50));
    }

    #[test]
    fn downscale_at_full_size_is_identity() {
        let frame = solid_frame(64, 48, 7);
        let scaled = frame.downscale_percent(100).expect("downscale");
        assert_eq!((scaled.width, scaled.height), (64, 48));
    }

    #[test]
    fn jpeg_encode_clamps_width() {
        let frame = solid_frame(800, 400, 200);
        let jpeg = frame
            .to_jpeg(EMBED_MAX_WIDTH, EMBED_JPEG_QUALITY)
            .expect("encode");
        assert!(!jpeg.is_empty());
        // JPEG SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn jpeg_encode_small_frame_keeps_size() {
        let frame = solid_frame(120, 90, 31);
        let jpeg = frame.to_jpeg(EMBED_MAX_WIDTH, 80).expect("encode");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!(decoded.width(), 120);
        assert_eq!(decoded.height(), 90);
    }
}
