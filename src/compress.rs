//! Shrinks oversized image payloads before they are persisted.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::{debug, info, warn};

use crate::config::CompressionConfig;
use crate::model::ImagePayload;

/// Payloads whose encoded size is below this are stored untouched.
pub const DEFAULT_THRESHOLD_BYTES: usize = 100 * 1024;

/// Compresses with the default size threshold.
pub fn compress(payload: &ImagePayload, max_dimension: u32, quality: f32) -> ImagePayload {
    compress_with_threshold(payload, DEFAULT_THRESHOLD_BYTES, max_dimension, quality)
}

/// Downscales and re-encodes `payload` as JPEG when it is at least
/// `threshold_bytes` large. The original is returned whenever it is small,
/// cannot be decoded, or the re-encoded form would not be smaller.
pub fn compress_with_threshold(
    payload: &ImagePayload,
    threshold_bytes: usize,
    max_dimension: u32,
    quality: f32,
) -> ImagePayload {
    let original_len = payload.encoded_len();
    if original_len < threshold_bytes {
        return payload.clone();
    }

    match reencode(payload, max_dimension, quality) {
        Ok(candidate) if candidate.encoded_len() < original_len => {
            info!(
                original_bytes = original_len,
                compressed_bytes = candidate.encoded_len(),
                "compressed image payload"
            );
            candidate
        }
        Ok(candidate) => {
            debug!(
                original_bytes = original_len,
                candidate_bytes = candidate.encoded_len(),
                "re-encoded image not smaller, keeping original"
            );
            payload.clone()
        }
        Err(err) => {
            warn!(mime = %payload.mime, error = %err, "image compression failed, keeping original");
            payload.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn compress(&self, payload: &ImagePayload) -> ImagePayload {
        compress_with_threshold(
            payload,
            self.config.threshold_bytes,
            self.config.max_dimension,
            self.config.quality,
        )
    }
}

/// Scales `(width, height)` so the longer side is at most `max_dimension`.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }

    let scale = f64::from(max_dimension) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max_dimension);
    (scaled(width), scaled(height))
}

fn reencode(
    payload: &ImagePayload,
    max_dimension: u32,
    quality: f32,
) -> Result<ImagePayload, image::ImageError> {
    let decoded = image::load_from_memory(&payload.bytes)?;
    let (width, height) = target_dimensions(decoded.width(), decoded.height(), max_dimension);
    let resized = if (width, height) == (decoded.width(), decoded.height()) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Triangle)
    };

    // JPEG has no alpha channel
    let rgb = resized.to_rgb8();
    let jpeg_quality = (quality.clamp(0.01, 1.0) * 100.0).round() as u8;

    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, jpeg_quality);
    rgb.write_with_encoder(encoder)?;

    Ok(ImagePayload::new("image/jpeg", bytes))
}
