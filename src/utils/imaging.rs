use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::{debug, warn};

use crate::llm::media::{detect_mime_type, extension_for_mime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    InlinePhoto,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mode: DeliveryMode,
    /// JPEG quality used for inline photos; `None` when the original bytes are sent.
    pub quality: Option<u8>,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingPolicy {
    pub max_bytes: usize,
    pub start_quality: u8,
    pub quality_step: u8,
    pub min_quality: u8,
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10_000_000,
            start_quality: 95,
            quality_step: 10,
            min_quality: 40,
        }
    }
}

impl EncodingPolicy {
    /// Clamps the knobs into a range where the quality walk always terminates.
    pub fn normalized(self) -> Self {
        let start_quality = self.start_quality.clamp(1, 100);
        Self {
            max_bytes: self.max_bytes,
            start_quality,
            quality_step: self.quality_step.max(1),
            min_quality: self.min_quality.clamp(1, start_quality),
        }
    }
}

/// Walks quality down from the start in fixed steps until `encode` fits under
/// `max_bytes`. Returns `None` when even the floor quality is too large.
pub fn adapt_quality<F>(policy: EncodingPolicy, mut encode: F) -> Result<Option<(Vec<u8>, u8)>>
where
    F: FnMut(u8) -> Result<Vec<u8>>,
{
    let policy = policy.normalized();
    let mut quality = policy.start_quality;
    loop {
        let encoded = encode(quality)?;
        debug!(
            quality,
            size = encoded.len(),
            max = policy.max_bytes,
            "Re-encoded image"
        );
        if encoded.len() <= policy.max_bytes {
            return Ok(Some((encoded, quality)));
        }
        if quality <= policy.min_quality {
            return Ok(None);
        }
        quality = quality
            .saturating_sub(policy.quality_step)
            .max(policy.min_quality);
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder.encode_image(image)?;
    Ok(buffer)
}

fn as_attachment(original: &[u8]) -> PreparedImage {
    let extension = detect_mime_type(original)
        .as_deref()
        .map(extension_for_mime)
        .unwrap_or("bin");
    PreparedImage {
        bytes: original.to_vec(),
        mode: DeliveryMode::Attachment,
        quality: None,
        file_name: format!("image.{extension}"),
    }
}

/// Normalizes provider output to a JPEG that fits the inline photo ceiling, or falls back
/// to sending the original bytes as a file. Never fails.
pub fn prepare_for_delivery(original: &[u8], policy: EncodingPolicy) -> PreparedImage {
    let decoded = match image::load_from_memory(original) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("Generated image could not be decoded, sending as file: {err}");
            return as_attachment(original);
        }
    };
    let rgb = decoded.to_rgb8();

    match adapt_quality(policy, |quality| encode_jpeg(&rgb, quality)) {
        Ok(Some((bytes, quality))) => PreparedImage {
            bytes,
            mode: DeliveryMode::InlinePhoto,
            quality: Some(quality),
            file_name: "image.jpg".to_string(),
        },
        Ok(None) => {
            warn!(
                "Image exceeds {} bytes even at minimum quality, sending as file",
                policy.max_bytes
            );
            as_attachment(original)
        }
        Err(err) => {
            warn!("JPEG re-encode failed, sending as file: {err}");
            as_attachment(original)
        }
    }
}
