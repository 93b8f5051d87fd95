//! Per-page image transforms.
//!
//! Transforms are deterministic: the same input bytes always produce the same
//! output bytes. A failing transform never aborts the document; the chain
//! keeps the bytes it had and records a warning.

use std::fmt;

use image::DynamicImage;
use thiserror::Error;
use tracing::warn;

use super::OutputFormat;

const JPEG_QUALITY: u8 = 90;

/// Why a transform could not be applied.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The page bytes are not a decodable image.
    #[error("cannot decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// Re-encoding failed.
    #[error("cannot encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// One deterministic page transform.
pub trait PageTransform: Send + Sync {
    /// Short name used in warnings.
    fn name(&self) -> &'static str;

    /// Transforms page bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the bytes cannot be decoded or encoded.
    fn apply(&self, bytes: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Inverts colours of negative scans. Output is JPEG.
#[derive(Debug, Clone, Copy, Default)]
pub struct Invert;

impl PageTransform for Invert {
    fn name(&self) -> &'static str {
        "invert"
    }

    fn apply(&self, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut img = image::load_from_memory(bytes).map_err(TransformError::Decode)?;
        img.invert();
        encode_jpeg(&img)
    }
}

/// Re-encodes non-JPEG pages as JPEG so PDF sinks can embed them directly.
/// JPEG input passes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeJpeg;

impl PageTransform for NormalizeJpeg {
    fn name(&self) -> &'static str {
        "normalize-jpeg"
    }

    fn apply(&self, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        if sniff_format(bytes) == Some("jpg") {
            return Ok(bytes.to_vec());
        }
        let img = image::load_from_memory(bytes).map_err(TransformError::Decode)?;
        encode_jpeg(&img)
    }
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .encode(
            &rgb,
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(TransformError::Encode)?;
    Ok(out)
}

/// Ordered list of transforms applied to every page.
#[derive(Default)]
pub struct TransformChain {
    steps: Vec<Box<dyn PageTransform>>,
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| step.name()))
            .finish()
    }
}

impl TransformChain {
    /// Chain for a job: optional inversion, then JPEG normalization for PDF.
    #[must_use]
    pub fn for_job(format: OutputFormat, invert: bool) -> Self {
        let mut chain = Self::default();
        if invert {
            chain = chain.with(Invert);
        }
        if format == OutputFormat::Pdf {
            chain = chain.with(NormalizeJpeg);
        }
        chain
    }

    /// Appends a transform.
    #[must_use]
    pub fn with(mut self, step: impl PageTransform + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain does nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step. A failing step is skipped: the bytes from before it
    /// carry on and a warning is returned.
    pub fn apply(&self, index: usize, bytes: Vec<u8>) -> (Vec<u8>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut current = bytes;
        for step in &self.steps {
            match step.apply(&current) {
                Ok(next) => current = next,
                Err(error) => {
                    warn!(page_index = index, transform = step.name(), %error, "transform failed; keeping original bytes");
                    warnings.push(format!(
                        "page {index}: {} skipped ({error})",
                        step.name()
                    ));
                }
            }
        }
        (current, warnings)
    }
}

/// Guesses an image format from magic bytes. Returns a file extension.
#[must_use]
pub fn sniff_format(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("jpg"),
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some("tif"),
        [0x00, 0x00, 0x00, 0x0C, b'j', b'P', ..] => Some("jp2"),
        _ => None,
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::fixtures::{jpeg, solid};
    use super::*;
    use image::{GenericImageView, ImageFormat};

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&jpeg(2, 2, 10)), Some("jpg"));
        assert_eq!(sniff_format(&solid(2, 2, 10, ImageFormat::Png)), Some("png"));
        assert_eq!(sniff_format(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_format(b"<html>"), None);
        assert_eq!(sniff_format(&[]), None);
    }

    #[test]
    fn test_invert_flips_pixels() {
        let out = Invert.apply(&solid(4, 4, 0, ImageFormat::Png)).unwrap();
        assert_eq!(sniff_format(&out), Some("jpg"));
        let img = image::load_from_memory(&out).unwrap();
        let pixel = img.get_pixel(1, 1);
        assert!(pixel.0[0] > 240, "expected near-white, got {:?}", pixel.0);
    }

    #[test]
    fn test_normalize_passes_jpeg_through() {
        let input = jpeg(3, 3, 128);
        assert_eq!(NormalizeJpeg.apply(&input).unwrap(), input);
    }

    #[test]
    fn test_normalize_reencodes_png() {
        let out = NormalizeJpeg
            .apply(&solid(5, 7, 200, ImageFormat::Png))
            .unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (5, 7));
        assert_eq!(sniff_format(&out), Some("jpg"));
    }

    #[test]
    fn test_chain_falls_back_to_original_bytes() {
        let chain = TransformChain::for_job(OutputFormat::Pdf, true);
        assert_eq!(chain.len(), 2);
        let garbage = b"not an image".to_vec();
        let (out, warnings) = chain.apply(4, garbage.clone());
        assert_eq!(out, garbage);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("page 4"));
        assert!(warnings[0].contains("invert"));
    }

    #[test]
    fn test_chain_is_deterministic() {
        let chain = TransformChain::for_job(OutputFormat::Cbz, true);
        let input = solid(6, 6, 30, ImageFormat::Png);
        let (first, _) = chain.apply(0, input.clone());
        let (second, _) = chain.apply(0, input);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cbz_without_invert_is_empty() {
        assert!(TransformChain::for_job(OutputFormat::Cbz, false).is_empty());
    }
}
