//! Image validation and size-budget compression.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType};
use mime_sniffer::MimeTypeSniffer;

use crate::error::ValidationError;
use crate::store::UploadImage;

pub const SUPPORTED_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

const MAX_ATTEMPTS: usize = 8;
const MIN_QUALITY: u8 = 40;
const QUALITY_STEP: u8 = 10;
const MIN_DIMENSION: u32 = 640;

/// A file handed to the pipeline by the editing surface.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    /// Declared type. Sniffed from the bytes when absent.
    pub mime_type: Option<String>,
    pub data: Bytes,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn content_hash(&self) -> blake3::Hash {
        blake3::hash(&self.data)
    }

    /// Check type and size. Returns the effective MIME type.
    pub fn validate(&self, max_bytes: usize) -> Result<String, ValidationError> {
        let mime = match self.mime_type.as_deref() {
            Some(declared) => declared.to_ascii_lowercase(),
            None => self
                .data
                .sniff_mime_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
        };
        if !SUPPORTED_TYPES.contains(&mime.as_str()) {
            return Err(ValidationError::UnsupportedType { mime });
        }
        if self.data.len() > max_bytes {
            return Err(ValidationError::TooLarge {
                size: self.data.len(),
                limit: max_bytes,
            });
        }
        Ok(mime)
    }
}

/// Re-encodes an image to fit a byte budget. Runs on a blocking thread.
pub trait Compressor: Send + Sync + 'static {
    fn compress(
        &self,
        file: &ImageFile,
        mime_type: &str,
        budget: usize,
    ) -> Result<UploadImage, ValidationError>;
}

/// Starting point and tightening schedule for one compression run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPlan {
    pub quality: u8,
    pub max_dimension: u32,
}

impl CompressionPlan {
    /// Larger originals start lower.
    pub fn for_size(original_bytes: usize) -> Self {
        const MIB: usize = 1024 * 1024;
        let (quality, max_dimension) = match original_bytes {
            n if n > 8 * MIB => (60, 1920),
            n if n > 3 * MIB => (70, 2048),
            n if n > MIB => (80, 2560),
            _ => (85, 2560),
        };
        Self {
            quality,
            max_dimension,
        }
    }

    /// Lower quality first, then shrink.
    pub fn tighten(self) -> Self {
        if self.quality > MIN_QUALITY {
            Self {
                quality: self.quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY),
                ..self
            }
        } else {
            Self {
                max_dimension: (self.max_dimension * 3 / 4).max(MIN_DIMENSION),
                ..self
            }
        }
    }
}

/// JPEG re-encoder driven by [`CompressionPlan`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegCompressor;

impl Compressor for JpegCompressor {
    fn compress(
        &self,
        file: &ImageFile,
        mime_type: &str,
        budget: usize,
    ) -> Result<UploadImage, ValidationError> {
        let decoded = image::load_from_memory(&file.data).map_err(|e| {
            ValidationError::Undecodable {
                message: e.to_string(),
            }
        })?;

        if file.data.len() <= budget {
            return Ok(UploadImage {
                data: file.data.clone(),
                mime_type: mime_type.to_string(),
                width: Some(decoded.width()),
                height: Some(decoded.height()),
            });
        }

        let mut plan = CompressionPlan::for_size(file.data.len());
        let mut best = usize::MAX;
        for attempt in 1..=MAX_ATTEMPTS {
            let scaled = fit_within(&decoded, plan.max_dimension);
            let encoded = encode_jpeg(&scaled, plan.quality)?;
            tracing::debug!(
                attempt,
                quality = plan.quality,
                max_dimension = plan.max_dimension,
                size = encoded.len(),
                budget,
                "compression attempt"
            );
            if encoded.len() <= budget {
                return Ok(UploadImage {
                    data: Bytes::from(encoded),
                    mime_type: "image/jpeg".to_string(),
                    width: Some(scaled.width()),
                    height: Some(scaled.height()),
                });
            }
            best = best.min(encoded.len());
            plan = plan.tighten();
        }
        Err(ValidationError::OverBudget { size: best, budget })
    }
}

fn fit_within(img: &DynamicImage, max_dimension: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_dimension {
        img.clone()
    } else {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ValidationError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| ValidationError::Undecodable {
            message: format!("jpeg encode failed: {e}"),
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: &DynamicImage) -> Vec<u8> {
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn noise_png(side: u32) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
        let img = RgbImage::from_fn(side, side, |_, _| {
            let mut next = || {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            };
            image::Rgb([next(), next(), next()])
        });
        encode_png(&DynamicImage::ImageRgb8(img))
    }

    #[test]
    fn test_plan_starts_lower_for_larger_files() {
        let small = CompressionPlan::for_size(500 * 1024);
        let huge = CompressionPlan::for_size(12 * 1024 * 1024);
        assert!(huge.quality < small.quality);
        assert!(huge.max_dimension < small.max_dimension);
    }

    #[test]
    fn test_plan_tightens_quality_then_dimension() {
        let mut plan = CompressionPlan {
            quality: 50,
            max_dimension: 2000,
        };
        plan = plan.tighten();
        assert_eq!(plan, CompressionPlan { quality: 40, max_dimension: 2000 });
        plan = plan.tighten();
        assert_eq!(plan, CompressionPlan { quality: 40, max_dimension: 1500 });
        for _ in 0..10 {
            plan = plan.tighten();
        }
        assert_eq!(plan.max_dimension, MIN_DIMENSION);
    }

    #[test]
    fn test_sniffs_missing_mime_type() {
        let file = ImageFile::new("a.png", noise_png(8));
        assert_eq!(file.validate(1024 * 1024).unwrap(), "image/png");
    }

    #[test]
    fn test_rejects_unsupported_declared_type() {
        let file = ImageFile::new("a.pdf", b"%PDF-1.4".to_vec()).with_mime_type("application/pdf");
        assert!(matches!(
            file.validate(1024),
            Err(ValidationError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_rejects_oversize_payload() {
        let file = ImageFile::new("a.png", noise_png(16)).with_mime_type("image/png");
        assert!(matches!(
            file.validate(10),
            Err(ValidationError::TooLarge { limit: 10, .. })
        ));
    }

    #[test]
    fn test_small_image_passes_through() {
        let bytes = noise_png(8);
        let file = ImageFile::new("a.png", bytes.clone());
        let out = JpegCompressor.compress(&file, "image/png", 1024 * 1024).unwrap();
        assert_eq!(out.data.as_ref(), bytes.as_slice());
        assert_eq!(out.mime_type, "image/png");
        assert_eq!(out.width, Some(8));
    }

    #[test]
    fn test_large_image_is_reencoded_under_budget() {
        let bytes = noise_png(256);
        let budget = 150 * 1024;
        assert!(bytes.len() > budget);
        let file = ImageFile::new("noise.png", bytes);
        let out = JpegCompressor.compress(&file, "image/png", budget).unwrap();
        assert!(out.data.len() <= budget);
        assert_eq!(out.mime_type, "image/jpeg");
    }

    #[test]
    fn test_impossible_budget_fails_fast() {
        let file = ImageFile::new("noise.png", noise_png(64));
        let err = JpegCompressor.compress(&file, "image/png", 16).unwrap_err();
        assert!(matches!(err, ValidationError::OverBudget { budget: 16, .. }));
    }

    #[test]
    fn test_garbage_is_undecodable() {
        let file = ImageFile::new("x.png", vec![0u8; 32]);
        assert!(matches!(
            JpegCompressor.compress(&file, "image/png", 1024),
            Err(ValidationError::Undecodable { .. })
        ));
    }
}
