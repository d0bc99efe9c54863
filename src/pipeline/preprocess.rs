//! Image preprocessing: derive the `vision-optimized` rendition of an upload.
//!
//! Phone photos of receipts arrive large, coloured and soft. The model reads
//! them better as a bounded, greyscale, slightly brightened and sharpened PNG,
//! and a 1024 px rendition costs a fraction of the image tokens of the
//! original.
//!
//! ## Steps
//!
//! ```text
//! decode ─▶ bound 3000² ─▶ greyscale ─▶ brightness +5 ─▶ contrast +10 ─▶ sharpen 15 ─▶ fit 1024² ─▶ PNG
//! ```
//!
//! Bounding happens first so the per-pixel filters never run on a 48 MP
//! photo. Both resize steps preserve aspect ratio and never upscale.
//!
//! PDF uploads are rasterised (first page only) through pdfium before the
//! image steps. pdfium is not async-safe, and the filters are CPU-bound, so
//! [`preprocess_asset`] runs everything inside `spawn_blocking`.

use crate::error::{InvoiceError, PreprocessError};
use crate::store::{AssetRef, AssetStore};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, info};

/// Adjustment parameters. Brightness, contrast and sharpening use a
/// −100..100 scale; sizes are the longest edge in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    pub brightness: i32,
    pub contrast: f32,
    pub sharpen: f32,
    /// Bound applied before filtering. Default: 3000.
    pub working_max: u32,
    /// Final bound of the rendition. Default: 1024.
    pub target_max: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            brightness: 5,
            contrast: 10.0,
            sharpen: 15.0,
            working_max: 3000,
            target_max: 1024,
        }
    }
}

impl PreprocessOptions {
    pub fn validate(&self) -> Result<(), InvoiceError> {
        if !(-100..=100).contains(&self.brightness) {
            return Err(InvoiceError::InvalidConfig(format!(
                "brightness must be -100–100, got {}",
                self.brightness
            )));
        }
        if !(-100.0..=100.0).contains(&self.contrast) {
            return Err(InvoiceError::InvalidConfig(format!(
                "contrast must be -100–100, got {}",
                self.contrast
            )));
        }
        if !(0.0..=100.0).contains(&self.sharpen) {
            return Err(InvoiceError::InvalidConfig(format!(
                "sharpen must be 0–100, got {}",
                self.sharpen
            )));
        }
        if self.target_max == 0 || self.working_max < self.target_max {
            return Err(InvoiceError::InvalidConfig(format!(
                "need 0 < target_max ≤ working_max, got {} / {}",
                self.target_max, self.working_max
            )));
        }
        Ok(())
    }
}

/// Produce the vision-optimized PNG for `bytes` of type `mime`.
///
/// Blocking. Use [`preprocess_asset`] from async code.
pub fn preprocess_bytes(
    bytes: &[u8],
    mime: &str,
    options: &PreprocessOptions,
) -> Result<Vec<u8>, PreprocessError> {
    let source = decode_source(bytes, mime, options.working_max)?;
    debug!(
        "Decoded {} source → {}x{} px",
        mime,
        source.width(),
        source.height()
    );
    let processed = apply_adjustments(source, options);
    encode_png(&processed)
}

/// Read the original of `asset`, preprocess it and store the result as the
/// `vision-optimized` conversion. Returns the size of the stored PNG.
pub async fn preprocess_asset(
    store: &dyn AssetStore,
    asset: &AssetRef,
    options: &PreprocessOptions,
) -> Result<usize, PreprocessError> {
    let start = Instant::now();
    let original = store.get(asset, None).await?;
    let mime = asset.mime.clone();
    let opts = *options;

    let png = tokio::task::spawn_blocking(move || preprocess_bytes(&original, &mime, &opts))
        .await
        .map_err(|e| PreprocessError::Task(e.to_string()))??;

    store
        .put_conversion(asset, crate::VISION_OPTIMIZED, &png)
        .await?;

    info!(
        asset_id = %asset.id,
        bytes = png.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Generated vision-optimized rendition"
    );
    Ok(png.len())
}

/// Apply the adjustment chain to an already decoded image.
pub fn apply_adjustments(img: DynamicImage, options: &PreprocessOptions) -> DynamicImage {
    let img = fit_within(img, options.working_max);
    let img = img.grayscale();
    let img = img.brighten(options.brightness * 255 / 100);
    let img = img.adjust_contrast(options.contrast);
    let img = if options.sharpen > 0.0 {
        img.unsharpen(options.sharpen / 10.0, 0)
    } else {
        img
    };
    fit_within(img, options.target_max)
}

/// Downscale so neither edge exceeds `max`; smaller images pass through.
fn fit_within(img: DynamicImage, max: u32) -> DynamicImage {
    if img.width() <= max && img.height() <= max {
        img
    } else {
        img.resize(max, max, FilterType::Lanczos3)
    }
}

fn decode_source(
    bytes: &[u8],
    mime: &str,
    max_pixels: u32,
) -> Result<DynamicImage, PreprocessError> {
    match mime {
        "image/jpeg" | "image/png" | "image/gif" => Ok(image::load_from_memory(bytes)?),
        "application/pdf" => rasterise_first_page(bytes, max_pixels),
        other => Err(PreprocessError::UnsupportedType {
            mime: other.to_string(),
        }),
    }
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

// ── PDF sources ──────────────────────────────────────────────────────────

/// Bind pdfium from `PDFIUM_LIB_PATH` if set, else from the system library.
fn bind_pdfium() -> Result<Pdfium, PreprocessError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PreprocessError::PdfiumBindingFailed(e.to_string()))?;
    Ok(Pdfium::new(bindings))
}

fn rasterise_first_page(bytes: &[u8], max_pixels: u32) -> Result<DynamicImage, PreprocessError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| PreprocessError::Rasterisation(format!("{:?}", e)))?;

    let pages = document.pages();
    debug!("PDF loaded: {} pages, rasterising page 1", pages.len());

    let page = pages
        .get(0)
        .map_err(|e| PreprocessError::Rasterisation(format!("page 1: {:?}", e)))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| PreprocessError::Rasterisation(format!("page 1: {:?}", e)))?;

    Ok(bitmap.as_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsAssetStore;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn png_of(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 200])
        }));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn default_options_validate() {
        assert!(PreprocessOptions::default().validate().is_ok());
        let bad = PreprocessOptions {
            working_max: 512,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn large_image_is_fit_into_target_box() {
        let out = preprocess_bytes(&png_of(2048, 1024), "image/png", &Default::default()).unwrap();
        assert_eq!(&out[..4], b"\x89PNG");
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (1024, 512));
    }

    #[test]
    fn small_image_is_not_upscaled() {
        let out = preprocess_bytes(&png_of(40, 60), "image/png", &Default::default()).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (40, 60));
    }

    #[test]
    fn output_is_greyscale() {
        let out = preprocess_bytes(&png_of(64, 64), "image/png", &Default::default()).unwrap();
        let rgb = image::load_from_memory(&out).unwrap().to_rgb8();
        assert!(rgb.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let err = preprocess_bytes(b"GIF89a", "image/webp", &Default::default()).unwrap_err();
        assert!(matches!(err, PreprocessError::UnsupportedType { .. }));
    }

    #[test]
    fn corrupt_image_is_a_decode_error() {
        let err = preprocess_bytes(b"not an image", "image/png", &Default::default()).unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }

    #[tokio::test]
    async fn preprocess_asset_writes_conversion() {
        let dir = TempDir::new().unwrap();
        let store = FsAssetStore::new(dir.path());
        let asset = store
            .put(&png_of(1500, 300), "invoices", "image/png")
            .await
            .unwrap();

        let size = preprocess_asset(&store, &asset, &Default::default())
            .await
            .unwrap();

        assert!(size > 0);
        assert!(store
            .has_conversion(&asset, crate::VISION_OPTIMIZED)
            .await
            .unwrap());
        let stored = store
            .get(&asset, Some(crate::VISION_OPTIMIZED))
            .await
            .unwrap();
        assert_eq!(stored.len(), size);
    }
}
