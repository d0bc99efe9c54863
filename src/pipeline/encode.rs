//! Image encoding: stored rendition bytes → base64 `ImageData`.
//!
//! Vision APIs accept images as base64 data embedded in the JSON request
//! body. The stored bytes are already a PNG (vision-optimized) or the
//! uploaded JPEG/PNG/GIF (original fallback), so no re-encoding happens here
//! except for PDF originals, which the vision APIs do not take as images.

use crate::error::PreprocessError;
use crate::pipeline::preprocess::{preprocess_bytes, PreprocessOptions};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Wrap already-encoded image bytes for the vision API.
///
/// `detail: "high"` lets GPT-4-class models tile the image instead of
/// reading a single 512 px overview, which loses line items on receipts.
pub fn encode_image(bytes: &[u8], mime: &str) -> ImageData {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded {} image → {} bytes base64", mime, b64.len());
    ImageData::new(b64, mime).with_detail("high")
}

/// Encode an original upload when no vision-optimized rendition exists.
///
/// Images pass through untouched. A PDF original is rasterised and
/// adjusted with `options` so the model still receives an image.
pub fn encode_original(
    bytes: &[u8],
    mime: &str,
    options: &PreprocessOptions,
) -> Result<ImageData, PreprocessError> {
    if mime == "application/pdf" {
        let png = preprocess_bytes(bytes, mime, options)?;
        Ok(encode_image(&png, "image/png"))
    } else {
        Ok(encode_image(bytes, mime))
    }
}
