//! Error types for the edgequake-invoice library.
//!
//! The split mirrors the two ways a document can go wrong:
//!
//! * [`InvoiceError`] — **Fatal** to the caller: the pipeline cannot be
//!   built or an upload cannot be accepted (bad config, provider missing,
//!   rejected file, storage unavailable). Returned as `Err(InvoiceError)`.
//!
//! * [`InvokeError`] — **Per-document**: one call to the extraction model
//!   failed. It never escapes an extraction job; the job maps it onto a
//!   record status (see [`crate::pipeline::job`]).
//!
//! Stage-local errors ([`PreprocessError`], [`StoreError`], [`UploadError`])
//! convert into [`InvoiceError`] where they cross the public API.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the edgequake-invoice library.
#[derive(Debug, Error)]
pub enum InvoiceError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The upload was rejected before a record was created.
    #[error(transparent)]
    Upload(#[from] UploadError),

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The vision-optimized rendition could not be produced.
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    /// Asset or record storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No record exists with the given id.
    #[error("Record {id} not found")]
    RecordNotFound { id: Uuid },

    /// The worker queues have been shut down.
    #[error("Pipeline is shut down; no further work is accepted")]
    PipelineClosed,

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed call to the structured-extraction model.
///
/// `Timeout` and `Provider` are provider-level failures: the call itself did
/// not complete. `EmptyResponse` and `Malformed` mean the call nominally
/// succeeded but produced nothing usable.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum InvokeError {
    /// The call exceeded the request timeout.
    #[error("Extraction call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Transport error or provider-side exception.
    #[error("Provider error: {message}")]
    Provider { message: String },

    /// The call succeeded but returned no structured payload.
    #[error("Provider returned an empty structured payload")]
    EmptyResponse,

    /// The payload could not be read as a JSON object.
    #[error("Provider returned a malformed payload: {detail}")]
    Malformed { detail: String },
}

impl InvokeError {
    /// `true` when the call itself failed (timeout, transport, provider).
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, InvokeError::Timeout { .. } | InvokeError::Provider { .. })
    }
}

/// Failure while deriving the vision-optimized rendition.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// Source bytes could not be decoded as an image.
    #[error("Failed to decode source image: {0}")]
    Decode(#[from] image::ImageError),

    /// The source MIME type has no preprocessing path.
    #[error("Unsupported source type '{mime}'")]
    UnsupportedType { mime: String },

    /// Could not bind to a pdfium library for a PDF source.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    /// pdfium loaded the library but could not rasterise the document.
    #[error("Failed to rasterise PDF: {0}")]
    Rasterisation(String),

    /// Reading the original or writing the conversion failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The blocking task panicked.
    #[error("Preprocessing task failed: {0}")]
    Task(String),
}

/// Asset or record storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("record already exists: {0}")]
    Duplicate(Uuid),

    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An upload rejected by the intake contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("No file was provided.")]
    Empty,

    #[error("Only JPG, PNG, GIF, and PDF files are allowed (got '{mime}').")]
    UnsupportedType { mime: String },

    #[error("File size should not exceed {max_bytes} bytes (got {size}).")]
    TooLarge { size: usize, max_bytes: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failure_classification() {
        assert!(InvokeError::Timeout { secs: 120 }.is_provider_failure());
        assert!(InvokeError::Provider {
            message: "502".into()
        }
        .is_provider_failure());
        assert!(!InvokeError::EmptyResponse.is_provider_failure());
        assert!(!InvokeError::Malformed {
            detail: "not json".into()
        }
        .is_provider_failure());
    }

    #[test]
    fn timeout_display() {
        let e = InvokeError::Timeout { secs: 120 };
        assert!(e.to_string().contains("120s"));
    }

    #[test]
    fn upload_too_large_display() {
        let e = UploadError::TooLarge {
            size: 6_000_000,
            max_bytes: 5_242_880,
        };
        let msg = e.to_string();
        assert!(msg.contains("5242880"), "got: {msg}");
        assert!(msg.contains("6000000"), "got: {msg}");
    }

    #[test]
    fn upload_converts_into_fatal_error() {
        let e: InvoiceError = UploadError::Empty.into();
        assert!(matches!(e, InvoiceError::Upload(UploadError::Empty)));
        assert_eq!(e.to_string(), "No file was provided.");
    }
}
