//! One-shot extraction entry points.
//!
//! These run the same intake, preprocessing and extraction steps as
//! [`crate::worker::Pipeline`], in sequence, against in-memory stores. Use
//! them for single documents (the CLI, scripts, tests); use the pipeline when
//! uploads arrive continuously.

use crate::config::ExtractionConfig;
use crate::error::InvoiceError;
use crate::pipeline::input;
use crate::pipeline::invoke::{LlmExtractor, StructuredExtractor};
use crate::pipeline::job::{ExtractionJob, JobOutcome};
use crate::pipeline::preprocess::preprocess_asset;
use crate::record::InvoiceRecord;
use crate::store::{AssetStore, InMemoryAssetStore, InMemoryRecordStore, RecordStore};
use crate::worker::{accept_upload, UploadRequest};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Owner id given to records created by the one-shot entry points.
pub const LOCAL_USER_ID: i64 = 0;

/// Result of a one-shot extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    /// The record as persisted after the job.
    pub record: InvoiceRecord,
    pub outcome: JobOutcome,
    /// Whether the vision-optimized rendition was produced.
    pub preprocessed: bool,
    pub elapsed_ms: u64,
}

/// Extract invoice data from a local file or HTTP(S) URL.
///
/// # Errors
/// Returns `Err` only when no record could be created: unreadable input, a
/// rejected upload, or an unconfigured provider. Extraction failures are
/// reported through [`ExtractionReport::outcome`].
///
/// # Example
/// ```rust,no_run
/// use edgequake_invoice::{extract, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::builder().model("gpt-4o-mini").build()?;
/// let report = extract("receipt.jpg", &config).await?;
/// println!("{:?} {:?}", report.record.total, report.record.currency);
/// # Ok(())
/// # }
/// ```
pub async fn extract(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionReport, InvoiceError> {
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);
    let doc = input::resolve_input(input_str, config.download_timeout_secs).await?;
    extract_from_bytes(doc.bytes, doc.filename, config).await
}

/// Extract invoice data from bytes already in memory. The MIME type is
/// sniffed from the content.
pub async fn extract_from_bytes(
    bytes: Vec<u8>,
    filename: impl Into<String>,
    config: &ExtractionConfig,
) -> Result<ExtractionReport, InvoiceError> {
    let request = UploadRequest {
        filename: filename.into(),
        mime: input::sniff_mime(&bytes).to_string(),
        bytes,
        user_id: LOCAL_USER_ID,
        team_id: None,
    };
    // Reject before touching the provider.
    request.validate(config.max_upload_bytes)?;
    let extractor: Arc<dyn StructuredExtractor> = Arc::new(LlmExtractor::from_config(config)?);
    extract_with(request, extractor, config).await
}

/// Run intake, preprocessing and extraction for `request` with the given
/// extractor.
pub async fn extract_with(
    request: UploadRequest,
    extractor: Arc<dyn StructuredExtractor>,
    config: &ExtractionConfig,
) -> Result<ExtractionReport, InvoiceError> {
    let start = Instant::now();
    let assets: Arc<dyn AssetStore> = Arc::new(InMemoryAssetStore::new());
    let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());

    // ── Step 1: Intake ───────────────────────────────────────────────────
    let (record_id, asset) =
        accept_upload(assets.as_ref(), records.as_ref(), config, request).await?;

    // ── Step 2: Preprocess ───────────────────────────────────────────────
    let preprocessed = match preprocess_asset(assets.as_ref(), &asset, &config.preprocess).await {
        Ok(bytes) => {
            config.observer.on_preprocess_complete(record_id, bytes);
            true
        }
        Err(e) => {
            warn!(
                record_id = %record_id,
                error = %e,
                "Preprocessing failed; extracting from the original"
            );
            config.observer.on_preprocess_failed(record_id, &e.to_string());
            false
        }
    };

    // ── Step 3: Extract ──────────────────────────────────────────────────
    let job = ExtractionJob::new(
        Arc::clone(&assets),
        Arc::clone(&records),
        extractor,
        Arc::new(config.clone()),
    );
    let outcome = job.run(record_id).await;

    let record = records
        .get(record_id)
        .await?
        .ok_or(InvoiceError::RecordNotFound { id: record_id })?;

    Ok(ExtractionReport {
        record,
        outcome,
        preprocessed,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionReport, InvoiceError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InvoiceError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input_str, config))
}
