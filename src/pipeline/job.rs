//! The extraction job: one record, one model call, one guarded write.
//!
//! ## State machine
//!
//! ```text
//! uploaded ──(asset missing)──────────▶ uploaded   abort, nothing written
//!          ──(timeout / provider error)▶ no_invoice
//!          ──(empty or malformed reply)▶ uploaded   stuck, logged at error
//!          ──(sentinel title)──────────▶ no_invoice
//!          ──(invoice data)────────────▶ processed
//! ```
//!
//! A job only acts on a record whose status is `uploaded`, and every write
//! is a compare-and-set against that status
//! ([`RecordStore::update_if_status`]). A second dispatch for the same
//! record therefore either sees a non-`uploaded` status and aborts, or loses
//! the compare-and-set and discards its write.
//!
//! [`ExtractionJob::run`] never returns an error: every failure ends in a
//! [`JobOutcome`], so a bad document cannot take a worker down.

use crate::config::ExtractionConfig;
use crate::error::{InvoiceError, InvokeError, PreprocessError, StoreError};
use crate::pipeline::encode::{encode_image, encode_original};
use crate::pipeline::invoke::{invoke, ExtractionRequest, StructuredExtractor};
use crate::pipeline::reconcile::{self, ExtractedFields};
use crate::prompts::extraction_prompt;
use crate::record::{InvoiceRecord, InvoiceStatus, ModelTelemetry, Rendition};
use crate::schema::ExtractionSchema;
use crate::store::{AssetStore, RecordStore};
use chrono::Utc;
use edgequake_llm::ImageData;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Why a record ended at `no_invoice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoInvoiceReason {
    /// The model returned the sentinel title.
    NotAnInvoice,
    /// Timeout, transport error or provider-side exception.
    ProviderFailure,
}

/// Why a record is still `uploaded` after a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    EmptyResponse,
    /// Not a JSON object, or required keys missing.
    Malformed,
    /// Invoice data without a total or currency.
    Incomplete,
}

/// Why nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Neither a vision-optimized rendition nor an original exists.
    MissingAsset,
    /// An asset exists but could not be turned into an image.
    UnreadableAsset,
    RecordNotFound,
    /// The record already left `uploaded`.
    AlreadyExtracted,
    /// The record store failed.
    Store,
}

/// How one job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Processed,
    NoInvoice(NoInvoiceReason),
    Stuck(StuckReason),
    Aborted(AbortReason),
}

impl JobOutcome {
    /// Status the record holds after the run; `None` when the job aborted
    /// without touching it.
    pub fn status(&self) -> Option<InvoiceStatus> {
        match self {
            JobOutcome::Processed => Some(InvoiceStatus::Processed),
            JobOutcome::NoInvoice(_) => Some(InvoiceStatus::NoInvoice),
            JobOutcome::Stuck(_) => Some(InvoiceStatus::Uploaded),
            JobOutcome::Aborted(_) => None,
        }
    }

    /// `true` for outcomes that need an operator to look at the record.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            JobOutcome::Stuck(_)
                | JobOutcome::Aborted(AbortReason::MissingAsset)
                | JobOutcome::Aborted(AbortReason::UnreadableAsset)
                | JobOutcome::Aborted(AbortReason::Store)
        )
    }
}

/// Runs extraction for records, sharing stores and extractor across runs.
#[derive(Clone)]
pub struct ExtractionJob {
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn RecordStore>,
    extractor: Arc<dyn StructuredExtractor>,
    config: Arc<ExtractionConfig>,
}

impl ExtractionJob {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn RecordStore>,
        extractor: Arc<dyn StructuredExtractor>,
        config: Arc<ExtractionConfig>,
    ) -> Self {
        Self {
            assets,
            records,
            extractor,
            config,
        }
    }

    /// Extract `record_id` and persist the result.
    pub async fn run(&self, record_id: Uuid) -> JobOutcome {
        let start = Instant::now();
        let outcome = self.execute(record_id).await;
        info!(
            record_id = %record_id,
            outcome = ?outcome,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Extraction job finished"
        );
        self.config
            .observer
            .on_extraction_complete(record_id, &outcome);
        outcome
    }

    async fn execute(&self, record_id: Uuid) -> JobOutcome {
        let mut record = match self.records.get(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(record_id = %record_id, "Extraction job for unknown record");
                return JobOutcome::Aborted(AbortReason::RecordNotFound);
            }
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Failed to load record");
                return JobOutcome::Aborted(AbortReason::Store);
            }
        };

        if record.status != InvoiceStatus::Uploaded {
            info!(
                record_id = %record_id,
                status = %record.status,
                "Record already extracted; skipping"
            );
            return JobOutcome::Aborted(AbortReason::AlreadyExtracted);
        }

        // ── 1. Resolve the image ─────────────────────────────────────────
        let (rendition, image) = match self.resolve_image(&record).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                error!(record_id = %record_id, "No image asset exists for record; aborting");
                return JobOutcome::Aborted(AbortReason::MissingAsset);
            }
            Err(InvoiceError::Store(e)) => {
                error!(record_id = %record_id, error = %e, "Failed to read asset");
                return JobOutcome::Aborted(AbortReason::Store);
            }
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Asset could not be prepared for the model");
                return JobOutcome::Aborted(AbortReason::UnreadableAsset);
            }
        };
        record.extraction_source = Some(rendition);
        info!(record_id = %record_id, rendition = %rendition, "Resolved image asset");
        self.config
            .observer
            .on_extraction_start(record_id, rendition);

        // ── 2. Build the request ─────────────────────────────────────────
        let schema = ExtractionSchema::for_variant(self.config.schema_variant);
        let request = ExtractionRequest {
            image,
            prompt: extraction_prompt(Utc::now().date_naive()),
            schema: schema.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: Duration::from_secs(self.config.api_timeout_secs),
        };

        // ── 3. Invoke ────────────────────────────────────────────────────
        let response = match invoke(self.extractor.as_ref(), request).await {
            Ok(response) => response,
            Err(e) if e.is_provider_failure() => {
                error!(record_id = %record_id, error = %e, "Provider failure; marking no_invoice");
                record.status = InvoiceStatus::NoInvoice;
                record.touch();
                return self
                    .persist(&record, JobOutcome::NoInvoice(NoInvoiceReason::ProviderFailure))
                    .await;
            }
            Err(InvokeError::EmptyResponse) => {
                error!(record_id = %record_id, "Empty structured payload; record left at uploaded");
                return JobOutcome::Stuck(StuckReason::EmptyResponse);
            }
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Malformed structured payload; record left at uploaded");
                return JobOutcome::Stuck(StuckReason::Malformed);
            }
        };

        // ── 4. Telemetry is written whatever the branch ──────────────────
        record.telemetry = ModelTelemetry {
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            model: Some(response.model.clone()),
        };
        record.touch();

        // ── 5. Reconcile ─────────────────────────────────────────────────
        let mapped = match ExtractedFields::from_response(&response.fields, &schema) {
            Ok(mapped) => mapped,
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Structured payload failed validation; record left at uploaded");
                return self
                    .persist(&record, JobOutcome::Stuck(StuckReason::Malformed))
                    .await;
            }
        };
        if mapped.confidence_flagged() {
            warn!(record_id = %record_id, "Model reported confidence outside 0–100; ignored");
        }

        match reconcile::apply(&mut record, &mapped.fields) {
            Ok(InvoiceStatus::NoInvoice) => {
                self.persist(&record, JobOutcome::NoInvoice(NoInvoiceReason::NotAnInvoice))
                    .await
            }
            Ok(_) => self.persist(&record, JobOutcome::Processed).await,
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Invoice payload incomplete; record left at uploaded");
                self.persist(&record, JobOutcome::Stuck(StuckReason::Incomplete))
                    .await
            }
        }
    }

    /// Prefer the vision-optimized conversion, fall back to the original.
    async fn resolve_image(
        &self,
        record: &InvoiceRecord,
    ) -> Result<Option<(Rendition, ImageData)>, InvoiceError> {
        let Some(asset) = record.asset.as_ref() else {
            return Ok(None);
        };

        let optimized = Rendition::VisionOptimized.conversion_name();
        if let Some(name) = optimized {
            if self.assets.has_conversion(asset, name).await? {
                match self.assets.get(asset, optimized).await {
                    Ok(bytes) => {
                        return Ok(Some((
                            Rendition::VisionOptimized,
                            encode_image(&bytes, "image/png"),
                        )))
                    }
                    Err(StoreError::AssetNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !self.assets.exists(asset).await? {
            return Ok(None);
        }
        let bytes = match self.assets.get(asset, Rendition::Original.conversion_name()).await {
            Ok(bytes) => bytes,
            Err(StoreError::AssetNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        warn!(
            record_id = %record.id,
            "No vision-optimized rendition; falling back to the original"
        );

        let mime = asset.mime.clone();
        let options = self.config.preprocess;
        let image = tokio::task::spawn_blocking(move || encode_original(&bytes, &mime, &options))
            .await
            .map_err(|e| PreprocessError::Task(e.to_string()))??;
        Ok(Some((Rendition::Original, image)))
    }

    /// Compare-and-set against `uploaded`. Returns `outcome` on success.
    async fn persist(&self, record: &InvoiceRecord, outcome: JobOutcome) -> JobOutcome {
        match self
            .records
            .update_if_status(record, InvoiceStatus::Uploaded)
            .await
        {
            Ok(true) => outcome,
            Ok(false) => {
                warn!(
                    record_id = %record.id,
                    "Record left uploaded while the job ran; discarding result"
                );
                JobOutcome::Aborted(AbortReason::AlreadyExtracted)
            }
            Err(e) => {
                error!(record_id = %record.id, error = %e, "Failed to persist record");
                JobOutcome::Aborted(AbortReason::Store)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_status_is_one_of_three() {
        let outcomes = [
            JobOutcome::Processed,
            JobOutcome::NoInvoice(NoInvoiceReason::NotAnInvoice),
            JobOutcome::NoInvoice(NoInvoiceReason::ProviderFailure),
            JobOutcome::Stuck(StuckReason::EmptyResponse),
            JobOutcome::Stuck(StuckReason::Malformed),
            JobOutcome::Stuck(StuckReason::Incomplete),
        ];
        for outcome in outcomes {
            let status = outcome.status().unwrap();
            assert!(matches!(
                status,
                InvoiceStatus::Uploaded | InvoiceStatus::Processed | InvoiceStatus::NoInvoice
            ));
        }
        assert_eq!(JobOutcome::Aborted(AbortReason::MissingAsset).status(), None);
    }

    #[test]
    fn stuck_and_missing_assets_need_attention() {
        assert!(JobOutcome::Stuck(StuckReason::EmptyResponse).needs_attention());
        assert!(JobOutcome::Aborted(AbortReason::MissingAsset).needs_attention());
        assert!(!JobOutcome::Aborted(AbortReason::AlreadyExtracted).needs_attention());
        assert!(!JobOutcome::NoInvoice(NoInvoiceReason::ProviderFailure).needs_attention());
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(JobOutcome::Stuck(StuckReason::EmptyResponse)).unwrap();
        assert_eq!(json["outcome"], "stuck");
        assert_eq!(json["reason"], "empty_response");
        let json = serde_json::to_value(JobOutcome::Processed).unwrap();
        assert_eq!(json["outcome"], "processed");
    }
}
