//! # edgequake-invoice
//!
//! Extract structured invoice and receipt data from uploaded images and PDFs
//! using Vision Language Models (VLMs).
//!
//! An upload becomes an [`InvoiceRecord`] in status `uploaded`. A
//! vision-optimized rendition is derived from the original (greyscale,
//! brightened, contrast-stretched, sharpened, capped at 1024 px), the model is
//! asked for a JSON object matching a fixed field schema, and the reply is
//! reconciled into the record. The record then ends in `processed` (a real
//! invoice with a total and currency), `no_invoice` (the model said it is not
//! an invoice, or the provider failed), or stays `uploaded` when the reply
//! could not be used.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Intake      validate type/size, store original, create record
//!  ├─ 2. Preprocess  greyscale → brightness → contrast → sharpen → resize
//!  │                 (PDF: first page rasterised via pdfium, spawn_blocking)
//!  ├─ 3. Trigger     ConversionCompleted(vision-optimized, invoices)
//!  ├─ 4. Invoke      one structured-output call, image + prompt + schema
//!  ├─ 5. Reconcile   typed field mapping, sentinel check, money → minor units
//!  └─ 6. Persist     compare-and-set on status `uploaded`
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let report = extract("receipt.jpg", &config).await?;
//!     println!("{} {:?}", report.record.status, report.record.total);
//!     Ok(())
//! }
//! ```
//!
//! For a long-running service, start a [`Pipeline`] over your own
//! [`AssetStore`] and [`RecordStore`] and feed it [`UploadRequest`]s.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `eq-invoice` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-invoice = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod money;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod schema;
pub mod store;
pub mod worker;

// ── Constants ────────────────────────────────────────────────────────────

/// Name of the preprocessed conversion the model reads.
pub const VISION_OPTIMIZED: &str = "vision-optimized";

/// Asset collection invoice uploads are stored in.
pub const INVOICES_COLLECTION: &str = "invoices";

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{InvoiceError, InvokeError, PreprocessError, StoreError, UploadError};
pub use extract::{extract, extract_from_bytes, extract_sync, extract_with, ExtractionReport};
pub use pipeline::invoke::{LlmExtractor, StructuredExtractor, StructuredResponse};
pub use pipeline::job::{AbortReason, ExtractionJob, JobOutcome, NoInvoiceReason, StuckReason};
pub use pipeline::preprocess::PreprocessOptions;
pub use progress::{NoopObserver, PipelineObserver};
pub use record::{InvoiceRecord, InvoiceStatus, Party, Rendition};
pub use schema::{ExtractionSchema, SchemaVariant};
pub use store::{AssetRef, AssetStore, FsAssetStore, InMemoryAssetStore, InMemoryRecordStore, RecordStore};
pub use worker::{ConversionCompleted, Pipeline, UploadRequest};
