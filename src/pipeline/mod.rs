//! Pipeline stages for invoice extraction.
//!
//! Each submodule implements one step. [`job`] strings the per-record steps
//! together; [`crate::worker`] schedules jobs.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ preprocess ──▶ encode ──▶ invoke ──▶ reconcile
//! (path/URL)  (image/pdfium) (base64)  (VLM)     (typed fields)
//!                                         │
//!                                  postprocess (transcription cleanup)
//! ```
//!
//! 1. [`input`]: read a local path or download a URL; sniff the MIME type
//! 2. [`preprocess`]: derive the vision-optimized PNG; CPU-bound, runs in
//!    `spawn_blocking`
//! 3. [`encode`]: base64-wrap the chosen rendition as `ImageData`
//! 4. [`invoke`]: the single structured-output model call, under a timeout;
//!    the only stage with network I/O
//! 5. [`reconcile`]: map the reply onto typed fields and decide the status
//! 6. [`postprocess`]: cleanup rules for the Markdown transcription and the
//!    JSON payload (code fences, table rows, invisible characters)

pub mod encode;
pub mod input;
pub mod invoke;
pub mod job;
pub mod postprocess;
pub mod preprocess;
pub mod reconcile;
