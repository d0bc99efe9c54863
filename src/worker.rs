//! Queue-driven pipeline: intake, preprocessing and extraction workers.
//!
//! ```text
//!  upload() ──► preprocess queue ──► preprocess worker ──► ConversionCompleted
//!                                          │ (failure)            │
//!                                          │                      ▼
//!                                          │                  listener ── filter: vision-optimized
//!                                          │                      │         + invoices collection
//!                                          ▼                      ▼
//!                                   extraction queue ◄────────────┘
//!                                          │
//!                                          ▼
//!                                   extraction worker ──► ExtractionJob::run
//! ```
//!
//! Each worker drains its queue with `for_each_concurrent`, bounded by the
//! concurrency settings in [`ExtractionConfig`]. A record is held in an
//! in-flight set from dispatch until its job returns, so duplicate events for
//! the same record collapse into one job. The job's compare-and-set persist
//! covers whatever still races past the set (another process, a manual
//! re-dispatch after the first job finished).

use crate::config::ExtractionConfig;
use crate::error::{InvoiceError, UploadError};
use crate::pipeline::job::ExtractionJob;
use crate::pipeline::invoke::StructuredExtractor;
use crate::pipeline::preprocess::preprocess_asset;
use crate::record::InvoiceRecord;
use crate::store::{AssetRef, AssetStore, RecordStore};
use crate::{INVOICES_COLLECTION, VISION_OPTIMIZED};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// MIME types accepted at intake.
pub const ACCEPTED_MIME_TYPES: [&str; 4] =
    ["image/jpeg", "image/png", "image/gif", "application/pdf"];

// ── Intake ───────────────────────────────────────────────────────────────

/// A file submitted by a user.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub user_id: i64,
    pub team_id: Option<i64>,
}

impl UploadRequest {
    /// Check presence, type and size. Nothing is stored for a rejected upload.
    pub fn validate(&self, max_bytes: usize) -> Result<(), UploadError> {
        if self.bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if !ACCEPTED_MIME_TYPES.contains(&self.mime.as_str()) {
            return Err(UploadError::UnsupportedType {
                mime: self.mime.clone(),
            });
        }
        if self.bytes.len() > max_bytes {
            return Err(UploadError::TooLarge {
                size: self.bytes.len(),
                max_bytes,
            });
        }
        Ok(())
    }
}

/// Validate `request`, store the original in the invoices collection and
/// create its `uploaded` record.
pub(crate) async fn accept_upload(
    assets: &dyn AssetStore,
    records: &dyn RecordStore,
    config: &ExtractionConfig,
    request: UploadRequest,
) -> Result<(Uuid, AssetRef), InvoiceError> {
    request.validate(config.max_upload_bytes)?;

    let asset = assets
        .put(&request.bytes, INVOICES_COLLECTION, &request.mime)
        .await?;
    let mut record = InvoiceRecord::new_upload(request.user_id, request.team_id, &request.filename);
    record.asset = Some(asset.clone());
    let record_id = record.id;
    records.insert(record).await?;

    info!(
        record_id = %record_id,
        asset_id = %asset.id,
        mime = %asset.mime,
        bytes = asset.size,
        "Upload accepted"
    );
    config.observer.on_upload(record_id, &request.filename);
    Ok((record_id, asset))
}

// ── Events ───────────────────────────────────────────────────────────────

/// Emitted when a named conversion of an asset has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCompleted {
    pub conversion_name: String,
    pub collection_name: String,
    pub record_id: Uuid,
}

impl ConversionCompleted {
    /// Only the vision-optimized rendition of an invoice upload starts an
    /// extraction.
    pub fn triggers_extraction(&self) -> bool {
        self.conversion_name == VISION_OPTIMIZED && self.collection_name == INVOICES_COLLECTION
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PreprocessTask {
    record_id: Uuid,
    asset: AssetRef,
}

#[derive(Clone)]
struct Dispatcher {
    tx: mpsc::UnboundedSender<Uuid>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Dispatcher {
    /// Queue `record_id` for extraction. `Ok(false)` if it is already queued
    /// or running.
    fn dispatch(&self, record_id: Uuid) -> Result<bool, InvoiceError> {
        if !lock(&self.in_flight).insert(record_id) {
            debug!(record_id = %record_id, "Extraction already in flight; skipping");
            return Ok(false);
        }
        if self.tx.send(record_id).is_err() {
            lock(&self.in_flight).remove(&record_id);
            return Err(InvoiceError::PipelineClosed);
        }
        Ok(true)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Senders {
    preprocess: mpsc::UnboundedSender<PreprocessTask>,
    events: mpsc::UnboundedSender<ConversionCompleted>,
    dispatcher: Dispatcher,
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Running pipeline. Must be started inside a tokio runtime.
pub struct Pipeline {
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn RecordStore>,
    config: Arc<ExtractionConfig>,
    senders: Mutex<Option<Senders>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawn the preprocess worker, the conversion listener and the
    /// extraction worker.
    pub fn start(
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn RecordStore>,
        extractor: Arc<dyn StructuredExtractor>,
        config: ExtractionConfig,
    ) -> Self {
        let config = Arc::new(config);
        let job = ExtractionJob::new(
            Arc::clone(&assets),
            Arc::clone(&records),
            extractor,
            Arc::clone(&config),
        );

        let (preprocess_tx, preprocess_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (extract_tx, extract_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let dispatcher = Dispatcher {
            tx: extract_tx,
            in_flight: Arc::clone(&in_flight),
        };

        let workers = vec![
            tokio::spawn(run_preprocess_worker(
                preprocess_rx,
                Arc::clone(&assets),
                Arc::clone(&config),
                events_tx.clone(),
                dispatcher.clone(),
            )),
            tokio::spawn(run_listener(events_rx, dispatcher.clone())),
            tokio::spawn(run_extraction_worker(
                extract_rx,
                job,
                in_flight,
                config.extraction_concurrency,
            )),
        ];

        info!(
            model = config.model_name(),
            preprocess_concurrency = config.preprocess_concurrency,
            extraction_concurrency = config.extraction_concurrency,
            "Invoice pipeline started"
        );

        Self {
            assets,
            records,
            config,
            senders: Mutex::new(Some(Senders {
                preprocess: preprocess_tx,
                events: events_tx,
                dispatcher,
            })),
            workers: Mutex::new(workers),
        }
    }

    /// Accept an upload: store the original, create an `uploaded` record and
    /// queue preprocessing. Returns the new record id.
    pub async fn upload(&self, request: UploadRequest) -> Result<Uuid, InvoiceError> {
        let (record_id, asset) = accept_upload(
            self.assets.as_ref(),
            self.records.as_ref(),
            &self.config,
            request,
        )
        .await?;

        self.with_senders(|s| {
            s.preprocess
                .send(PreprocessTask { record_id, asset })
                .map_err(|_| InvoiceError::PipelineClosed)
        })?;
        Ok(record_id)
    }

    /// Deliver a conversion event from outside the pipeline, e.g. a rendition
    /// produced by an external media service.
    pub fn notify(&self, event: ConversionCompleted) -> Result<(), InvoiceError> {
        self.with_senders(|s| {
            s.events
                .send(event)
                .map_err(|_| InvoiceError::PipelineClosed)
        })
    }

    /// Queue extraction for `record_id` directly, bypassing preprocessing.
    /// Returns `false` if the record is already queued or running.
    pub fn extract_now(&self, record_id: Uuid) -> Result<bool, InvoiceError> {
        self.with_senders(|s| s.dispatcher.dispatch(record_id))
    }

    pub async fn record(&self, record_id: Uuid) -> Result<InvoiceRecord, InvoiceError> {
        self.records
            .get(record_id)
            .await?
            .ok_or(InvoiceError::RecordNotFound { id: record_id })
    }

    /// All records, newest first.
    pub async fn records(&self) -> Result<Vec<InvoiceRecord>, InvoiceError> {
        Ok(self.records.list().await?)
    }

    /// Stop accepting work, drain every queue and wait for the workers.
    ///
    /// Queued preprocessing still runs, and the extractions it triggers are
    /// still executed.
    pub async fn shutdown(&self) {
        drop(lock(&self.senders).take());
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pipeline worker panicked");
            }
        }
        info!("Invoice pipeline stopped");
    }

    fn with_senders<T>(
        &self,
        f: impl FnOnce(&Senders) -> Result<T, InvoiceError>,
    ) -> Result<T, InvoiceError> {
        match lock(&self.senders).as_ref() {
            Some(senders) => f(senders),
            None => Err(InvoiceError::PipelineClosed),
        }
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

async fn run_preprocess_worker(
    rx: mpsc::UnboundedReceiver<PreprocessTask>,
    assets: Arc<dyn AssetStore>,
    config: Arc<ExtractionConfig>,
    events: mpsc::UnboundedSender<ConversionCompleted>,
    dispatcher: Dispatcher,
) {
    let concurrency = config.preprocess_concurrency;
    UnboundedReceiverStream::new(rx)
        .for_each_concurrent(concurrency, |task| {
            let assets = Arc::clone(&assets);
            let config = Arc::clone(&config);
            let events = events.clone();
            let dispatcher = dispatcher.clone();
            async move {
                let PreprocessTask { record_id, asset } = task;
                match preprocess_asset(assets.as_ref(), &asset, &config.preprocess).await {
                    Ok(bytes) => {
                        config.observer.on_preprocess_complete(record_id, bytes);
                        let event = ConversionCompleted {
                            conversion_name: VISION_OPTIMIZED.to_string(),
                            collection_name: asset.collection.clone(),
                            record_id,
                        };
                        if events.send(event).is_err() {
                            warn!(record_id = %record_id, "Listener gone; conversion event dropped");
                        }
                    }
                    Err(e) => {
                        warn!(
                            record_id = %record_id,
                            error = %e,
                            "Preprocessing failed; extracting from the original"
                        );
                        config.observer.on_preprocess_failed(record_id, &e.to_string());
                        if let Err(e) = dispatcher.dispatch(record_id) {
                            warn!(record_id = %record_id, error = %e, "Fallback dispatch failed");
                        }
                    }
                }
            }
        })
        .await;
    debug!("Preprocess worker drained");
}

async fn run_listener(mut rx: mpsc::UnboundedReceiver<ConversionCompleted>, dispatcher: Dispatcher) {
    while let Some(event) = rx.recv().await {
        if !event.triggers_extraction() {
            debug!(
                record_id = %event.record_id,
                conversion = %event.conversion_name,
                collection = %event.collection_name,
                "Ignoring conversion event"
            );
            continue;
        }
        if let Err(e) = dispatcher.dispatch(event.record_id) {
            warn!(record_id = %event.record_id, error = %e, "Dispatch failed");
        }
    }
    debug!("Conversion listener drained");
}

async fn run_extraction_worker(
    rx: mpsc::UnboundedReceiver<Uuid>,
    job: ExtractionJob,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    concurrency: usize,
) {
    UnboundedReceiverStream::new(rx)
        .for_each_concurrent(concurrency, |record_id| {
            let job = job.clone();
            let in_flight = Arc::clone(&in_flight);
            async move {
                job.run(record_id).await;
                lock(&in_flight).remove(&record_id);
            }
        })
        .await;
    debug!("Extraction worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mime: &str, bytes: Vec<u8>) -> UploadRequest {
        UploadRequest {
            filename: "receipt.png".into(),
            mime: mime.into(),
            bytes,
            user_id: 1,
            team_id: None,
        }
    }

    #[test]
    fn upload_validation() {
        assert_eq!(
            request("image/png", vec![]).validate(10),
            Err(UploadError::Empty)
        );
        assert_eq!(
            request("image/webp", vec![0; 4]).validate(10),
            Err(UploadError::UnsupportedType {
                mime: "image/webp".into()
            })
        );
        assert_eq!(
            request("application/pdf", vec![0; 11]).validate(10),
            Err(UploadError::TooLarge {
                size: 11,
                max_bytes: 10
            })
        );
        for mime in ACCEPTED_MIME_TYPES {
            assert!(request(mime, vec![0; 10]).validate(10).is_ok());
        }
    }

    #[test]
    fn only_vision_optimized_invoice_conversions_trigger() {
        let event = |conversion: &str, collection: &str| ConversionCompleted {
            conversion_name: conversion.into(),
            collection_name: collection.into(),
            record_id: Uuid::new_v4(),
        };
        assert!(event(VISION_OPTIMIZED, INVOICES_COLLECTION).triggers_extraction());
        assert!(!event("thumbnail", INVOICES_COLLECTION).triggers_extraction());
        assert!(!event(VISION_OPTIMIZED, "avatars").triggers_extraction());
    }

    #[tokio::test]
    async fn dispatcher_collapses_duplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        let id = Uuid::new_v4();

        assert!(dispatcher.dispatch(id).unwrap());
        assert!(!dispatcher.dispatch(id).unwrap());
        assert_eq!(rx.recv().await, Some(id));
        assert!(rx.try_recv().is_err());

        lock(&dispatcher.in_flight).remove(&id);
        assert!(dispatcher.dispatch(id).unwrap());
    }

    #[tokio::test]
    async fn dispatch_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let dispatcher = Dispatcher {
            tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        let id = Uuid::new_v4();
        assert!(matches!(
            dispatcher.dispatch(id),
            Err(InvoiceError::PipelineClosed)
        ));
        assert!(lock(&dispatcher.in_flight).is_empty());
    }
}
