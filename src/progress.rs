//! Observer trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::ExtractionConfigBuilder::observer`] to receive events as
//! documents move through preprocessing and extraction. Forward them to a
//! broadcast channel, a websocket, a terminal spinner, or a metrics sink; the
//! library does not care.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{ExtractionConfig, JobOutcome, PipelineObserver};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use uuid::Uuid;
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineObserver for Counter {
//!     fn on_extraction_complete(&self, _record_id: Uuid, _outcome: &JobOutcome) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .observer(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::job::JobOutcome;
use crate::record::Rendition;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the pipeline as each document progresses.
///
/// Workers run concurrently, so methods may be called from several threads at
/// once. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// A record was created for an accepted upload.
    fn on_upload(&self, record_id: Uuid, filename: &str) {
        let _ = (record_id, filename);
    }

    /// The vision-optimized rendition was written.
    ///
    /// * `bytes`: size of the PNG conversion
    fn on_preprocess_complete(&self, record_id: Uuid, bytes: usize) {
        let _ = (record_id, bytes);
    }

    /// Preprocessing failed; extraction will fall back to the original.
    fn on_preprocess_failed(&self, record_id: Uuid, error: &str) {
        let _ = (record_id, error);
    }

    /// The model request is about to be sent.
    fn on_extraction_start(&self, record_id: Uuid, rendition: Rendition) {
        let _ = (record_id, rendition);
    }

    /// An extraction job finished, whatever the outcome.
    fn on_extraction_complete(&self, record_id: Uuid, outcome: &JobOutcome) {
        let _ = (record_id, outcome);
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Shared observer handle as stored in [`crate::config::ExtractionConfig`].
pub type ObserverHandle = Arc<dyn PipelineObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::{AbortReason, NoInvoiceReason};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl PipelineObserver for Recording {
        fn on_upload(&self, _record_id: Uuid, filename: &str) {
            self.events.lock().unwrap().push(format!("upload {filename}"));
        }

        fn on_preprocess_failed(&self, _record_id: Uuid, error: &str) {
            self.events.lock().unwrap().push(format!("preprocess failed: {error}"));
        }

        fn on_extraction_start(&self, _record_id: Uuid, rendition: Rendition) {
            self.events.lock().unwrap().push(format!("start {rendition}"));
        }

        fn on_extraction_complete(&self, _record_id: Uuid, outcome: &JobOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {:?}", outcome.status()));
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs = NoopObserver;
        let id = Uuid::new_v4();
        obs.on_upload(id, "a.png");
        obs.on_preprocess_complete(id, 1024);
        obs.on_preprocess_failed(id, "decode");
        obs.on_extraction_start(id, Rendition::Original);
        obs.on_extraction_complete(id, &JobOutcome::Aborted(AbortReason::MissingAsset));
    }

    #[test]
    fn recording_observer_sees_events_in_order() {
        let obs = Recording::default();
        let id = Uuid::new_v4();
        obs.on_upload(id, "receipt.jpg");
        obs.on_preprocess_failed(id, "bad header");
        obs.on_extraction_start(id, Rendition::Original);
        obs.on_extraction_complete(id, &JobOutcome::NoInvoice(NoInvoiceReason::ProviderFailure));

        let events = obs.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                "upload receipt.jpg".to_string(),
                "preprocess failed: bad header".to_string(),
                "start original".to_string(),
                "done Some(NoInvoice)".to_string(),
            ]
        );
    }

    #[test]
    fn arc_dyn_observer_works() {
        let obs: ObserverHandle = Arc::new(NoopObserver);
        obs.on_preprocess_complete(Uuid::new_v4(), 10);
    }
}
