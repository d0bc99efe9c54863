//! Configuration for the extraction pipeline.
//!
//! Every knob lives in [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]. The same struct drives a one-shot CLI
//! extraction and the long-running [`crate::worker::Pipeline`].

use crate::error::InvoiceError;
use crate::pipeline::preprocess::PreprocessOptions;
use crate::progress::{NoopObserver, ObserverHandle};
use crate::schema::SchemaVariant;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Upload size cap (5 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Configuration for invoice extraction.
///
/// # Example
/// ```rust
/// use edgequake_invoice::{ExtractionConfig, SchemaVariant};
///
/// let config = ExtractionConfig::builder()
///     .model("gpt-4o-mini")
///     .schema_variant(SchemaVariant::Strict)
///     .extraction_concurrency(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Model identifier, e.g. "gpt-4o-mini", "claude-sonnet-4-20250514".
    /// If None, [`DEFAULT_MODEL`] is used.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Extraction must be reproducible: the same receipt should give the same
    /// amounts on every run.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 4096.
    ///
    /// The markdown transcription travels inside the JSON payload, so a dense
    /// receipt needs room for both.
    pub max_tokens: usize,

    /// Per-call timeout for the extraction model in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Which required-field set the schema declares. Default: Lenient.
    pub schema_variant: SchemaVariant,

    /// Image preprocessing parameters for the vision-optimized rendition.
    pub preprocess: PreprocessOptions,

    /// Preprocessing jobs running at once. Default: 2.
    ///
    /// Preprocessing is CPU-bound; keep this near the number of spare cores.
    pub preprocess_concurrency: usize,

    /// Extraction jobs running at once. Default: 4.
    ///
    /// Network-bound. Lower it on `429` rate-limit errors.
    pub extraction_concurrency: usize,

    /// Largest accepted upload in bytes. Default: 5 MiB.
    pub max_upload_bytes: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Pipeline event observer. Default: no-op.
    pub observer: ObserverHandle,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 120,
            schema_variant: SchemaVariant::default(),
            preprocess: PreprocessOptions::default(),
            preprocess_concurrency: 2,
            extraction_concurrency: 4,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            download_timeout_secs: 120,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("schema_variant", &self.schema_variant)
            .field("preprocess", &self.preprocess)
            .field("preprocess_concurrency", &self.preprocess_concurrency)
            .field("extraction_concurrency", &self.extraction_concurrency)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The model identifier in effect.
    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn schema_variant(mut self, variant: SchemaVariant) -> Self {
        self.config.schema_variant = variant;
        self
    }

    pub fn preprocess(mut self, options: PreprocessOptions) -> Self {
        self.config.preprocess = options;
        self
    }

    pub fn preprocess_concurrency(mut self, n: usize) -> Self {
        self.config.preprocess_concurrency = n.max(1);
        self
    }

    pub fn extraction_concurrency(mut self, n: usize) -> Self {
        self.config.extraction_concurrency = n.max(1);
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn observer(mut self, observer: ObserverHandle) -> Self {
        self.config.observer = observer;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, InvoiceError> {
        let c = &self.config;
        if c.api_timeout_secs == 0 {
            return Err(InvoiceError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(InvoiceError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.max_upload_bytes == 0 {
            return Err(InvoiceError::InvalidConfig(
                "max_upload_bytes must be ≥ 1".into(),
            ));
        }
        c.preprocess.validate()?;
        Ok(self.config)
    }
}
