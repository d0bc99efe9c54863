//! Model invocation: one image + schema + prompt in, one JSON object out.
//!
//! [`StructuredExtractor`] is the seam between the extraction job and the
//! provider. [`LlmExtractor`] implements it over any `edgequake-llm`
//! provider; tests script their own.
//!
//! ## Message layout
//!
//! 1. **System message**: [`schema_instruction`]: answer with exactly one
//!    JSON object conforming to the rendered schema.
//! 2. **User message**: the extraction prompt with the invoice image attached.
//!
//! The schema travels as an instruction rather than a provider-enforced
//! structured-output mode, so nullable and missing fields are tolerated and
//! every provider behind `edgequake-llm` can serve the request. The reply is
//! fence-stripped and parsed as a JSON object here; mapping it onto a record
//! is the reconciler's job.
//!
//! There is no retry. A failed call leaves a `no_invoice` record and a
//! stuck one waits for an external re-trigger.

use crate::config::ExtractionConfig;
use crate::error::{InvoiceError, InvokeError};
use crate::pipeline::postprocess::json_payload;
use crate::prompts::schema_instruction;
use crate::schema::ExtractionSchema;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything one extraction call needs.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub image: ImageData,
    pub prompt: String,
    pub schema: ExtractionSchema,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

/// Token usage reported by the provider. `None` when not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// A successfully parsed structured payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResponse {
    pub fields: Map<String, Value>,
    pub usage: Usage,
    pub model: String,
}

/// A structured-extraction backend.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    /// Send one request. Implementations need not enforce `request.timeout`;
    /// [`invoke`] does.
    async fn extract(&self, request: ExtractionRequest) -> Result<StructuredResponse, InvokeError>;

    /// Model identifier recorded in telemetry.
    fn model(&self) -> &str;
}

/// Call `extractor` under the request timeout.
pub async fn invoke(
    extractor: &dyn StructuredExtractor,
    request: ExtractionRequest,
) -> Result<StructuredResponse, InvokeError> {
    let timeout = request.timeout;
    let start = Instant::now();

    match tokio::time::timeout(timeout, extractor.extract(request)).await {
        Ok(Ok(response)) => {
            debug!(
                model = %response.model,
                prompt_tokens = ?response.usage.prompt_tokens,
                completion_tokens = ?response.usage.completion_tokens,
                fields = response.fields.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Extraction call returned"
            );
            Ok(response)
        }
        Ok(Err(e)) => {
            warn!(model = extractor.model(), error = %e, "Extraction call failed");
            Err(e)
        }
        Err(_) => {
            let secs = timeout.as_secs().max(1);
            warn!(model = extractor.model(), secs, "Extraction call timed out");
            Err(InvokeError::Timeout { secs })
        }
    }
}

/// Read a raw model reply as a JSON object.
///
/// Blank replies and `{}` are [`InvokeError::EmptyResponse`]; anything that
/// is not a JSON object is [`InvokeError::Malformed`].
pub fn parse_payload(content: &str) -> Result<Map<String, Value>, InvokeError> {
    if content.trim().is_empty() {
        return Err(InvokeError::EmptyResponse);
    }
    let text = json_payload(content).ok_or_else(|| InvokeError::Malformed {
        detail: "no JSON object in response".to_string(),
    })?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) if map.is_empty() => Err(InvokeError::EmptyResponse),
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(InvokeError::Malformed {
            detail: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(InvokeError::Malformed {
            detail: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── edgequake-llm backend ────────────────────────────────────────────────

/// [`StructuredExtractor`] over an `edgequake-llm` provider.
pub struct LlmExtractor {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl std::fmt::Debug for LlmExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmExtractor")
            .field("provider", &"<dyn LLMProvider>")
            .field("model", &self.model)
            .finish()
    }
}

impl LlmExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Resolve the provider named by `config` (see [`resolve_provider`]).
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, InvoiceError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config.model_name()))
    }
}

#[async_trait]
impl StructuredExtractor for LlmExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<StructuredResponse, InvokeError> {
        let options = build_options(&request);
        let messages = build_messages(request);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| InvokeError::Provider {
                message: e.to_string(),
            })?;

        let fields = parse_payload(&response.content)?;
        let prompt = response.prompt_tokens as u64;
        let completion = response.completion_tokens as u64;

        Ok(StructuredResponse {
            fields,
            usage: Usage {
                prompt_tokens: (prompt > 0).then(|| u32::try_from(prompt).unwrap_or(u32::MAX)),
                completion_tokens: (completion > 0)
                    .then(|| u32::try_from(completion).unwrap_or(u32::MAX)),
            },
            model: self.model.clone(),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn build_messages(request: ExtractionRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(schema_instruction(&request.schema)),
        ChatMessage::user_with_images(request.prompt, vec![request.image]),
    ]
}

fn build_options(request: &ExtractionRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        ..Default::default()
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        InvoiceError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`).
/// 2. **Named provider** (`config.provider_name`) with `config.model_name()`.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both non-empty.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, config.model_name());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_vision_provider("openai", config.model_name());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| InvoiceError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
