//! Single-document extraction.
//!
//! ```text
//! Document ──▶ CompletionClient::complete ──▶ decode ──┬─▶ ExtractedInvoice
//!                    ▲                                 │
//!                    └── one continuation if truncated ┘
//! ```
//!
//! [`CompletionClient`] is the one place a model is called. The production
//! client wraps an `edgequake-llm` provider; tests plug in a scripted fake.
//! [`LlmExtractor`] owns the prompt choice, the retry policy and the
//! truncation recovery, and returns per-document [`DocumentError`]s.

use crate::codec::compact::PartialInvoice;
use crate::codec::{json, ExtractedInvoice};
use crate::config::{ExtractionMode, PipelineConfig};
use crate::document::Document;
use crate::error::{DocumentError, PipelineError, ServiceError};
use crate::prompts::{continuation_prompt, COMPACT_EXTRACTION_PROMPT, JSON_EXTRACTION_PROMPT};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One model answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Generation stopped at the output token cap.
    pub truncated: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A model that reads an optional PDF and answers with text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user_text: &str,
        pdf: Option<&[u8]>,
    ) -> Result<Completion, ServiceError>;
}

/// [`CompletionClient`] over an `edgequake-llm` provider.
pub struct LlmCompletionClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    max_tokens: usize,
}

impl LlmCompletionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
            max_tokens,
        }
    }

    /// Resolve the provider from the configuration, then the environment.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let temperature = match config.extraction_mode {
            ExtractionMode::Json => 0.0,
            ExtractionMode::Compact => config.temperature,
        };
        Ok(Self::new(
            resolve_provider(config)?,
            temperature,
            config.max_tokens,
        ))
    }
}

#[async_trait]
impl CompletionClient for LlmCompletionClient {
    async fn complete(
        &self,
        system: &str,
        user_text: &str,
        pdf: Option<&[u8]>,
    ) -> Result<Completion, ServiceError> {
        let mut messages = vec![ChatMessage::system(system)];
        match pdf {
            Some(bytes) => messages.push(ChatMessage::user_with_images(
                user_text,
                vec![ImageData::new(STANDARD.encode(bytes), "application/pdf")],
            )),
            None => messages.push(ChatMessage::user_with_images(user_text, Vec::new())),
        }

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ServiceError::from_message("llm", &e.to_string()))?;

        Ok(Completion {
            truncated: response.completion_tokens >= self.max_tokens,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
            text: response.content,
        })
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
/// pre-built provider, named provider, `EDGEQUAKE_LLM_PROVIDER` plus
/// `EDGEQUAKE_MODEL`, then auto-detection from API key variables.
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let default_model = config.model.as_deref().unwrap_or("gemini-2.5-flash");
    if let Some(ref name) = config.provider_name {
        return create_provider(name, default_model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if std::env::var("GEMINI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("gemini", default_model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY, or configure a provider.\n\
                Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

/// Parse model text in whichever encoding it arrived in.
pub fn parse_text(text: &str) -> PartialInvoice {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with("```json") {
        match json::parse(text) {
            Ok(partial) => return partial,
            Err(e) => debug!(error = %e, "Not a JSON extraction, trying line protocol"),
        }
    }
    PartialInvoice::parse(text)
}

/// Promote a parsed response, naming what is missing when it cannot be.
pub fn finish_extraction(partial: PartialInvoice) -> Result<ExtractedInvoice, DocumentError> {
    if partial.is_empty() {
        return Err(DocumentError::EmptyExtraction);
    }
    let missing = partial.missing_fields();
    partial.finish().ok_or_else(|| DocumentError::Parsing {
        detail: format!("missing {}", missing.join(", ")),
    })
}

/// Extracts one document into an invoice.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, document: &Document) -> Result<ExtractedInvoice, DocumentError>;
}

/// [`DocumentExtractor`] over a [`CompletionClient`], with truncation
/// recovery in compact mode.
pub struct LlmExtractor {
    client: Arc<dyn CompletionClient>,
    mode: ExtractionMode,
    system_prompt: Option<String>,
    retry: RetryPolicy,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, mode: ExtractionMode, retry: RetryPolicy) -> Self {
        Self {
            client,
            mode,
            system_prompt: None,
            retry,
        }
    }

    pub fn from_config(
        client: Arc<dyn CompletionClient>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            client,
            mode: config.extraction_mode,
            system_prompt: config.system_prompt.clone(),
            retry: RetryPolicy::from_config(config),
        }
    }

    fn system_prompt(&self) -> &str {
        match (&self.system_prompt, self.mode) {
            (Some(custom), _) => custom,
            (None, ExtractionMode::Compact) => COMPACT_EXTRACTION_PROMPT,
            (None, ExtractionMode::Json) => JSON_EXTRACTION_PROMPT,
        }
    }

    async fn call(
        &self,
        document: &Document,
        user_text: &str,
    ) -> Result<Completion, DocumentError> {
        let system = self.system_prompt();
        self.retry
            .run(
                "extract",
                || self.client.complete(system, user_text, Some(&document.bytes)),
                ServiceError::class,
            )
            .await
            .map_err(|e| DocumentError::from_service(&e.error, e.attempts.saturating_sub(1)))
    }
}

#[async_trait]
impl DocumentExtractor for LlmExtractor {
    async fn extract(&self, document: &Document) -> Result<ExtractedInvoice, DocumentError> {
        let start = Instant::now();
        let first = self.call(document, "").await?;
        debug!(
            document = %document.key,
            input_tokens = first.input_tokens,
            output_tokens = first.output_tokens,
            truncated = first.truncated,
            "Extraction response"
        );

        let partial = match self.mode {
            ExtractionMode::Json => {
                if first.truncated {
                    warn!(document = %document.key, "JSON extraction truncated");
                    return Err(DocumentError::NeedsManualProcessing);
                }
                json::parse(&first.text).map_err(|e| DocumentError::Parsing {
                    detail: e.to_string(),
                })?
            }
            ExtractionMode::Compact => {
                let mut partial = PartialInvoice::parse(&first.text);
                if first.truncated {
                    let next = partial.last_line_number().saturating_add(1);
                    warn!(
                        document = %document.key,
                        next_line = next,
                        "Extraction truncated, requesting continuation"
                    );
                    let prompt = continuation_prompt(&first.text, next);
                    let cont = self.call(document, &prompt).await.map_err(|e| {
                        warn!(document = %document.key, error = %e, "Continuation failed");
                        DocumentError::NeedsManualProcessing
                    })?;
                    if cont.truncated {
                        warn!(document = %document.key, "Continuation truncated as well");
                        return Err(DocumentError::NeedsManualProcessing);
                    }
                    let added = partial.merge_continuation(PartialInvoice::parse(&cont.text));
                    debug!(document = %document.key, added, "Merged continuation");
                }
                partial
            }
        };

        let invoice = finish_extraction(partial)?;
        info!(
            document = %document.key,
            invoice = %invoice.invoice_code,
            items = invoice.items.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Extracted invoice"
        );
        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Scripted {
        answers: Mutex<VecDeque<Result<Completion, ServiceError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<Completion, ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(
            &self,
            _system: &str,
            user_text: &str,
            _pdf: Option<&[u8]>,
        ) -> Result<Completion, ServiceError> {
            self.prompts.lock().unwrap().push(user_text.to_string());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Api("script exhausted".into())))
        }
    }

    fn answer(text: &str, truncated: bool) -> Result<Completion, ServiceError> {
        Ok(Completion {
            text: text.to_string(),
            truncated,
            ..Completion::default()
        })
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            rate_limit_base: Duration::from_millis(1),
            rate_limit_cap: Duration::from_millis(2),
            transient_delay: Duration::from_millis(1),
        }
    }

    fn doc() -> Document {
        Document::from_bytes("f.pdf", b"%PDF-1.7".to_vec()).unwrap()
    }

    const HEAD: &str = "HEADER|F-9|2024-05-02|30.00\nPROVIDER|Acme SL|B12345678|~|~|~\n";

    #[tokio::test]
    async fn truncated_response_is_continued_and_merged() {
        let first = format!(
            "{HEAD}ITEM|Tornillo|T1|1|1|10.00|10.00|~|~|~|1\nITEM|Tuerca|T2|1|1|10.00|10.00|~|~|~|2\nITEM|Aran"
        );
        let cont = "ITEM|Tuerca|T2|1|1|10.00|10.00|~|~|~|2\nITEM|Arandela|T3|1|1|10.00|10.00|~|~|~|3\n";
        let client = Scripted::new(vec![answer(&first, true), answer(cont, false)]);
        let extractor = LlmExtractor::new(client.clone(), ExtractionMode::Compact, fast_retry());

        let invoice = extractor.extract(&doc()).await.unwrap();
        let names: Vec<_> = invoice
            .items
            .iter()
            .map(|i| i.material_name.clone().unwrap())
            .collect();
        assert_eq!(names, ["Tornillo", "Tuerca", "Arandela"]);
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("lineNumber 3"));
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let client = Scripted::new(vec![
            Err(ServiceError::RateLimited {
                service: "fake".into(),
                retry_after_secs: None,
            }),
            answer(&format!("{HEAD}ITEM|Tornillo|~|1|2|5.00|10.00|~|~|~|1"), false),
        ]);
        let extractor = LlmExtractor::new(client, ExtractionMode::Compact, fast_retry());
        let invoice = extractor.extract(&doc()).await.unwrap();
        assert_eq!(invoice.invoice_code, "F-9");
    }

    #[tokio::test]
    async fn fatal_errors_surface_as_extraction_errors() {
        let client = Scripted::new(vec![Err(ServiceError::Auth {
            service: "fake".into(),
            detail: "bad key".into(),
        })]);
        let extractor = LlmExtractor::new(client, ExtractionMode::Compact, fast_retry());
        let err = extractor.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, DocumentError::Extraction { retries: 0, .. }));
    }

    #[tokio::test]
    async fn missing_fields_are_named() {
        let client = Scripted::new(vec![answer("HEADER|F-1|~|10.00\n", false)]);
        let extractor = LlmExtractor::new(client, ExtractionMode::Compact, fast_retry());
        match extractor.extract(&doc()).await {
            Err(DocumentError::Parsing { detail }) => {
                assert!(detail.contains("issueDate"));
                assert!(detail.contains("items"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_mode_decodes_legacy_objects() {
        let body = r#"{"invoiceCode":"J-1","issueDate":"2024-01-05","totalAmount":12.5,
            "provider":{"name":"Acme","cif":"B1"},
            "items":[{"materialName":"Cable","quantity":5,"unitPrice":2.5,"lineNumber":1}]}"#;
        let client = Scripted::new(vec![answer(body, false)]);
        let extractor = LlmExtractor::new(client, ExtractionMode::Json, fast_retry());
        let invoice = extractor.extract(&doc()).await.unwrap();
        assert_eq!(invoice.invoice_code, "J-1");
        assert_eq!(invoice.items.len(), 1);
    }

    #[test]
    fn parse_text_detects_encoding() {
        let p = parse_text(r#"{"invoiceCode":"A"}"#);
        assert_eq!(
            p.header.and_then(|h| h.invoice_code).as_deref(),
            Some("A")
        );
        assert!(parse_text("HEADER|A|2024-01-01|1.00").header.is_some());
    }
}
