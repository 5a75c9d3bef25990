//! Model stage: one multimodal request per half-page.
//!
//! The request carries, in order:
//! 1. the operator's instruction prompt,
//! 2. the half-page PDF as an inline `application/pdf` attachment,
//! 3. the OCR HTML framed by [`crate::prompts::ocr_context`].
//!
//! [`GeminiClient`] speaks the Gemini `generateContent` REST API directly.
//! The API key comes from the configuration file and travels in the
//! `x-goog-api-key` header.
//!
//! ## Retry Strategy
//!
//! [`analyze_with_retry`] retries only what [`ModelError::is_retryable`]
//! accepts (transport errors, timeouts, 429, 5xx), waiting
//! `retry_backoff_ms * 2^(attempt-1)`: with 500 ms base and 3 retries the
//! waits are 500 ms → 1 s → 2 s.

use crate::error::ModelError;
use crate::pipeline::encode::{encode_pdf, InlineData};
use crate::prompts::ocr_context;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Longest error body kept in a [`ModelError::Request`].
const MAX_ERROR_DETAIL: usize = 500;

/// Everything the model sees for one half-page.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub pdf_path: &'a Path,
    pub html_text: &'a str,
    pub prompt_text: &'a str,
    pub model_id: &'a str,
}

/// Sends one multimodal request and returns the raw response text.
pub trait ModelClient: Send + Sync {
    fn analyze(
        &self,
        request: &ModelRequest<'_>,
    ) -> impl Future<Output = Result<String, ModelError>> + Send;
}

impl<T: ModelClient> ModelClient for &T {
    fn analyze(
        &self,
        request: &ModelRequest<'_>,
    ) -> impl Future<Output = Result<String, ModelError>> + Send {
        (**self).analyze(request)
    }
}

/// Call `client` with bounded exponential backoff.
///
/// Returns the final result and the number of retries spent.
pub async fn analyze_with_retry<M: ModelClient>(
    client: &M,
    request: &ModelRequest<'_>,
    max_retries: u32,
    retry_backoff_ms: u64,
) -> (Result<String, ModelError>, u32) {
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            let backoff = retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(20));
            warn!(
                "{}: retry {}/{} after {}ms",
                request.pdf_path.display(),
                attempt,
                max_retries,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match client.analyze(request).await {
            Ok(text) => return (Ok(text), attempt),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                warn!(
                    "{}: attempt {} failed: {}",
                    request.pdf_path.display(),
                    attempt + 1,
                    e
                );
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

// ── Gemini wire format ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

/// `gemini-2.5-flash` → `models/gemini-2.5-flash`; prefixed ids pass through.
pub fn normalize_model_id(model_id: &str) -> String {
    let id = model_id.trim();
    if id.starts_with("models/") || id.starts_with("tunedModels/") {
        id.to_string()
    } else {
        format!("models/{id}")
    }
}

fn build_request(
    prompt_text: &str,
    pdf: InlineData,
    html_text: &str,
    temperature: f32,
    max_output_tokens: Option<u32>,
) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts: vec![
                Part::Text {
                    text: prompt_text.to_string(),
                },
                Part::Inline {
                    inline_data: Blob {
                        mime_type: pdf.mime_type,
                        data: pdf.data,
                    },
                },
                Part::Text {
                    text: ocr_context(html_text),
                },
            ],
        }],
        generation_config: GenerationConfig {
            temperature,
            max_output_tokens,
        },
    }
}

/// Concatenated text of the first candidate that has any.
fn response_text(response: GenerateContentResponse) -> Result<String, ModelError> {
    let mut finish_reason = None;
    for candidate in response.candidates {
        let text: String = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text)
                    .collect()
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            return Ok(text);
        }
        finish_reason = finish_reason.or(candidate.finish_reason);
    }

    let reason = response
        .prompt_feedback
        .and_then(|f| f.block_reason)
        .or(finish_reason);
    Err(ModelError::EmptyResponse { reason })
}

fn error_detail(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        let ErrorBody { message, status } = envelope.error;
        match (status, message) {
            (Some(s), Some(m)) => return format!("{s}: {m}"),
            (None, Some(m)) => return m,
            (Some(s), None) => return s,
            (None, None) => {}
        }
    }
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_DETAIL) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

// ── Gemini client ────────────────────────────────────────────────────────

/// [`ModelClient`] for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    temperature: f32,
    max_output_tokens: Option<u32>,
    timeout_secs: u64,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
            temperature: 0.1,
            max_output_tokens: None,
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: Option<u32>) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!(
            "{}/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            normalize_model_id(model_id)
        )
    }

    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ModelError::Request {
                status: e.status().map(|s| s.as_u16()),
                detail: e.to_string(),
            }
        }
    }
}

impl ModelClient for GeminiClient {
    async fn analyze(&self, request: &ModelRequest<'_>) -> Result<String, ModelError> {
        let pdf = encode_pdf(request.pdf_path)
            .await
            .map_err(|e| ModelError::Attachment {
                path: request.pdf_path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let body = build_request(
            request.prompt_text,
            pdf,
            request.html_text,
            self.temperature,
            self.max_output_tokens,
        );

        let url = self.endpoint(request.model_id);
        debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Request {
                status: Some(status.as_u16()),
                detail: error_detail(&text),
            });
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        let text = response_text(parsed)?;
        debug!("{}: {} chars of model output", request.pdf_path.display(), text.len());
        Ok(text)
    }
}
