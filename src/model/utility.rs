//! Utility adapter: cheapest path, strict JSON outputs. Gemini-shaped
//! wire format, API-key query-parameter auth. Also implements the
//! classifier RPC and transaction categorization.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

use super::{build_http_client, extract_json_block, ModelClient, ModelId, ModelInvocation, ModelResult};

const DEFAULT_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/utility-flash:generateContent";
const MAX_TEMPERATURE: f64 = 0.1;
const MAX_CATEGORIZE_BATCH: usize = 20;

const CLASSIFIER_SYSTEM_PREFIX: &str = "Classify the user's message into exactly one of: \
roast, advice, categorize, sensitive, receipt, general. Respond with strict JSON only: \
{\"intent\": <label>, \"confidence\": <0..1>, \"reasoning\": <short string, optional>}.";

const CATEGORIZE_SYSTEM_PREFIX: &str = "Categorize the given transaction(s) into a short \
merchant-category label. Respond with strict JSON only.";

/// System prefix used when the router dispatches a `Categorize` or
/// `Receipt` intent through the generic [`ModelClient::invoke`] path
/// rather than one of the dedicated task methods below (e.g. a chat
/// message about a receipt that isn't a bare transaction description).
pub const CHAT_SYSTEM_PREFIX: &str = "You are the cheapest-tier assistant for a personal \
finance app, used for transaction categorization and receipt questions. Be brief and plain.";

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct Request {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct Response {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "cachedContentTokenCount", default)]
    cached_content_token_count: u64,
}

/// Strict JSON returned by the classifier task.
#[derive(Deserialize)]
pub struct ClassifyResult {
    pub intent: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// Token usage for one Utility call, surfaced alongside a task method's
/// parsed result so callers (the intent classifier, in particular) can
/// bill it through the [`crate::accountant::UsageAccountant`] themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdapterUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
}

impl From<UsageMetadata> for AdapterUsage {
    fn from(u: UsageMetadata) -> Self {
        Self {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            cached_input_tokens: u.cached_content_token_count,
        }
    }
}

/// Strict JSON returned by the single-transaction categorization task.
#[derive(Deserialize)]
pub struct CategorizeResult {
    pub category: String,
}

pub struct UtilityAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl UtilityAdapter {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: build_http_client(config.timeout),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: config.api_key.clone(),
        }
    }

    #[cfg(test)]
    pub fn unreachable_for_tests() -> Self {
        Self {
            client: build_http_client(std::time::Duration::from_millis(50)),
            base_url: "http://127.0.0.1:0/unreachable".to_string(),
            api_key: String::new(),
        }
    }

    async fn call(&self, system_prefix: &str, payload: &str, max_output_tokens: u32) -> Result<(String, Option<UsageMetadata>)> {
        let prompt = format!("{system_prefix}\n\n{payload}");
        let body = Request {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: MAX_TEMPERATURE,
                max_output_tokens,
            },
        };

        let url = format!("{}?key={}", self.base_url, self.api_key);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status_error(status, detail));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| Error::model_transient("utility", format!("invalid response body: {e}")))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::model_transient("utility", "empty candidates array"))?;
        let text = candidate
            .content
            .parts
            .into_iter()
            .next()
            .map(|p| p.text)
            .unwrap_or_default();

        Ok((text, parsed.usage_metadata))
    }

    /// Task (a): intent classification. On JSON-parse failure, the
    /// classifier falls back to `(General, 0.5)` — the caller
    /// ([`crate::intent::IntentClassifier`]) applies that rule itself, so
    /// this just surfaces the parse error. Usage is returned alongside
    /// the parsed result so the caller can bill this call itself.
    pub async fn classify_intent(&self, message: &str) -> Result<(ClassifyResult, AdapterUsage)> {
        let (text, usage) = self.call(CLASSIFIER_SYSTEM_PREFIX, message, 150).await?;
        let json = extract_json_block(&text);
        let parsed = serde_json::from_str(json)
            .map_err(|e| Error::model_transient("utility", format!("unparseable classifier json: {e}")))?;
        Ok((parsed, usage.unwrap_or_default().into()))
    }

    /// Task (b): single-transaction categorization.
    pub async fn categorize_transaction(&self, description: &str) -> Result<CategorizeResult> {
        let (text, _usage) = self.call(CATEGORIZE_SYSTEM_PREFIX, description, 100).await?;
        let json = extract_json_block(&text);
        serde_json::from_str(json)
            .map_err(|e| Error::model_transient("utility", format!("unparseable categorize json: {e}")))
    }

    /// Task (c): batch transaction categorization, capped at
    /// [`MAX_CATEGORIZE_BATCH`] items per request.
    pub async fn categorize_batch(&self, descriptions: &[String]) -> Result<Vec<CategorizeResult>> {
        if descriptions.len() > MAX_CATEGORIZE_BATCH {
            return Err(Error::internal(format!(
                "batch categorize accepts at most {MAX_CATEGORIZE_BATCH} items, got {}",
                descriptions.len()
            )));
        }
        let payload = descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| format!("{i}. {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        let (text, _usage) = self.call(CATEGORIZE_SYSTEM_PREFIX, &payload, 500).await?;
        let json = extract_json_block(&text);
        serde_json::from_str(json)
            .map_err(|e| Error::model_transient("utility", format!("unparseable batch categorize json: {e}")))
    }
}

#[async_trait]
impl ModelClient for UtilityAdapter {
    fn model_id(&self) -> ModelId {
        ModelId::Utility
    }

    async fn invoke(&self, invocation: ModelInvocation) -> Result<ModelResult> {
        let started = Instant::now();
        let (text, usage) = self
            .call(
                &invocation.system_prefix,
                &invocation.user_message,
                invocation.max_output_tokens,
            )
            .await?;

        let usage = usage.unwrap_or_default();
        Ok(ModelResult {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            cached_input_tokens: usage.cached_content_token_count,
            wall_clock_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout("utility", 0)
    } else {
        Error::model_transient("utility", e.to_string())
    }
}

fn classify_status_error(status: reqwest::StatusCode, detail: String) -> Error {
    if status.is_server_error() || status.as_u16() == 429 {
        Error::model_transient("utility", format!("{status}: {detail}"))
    } else {
        Error::model_permanent("utility", format!("{status}: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classify_intent_against_unreachable_backend_fails() {
        let adapter = UtilityAdapter::unreachable_for_tests();
        let err = adapter.classify_intent("hello").await.unwrap_err();
        assert!(err.is_model_failure());
    }

    #[tokio::test]
    async fn categorize_batch_rejects_oversized_batches() {
        let adapter = UtilityAdapter::unreachable_for_tests();
        let items: Vec<String> = (0..21).map(|i| format!("item {i}")).collect();
        let err = adapter.categorize_batch(&items).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn classify_result_defaults_confidence_when_absent() {
        let parsed: ClassifyResult = serde_json::from_str("{\"intent\":\"advice\"}").unwrap();
        assert_eq!(parsed.confidence, 0.5);
    }
}
