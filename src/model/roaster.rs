//! Roaster adapter: punchy, short, cheap. OpenAI-shaped wire format,
//! Bearer auth.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

use super::{build_http_client, ChatRole, ModelClient, ModelId, ModelInvocation, ModelResult};

const DEFAULT_BASE_URL: &str = "https://api.roaster.internal/v1/chat/completions";
const TEMPERATURE: f64 = 0.8;
const MAX_OUTPUT_TOKENS: u32 = 500;
/// Trailing conversation window: at most this many prior messages.
pub const CONVERSATION_WINDOW: usize = 6;

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    messages: Vec<Message>,
    system: &'a str,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct Response {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Fixed "personality" system prefix: stable across requests so the
/// backend's own prompt cache recognizes it.
const PERSONALITY_PREFIX: &str = "You are a sharp-tongued but ultimately supportive financial \
roast comedian. Keep it short, funny, and a little mean, but never cruel. Always land on \
something actionable.";

/// The stable personality prefix, for callers (the router) that need to
/// quote it verbatim without duplicating the constant.
pub fn personality_prefix() -> &'static str {
    PERSONALITY_PREFIX
}

/// Format the per-request dynamic-context block appended after the
/// personality prefix.
pub fn format_dynamic_context_block(
    balance: f64,
    hidden_balance: f64,
    todays_spending: f64,
    upcoming_bills_total: f64,
    last_transactions: &[String],
    stress_level: &str,
    intensity_mode: &str,
) -> String {
    let recent = last_transactions
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "balance=${balance:.2} hidden=${hidden_balance:.2} today=${todays_spending:.2} \
upcoming_bills=${upcoming_bills_total:.2} recent=[{recent}] stress={stress_level} \
intensity={intensity_mode}"
    )
}

pub struct RoasterAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RoasterAdapter {
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
}

#[async_trait]
impl ModelClient for RoasterAdapter {
    fn model_id(&self) -> ModelId {
        ModelId::Roaster
    }

    async fn invoke(&self, invocation: ModelInvocation) -> Result<ModelResult> {
        let started = Instant::now();
        let system = format!("{}\n\n{}", invocation.system_prefix, invocation.dynamic_context_block);

        let mut messages: Vec<Message> = invocation
            .history
            .iter()
            .rev()
            .take(CONVERSATION_WINDOW)
            .rev()
            .map(|m| Message {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect();
        messages.push(Message {
            role: "user",
            content: invocation.user_message.clone(),
        });

        let body = Request {
            model: "roaster-fast",
            messages,
            system: &system,
            max_tokens: invocation.max_output_tokens.min(MAX_OUTPUT_TOKENS),
            temperature: invocation.temperature.min(TEMPERATURE).max(0.0),
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("roaster", e))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&raw)
                .map(|b| b.error.message)
                .unwrap_or(raw);
            return Err(classify_status_error("roaster", status, detail));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| Error::model_transient("roaster", format!("invalid response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::model_transient("roaster", "empty choices array"))?;

        Ok(ModelResult {
            text: choice.message.content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            cached_input_tokens: parsed
                .usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            wall_clock_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn classify_transport_error(model: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(model, 0)
    } else {
        Error::model_transient(model, e.to_string())
    }
}

fn classify_status_error(model: &str, status: reqwest::StatusCode, detail: String) -> Error {
    if status.is_server_error() || status.as_u16() == 429 {
        Error::model_transient(model, format!("{status}: {detail}"))
    } else {
        Error::model_permanent(model, format!("{status}: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_context_block_includes_required_fields() {
        let block = format_dynamic_context_block(
            120.0,
            500.0,
            12.5,
            80.0,
            &["coffee $4".to_string(), "rent $1200".to_string()],
            "moderate",
            "insanity",
        );
        assert!(block.contains("balance=$120.00"));
        assert!(block.contains("stress=moderate"));
        assert!(block.contains("intensity=insanity"));
    }

    #[tokio::test]
    async fn invoke_against_unreachable_backend_is_a_model_transient() {
        let adapter = RoasterAdapter::unreachable_for_tests();
        let invocation = ModelInvocation {
            system_prefix: PERSONALITY_PREFIX.to_string(),
            dynamic_context_block: String::new(),
            history: vec![],
            user_message: "hi".to_string(),
            max_output_tokens: 100,
            temperature: 0.8,
        };
        let err = adapter.invoke(invocation).await.unwrap_err();
        assert!(err.is_model_failure());
    }
}
