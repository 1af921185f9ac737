//! Advisor adapter: nuanced, policy-safe advice. Anthropic-shaped wire
//! format — a split `system` array with an optional cache-control hint on
//! the stable policy block — Bearer auth.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

use super::{build_http_client, ChatRole, ModelClient, ModelId, ModelInvocation, ModelResult};

const DEFAULT_BASE_URL: &str = "https://api.advisor.internal/v1/messages";
const MAX_TEMPERATURE: f64 = 0.5;
const MIN_TEMPERATURE: f64 = 0.3;
const MAX_OUTPUT_TOKENS: u32 = 1000;
/// Trailing conversation window: at most this many prior messages.
pub const CONVERSATION_WINDOW: usize = 10;

/// The never-varying policy block. Cacheable, so it is always marked with
/// an ephemeral cache-control hint.
pub const POLICY_BLOCK: &str = "You are FURG, a financial AI advisor with expertise in \
personal finance. Provide thoughtful, nuanced financial advice. Be specific with numbers, \
weigh pros and cons objectively, never shame users for past decisions, and suggest \
professional help for complex tax or investment situations.";

#[derive(Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    system: Vec<SystemBlock>,
    messages: Vec<Message>,
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
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct AdvisorAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AdvisorAdapter {
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
impl ModelClient for AdvisorAdapter {
    fn model_id(&self) -> ModelId {
        ModelId::Advisor
    }

    async fn invoke(&self, invocation: ModelInvocation) -> Result<ModelResult> {
        let started = Instant::now();

        let system = vec![
            SystemBlock {
                kind: "text",
                text: invocation.system_prefix.clone(),
                cache_control: Some(CacheControl { kind: "ephemeral" }),
            },
            SystemBlock {
                kind: "text",
                text: invocation.dynamic_context_block.clone(),
                cache_control: None,
            },
        ];

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
            model: "advisor-flagship",
            system,
            messages,
            max_tokens: invocation.max_output_tokens.min(MAX_OUTPUT_TOKENS),
            temperature: invocation.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE),
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&raw)
                .map(|b| b.error.message)
                .unwrap_or(raw);
            return Err(classify_status_error(status, detail));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| Error::model_transient("advisor", format!("invalid response body: {e}")))?;

        let text = parsed
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(Error::model_transient("advisor", "empty content blocks"));
        }

        Ok(ModelResult {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cached_input_tokens: parsed.usage.cache_read_input_tokens,
            wall_clock_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout("advisor", 0)
    } else {
        Error::model_transient("advisor", e.to_string())
    }
}

fn classify_status_error(status: reqwest::StatusCode, detail: String) -> Error {
    if status.is_server_error() || status.as_u16() == 429 {
        Error::model_transient("advisor", format!("{status}: {detail}"))
    } else {
        Error::model_permanent("advisor", format!("{status}: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_block_is_nonempty_and_stable() {
        assert!(POLICY_BLOCK.contains("FURG"));
    }

    #[tokio::test]
    async fn invoke_against_unreachable_backend_is_a_model_failure() {
        let adapter = AdvisorAdapter::unreachable_for_tests();
        let invocation = ModelInvocation {
            system_prefix: POLICY_BLOCK.to_string(),
            dynamic_context_block: "balance=$100".to_string(),
            history: vec![],
            user_message: "is it worth buying this $800 chair?".to_string(),
            max_output_tokens: 500,
            temperature: 0.4,
        };
        let err = adapter.invoke(invocation).await.unwrap_err();
        assert!(err.is_model_failure());
    }
}
