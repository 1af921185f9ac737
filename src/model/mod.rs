//! The `ModelClient` interface and its three adapters.
//!
//! Each adapter owns request shaping, transport, and usage extraction for
//! one backend. Adapters are stateless: conversation trimming is the
//! router's job, not the adapter's. None of the adapters retry; the
//! router owns retry/fallback policy.

pub mod advisor;
pub mod roaster;
pub mod types;
pub mod utility;

use async_trait::async_trait;

use crate::error::Result;
pub use types::{ChatMessage, ChatRole, ModelId, ModelInvocation, ModelResult, PriceRow, PriceTable};

/// Common contract implemented by the Roaster, Advisor, and Utility
/// adapters. A timeout or transport failure surfaces as `Err` carrying a
/// closed [`crate::error::Error`] kind; the adapter never retries.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_id(&self) -> ModelId;

    async fn invoke(&self, invocation: ModelInvocation) -> Result<ModelResult>;
}

pub use advisor::AdvisorAdapter;
pub use roaster::RoasterAdapter;
pub use utility::UtilityAdapter;

/// Build an HTTP client with the adapter's per-call timeout. Connection
/// pooling and proxy configuration are left to `reqwest`'s defaults.
pub(crate) fn build_http_client(timeout: std::time::Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Extract a JSON object from a response that may wrap it in a markdown
/// code fence (```json ... ``` or ``` ... ```), or return it raw.
pub(crate) fn extract_json_block(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let content_start = start + 7;
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }
    if let Some(start) = response.find("```") {
        let content_start = start + 3;
        let content_start = response[content_start..]
            .find('\n')
            .map(|i| content_start + i + 1)
            .unwrap_or(content_start);
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return &response[start..=end];
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_block_handles_fenced_json() {
        let raw = "here you go:\n```json\n{\"intent\":\"roast\"}\n```\nthanks";
        assert_eq!(extract_json_block(raw), "{\"intent\":\"roast\"}");
    }

    #[test]
    fn extract_json_block_handles_generic_fence() {
        let raw = "```\n{\"intent\":\"advice\"}\n```";
        assert_eq!(extract_json_block(raw), "{\"intent\":\"advice\"}");
    }

    #[test]
    fn extract_json_block_handles_raw_json() {
        let raw = "sure, {\"intent\":\"general\"} there you go";
        assert_eq!(extract_json_block(raw), "{\"intent\":\"general\"}");
    }
}
