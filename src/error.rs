//! Closed error taxonomy for furg-core.
//!
//! Every outward-facing failure is one of a small number of kinds (see
//! module docs on [`Error`]); no variant carries backend-specific text
//! beyond a short human-readable detail. The three budget kinds and
//! `Cancelled` are the only kinds the [`crate::router::Router`] surfaces
//! to its caller as `Err` — everything else (model failures, classifier
//! degradation, cache misses) is recovered locally and only logged.

use thiserror::Error;

/// Result type alias using furg-core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing and accounting for a request.
///
/// The three `*BudgetExceeded`/`RateExceeded` variants and `Cancelled` are
/// the only ones a caller of [`crate::router::Router::dispatch`] ever
/// observes as a hard failure. `ModelTransient`/`ModelPermanent`/`Timeout`
/// are produced by adapters and consumed by the router, which turns them
/// into a synthetic fallback response rather than propagating them
/// further.
#[derive(Error, Debug)]
pub enum Error {
    /// Per-user or per-IP request rate exceeded (BudgetGuard).
    #[error("rate exceeded: {detail}")]
    RateExceeded { detail: String },

    /// Per-user daily token ceiling exceeded (BudgetGuard).
    #[error("token budget exceeded: {detail}")]
    TokenBudgetExceeded { detail: String },

    /// Per-user daily cost ceiling exceeded (BudgetGuard).
    #[error("cost budget exceeded: {detail}")]
    CostBudgetExceeded { detail: String },

    /// A model backend call failed in a way expected to be transient
    /// (network error, 5xx, timeout, quota). The router treats this as a
    /// signal to fall back, not as a caller-visible failure.
    #[error("model '{model}' transient failure: {detail}")]
    ModelTransient { model: String, detail: String },

    /// A model backend call failed with a non-quota 4xx. Handled
    /// identically to `ModelTransient` by the router, logged louder.
    #[error("model '{model}' permanent failure: {detail}")]
    ModelPermanent { model: String, detail: String },

    /// A model call exceeded its per-call wall-clock deadline.
    #[error("model '{model}' timed out after {duration_ms}ms")]
    Timeout { model: String, duration_ms: u64 },

    /// The request's cancellation signal fired before a suspension point
    /// returned. Surfaced to the caller as `Err`, distinct from the three
    /// budget kinds: the caller already knows it cancelled and has no use
    /// for a billed synthetic response.
    #[error("request cancelled: {detail}")]
    Cancelled { detail: String },

    /// Configuration could not be parsed from the environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to a model backend.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not deserialize into the expected wire shape.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that does not fit the closed taxonomy above. Used
    /// sparingly, for invariant violations rather than expected failure
    /// modes.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn rate_exceeded(detail: impl Into<String>) -> Self {
        Self::RateExceeded {
            detail: detail.into(),
        }
    }

    pub fn token_budget_exceeded(detail: impl Into<String>) -> Self {
        Self::TokenBudgetExceeded {
            detail: detail.into(),
        }
    }

    pub fn cost_budget_exceeded(detail: impl Into<String>) -> Self {
        Self::CostBudgetExceeded {
            detail: detail.into(),
        }
    }

    pub fn model_transient(model: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ModelTransient {
            model: model.into(),
            detail: detail.into(),
        }
    }

    pub fn model_permanent(model: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ModelPermanent {
            model: model.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(model: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            model: model.into(),
            duration_ms,
        }
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::Cancelled {
            detail: detail.into(),
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// True for the three kinds BudgetGuard produces — the only kinds the
    /// router ever returns as a hard failure to its caller.
    pub fn is_budget_refusal(&self) -> bool {
        matches!(
            self,
            Self::RateExceeded { .. } | Self::TokenBudgetExceeded { .. } | Self::CostBudgetExceeded { .. }
        )
    }

    /// True for adapter failures the router recovers from via the
    /// synthetic fallback rather than surfacing to the caller.
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelTransient { .. } | Self::ModelPermanent { .. } | Self::Timeout { .. }
        )
    }

    /// True when the request's cancellation signal fired. The router
    /// propagates this as `Err` rather than degrading to a fallback
    /// response, unlike a genuine model failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_refusal_classification() {
        assert!(Error::rate_exceeded("too fast").is_budget_refusal());
        assert!(Error::token_budget_exceeded("over").is_budget_refusal());
        assert!(Error::cost_budget_exceeded("over").is_budget_refusal());
        assert!(!Error::internal("oops").is_budget_refusal());
    }

    #[test]
    fn model_failure_classification() {
        assert!(Error::model_transient("roaster", "timeout").is_model_failure());
        assert!(Error::model_permanent("advisor", "400").is_model_failure());
        assert!(Error::timeout("utility", 30_000).is_model_failure());
        assert!(!Error::config("bad").is_model_failure());
    }
}
