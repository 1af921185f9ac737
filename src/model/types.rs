//! Shared types for the [`crate::model::ModelClient`] interface: the
//! closed model-id enum, invocation/result records, and the price table.

use std::collections::HashMap;

/// The closed set of backends the router can dispatch to, plus the
/// synthetic label used when no backend produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelId {
    Roaster,
    Advisor,
    Utility,
    /// Billed as zero cost; recorded when the router falls back because
    /// the chosen adapter returned a terminal error.
    SyntheticFallback,
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Roaster => "roaster",
            Self::Advisor => "advisor",
            Self::Utility => "utility",
            Self::SyntheticFallback => "synthetic-fallback",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A request to a [`crate::model::ModelClient`]. `cacheable_system_block`
/// is only ever populated for the Advisor adapter, whose backend supports
/// a cache-control hint on part of the system prompt.
#[derive(Clone, Debug)]
pub struct ModelInvocation {
    /// Stable system prefix, concatenated ahead of the per-request block.
    pub system_prefix: String,
    /// Per-request system content that follows the stable prefix and is
    /// never itself cacheable (user-state, dynamic context).
    pub dynamic_context_block: String,
    /// Trailing conversation window, already trimmed to the adapter's
    /// limit by the router.
    pub history: Vec<ChatMessage>,
    pub user_message: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
}

/// The outcome of one successful [`crate::model::ModelClient::invoke`]
/// call. Adapters never retry; a failed call surfaces as `Err` instead.
#[derive(Clone, Debug)]
pub struct ModelResult {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Prefix tokens the backend served from its own prompt cache. Zero
    /// when the backend does not report this.
    pub cached_input_tokens: u64,
    pub wall_clock_ms: u64,
}

impl ModelResult {
    /// `max(0, input_tokens - cached_input_tokens)`, per the cost identity.
    pub fn fresh_input_tokens(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_input_tokens)
    }
}

/// Three per-million-token rates for one model.
#[derive(Clone, Copy, Debug)]
pub struct PriceRow {
    pub fresh_input_per_m: f64,
    pub cached_input_per_m: f64,
    pub output_per_m: f64,
}

/// A closed, loaded-at-startup map from [`ModelId`] to its [`PriceRow`].
/// Updating prices requires a process restart.
#[derive(Clone, Debug)]
pub struct PriceTable {
    rows: HashMap<ModelId, PriceRow>,
}

impl PriceTable {
    pub fn new() -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            ModelId::Roaster,
            PriceRow {
                fresh_input_per_m: 0.20,
                cached_input_per_m: 0.05,
                output_per_m: 0.50,
            },
        );
        rows.insert(
            ModelId::Advisor,
            PriceRow {
                fresh_input_per_m: 3.00,
                cached_input_per_m: 0.30,
                output_per_m: 15.00,
            },
        );
        rows.insert(
            ModelId::Utility,
            PriceRow {
                fresh_input_per_m: 0.075,
                cached_input_per_m: 0.02,
                output_per_m: 0.30,
            },
        );
        rows.insert(
            ModelId::SyntheticFallback,
            PriceRow {
                fresh_input_per_m: 0.0,
                cached_input_per_m: 0.0,
                output_per_m: 0.0,
            },
        );
        Self { rows }
    }

    pub fn row(&self, model: ModelId) -> PriceRow {
        self.rows
            .get(&model)
            .copied()
            .unwrap_or(PriceRow {
                fresh_input_per_m: 0.0,
                cached_input_per_m: 0.0,
                output_per_m: 0.0,
            })
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_input_tokens_saturates_at_zero() {
        let r = ModelResult {
            text: String::new(),
            input_tokens: 10,
            output_tokens: 0,
            cached_input_tokens: 50,
            wall_clock_ms: 0,
        };
        assert_eq!(r.fresh_input_tokens(), 0);
    }

    #[test]
    fn price_table_has_a_row_for_every_real_model() {
        let table = PriceTable::new();
        for model in [ModelId::Roaster, ModelId::Advisor, ModelId::Utility] {
            let row = table.row(model);
            assert!(row.fresh_input_per_m > 0.0);
        }
        assert_eq!(table.row(ModelId::SyntheticFallback).fresh_input_per_m, 0.0);
    }
}
