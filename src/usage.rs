//! The [`UsageEvent`] record: an append-only account of one model
//! interaction's tokens, cost, latency, and labels. Produced by the
//! [`crate::accountant::UsageAccountant`] and consumed by the
//! [`crate::collaborators::UsageLedger`].

use chrono::{DateTime, Utc};

use crate::intent::IntentLabel;
use crate::model::ModelId;

/// One model interaction, billed and labeled. Never mutated after
/// construction; `Record` is write-once.
#[derive(Clone, Debug)]
pub struct UsageEvent {
    pub user_id: String,
    /// A short tag identifying which call site produced this event, e.g.
    /// `"chat"` for the end-user dispatch path or `"classifier"` for the
    /// Utility call the intent classifier makes on its own behalf.
    pub endpoint_tag: String,
    pub model_id: ModelId,
    pub intent: IntentLabel,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}
