//! Narrow interfaces to the external collaborators this core consumes
//! but does not own: the profile store, conversation log, usage ledger,
//! and life-context provider. Each trait mirrors one bullet from the
//! external-interfaces contract; a simple in-memory implementation is
//! provided for tests and standalone operation. A real deployment
//! supplies database-backed implementations of the same traits.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;

use crate::error::Result;
use crate::model::ChatRole;
use crate::usage::UsageEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntensityMode {
    Mild,
    Moderate,
    Insanity,
}

#[derive(Clone, Debug)]
pub struct SavingsGoal {
    pub amount: f64,
    pub purpose: String,
    pub deadline: Option<NaiveDate>,
}

/// Raw profile data as returned by the [`ProfileStore`]; projected into
/// [`crate::context::ProfileSnapshot`] by the context assembler.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub intensity_mode: IntensityMode,
    pub annual_income: Option<f64>,
    pub savings_goal: Option<SavingsGoal>,
    pub learned_insights: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressLevel {
    Low,
    Moderate,
    Elevated,
    High,
}

/// Raw life-context data as returned by the [`LifeContextProvider`];
/// projected into [`crate::context::SlowContext`] by the context
/// assembler.
#[derive(Clone, Debug)]
pub struct LifeContext {
    pub stress_level: StressLevel,
    pub sleep_hours: f64,
    pub location_mode: String,
    pub upcoming_event_hints: Vec<String>,
    pub weekly_spending_avg: f64,
    pub weekend_multiplier: f64,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Option<Profile>;
    async fn update_profile(&self, user_id: &str, profile: Profile) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct ConversationMessage {
    pub role: ChatRole,
    pub content: String,
    pub meta: Option<serde_json::Value>,
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append_message(&self, user_id: &str, message: ConversationMessage);
    /// Most recent `limit` messages, sorted oldest-first.
    async fn get_recent(&self, user_id: &str, limit: usize) -> Vec<ConversationMessage>;
}

/// Today's running totals for one user, as read from the ledger.
#[derive(Clone, Copy, Debug, Default)]
pub struct DailySum {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append_event(&self, event: UsageEvent);
    async fn sum_today(&self, user_id: &str) -> DailySum;
}

#[async_trait]
pub trait LifeContextProvider: Send + Sync {
    async fn get_context(&self, user_id: &str) -> Option<LifeContext>;
}

// ---------------------------------------------------------------------
// In-memory reference implementations
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<String, Profile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, user_id: &str) -> Option<Profile> {
        self.profiles.get(user_id).map(|p| p.clone())
    }

    async fn update_profile(&self, user_id: &str, profile: Profile) -> Result<()> {
        self.profiles.insert(user_id.to_string(), profile);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationLog {
    messages: DashMap<String, Vec<ConversationMessage>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append_message(&self, user_id: &str, message: ConversationMessage) {
        self.messages.entry(user_id.to_string()).or_default().push(message);
    }

    async fn get_recent(&self, user_id: &str, limit: usize) -> Vec<ConversationMessage> {
        match self.messages.get(user_id) {
            Some(history) => {
                let len = history.len();
                let start = len.saturating_sub(limit);
                history[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

/// In-memory ledger. Stores every event (append-only) and keeps a
/// per-`(user, UTC day)` running total so `sum_today` does not have to
/// rescan history.
#[derive(Default)]
pub struct InMemoryUsageLedger {
    events: DashMap<String, Vec<UsageEvent>>,
    daily: DashMap<(String, chrono::NaiveDate), DailySum>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn append_event(&self, event: UsageEvent) {
        let day = event.timestamp.date_naive();
        {
            let mut entry = self.daily.entry((event.user_id.clone(), day)).or_default();
            entry.requests += 1;
            entry.input_tokens += event.input_tokens;
            entry.output_tokens += event.output_tokens;
            entry.cost_usd += event.cost_usd;
        }
        self.events.entry(event.user_id.clone()).or_default().push(event);
    }

    async fn sum_today(&self, user_id: &str) -> DailySum {
        let today = Utc::now().date_naive();
        self.daily
            .get(&(user_id.to_string(), today))
            .map(|s| *s)
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct InMemoryLifeContextProvider {
    contexts: DashMap<String, LifeContext>,
}

impl InMemoryLifeContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<String>, context: LifeContext) {
        self.contexts.insert(user_id.into(), context);
    }
}

#[async_trait]
impl LifeContextProvider for InMemoryLifeContextProvider {
    async fn get_context(&self, user_id: &str) -> Option<LifeContext> {
        self.contexts.get(user_id).map(|c| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::UsageEvent;
    use crate::model::ModelId;
    use crate::intent::IntentLabel;

    #[tokio::test]
    async fn profile_store_round_trips() {
        let store = InMemoryProfileStore::new();
        assert!(store.get_profile("u1").await.is_none());
        store
            .update_profile(
                "u1",
                Profile {
                    name: "Ren".to_string(),
                    intensity_mode: IntensityMode::Moderate,
                    annual_income: Some(80_000.0),
                    savings_goal: None,
                    learned_insights: vec![],
                },
            )
            .await
            .unwrap();
        let got = store.get_profile("u1").await.unwrap();
        assert_eq!(got.name, "Ren");
    }

    #[tokio::test]
    async fn conversation_log_returns_last_n_oldest_first() {
        let log = InMemoryConversationLog::new();
        for i in 0..5 {
            log.append_message(
                "u1",
                ConversationMessage {
                    role: ChatRole::User,
                    content: format!("msg {i}"),
                    meta: None,
                },
            )
            .await;
        }
        let recent = log.get_recent("u1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg 3");
        assert_eq!(recent[1].content, "msg 4");
    }

    #[tokio::test]
    async fn ledger_sums_append_within_today() {
        let ledger = InMemoryUsageLedger::new();
        ledger
            .append_event(UsageEvent {
                user_id: "u1".to_string(),
                endpoint_tag: "chat".to_string(),
                model_id: ModelId::Roaster,
                intent: IntentLabel::Roast,
                input_tokens: 100,
                output_tokens: 50,
                cached_input_tokens: 0,
                cost_usd: 0.01,
                latency_ms: 10,
                timestamp: Utc::now(),
            })
            .await;
        let sum = ledger.sum_today("u1").await;
        assert_eq!(sum.requests, 1);
        assert_eq!(sum.input_tokens, 100);
        assert_eq!(sum.cost_usd, 0.01);
    }
}
