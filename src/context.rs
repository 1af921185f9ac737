//! `ContextAssembler`: composes a [`UserContext`] from three lifetime
//! tiers — static (profile), slow (health/location/calendar aggregates),
//! and dynamic (per-request balances) — via the [`crate::cache::CacheLayer`].
//!
//! Static and slow tiers are cached; dynamic context is assembled per
//! request and never cached. A cache miss on either cached tier rebuilds
//! it from the collaborator the tier is sourced from and repopulates the
//! cache; a cache error is swallowed by `CacheLayer` itself and simply
//! looks like a miss here.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheLayer;
use crate::collaborators::{IntensityMode, LifeContext, Profile, SavingsGoal, StressLevel};

const STATIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SLOW_TTL: Duration = Duration::from_secs(60 * 60);
/// TTL for the compiled per-model system-prompt prefix the router caches
/// under the same [`CacheLayer`]; defined here because it shares the
/// tier-invalidation discipline of static/slow, even though the router
/// (not the assembler) populates it.
pub const PROMPT_PREFIX_TTL: Duration = Duration::from_secs(5 * 60);

/// The three cache tiers a `(userId, tier)` key can name. `PromptPrefix`
/// is additionally parameterized by model, since each adapter compiles
/// its own prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Static,
    Slow,
}

/// Build the opaque cache key for a `(userId, tier)` pair.
pub fn cache_key(user_id: &str, tier: Tier) -> String {
    let tier = match tier {
        Tier::Static => "static",
        Tier::Slow => "slow",
    };
    format!("ctx:{user_id}:{tier}")
}

/// Build the cache key for the compiled prompt-prefix tier, parameterized
/// by model so Roaster/Advisor/Utility prefixes don't collide.
pub fn prompt_prefix_cache_key(user_id: &str, model: &str) -> String {
    format!("ctx:{user_id}:prompt-prefix:{model}")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntensityPreference {
    Mild,
    Moderate,
    Insanity,
}

impl IntensityPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mild => "mild",
            Self::Moderate => "moderate",
            Self::Insanity => "insanity",
        }
    }
}

impl From<IntensityMode> for IntensityPreference {
    fn from(mode: IntensityMode) -> Self {
        match mode {
            IntensityMode::Mild => Self::Mild,
            IntensityMode::Moderate => Self::Moderate,
            IntensityMode::Insanity => Self::Insanity,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavingsGoalSnapshot {
    pub amount: f64,
    pub purpose: String,
    pub deadline: Option<String>,
}

impl From<&SavingsGoal> for SavingsGoalSnapshot {
    fn from(goal: &SavingsGoal) -> Self {
        Self {
            amount: goal.amount,
            purpose: goal.purpose.clone(),
            deadline: goal.deadline.map(|d| d.to_string()),
        }
    }
}

/// Static tier: refreshed from the [`crate::collaborators::ProfileStore`]
/// on cache miss; invalidated by any profile mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub display_name: String,
    pub intensity_preference: IntensityPreference,
    pub annual_income: Option<f64>,
    pub savings_goal: Option<SavingsGoalSnapshot>,
    pub learned_insights: Vec<String>,
}

impl From<&Profile> for ProfileSnapshot {
    fn from(profile: &Profile) -> Self {
        Self {
            display_name: profile.name.clone(),
            intensity_preference: profile.intensity_mode.into(),
            annual_income: profile.annual_income,
            savings_goal: profile.savings_goal.as_ref().map(SavingsGoalSnapshot::from),
            learned_insights: profile.learned_insights.clone(),
        }
    }
}

/// Slow tier: rebuilt from the [`crate::collaborators::LifeContextProvider`]
/// on cache miss; invalidated by a life-context update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlowContext {
    pub stress_level: String,
    pub sleep_hours: f64,
    pub location_mode: String,
    pub upcoming_event_hints: Vec<String>,
    pub weekly_spending_avg: f64,
    pub weekend_multiplier: f64,
    /// Derived `base × stressFactor × sleepFactor`, clamped to [1.0, 2.0].
    pub spending_risk_multiplier: f64,
}

fn stress_factor(level: StressLevel) -> f64 {
    match level {
        StressLevel::Low => 1.0,
        StressLevel::Moderate => 1.15,
        StressLevel::Elevated => 1.35,
        StressLevel::High => 1.6,
    }
}

fn sleep_factor(sleep_hours: f64) -> f64 {
    if sleep_hours < 5.0 {
        1.2
    } else if sleep_hours < 6.0 {
        1.1
    } else {
        1.0
    }
}

/// `base × stressFactor × sleepFactor`, clamped to [1.0, 2.0]. `base` is
/// fixed at 1.0 — the source never names a distinct base multiplier, so
/// this is the identity before the stress/sleep factors apply.
pub fn spending_risk_multiplier(stress_level: StressLevel, sleep_hours: f64) -> f64 {
    let base = 1.0;
    (base * stress_factor(stress_level) * sleep_factor(sleep_hours)).clamp(1.0, 2.0)
}

impl From<&LifeContext> for SlowContext {
    fn from(ctx: &LifeContext) -> Self {
        Self {
            stress_level: stress_level_str(ctx.stress_level).to_string(),
            sleep_hours: ctx.sleep_hours,
            location_mode: ctx.location_mode.clone(),
            upcoming_event_hints: ctx.upcoming_event_hints.clone(),
            weekly_spending_avg: ctx.weekly_spending_avg,
            weekend_multiplier: ctx.weekend_multiplier,
            spending_risk_multiplier: spending_risk_multiplier(ctx.stress_level, ctx.sleep_hours),
        }
    }
}

fn stress_level_str(level: StressLevel) -> &'static str {
    match level {
        StressLevel::Low => "low",
        StressLevel::Moderate => "moderate",
        StressLevel::Elevated => "elevated",
        StressLevel::High => "high",
    }
}

impl Default for SlowContext {
    /// Sensible defaults used when no [`LifeContext`] is available for a
    /// user — moderate stress, typical sleep, no special aggregates.
    fn default() -> Self {
        Self {
            stress_level: "moderate".to_string(),
            sleep_hours: 7.0,
            location_mode: "unknown".to_string(),
            upcoming_event_hints: Vec::new(),
            weekly_spending_avg: 0.0,
            weekend_multiplier: 1.0,
            spending_risk_multiplier: spending_risk_multiplier(StressLevel::Moderate, 7.0),
        }
    }
}

/// Per-request inputs the caller supplies; never cached.
#[derive(Clone, Debug)]
pub struct DynamicInputs {
    pub visible_balance: f64,
    pub hidden_balance: f64,
    pub upcoming_bills_total_30d: f64,
    pub todays_spending: f64,
    pub last_transactions: Vec<String>,
}

/// Dynamic tier: constructed per request, capped to the last 5
/// transactions, and never cached.
#[derive(Clone, Debug)]
pub struct DynamicContext {
    pub visible_balance: f64,
    pub hidden_balance: f64,
    pub upcoming_bills_total_30d: f64,
    pub todays_spending: f64,
    pub last_transactions: Vec<String>,
}

impl From<DynamicInputs> for DynamicContext {
    fn from(inputs: DynamicInputs) -> Self {
        let mut last_transactions = inputs.last_transactions;
        last_transactions.truncate(5);
        Self {
            visible_balance: inputs.visible_balance,
            hidden_balance: inputs.hidden_balance,
            upcoming_bills_total_30d: inputs.upcoming_bills_total_30d,
            todays_spending: inputs.todays_spending,
            last_transactions,
        }
    }
}

/// The composed view prompt assembly reads from. Never persisted.
#[derive(Clone, Debug)]
pub struct UserContext {
    pub profile: ProfileSnapshot,
    pub slow: SlowContext,
    pub dynamic: DynamicContext,
}

pub struct ContextAssembler {
    cache: Arc<dyn CacheLayer>,
}

impl ContextAssembler {
    pub fn new(cache: Arc<dyn CacheLayer>) -> Self {
        Self { cache }
    }

    /// Build a [`UserContext`] for one request. `profile_from_store` is
    /// consulted only on a static-tier cache miss; `life_context` only on
    /// a slow-tier miss (absent falls back to [`SlowContext::default`]).
    pub async fn build(
        &self,
        user_id: &str,
        profile_from_store: Option<&Profile>,
        dynamic_inputs: DynamicInputs,
        life_context: Option<&LifeContext>,
    ) -> UserContext {
        let profile = self.load_static(user_id, profile_from_store).await;
        let slow = self.load_slow(user_id, life_context).await;
        let dynamic = DynamicContext::from(dynamic_inputs);
        UserContext { profile, slow, dynamic }
    }

    async fn load_static(&self, user_id: &str, profile_from_store: Option<&Profile>) -> ProfileSnapshot {
        let key = cache_key(user_id, Tier::Static);
        if let Some(raw) = self.cache.get(&key).await {
            if let Ok(snapshot) = serde_json::from_str::<ProfileSnapshot>(&raw) {
                return snapshot;
            }
        }
        let snapshot = match profile_from_store {
            Some(profile) => ProfileSnapshot::from(profile),
            None => ProfileSnapshot {
                display_name: "there".to_string(),
                intensity_preference: IntensityPreference::Moderate,
                annual_income: None,
                savings_goal: None,
                learned_insights: Vec::new(),
            },
        };
        if let Ok(raw) = serde_json::to_string(&snapshot) {
            self.cache.set(&key, raw, STATIC_TTL).await;
        }
        snapshot
    }

    async fn load_slow(&self, user_id: &str, life_context: Option<&LifeContext>) -> SlowContext {
        let key = cache_key(user_id, Tier::Slow);
        if let Some(raw) = self.cache.get(&key).await {
            if let Ok(slow) = serde_json::from_str::<SlowContext>(&raw) {
                return slow;
            }
        }
        let slow = match life_context {
            Some(ctx) => SlowContext::from(ctx),
            None => SlowContext::default(),
        };
        if let Ok(raw) = serde_json::to_string(&slow) {
            self.cache.set(&key, raw, SLOW_TTL).await;
        }
        slow
    }

    /// Invalidate the static tier; called by the router when a profile
    /// mutation is observed (mirrors `ProfileStore::update_profile`'s
    /// documented side effect). Also drops every per-model prompt-prefix
    /// entry for the user, since the table in the component design names
    /// "static or slow change" as the prompt-prefix tier's invalidation
    /// trigger.
    pub async fn invalidate_static(&self, user_id: &str) {
        self.cache.delete(&cache_key(user_id, Tier::Static)).await;
        self.invalidate_all_prompt_prefixes(user_id).await;
    }

    /// Invalidate the slow tier on a life-context update, and the
    /// dependent prompt-prefix entries with it.
    pub async fn invalidate_slow(&self, user_id: &str) {
        self.cache.delete(&cache_key(user_id, Tier::Slow)).await;
        self.invalidate_all_prompt_prefixes(user_id).await;
    }

    async fn invalidate_all_prompt_prefixes(&self, user_id: &str) {
        for model in ["roaster", "advisor", "utility"] {
            self.invalidate_prompt_prefix(user_id, model).await;
        }
    }

    /// Fetch the compiled per-model system-prompt prefix for `user_id`
    /// from the prompt-prefix tier, computing and populating it with
    /// `compute` on a miss. The prefixes this crate's adapters use are
    /// stable constants, so a miss is cheap either way; this tier exists
    /// so a deployment whose prefixes are themselves user-specific (a
    /// tone preset baked into the static profile, say) gets the same
    /// 5-minute cache discipline as static/slow.
    pub async fn prompt_prefix(&self, user_id: &str, model: &str, compute: impl FnOnce() -> String) -> String {
        let key = prompt_prefix_cache_key(user_id, model);
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }
        let prefix = compute();
        self.cache.set(&key, prefix.clone(), PROMPT_PREFIX_TTL).await;
        prefix
    }

    /// Invalidate a user's compiled prefix for one model; called whenever
    /// the static or slow tier it was derived from changes.
    pub async fn invalidate_prompt_prefix(&self, user_id: &str, model: &str) {
        self.cache.delete(&prompt_prefix_cache_key(user_id, model)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InProcessCache;

    fn sample_inputs() -> DynamicInputs {
        DynamicInputs {
            visible_balance: 120.0,
            hidden_balance: 500.0,
            upcoming_bills_total_30d: 80.0,
            todays_spending: 12.5,
            last_transactions: vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
                "f".to_string(),
            ],
        }
    }

    #[tokio::test]
    async fn dynamic_tier_truncates_to_five_transactions() {
        let assembler = ContextAssembler::new(Arc::new(InProcessCache::new()));
        let ctx = assembler.build("u1", None, sample_inputs(), None).await;
        assert_eq!(ctx.dynamic.last_transactions.len(), 5);
    }

    #[tokio::test]
    async fn static_tier_defaults_on_miss_without_profile() {
        let assembler = ContextAssembler::new(Arc::new(InProcessCache::new()));
        let ctx = assembler.build("u1", None, sample_inputs(), None).await;
        assert_eq!(ctx.profile.intensity_preference, IntensityPreference::Moderate);
    }

    #[tokio::test]
    async fn static_tier_is_cached_across_calls() {
        let cache = Arc::new(InProcessCache::new());
        let assembler = ContextAssembler::new(cache.clone());
        let profile = Profile {
            name: "Ren".to_string(),
            intensity_mode: IntensityMode::Insanity,
            annual_income: None,
            savings_goal: None,
            learned_insights: vec![],
        };
        let first = assembler.build("u1", Some(&profile), sample_inputs(), None).await;
        assert_eq!(first.profile.display_name, "Ren");

        // Second call passes no profile; must still read "Ren" back from cache.
        let second = assembler.build("u1", None, sample_inputs(), None).await;
        assert_eq!(second.profile.display_name, "Ren");
    }

    #[tokio::test]
    async fn invalidate_static_forces_a_rebuild() {
        let cache = Arc::new(InProcessCache::new());
        let assembler = ContextAssembler::new(cache.clone());
        let profile = Profile {
            name: "Ren".to_string(),
            intensity_mode: IntensityMode::Mild,
            annual_income: None,
            savings_goal: None,
            learned_insights: vec![],
        };
        assembler.build("u1", Some(&profile), sample_inputs(), None).await;
        assembler.invalidate_static("u1").await;

        let rebuilt = assembler.build("u1", None, sample_inputs(), None).await;
        assert_eq!(rebuilt.profile.display_name, "there");
    }

    #[test]
    fn spending_risk_multiplier_clamps_to_two() {
        let m = spending_risk_multiplier(StressLevel::High, 4.0);
        assert!((m - 2.0).abs() < 1e-9);
    }

    #[test]
    fn spending_risk_multiplier_floor_is_one() {
        let m = spending_risk_multiplier(StressLevel::Low, 8.0);
        assert!((m - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn prompt_prefix_is_computed_once_then_served_from_cache() {
        let assembler = ContextAssembler::new(Arc::new(InProcessCache::new()));
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            "prefix-v1".to_string()
        };
        let first = assembler.prompt_prefix("u1", "roaster", compute).await;
        let second = assembler.prompt_prefix("u1", "roaster", compute).await;
        assert_eq!(first, "prefix-v1");
        assert_eq!(second, "prefix-v1");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prompt_prefix_invalidation_forces_recompute() {
        let assembler = ContextAssembler::new(Arc::new(InProcessCache::new()));
        assembler.prompt_prefix("u1", "roaster", || "v1".to_string()).await;
        assembler.invalidate_prompt_prefix("u1", "roaster").await;
        let refreshed = assembler.prompt_prefix("u1", "roaster", || "v2".to_string()).await;
        assert_eq!(refreshed, "v2");
    }
}
