//! `Router`: orchestrates one request end-to-end — `Admit → Classify →
//! Assemble → Invoke → Record` — and owns the fallback and cancellation
//! policy. See the module-level state machine in the design docs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::accountant::UsageAccountant;
use crate::budget::BudgetGuard;
use crate::collaborators::{ConversationLog, ConversationMessage, LifeContext, Profile, ProfileStore};
use crate::context::{ContextAssembler, DynamicInputs};
use crate::error::{Error, Result};
use crate::intent::{IntentClassifier, IntentLabel};
use crate::model::advisor::{self, AdvisorAdapter};
use crate::model::roaster::{self, RoasterAdapter};
use crate::model::utility::{self, UtilityAdapter};
use crate::model::{ChatMessage, ModelClient, ModelId, ModelInvocation, ModelResult};
use crate::usage::UsageEvent;

/// Roughly 4 characters per token, plus a fixed prompt-scaffolding
/// overhead, as the forward-looking estimate `BudgetGuard.Admit` checks
/// against — not billed; the adapter's own usage counts are. Pinned by
/// the scenario where a user sitting at 99_500 of a 100_000 daily token
/// cap sends "should I buy a new phone?" (25 chars, so `⌈25/4⌉ = 7`) and
/// the guard must still refuse: `99_500 + 3·(7 + overhead) > 100_000`
/// only holds once `overhead` clears 159.
const PROMPT_OVERHEAD_TOKENS: u64 = 160;

const FALLBACK_TEXTS: &[&str] = &[
    "I'm having trouble reaching my brain right now — mind trying again in a moment?",
    "Something broke on my end before I could answer. Give it another shot shortly.",
    "I couldn't get a response back in time. One more try should do it.",
];

/// A cooperative cancellation signal threaded through one request's
/// suspension points. Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct Cancellation {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Cancellation::cancel`] has been called. Race-safe:
    /// if cancellation already fired before this is polled, it returns
    /// immediately rather than waiting for a notification that already
    /// happened.
    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Race `fut` against cancellation. On cancellation, `fut` is dropped
/// (cooperatively aborting it if it is itself cancellation-aware) and an
/// `Error::Cancelled` is returned instead of the future's own result.
async fn race<T>(cancellation: &Cancellation, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Error::cancelled("request cancellation signal fired")),
        res = fut => res,
    }
}

/// `Request = (userId, message, profile, dynamicInputs, lifeContext?,
/// history)`. `history`, when `None`, is fetched from the
/// [`ConversationLog`] by the router itself and trimmed to the chosen
/// adapter's window — conversation trimming is the router's
/// responsibility, never the adapter's.
pub struct Request {
    pub user_id: String,
    pub message: String,
    pub profile: Option<Profile>,
    pub dynamic_inputs: DynamicInputs,
    pub life_context: Option<LifeContext>,
    pub history: Option<Vec<ConversationMessage>>,
}

/// `Response = (text, modelId, intent, inputTokens, outputTokens,
/// cachedInputTokens, costUsd, latencyMs)`. The core's single in-process
/// entry point's output; budget refusals and cancellation are the only
/// failures surfaced as `Err` from [`Router::dispatch`] rather than
/// folded into a `Response`.
#[derive(Clone, Debug)]
pub struct Response {
    pub text: String,
    pub model_id: ModelId,
    pub intent: IntentLabel,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Intent → model routing table from the data model (§3). `Sensitive`
/// always goes to Advisor.
fn model_for_intent(intent: IntentLabel) -> ModelId {
    match intent {
        IntentLabel::Roast | IntentLabel::General => ModelId::Roaster,
        IntentLabel::Advice | IntentLabel::Sensitive => ModelId::Advisor,
        IntentLabel::Categorize | IntentLabel::Receipt => ModelId::Utility,
    }
}

/// `⌈|message|/4⌉ + overhead`, the forward-looking token estimate
/// `BudgetGuard.Admit` checks against.
fn estimate_input_tokens(message: &str) -> u64 {
    let chars = message.chars().count() as u64;
    chars.div_ceil(4) + PROMPT_OVERHEAD_TOKENS
}

pub struct Router {
    budget: Arc<BudgetGuard>,
    classifier: Arc<IntentClassifier>,
    context: Arc<ContextAssembler>,
    accountant: Arc<UsageAccountant>,
    roaster: Arc<RoasterAdapter>,
    advisor: Arc<AdvisorAdapter>,
    utility: Arc<UtilityAdapter>,
    profiles: Arc<dyn ProfileStore>,
    conversation: Arc<dyn ConversationLog>,
    fallback_cursor: AtomicUsize,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        budget: Arc<BudgetGuard>,
        classifier: Arc<IntentClassifier>,
        context: Arc<ContextAssembler>,
        accountant: Arc<UsageAccountant>,
        roaster: Arc<RoasterAdapter>,
        advisor: Arc<AdvisorAdapter>,
        utility: Arc<UtilityAdapter>,
        profiles: Arc<dyn ProfileStore>,
        conversation: Arc<dyn ConversationLog>,
    ) -> Self {
        Self {
            budget,
            classifier,
            context,
            accountant,
            roaster,
            advisor,
            utility,
            profiles,
            conversation,
            fallback_cursor: AtomicUsize::new(0),
        }
    }

    fn next_fallback_text(&self) -> &'static str {
        let idx = self.fallback_cursor.fetch_add(1, Ordering::Relaxed) % FALLBACK_TEXTS.len();
        FALLBACK_TEXTS[idx]
    }

    /// `Dispatch(userId, message, profile, dynamicInputs, lifeContext?,
    /// history) → ModelResult`. Budget refusals and cancellation are the
    /// only `Err`s; everything else — classifier failure, context-
    /// assembly fallback, model failure — degrades to a best-effort
    /// `Response`.
    #[instrument(skip(self, request, cancellation), fields(user_id = %request.user_id))]
    pub async fn dispatch(&self, request: Request, cancellation: &Cancellation) -> Result<Response> {
        let Request {
            user_id,
            message,
            profile,
            dynamic_inputs,
            life_context,
            history,
        } = request;

        // 1. Admit.
        let estimate = estimate_input_tokens(&message);
        self.budget.admit(&user_id, estimate).await?;

        if cancellation.is_cancelled() {
            return Err(Error::cancelled("cancelled before classification"));
        }

        // 2. Classify. `classify` itself never fails; the only way this
        // stage produces an `Err` is the cancellation signal firing,
        // which aborts the whole dispatch rather than degrading further.
        let decision = race(cancellation, async {
            Ok(self.classifier.classify(&user_id, &message).await)
        })
        .await?;

        // 3. Intent → model.
        let model_id = model_for_intent(decision.label);

        // 4. Assemble context. Same cancellation-aborts-immediately rule
        // as classification; `build` itself is infallible.
        let profile_ref = profile.as_ref();
        let life_context_ref = life_context.as_ref();
        let user_context = race(cancellation, async {
            Ok(self
                .context
                .build(&user_id, profile_ref, dynamic_inputs.clone(), life_context_ref)
                .await)
        })
        .await?;

        // Conversation trimming is the router's job, never the adapter's.
        let window = match model_id {
            ModelId::Roaster => roaster::CONVERSATION_WINDOW,
            ModelId::Advisor => advisor::CONVERSATION_WINDOW,
            ModelId::Utility => 0,
            ModelId::SyntheticFallback => 0,
        };
        let history = match history {
            Some(h) => h,
            None => {
                if window == 0 {
                    Vec::new()
                } else {
                    self.conversation.get_recent(&user_id, window).await
                }
            }
        };
        let history: Vec<ChatMessage> = history
            .iter()
            .rev()
            .take(window)
            .rev()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        let invocation = self
            .build_invocation(&user_id, model_id, &user_context, history, &message)
            .await;

        // 5. Invoke.
        let started = Instant::now();
        let invoke_result = race(cancellation, self.invoke(model_id, invocation)).await;

        match invoke_result {
            Ok(result) => self.finish_with_result(&user_id, model_id, decision.label, result).await,
            // Cancellation aborts rather than falling back: the caller
            // already knows it cancelled and doesn't need a synthetic
            // response billed on its behalf.
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                warn!(model = %model_id, error = %err, "model invocation failed, falling back");
                self.finish_with_fallback(&user_id, decision.label, started).await
            }
        }
    }

    /// Resolves `system_prefix` through the [`ContextAssembler`]'s
    /// prompt-prefix tier (5 min TTL, keyed per user and model) rather
    /// than formatting it inline every call — this crate's three
    /// prefixes are fixed constants today, so the tier mostly pays for
    /// itself as infrastructure a deployment with per-user tone presets
    /// can build on without touching the router again.
    async fn build_invocation(
        &self,
        user_id: &str,
        model_id: ModelId,
        ctx: &crate::context::UserContext,
        history: Vec<ChatMessage>,
        user_message: &str,
    ) -> ModelInvocation {
        match model_id {
            ModelId::Roaster => {
                let recent: Vec<String> = ctx.dynamic.last_transactions.clone();
                let dynamic_context_block = roaster::format_dynamic_context_block(
                    ctx.dynamic.visible_balance,
                    ctx.dynamic.hidden_balance,
                    ctx.dynamic.todays_spending,
                    ctx.dynamic.upcoming_bills_total_30d,
                    &recent,
                    &ctx.slow.stress_level,
                    ctx.profile.intensity_preference.as_str(),
                );
                let system_prefix = self
                    .context
                    .prompt_prefix(user_id, "roaster", || roaster_prefix().to_string())
                    .await;
                ModelInvocation {
                    system_prefix,
                    dynamic_context_block,
                    history,
                    user_message: user_message.to_string(),
                    max_output_tokens: 500,
                    temperature: 0.8,
                }
            }
            ModelId::Advisor => {
                let dynamic_context_block = format!(
                    "balance=${:.2} hidden=${:.2} today_spend=${:.2} upcoming_bills=${:.2} \
weekly_avg=${:.2} risk_multiplier={:.2} income={} savings_goal={}",
                    ctx.dynamic.visible_balance,
                    ctx.dynamic.hidden_balance,
                    ctx.dynamic.todays_spending,
                    ctx.dynamic.upcoming_bills_total_30d,
                    ctx.slow.weekly_spending_avg,
                    ctx.slow.spending_risk_multiplier,
                    ctx.profile
                        .annual_income
                        .map(|v| format!("${v:.2}"))
                        .unwrap_or_else(|| "unknown".to_string()),
                    ctx.profile
                        .savings_goal
                        .as_ref()
                        .map(|g| format!("{} (${:.2})", g.purpose, g.amount))
                        .unwrap_or_else(|| "none".to_string()),
                );
                let system_prefix = self
                    .context
                    .prompt_prefix(user_id, "advisor", || advisor::POLICY_BLOCK.to_string())
                    .await;
                ModelInvocation {
                    system_prefix,
                    dynamic_context_block,
                    history,
                    user_message: user_message.to_string(),
                    max_output_tokens: 1000,
                    temperature: 0.4,
                }
            }
            ModelId::Utility | ModelId::SyntheticFallback => {
                let system_prefix = self
                    .context
                    .prompt_prefix(user_id, "utility", || utility::CHAT_SYSTEM_PREFIX.to_string())
                    .await;
                ModelInvocation {
                    system_prefix,
                    dynamic_context_block: String::new(),
                    history,
                    user_message: user_message.to_string(),
                    max_output_tokens: 300,
                    temperature: 0.1,
                }
            }
        }
    }

    async fn invoke(&self, model_id: ModelId, invocation: ModelInvocation) -> Result<ModelResult> {
        match model_id {
            ModelId::Roaster => self.roaster.invoke(invocation).await,
            ModelId::Advisor => self.advisor.invoke(invocation).await,
            ModelId::Utility => self.utility.invoke(invocation).await,
            ModelId::SyntheticFallback => unreachable!("router never routes an intent to the synthetic model"),
        }
    }

    async fn finish_with_result(
        &self,
        user_id: &str,
        model_id: ModelId,
        intent: IntentLabel,
        result: ModelResult,
    ) -> Result<Response> {
        let fresh = result.fresh_input_tokens();
        let cost = self
            .accountant
            .cost_of(model_id, fresh, result.cached_input_tokens, result.output_tokens);

        self.accountant
            .record(UsageEvent {
                user_id: user_id.to_string(),
                endpoint_tag: "chat".to_string(),
                model_id,
                intent,
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
                cached_input_tokens: result.cached_input_tokens,
                cost_usd: cost,
                latency_ms: result.wall_clock_ms,
                timestamp: Utc::now(),
            })
            .await;

        info!(model = %model_id, %intent, cost_usd = cost, "dispatch complete");

        Ok(Response {
            text: result.text,
            model_id,
            intent,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            cached_input_tokens: result.cached_input_tokens,
            cost_usd: cost,
            latency_ms: result.wall_clock_ms,
        })
    }

    /// No cross-model failover: a `ModelTransient` (or cancellation, or a
    /// context-assembly abort) from one adapter never causes the router
    /// to try a different model. The synthetic fallback is billed as
    /// zero cost and recorded like any other usage event.
    async fn finish_with_fallback(
        &self,
        user_id: &str,
        intent: IntentLabel,
        started: Instant,
    ) -> Result<Response> {
        let text = self.next_fallback_text().to_string();
        let latency_ms = started.elapsed().as_millis() as u64;

        self.accountant
            .record(UsageEvent {
                user_id: user_id.to_string(),
                endpoint_tag: "chat".to_string(),
                model_id: ModelId::SyntheticFallback,
                intent,
                input_tokens: 0,
                output_tokens: 0,
                cached_input_tokens: 0,
                cost_usd: 0.0,
                latency_ms,
                timestamp: Utc::now(),
            })
            .await;

        Ok(Response {
            text,
            model_id: ModelId::SyntheticFallback,
            intent,
            input_tokens: 0,
            output_tokens: 0,
            cached_input_tokens: 0,
            cost_usd: 0.0,
            latency_ms,
        })
    }
}

fn roaster_prefix() -> &'static str {
    // Re-exported so the router never hardcodes the adapter's private
    // prompt text; kept in one place (`roaster` module) for the backend
    // prompt-cache stability guarantee to hold.
    roaster::personality_prefix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::UsageAccountant;
    use crate::budget::BudgetGuard;
    use crate::cache::InProcessCache;
    use crate::collaborators::{InMemoryConversationLog, InMemoryProfileStore, InMemoryUsageLedger};
    use crate::config::Config;
    use crate::model::PriceTable;

    fn sample_dynamic_inputs() -> DynamicInputs {
        DynamicInputs {
            visible_balance: 120.0,
            hidden_balance: 500.0,
            upcoming_bills_total_30d: 80.0,
            todays_spending: 12.5,
            last_transactions: vec!["coffee $4".to_string()],
        }
    }

    fn build_router() -> Router {
        let cfg = Config::for_tests();
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let accountant = Arc::new(UsageAccountant::new(PriceTable::new(), ledger.clone()));
        let budget = Arc::new(BudgetGuard::new(cfg.r_max, cfg.t_max_day, cfg.c_max_day, ledger.clone()));
        let utility = Arc::new(UtilityAdapter::unreachable_for_tests());
        let classifier = Arc::new(IntentClassifier::new(utility.clone(), accountant.clone()));
        let context = Arc::new(ContextAssembler::new(Arc::new(InProcessCache::new())));
        Router::new(
            budget,
            classifier,
            context,
            accountant,
            Arc::new(RoasterAdapter::unreachable_for_tests()),
            Arc::new(AdvisorAdapter::unreachable_for_tests()),
            utility,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(InMemoryConversationLog::new()),
        )
    }

    #[tokio::test]
    async fn unreachable_backend_falls_back_and_is_billed_zero() {
        let router = build_router();
        let request = Request {
            user_id: "u1".to_string(),
            message: "roast my coffee spending".to_string(),
            profile: None,
            dynamic_inputs: sample_dynamic_inputs(),
            life_context: None,
            history: None,
        };
        let response = router.dispatch(request, &Cancellation::new()).await.unwrap();
        assert_eq!(response.model_id, ModelId::SyntheticFallback);
        assert_eq!(response.cost_usd, 0.0);
        assert_eq!(response.input_tokens, 0);
    }

    #[tokio::test]
    async fn routing_table_matches_closed_intent_model_mapping() {
        assert_eq!(model_for_intent(IntentLabel::Roast), ModelId::Roaster);
        assert_eq!(model_for_intent(IntentLabel::General), ModelId::Roaster);
        assert_eq!(model_for_intent(IntentLabel::Advice), ModelId::Advisor);
        assert_eq!(model_for_intent(IntentLabel::Sensitive), ModelId::Advisor);
        assert_eq!(model_for_intent(IntentLabel::Categorize), ModelId::Utility);
        assert_eq!(model_for_intent(IntentLabel::Receipt), ModelId::Utility);
    }

    #[tokio::test]
    async fn already_cancelled_request_never_reaches_the_adapter() {
        let router = build_router();
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let request = Request {
            user_id: "u2".to_string(),
            message: "roast my coffee spending".to_string(),
            profile: None,
            dynamic_inputs: sample_dynamic_inputs(),
            life_context: None,
            history: None,
        };
        let err = router.dispatch(request, &cancellation).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn rate_exceeded_is_the_only_hard_failure() {
        let router = build_router();
        for _ in 0..10 {
            let request = Request {
                user_id: "u3".to_string(),
                message: "hi".to_string(),
                profile: None,
                dynamic_inputs: sample_dynamic_inputs(),
                life_context: None,
                history: None,
            };
            router.dispatch(request, &Cancellation::new()).await.unwrap();
        }
        let request = Request {
            user_id: "u3".to_string(),
            message: "hi".to_string(),
            profile: None,
            dynamic_inputs: sample_dynamic_inputs(),
            life_context: None,
            history: None,
        };
        let err = router.dispatch(request, &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, Error::RateExceeded { .. }));
    }

    #[test]
    fn estimate_grows_with_message_length() {
        assert!(estimate_input_tokens("a".repeat(400).as_str()) > estimate_input_tokens("hi"));
    }

    #[tokio::test]
    async fn near_daily_token_cap_refuses_a_short_message() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        ledger
            .append_event(UsageEvent {
                user_id: "u_s2".to_string(),
                endpoint_tag: "chat".to_string(),
                model_id: ModelId::Advisor,
                intent: IntentLabel::Advice,
                input_tokens: 99_500,
                output_tokens: 0,
                cached_input_tokens: 0,
                cost_usd: 0.10,
                latency_ms: 10,
                timestamp: chrono::Utc::now(),
            })
            .await;

        let cfg = Config::for_tests();
        let accountant = Arc::new(UsageAccountant::new(PriceTable::new(), ledger.clone()));
        let budget = Arc::new(BudgetGuard::new(cfg.r_max, cfg.t_max_day, cfg.c_max_day, ledger.clone()));
        let utility = Arc::new(UtilityAdapter::unreachable_for_tests());
        let classifier = Arc::new(IntentClassifier::new(utility.clone(), accountant.clone()));
        let context = Arc::new(ContextAssembler::new(Arc::new(InProcessCache::new())));
        let router = Router::new(
            budget,
            classifier,
            context,
            accountant,
            Arc::new(RoasterAdapter::unreachable_for_tests()),
            Arc::new(AdvisorAdapter::unreachable_for_tests()),
            utility,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(InMemoryConversationLog::new()),
        );

        let request = Request {
            user_id: "u_s2".to_string(),
            message: "should I buy a new phone?".to_string(),
            profile: None,
            dynamic_inputs: sample_dynamic_inputs(),
            life_context: None,
            history: None,
        };
        let err = router.dispatch(request, &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, Error::TokenBudgetExceeded { .. }));
    }
}
