//! # furg-core
//!
//! The LLM request-routing and cost-governance core of a chat-first
//! personal finance assistant: classify an inbound message, assemble its
//! user context, dispatch to the cheapest adequate backend, and account
//! for every token spent — all behind per-user budget enforcement.
//!
//! ## Core components
//!
//! - [`intent`] — local-heuristic-then-remote intent classification.
//! - [`context`] — the three-tier (static/slow/dynamic) user context.
//! - [`cache`] — the TTL key-value abstraction the context tiers sit on.
//! - [`model`] — the `ModelClient` interface and the Roaster/Advisor/
//!   Utility adapters.
//! - [`budget`] — per-user/IP rate limiting and daily token/cost ceilings.
//! - [`accountant`] — cost computation and ledger write-through.
//! - [`router`] — `Router::dispatch`, the end-to-end orchestration.
//! - [`collaborators`] — narrow traits to the external systems this core
//!   consumes (profile store, conversation log, usage ledger,
//!   life-context provider), plus in-memory reference implementations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use furg_core::{Config, Core};
//! use furg_core::router::Request;
//! use furg_core::context::DynamicInputs;
//!
//! # async fn run() -> furg_core::error::Result<()> {
//! let core = Core::new(Config::for_tests());
//! let response = core
//!     .router
//!     .dispatch(
//!         Request {
//!             user_id: "u1".to_string(),
//!             message: "roast my coffee spending".to_string(),
//!             profile: None,
//!             dynamic_inputs: DynamicInputs {
//!                 visible_balance: 120.0,
//!                 hidden_balance: 500.0,
//!                 upcoming_bills_total_30d: 80.0,
//!                 todays_spending: 12.5,
//!                 last_transactions: vec![],
//!             },
//!             life_context: None,
//!             history: None,
//!         },
//!         &furg_core::router::Cancellation::new(),
//!     )
//!     .await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

pub mod accountant;
pub mod budget;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod intent;
pub mod model;
pub mod router;
pub mod usage;

use std::sync::Arc;

use collaborators::{InMemoryConversationLog, InMemoryProfileStore, InMemoryUsageLedger};
use model::{advisor::AdvisorAdapter, roaster::RoasterAdapter, utility::UtilityAdapter};

pub use config::Config;
pub use error::{Error, Result};

/// The composed, process-wide value everything else is built from. No
/// component holds shared mutable state outside of what `Core` itself
/// owns — constructing two `Core`s (as tests do, with distinct
/// `Config`s) never share rate windows, caches, or ledgers.
pub struct Core {
    pub router: router::Router,
    pub accountant: Arc<accountant::UsageAccountant>,
    pub budget: Arc<budget::BudgetGuard>,
    pub profiles: Arc<dyn collaborators::ProfileStore>,
    pub conversation: Arc<dyn collaborators::ConversationLog>,
    pub ledger: Arc<dyn collaborators::UsageLedger>,
}

impl Core {
    /// Build a `Core` from `config`, wiring the in-memory reference
    /// collaborators and selecting the cache backend named by
    /// `config.cache_backend_url` (absent selects the in-process
    /// backend). A production deployment swaps `profiles`/`conversation`/
    /// `ledger` for database-backed implementations of the same traits
    /// without touching the core.
    pub fn new(config: Config) -> Self {
        let cache: Arc<dyn cache::CacheLayer> = match &config.cache_backend_url {
            Some(url) => Arc::new(cache::RemoteCache::new(url.clone())),
            None => Arc::new(cache::InProcessCache::new()),
        };

        let ledger: Arc<dyn collaborators::UsageLedger> = Arc::new(InMemoryUsageLedger::new());
        let profiles: Arc<dyn collaborators::ProfileStore> = Arc::new(InMemoryProfileStore::new());
        let conversation: Arc<dyn collaborators::ConversationLog> = Arc::new(InMemoryConversationLog::new());

        let prices = model::PriceTable::new();
        let accountant = Arc::new(accountant::UsageAccountant::new(prices, ledger.clone()));
        let budget = Arc::new(budget::BudgetGuard::new(
            config.r_max,
            config.t_max_day,
            config.c_max_day,
            ledger.clone(),
        ));

        let roaster = Arc::new(RoasterAdapter::new(&config.roaster));
        let advisor = Arc::new(AdvisorAdapter::new(&config.advisor));
        let utility = Arc::new(UtilityAdapter::new(&config.utility));

        let classifier = Arc::new(intent::IntentClassifier::new(utility.clone(), accountant.clone()));
        let context = Arc::new(context::ContextAssembler::new(cache));

        let router = router::Router::new(
            budget.clone(),
            classifier,
            context,
            accountant.clone(),
            roaster,
            advisor,
            utility,
            profiles.clone(),
            conversation.clone(),
        );

        Self {
            router,
            accountant,
            budget,
            profiles,
            conversation,
            ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context::DynamicInputs;
    use router::{Cancellation, Request};

    #[tokio::test]
    async fn core_dispatches_end_to_end_against_unreachable_backends() {
        let core = Core::new(Config::for_tests());
        let request = Request {
            user_id: "u1".to_string(),
            message: "roast my coffee spending".to_string(),
            profile: None,
            dynamic_inputs: DynamicInputs {
                visible_balance: 120.0,
                hidden_balance: 500.0,
                upcoming_bills_total_30d: 80.0,
                todays_spending: 12.5,
                last_transactions: vec![],
            },
            life_context: None,
            history: None,
        };
        let response = core.router.dispatch(request, &Cancellation::new()).await.unwrap();
        // Unreachable backends in tests degrade to the synthetic fallback
        // rather than failing the request.
        assert_eq!(response.model_id, model::ModelId::SyntheticFallback);
    }

    #[test]
    fn two_cores_never_share_state() {
        let a = Core::new(Config::for_tests());
        let b = Core::new(Config::for_tests());
        assert!(!Arc::ptr_eq(&a.accountant, &b.accountant));
        assert!(!Arc::ptr_eq(&a.budget, &b.budget));
    }
}
