//! `UsageAccountant`: turns token counts into a cost figure via the price
//! table, then write-throughs the resulting [`UsageEvent`] to the ledger.
//!
//! The accountant must not block the request path on a slow ledger write
//! beyond a short soft deadline (default 500 ms): on deadline it enqueues
//! to a bounded background buffer and returns; if that buffer is full the
//! event is dropped and a counter is incremented. Both outcomes are
//! internal (`LedgerWriteDeferred` / `LedgerWriteDropped`) and never
//! surface to the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::collaborators::UsageLedger;
use crate::model::{ModelId, PriceTable};
use crate::usage::UsageEvent;

const SOFT_DEADLINE: Duration = Duration::from_millis(500);
const BACKGROUND_BUFFER_CAPACITY: usize = 1024;

/// Observability counters for the two internal, never-surfaced ledger
/// failure modes.
#[derive(Default)]
pub struct AccountantMetrics {
    pub deferred: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct UsageAccountant {
    prices: PriceTable,
    ledger: Arc<dyn UsageLedger>,
    background: mpsc::Sender<UsageEvent>,
    background_rx: Mutex<Option<mpsc::Receiver<UsageEvent>>>,
    background_started: AtomicBool,
    metrics: Arc<AccountantMetrics>,
}

impl UsageAccountant {
    /// Construction is synchronous and spawns nothing: the background
    /// writer task is only started the first time [`Self::record`] takes
    /// its deadline-exceeded branch, from inside the Tokio runtime that
    /// call is already running on. This keeps `new` callable from plain
    /// synchronous code (including `#[test]`s with no runtime on the
    /// current thread), unlike `tokio::spawn` itself.
    pub fn new(prices: PriceTable, ledger: Arc<dyn UsageLedger>) -> Self {
        let (tx, rx) = mpsc::channel::<UsageEvent>(BACKGROUND_BUFFER_CAPACITY);
        Self {
            prices,
            ledger,
            background: tx,
            background_rx: Mutex::new(Some(rx)),
            background_started: AtomicBool::new(false),
            metrics: Arc::new(AccountantMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<AccountantMetrics> {
        self.metrics.clone()
    }

    /// Spawns the background writer loop at most once, on whichever
    /// `record` call first needs it.
    fn ensure_background_writer(&self) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.background_rx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut rx) = guard.take() {
            let ledger = self.ledger.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    ledger.append_event(event).await;
                }
            });
        }
    }

    /// `cost = fresh_input·p_in + cached_input·p_cached + output·p_out`,
    /// rates per million tokens, arithmetic in `f64` (sufficient for the
    /// 6-decimal-digit precision floor the cost identity requires at this
    /// crate's volumes).
    pub fn cost_of(&self, model: ModelId, fresh: u64, cached: u64, output: u64) -> f64 {
        let row = self.prices.row(model);
        (fresh as f64) * row.fresh_input_per_m / 1_000_000.0
            + (cached as f64) * row.cached_input_per_m / 1_000_000.0
            + (output as f64) * row.output_per_m / 1_000_000.0
    }

    /// Write-through to the ledger with a soft deadline. On timeout, the
    /// event is hand off to a bounded background buffer instead of
    /// blocking the request path; if that buffer is saturated the event
    /// is dropped and `metrics.dropped` is incremented. Either way,
    /// `Record` never fails the request.
    pub async fn record(&self, event: UsageEvent) {
        match tokio::time::timeout(SOFT_DEADLINE, self.ledger.append_event(event.clone())).await {
            Ok(()) => {}
            Err(_) => {
                self.metrics.deferred.fetch_add(1, Ordering::Relaxed);
                self.ensure_background_writer();
                match self.background.try_send(event) {
                    Ok(()) => {}
                    Err(_) => {
                        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("usage ledger background buffer full, dropping usage event");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryUsageLedger;
    use crate::intent::IntentLabel;

    fn sample_event() -> UsageEvent {
        UsageEvent {
            user_id: "u1".to_string(),
            endpoint_tag: "chat".to_string(),
            model_id: ModelId::Roaster,
            intent: IntentLabel::Roast,
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cached_input_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 5,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn cost_identity_matches_price_table() {
        let accountant = UsageAccountant::new(PriceTable::new(), Arc::new(InMemoryUsageLedger::new()));
        let row = PriceTable::new().row(ModelId::Roaster);
        let cost = accountant.cost_of(ModelId::Roaster, 1_000_000, 0, 1_000_000);
        assert!((cost - (row.fresh_input_per_m + row.output_per_m)).abs() < 1e-6);
    }

    #[test]
    fn fresh_and_cached_split_matches_cost_identity() {
        let accountant = UsageAccountant::new(PriceTable::new(), Arc::new(InMemoryUsageLedger::new()));
        let row = PriceTable::new().row(ModelId::Advisor);
        let cost = accountant.cost_of(ModelId::Advisor, 500_000, 500_000, 200_000);
        let expected =
            0.5 * row.fresh_input_per_m + 0.5 * row.cached_input_per_m + 0.2 * row.output_per_m;
        assert!((cost - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn record_writes_through_to_the_ledger() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let accountant = UsageAccountant::new(PriceTable::new(), ledger.clone());
        accountant.record(sample_event()).await;
        let sum = ledger.sum_today("u1").await;
        assert_eq!(sum.requests, 1);
    }

    #[tokio::test]
    async fn synthetic_fallback_is_billed_at_zero() {
        let accountant = UsageAccountant::new(PriceTable::new(), Arc::new(InMemoryUsageLedger::new()));
        let cost = accountant.cost_of(ModelId::SyntheticFallback, 999, 999, 999);
        assert_eq!(cost, 0.0);
    }

    // Cost identity holds for any token split and any real model: `cost_of`
    // equals the price row's dot product with (fresh, cached, output), to
    // within 1e-6, for every combination the field can take.
    proptest::proptest! {
        #[test]
        fn cost_identity_holds_for_arbitrary_token_counts(
            fresh in 0u64..50_000_000,
            cached in 0u64..50_000_000,
            output in 0u64..50_000_000,
            model_idx in 0usize..3,
        ) {
            let model = [ModelId::Roaster, ModelId::Advisor, ModelId::Utility][model_idx];
            let accountant = UsageAccountant::new(PriceTable::new(), Arc::new(InMemoryUsageLedger::new()));
            let row = PriceTable::new().row(model);
            let cost = accountant.cost_of(model, fresh, cached, output);
            let expected = (fresh as f64) * row.fresh_input_per_m / 1_000_000.0
                + (cached as f64) * row.cached_input_per_m / 1_000_000.0
                + (output as f64) * row.output_per_m / 1_000_000.0;
            proptest::prop_assert!((cost - expected).abs() < 1e-6);
        }
    }
}
