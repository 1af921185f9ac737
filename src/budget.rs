//! `BudgetGuard`: the three enforcement surfaces that gate a request
//! before any model is ever called — per-user rate, per-IP rate, and
//! per-user daily token/cost ceilings. This is the crate's sole load
//! shedding mechanism; there is no request queue behind it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::collaborators::UsageLedger;
use crate::error::{Error, Result};

const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Forward-looking output:input ratio baked into the token-budget check.
const TOKEN_ESTIMATE_MULTIPLIER: u64 = 3;

/// A per-user or per-IP sliding window of admitted request arrival times,
/// serialized behind its own lock so different keys never contend.
struct Window {
    arrivals: Mutex<VecDeque<Instant>>,
}

impl Window {
    fn new() -> Self {
        Self {
            arrivals: Mutex::new(VecDeque::new()),
        }
    }

    /// Evict arrivals older than [`RATE_WINDOW`], then admit a new one if
    /// the window is still under `cap`. Returns the reservation's instant
    /// so the caller can roll it back if a later check refuses the
    /// request — the window must only ever reflect arrivals that were
    /// ultimately admitted (see [`crate::budget`] module docs).
    fn try_reserve(&self, cap: u32, now: Instant) -> std::result::Result<Instant, ()> {
        let mut arrivals = self.arrivals.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(&front) = arrivals.front() {
            if now.duration_since(front) > RATE_WINDOW {
                arrivals.pop_front();
            } else {
                break;
            }
        }
        if arrivals.len() as u32 >= cap {
            return Err(());
        }
        arrivals.push_back(now);
        Ok(now)
    }

    fn rollback(&self, stamp: Instant) {
        let mut arrivals = self.arrivals.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = arrivals.iter().position(|&t| t == stamp) {
            arrivals.remove(pos);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.arrivals.lock().unwrap().len()
    }
}

/// Request-rate and token/cost ceilings per user, per IP, and per
/// process. Consulted by [`crate::router::Router`] before dispatch.
pub struct BudgetGuard {
    r_max: u32,
    t_max_day: u64,
    c_max_day: f64,
    user_windows: DashMap<String, Arc<Window>>,
    ip_windows: DashMap<String, Arc<Window>>,
    ledger: Arc<dyn UsageLedger>,
}

impl BudgetGuard {
    pub fn new(r_max: u32, t_max_day: u64, c_max_day: f64, ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            r_max,
            t_max_day,
            c_max_day,
            user_windows: DashMap::new(),
            ip_windows: DashMap::new(),
            ledger,
        }
    }

    fn window_for(map: &DashMap<String, Arc<Window>>, key: &str) -> Arc<Window> {
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Window::new()))
            .clone()
    }

    /// `Admit(userId, estimatedInputTokens) → Admit | Refuse(kind, detail)`.
    /// Evaluates rate, token, then cost; the first refusal wins and the
    /// rate reservation (if any) is rolled back so refused requests never
    /// count against the per-minute window.
    pub async fn admit(&self, user_id: &str, estimated_input_tokens: u64) -> Result<()> {
        let window = Self::window_for(&self.user_windows, user_id);
        let reservation = window
            .try_reserve(self.r_max, Instant::now())
            .map_err(|_| Error::rate_exceeded(format!("user {user_id} exceeded {} req/60s", self.r_max)))?;

        let sum = self.ledger.sum_today(user_id).await;

        if sum.input_tokens + TOKEN_ESTIMATE_MULTIPLIER * estimated_input_tokens > self.t_max_day {
            window.rollback(reservation);
            return Err(Error::token_budget_exceeded(format!(
                "user {user_id}: {} used + {}x{} estimate > {} daily cap",
                sum.input_tokens, TOKEN_ESTIMATE_MULTIPLIER, estimated_input_tokens, self.t_max_day
            )));
        }

        if sum.cost_usd >= self.c_max_day {
            window.rollback(reservation);
            return Err(Error::cost_budget_exceeded(format!(
                "user {user_id}: ${:.2} used >= ${:.2} daily cap",
                sum.cost_usd, self.c_max_day
            )));
        }

        Ok(())
    }

    /// Per-IP surface, applied upstream of authentication by the (out of
    /// scope) HTTP layer to protect unauthenticated paths. Cap is
    /// `2 × r_max`; same lazy-cleanup discipline as the per-user window.
    pub fn admit_ip(&self, ip: &str) -> Result<()> {
        let window = Self::window_for(&self.ip_windows, ip);
        window
            .try_reserve(self.r_max * 2, Instant::now())
            .map(|_| ())
            .map_err(|_| Error::rate_exceeded(format!("ip {ip} exceeded {} req/60s", self.r_max * 2)))
    }
}
