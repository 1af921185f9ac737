//! Process-start configuration.
//!
//! Every tunable named in the external-interfaces contract is bound into
//! one immutable [`Config`] value via [`Config::from_env`]. Nothing else
//! in this crate reads the environment directly; constructing a [`Config`]
//! by hand (as tests do) must behave identically to loading it from the
//! process environment.

use std::time::Duration;

use crate::error::{Error, Result};

/// Per-model backend configuration: where to reach it, how to authenticate,
/// and how long to wait before giving up.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub api_key: String,
    pub timeout: Duration,
}

/// Immutable, process-wide configuration bound at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Per-user, per-minute request cap (sliding 60s window).
    pub r_max: u32,
    /// Per-user daily token ceiling (UTC day).
    pub t_max_day: u64,
    /// Per-user daily cost ceiling in USD (UTC day).
    pub c_max_day: f64,

    pub roaster: BackendConfig,
    pub advisor: BackendConfig,
    pub utility: BackendConfig,

    /// Remote shared-cache URL. `None` selects the in-process backend.
    pub cache_backend_url: Option<String>,
}

const DEFAULT_R_MAX: u32 = 10;
const DEFAULT_T_MAX_DAY: u64 = 100_000;
const DEFAULT_C_MAX_DAY: f64 = 5.0;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

impl Config {
    /// Load configuration from the process environment, applying the
    /// documented defaults for anything unset. Returns `Error::Config`
    /// naming the offending variable rather than panicking.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            r_max: parse_env_or("R_MAX", DEFAULT_R_MAX)?,
            t_max_day: parse_env_or("T_MAX_DAY", DEFAULT_T_MAX_DAY)?,
            c_max_day: parse_env_or("C_MAX_DAY", DEFAULT_C_MAX_DAY)?,
            roaster: BackendConfig {
                api_key: std::env::var("ROASTER_API_KEY").unwrap_or_default(),
                timeout: Duration::from_millis(parse_env_or("ROASTER_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?),
            },
            advisor: BackendConfig {
                api_key: std::env::var("ADVISOR_API_KEY").unwrap_or_default(),
                timeout: Duration::from_millis(parse_env_or("ADVISOR_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?),
            },
            utility: BackendConfig {
                api_key: std::env::var("UTILITY_API_KEY").unwrap_or_default(),
                timeout: Duration::from_millis(parse_env_or("UTILITY_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?),
            },
            cache_backend_url: std::env::var("CACHE_BACKEND_URL").ok(),
        })
    }

    /// A configuration with the documented defaults and empty API keys,
    /// suitable for tests that construct a `Core` without touching the
    /// environment.
    pub fn for_tests() -> Self {
        Self {
            r_max: DEFAULT_R_MAX,
            t_max_day: DEFAULT_T_MAX_DAY,
            c_max_day: DEFAULT_C_MAX_DAY,
            roaster: BackendConfig {
                api_key: String::new(),
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            },
            advisor: BackendConfig {
                api_key: String::new(),
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            },
            utility: BackendConfig {
                api_key: String::new(),
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            },
            cache_backend_url: None,
        }
    }
}

/// Parse an environment variable via `FromStr`, falling back to `default`
/// when unset, and reporting a `Config` error naming the variable when set
/// but unparsable.
fn parse_env_or<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{var} is set but not a valid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
