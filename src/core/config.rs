use std::env;
use std::time::Duration;

use crate::compare::{DedupPolicy, DispatchConfig};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_MAX_SESSIONS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_url: String,
    pub max_sessions: usize,
    /// `None` waits on a silent stream forever.
    pub idle_timeout: Option<Duration>,
    pub system_prompt: Option<String>,
    pub dedup: DedupPolicy,
}

impl AppConfig {
    /// Build the config from any key lookup. `Default` reads the
    /// process environment, tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_url =
            lookup("MODELDUEL_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let max_sessions = parse_or(
            "MODELDUEL_MAX_SESSIONS",
            lookup("MODELDUEL_MAX_SESSIONS"),
            DEFAULT_MAX_SESSIONS,
        )
        .max(1);
        let idle_timeout_secs = parse_or(
            "MODELDUEL_IDLE_TIMEOUT_SECS",
            lookup("MODELDUEL_IDLE_TIMEOUT_SECS"),
            DEFAULT_IDLE_TIMEOUT_SECS,
        );
        let idle_timeout = (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs));
        let system_prompt = lookup("MODELDUEL_SYSTEM_PROMPT").filter(|p| !p.trim().is_empty());
        let dedup = parse_or("MODELDUEL_DEDUP", lookup("MODELDUEL_DEDUP"), DedupPolicy::Suffix);

        Self {
            api_url,
            max_sessions,
            idle_timeout,
            system_prompt,
            dedup,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            idle_timeout: self.idle_timeout,
            dedup: self.dedup,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {}", key, raw);
            default
        }),
        None => default,
    }
}
