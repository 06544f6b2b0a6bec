//! Server configuration.
//!
//! Read from `OKEY_*` environment variables. Anything unset or unparseable
//! keeps its default.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::game::rules::{AutoDiscardPolicy, RuleSet};
use crate::network::auth::AuthConfig;

/// State store settings.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Redis URL. When unset the in-memory backend is used.
    pub redis_url: Option<String>,
    /// Deadline for every single store call.
    pub operation_timeout: Duration,
    /// Compare-and-swap attempts before giving up with a conflict.
    pub max_update_retries: u32,
    /// Expiry refreshed on every write of a live room.
    pub active_room_ttl: Duration,
    /// Retention after a room finishes or is cancelled.
    pub finished_room_ttl: Duration,
    /// Expiry of connection bindings.
    pub binding_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            operation_timeout: Duration::from_millis(2_000),
            max_update_retries: 8,
            active_room_ttl: Duration::from_secs(6 * 60 * 60),
            finished_room_ttl: Duration::from_secs(60 * 60),
            binding_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Turn timer settings.
#[derive(Clone, Debug)]
pub struct TimerConfig {
    /// How often the active-room index is scanned for overdue turns.
    pub poll_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

/// Complete server configuration.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    /// State store
    pub store: StoreConfig,
    /// Table rules
    pub rules: RuleSet,
    /// Turn timer
    pub timer: TimerConfig,
    /// Token validation
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.store.redis_url = std::env::var("OKEY_REDIS_URL").ok().filter(|s| !s.is_empty());
        if let Some(ms) = env_parse::<u64>("OKEY_STORE_TIMEOUT_MS") {
            config.store.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("OKEY_STORE_MAX_RETRIES") {
            config.store.max_update_retries = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("OKEY_ROOM_TTL_SECS") {
            config.store.active_room_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("OKEY_FINISHED_ROOM_TTL_SECS") {
            config.store.finished_room_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("OKEY_BINDING_TTL_SECS") {
            config.store.binding_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("OKEY_TURN_TIMEOUT_SECS") {
            config.rules.turn_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("OKEY_HAND_SIZE") {
            config.rules.hand_size = n;
        }
        if let Some(flag) = env_flag("OKEY_ALLOW_DISCARD_PICKUP") {
            config.rules.allow_discard_pickup = flag;
        }
        if let Some(policy) = env_parse::<AutoDiscardPolicy>("OKEY_AUTO_DISCARD") {
            config.rules.auto_discard = policy;
        }

        if let Some(ms) = env_parse::<u64>("OKEY_TIMER_POLL_MS") {
            config.timer.poll_interval = Duration::from_millis(ms.max(10));
        }

        config.auth = AuthConfig::from_env();

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "true" || v == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.store.redis_url.is_none());
        assert_eq!(config.store.max_update_retries, 8);
        assert_eq!(config.rules.hand_size, 14);
        assert!(config.store.finished_room_ttl < config.store.active_room_ttl);
        assert!(!config.auth.is_configured());
    }

    #[test]
    fn test_from_env_overrides() {
        // Variables unique to this test so parallel tests are unaffected
        std::env::set_var("OKEY_TURN_TIMEOUT_SECS", "12");
        std::env::set_var("OKEY_AUTO_DISCARD", "drawn_tile");
        std::env::set_var("OKEY_STORE_MAX_RETRIES", "nope");
        let config = AppConfig::from_env();
        std::env::remove_var("OKEY_TURN_TIMEOUT_SECS");
        std::env::remove_var("OKEY_AUTO_DISCARD");
        std::env::remove_var("OKEY_STORE_MAX_RETRIES");

        assert_eq!(config.rules.turn_timeout, Duration::from_secs(12));
        assert_eq!(config.rules.auto_discard, AutoDiscardPolicy::DrawnTile);
        assert_eq!(config.store.max_update_retries, 8);
    }
}
