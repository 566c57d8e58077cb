//! Call coordinator configuration.
//!
//! Every timing and threshold used by reconciliation, tie-break, circuit
//! breaking and reaction throttling is tunable. Values are loaded from
//! environment variables with defaults; embedding applications can also start
//! from [`Config::default`] and override fields directly.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default `application` field of published announcements.
pub const DEFAULT_APPLICATION: &str = "m.call";

/// Default `scope` field of published announcements.
pub const DEFAULT_SCOPE: &str = "m.room";

/// Default announcement lifetime in seconds.
pub const DEFAULT_ANNOUNCEMENT_TTL_SECONDS: u64 = 3600;

/// Default re-announcement interval in seconds (three quarters of the TTL).
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 2700;

/// Default delay before retrying a failed re-announcement, in seconds.
pub const DEFAULT_REFRESH_RETRY_SECONDS: u64 = 5;

/// Default settle delay before a departure is confirmed, in milliseconds.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;

/// Default wait for the remote's offer when the remote is the designated initiator, in milliseconds.
pub const DEFAULT_TIE_BREAK_TIMEOUT_MS: u64 = 5000;

/// Default wait when the tie-break falls through to session ids, in milliseconds.
pub const DEFAULT_TIE_BREAK_SECONDARY_TIMEOUT_MS: u64 = 1500;

/// Default consecutive failures before a peer's breaker opens.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Default breaker cool-down in seconds.
pub const DEFAULT_BREAKER_COOLDOWN_SECONDS: u64 = 120;

/// Default number of outstanding ephemeral reactions.
pub const DEFAULT_REACTION_BUDGET: u32 = 10;

/// Default interval at which the reaction budget recovers one unit, in milliseconds.
pub const DEFAULT_REACTION_DECAY_MS: u64 = 1000;

/// Default delay before re-subscribing to a terminated announcement stream, in milliseconds.
pub const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 1000;

/// Upper bound for every configured duration, in seconds (one week).
pub const MAX_DURATION_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Call coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `application` field written to and matched against announcements.
    pub application: String,

    /// `scope` field written to and matched against announcements.
    pub scope: String,

    /// Lifetime of a published announcement.
    pub announcement_ttl: Duration,

    /// Interval between re-announcements while entered. Must be shorter than the TTL.
    pub refresh_interval: Duration,

    /// Delay before retrying a failed re-announcement.
    pub refresh_retry_delay: Duration,

    /// Delay before a provisional departure is re-checked and confirmed.
    pub settle_delay: Duration,

    /// How long to wait for the remote's offer when it is the designated initiator.
    pub tie_break_timeout: Duration,

    /// Wait used when identities collide and session ids decide. Must not exceed `tie_break_timeout`.
    pub tie_break_secondary_timeout: Duration,

    /// Consecutive failures before a peer's breaker opens.
    pub breaker_failure_threshold: u32,

    /// How long an open breaker suppresses setup attempts.
    pub breaker_cooldown: Duration,

    /// Maximum outstanding ephemeral reactions.
    pub reaction_budget: u32,

    /// Interval at which one unit of reaction budget is restored.
    pub reaction_decay_interval: Duration,

    /// Delay before re-subscribing after the announcement stream ended.
    pub resubscribe_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            announcement_ttl: Duration::from_secs(DEFAULT_ANNOUNCEMENT_TTL_SECONDS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECONDS),
            refresh_retry_delay: Duration::from_secs(DEFAULT_REFRESH_RETRY_SECONDS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            tie_break_timeout: Duration::from_millis(DEFAULT_TIE_BREAK_TIMEOUT_MS),
            tie_break_secondary_timeout: Duration::from_millis(
                DEFAULT_TIE_BREAK_SECONDARY_TIMEOUT_MS,
            ),
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown: Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECONDS),
            reaction_budget: DEFAULT_REACTION_BUDGET,
            reaction_decay_interval: Duration::from_millis(DEFAULT_REACTION_DECAY_MS),
            resubscribe_delay: Duration::from_millis(DEFAULT_RESUBSCRIBE_DELAY_MS),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let application = vars
            .get("CALL_APPLICATION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_APPLICATION.to_string());

        let scope = vars
            .get("CALL_SCOPE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());

        let announcement_ttl = Duration::from_secs(parse_or(
            vars,
            "CALL_ANNOUNCEMENT_TTL_SECONDS",
            DEFAULT_ANNOUNCEMENT_TTL_SECONDS,
        ));

        let refresh_interval = Duration::from_secs(parse_or(
            vars,
            "CALL_REFRESH_INTERVAL_SECONDS",
            DEFAULT_REFRESH_INTERVAL_SECONDS,
        ));

        let refresh_retry_delay = Duration::from_secs(parse_or(
            vars,
            "CALL_REFRESH_RETRY_SECONDS",
            DEFAULT_REFRESH_RETRY_SECONDS,
        ));

        let settle_delay = Duration::from_millis(parse_or(
            vars,
            "CALL_SETTLE_DELAY_MS",
            DEFAULT_SETTLE_DELAY_MS,
        ));

        let tie_break_timeout = Duration::from_millis(parse_or(
            vars,
            "CALL_TIE_BREAK_TIMEOUT_MS",
            DEFAULT_TIE_BREAK_TIMEOUT_MS,
        ));

        let tie_break_secondary_timeout = Duration::from_millis(parse_or(
            vars,
            "CALL_TIE_BREAK_SECONDARY_TIMEOUT_MS",
            DEFAULT_TIE_BREAK_SECONDARY_TIMEOUT_MS,
        ));

        let breaker_failure_threshold = parse_or(
            vars,
            "CALL_BREAKER_FAILURE_THRESHOLD",
            DEFAULT_BREAKER_FAILURE_THRESHOLD,
        );

        let breaker_cooldown = Duration::from_secs(parse_or(
            vars,
            "CALL_BREAKER_COOLDOWN_SECONDS",
            DEFAULT_BREAKER_COOLDOWN_SECONDS,
        ));

        let reaction_budget = parse_or(vars, "CALL_REACTION_BUDGET", DEFAULT_REACTION_BUDGET);

        let reaction_decay_interval = Duration::from_millis(parse_or(
            vars,
            "CALL_REACTION_DECAY_MS",
            DEFAULT_REACTION_DECAY_MS,
        ));

        let resubscribe_delay = Duration::from_millis(parse_or(
            vars,
            "CALL_RESUBSCRIBE_DELAY_MS",
            DEFAULT_RESUBSCRIBE_DELAY_MS,
        ));

        let config = Config {
            application,
            scope,
            announcement_ttl,
            refresh_interval,
            refresh_retry_delay,
            settle_delay,
            tie_break_timeout,
            tie_break_secondary_timeout,
            breaker_failure_threshold,
            breaker_cooldown,
            reaction_budget,
            reaction_decay_interval,
            resubscribe_delay,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and relations between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = Duration::from_secs(MAX_DURATION_SECONDS);
        let durations = [
            ("announcement TTL", self.announcement_ttl),
            ("refresh interval", self.refresh_interval),
            ("refresh retry delay", self.refresh_retry_delay),
            ("settle delay", self.settle_delay),
            ("tie-break timeout", self.tie_break_timeout),
            ("secondary tie-break timeout", self.tie_break_secondary_timeout),
            ("breaker cool-down", self.breaker_cooldown),
            ("reaction decay interval", self.reaction_decay_interval),
            ("resubscribe delay", self.resubscribe_delay),
        ];
        for (name, value) in durations {
            if value > max {
                return Err(ConfigError::InvalidValue(format!(
                    "{name} must not exceed {MAX_DURATION_SECONDS} seconds"
                )));
            }
        }
        if self.refresh_interval.is_zero() || self.refresh_interval >= self.announcement_ttl {
            return Err(ConfigError::InvalidValue(
                "refresh interval must be non-zero and shorter than the announcement TTL"
                    .to_string(),
            ));
        }
        if self.tie_break_secondary_timeout > self.tie_break_timeout {
            return Err(ConfigError::InvalidValue(
                "secondary tie-break timeout must not exceed the primary timeout".to_string(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "breaker failure threshold must be at least 1".to_string(),
            ));
        }
        if self.reaction_decay_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "reaction decay interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config, Config::default());
        assert_eq!(config.application, "m.call");
        assert_eq!(config.scope, "m.room");
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_cooldown, Duration::from_secs(120));
        assert_eq!(config.reaction_budget, 10);
        assert_eq!(config.reaction_decay_interval, Duration::from_secs(1));
        assert!(config.refresh_interval < config.announcement_ttl);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("CALL_APPLICATION".to_string(), "io.example.call".to_string()),
            ("CALL_SETTLE_DELAY_MS".to_string(), "750".to_string()),
            ("CALL_TIE_BREAK_TIMEOUT_MS".to_string(), "3000".to_string()),
            (
                "CALL_TIE_BREAK_SECONDARY_TIMEOUT_MS".to_string(),
                "1000".to_string(),
            ),
            ("CALL_BREAKER_FAILURE_THRESHOLD".to_string(), "3".to_string()),
            ("CALL_BREAKER_COOLDOWN_SECONDS".to_string(), "30".to_string()),
            ("CALL_REACTION_BUDGET".to_string(), "4".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.application, "io.example.call");
        assert_eq!(config.settle_delay, Duration::from_millis(750));
        assert_eq!(config.tie_break_timeout, Duration::from_secs(3));
        assert_eq!(config.tie_break_secondary_timeout, Duration::from_secs(1));
        assert_eq!(config.breaker_failure_threshold, 3);
        assert_eq!(config.breaker_cooldown, Duration::from_secs(30));
        assert_eq!(config.reaction_budget, 4);
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let vars = HashMap::from([(
            "CALL_BREAKER_FAILURE_THRESHOLD".to_string(),
            "many".to_string(),
        )]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(
            config.breaker_failure_threshold,
            DEFAULT_BREAKER_FAILURE_THRESHOLD
        );
    }

    #[test]
    fn test_refresh_must_be_shorter_than_ttl() {
        let vars = HashMap::from([
            ("CALL_ANNOUNCEMENT_TTL_SECONDS".to_string(), "60".to_string()),
            ("CALL_REFRESH_INTERVAL_SECONDS".to_string(), "60".to_string()),
        ]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_secondary_timeout_bounded_by_primary() {
        let vars = HashMap::from([
            ("CALL_TIE_BREAK_TIMEOUT_MS".to_string(), "1000".to_string()),
            (
                "CALL_TIE_BREAK_SECONDARY_TIMEOUT_MS".to_string(),
                "2000".to_string(),
            ),
        ]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let vars = HashMap::from([(
            "CALL_BREAKER_COOLDOWN_SECONDS".to_string(),
            u64::MAX.to_string(),
        )]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        let vars = HashMap::from([("CALL_SETTLE_DELAY_MS".to_string(), u64::MAX.to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        let config = Config {
            breaker_cooldown: Duration::from_secs(MAX_DURATION_SECONDS),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_breaker_threshold_rejected() {
        let config = Config {
            breaker_failure_threshold: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
