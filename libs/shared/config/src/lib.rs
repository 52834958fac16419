use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Reconnection backoff used when ICE drops out of a live call.
///
/// Attempt `n` (1-based) waits `base_delay * factor^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_attempts: 3,
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Backoff delays for every attempt, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSessionConfig {
    pub negotiation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub ice_servers: Vec<String>,
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

impl CallSessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(env_or(
                "CALL_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect.base_delay.as_millis() as u64,
            )),
            factor: env_or("CALL_RECONNECT_FACTOR", defaults.reconnect.factor),
            max_attempts: env_or("CALL_RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts),
            max_delay: Duration::from_millis(env_or(
                "CALL_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect.max_delay.as_millis() as u64,
            )),
            attempt_timeout: Duration::from_secs(env_or(
                "CALL_RECONNECT_ATTEMPT_TIMEOUT_SECS",
                defaults.reconnect.attempt_timeout.as_secs(),
            )),
        };

        let ice_servers = match env::var("CALL_ICE_SERVERS") {
            Ok(raw) => {
                let servers: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if servers.is_empty() {
                    warn!("CALL_ICE_SERVERS is empty, using default STUN server");
                    defaults.ice_servers.clone()
                } else {
                    servers
                }
            }
            Err(_) => defaults.ice_servers.clone(),
        };

        let config = Self {
            negotiation_timeout: Duration::from_secs(env_or(
                "CALL_NEGOTIATION_TIMEOUT_SECS",
                defaults.negotiation_timeout.as_secs(),
            )),
            reconnect,
            ice_servers,
        };

        if !config.is_valid() {
            warn!("Call session configuration has zero timeouts or attempts, falling back to defaults");
            return defaults;
        }

        config
    }

    pub fn is_valid(&self) -> bool {
        !self.negotiation_timeout.is_zero()
            && !self.reconnect.attempt_timeout.is_zero()
            && self.reconnect.factor >= 1
            && self.reconnect.max_attempts >= 1
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CallSessionConfig::default();
        assert!(config.is_valid());
        assert_eq!(config.negotiation_timeout, Duration::from_secs(30));
        assert_eq!(config.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("CALL_NEGOTIATION_TIMEOUT_SECS", "12");
        env::set_var("CALL_RECONNECT_MAX_ATTEMPTS", "not-a-number");
        env::set_var("CALL_ICE_SERVERS", "stun:a.example:3478, turn:b.example:3478");

        let config = CallSessionConfig::from_env();

        env::remove_var("CALL_NEGOTIATION_TIMEOUT_SECS");
        env::remove_var("CALL_RECONNECT_MAX_ATTEMPTS");
        env::remove_var("CALL_ICE_SERVERS");

        assert_eq!(config.negotiation_timeout, Duration::from_secs(12));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example:3478".to_string()]
        );
    }
}
