//! Connection configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the connection re-dials after its channel drops.
///
/// Attempt `n` (1-based) waits `initial_backoff * 2^(n-1)`, capped at
/// `max_backoff`, plus a random jitter in `[0, jitter)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before the connection gives up and enters `Failed`.
    /// Zero disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_backoff: Duration,
    /// Upper bound on the random delay added to every attempt.
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Clamps inconsistent values instead of failing.
    pub fn validated(mut self) -> Self {
        if self.max_backoff < self.initial_backoff {
            tracing::warn!(
                initial = ?self.initial_backoff,
                max = ?self.max_backoff,
                "max_backoff below initial_backoff, raising it"
            );
            self.max_backoff = self.initial_backoff;
        }
        self
    }

    /// The delay before attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);

        let jitter_us = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        let jitter = if jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..jitter_us))
        } else {
            Duration::ZERO
        };
        base + jitter
    }
}

/// Settings for one [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long to wait for the server's handshake reply. Also bounds each
    /// lock reacquisition after a reconnect.
    pub handshake_timeout: Duration,
    /// Reconnection behaviour.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Clamps inconsistent values instead of failing.
    pub fn validated(mut self) -> Self {
        if self.handshake_timeout.is_zero() {
            tracing::warn!(
                default = ?Self::DEFAULT_HANDSHAKE_TIMEOUT,
                "handshake_timeout is zero, using default"
            );
            self.handshake_timeout = Self::DEFAULT_HANDSHAKE_TIMEOUT;
        }
        self.reconnect = self.reconnect.validated();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(10),
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = policy.backoff_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(110));
        }
    }

    #[test]
    fn test_validated_raises_max_backoff() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
            ..no_jitter()
        }
        .validated();
        assert_eq!(policy.max_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_validated_replaces_zero_handshake_timeout() {
        let config = ConnectionConfig {
            handshake_timeout: Duration::ZERO,
            ..ConnectionConfig::default()
        }
        .validated();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "reconnect": { "max_attempts": 3 } }"#).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(
            config.reconnect.initial_backoff,
            ReconnectPolicy::default().initial_backoff
        );
    }

    #[test]
    fn test_disabled_policy_has_no_attempts() {
        assert_eq!(ReconnectPolicy::disabled().max_attempts, 0);
    }
}
