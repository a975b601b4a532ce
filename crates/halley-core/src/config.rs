//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the engine. Every field has a default, so an empty table
/// deserializes to [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a long-polling session's delivery queue.
    pub max_queue_size: usize,
    /// How long an unused channel lingers before it may be swept.
    pub channel_ttl_ms: u64,
    /// Reconnect interval advised to clients.
    pub session_connect_interval_ms: u64,
    /// Silence after which a session is force-disconnected.
    pub session_max_idle_ms: u64,
    /// Period of the idle channel sweep.
    pub idle_channel_cycle_ms: u64,
    /// Period of the idle session sweep.
    pub idle_session_cycle_ms: u64,
    /// How long a connect waits for deliveries when the client gives no timeout.
    pub long_poll_timeout_ms: u64,
    /// Channel patterns whose channels echo a publish back to its sender.
    pub reflecting_paths: Vec<String>,
    /// Create unknown channels on publish instead of rejecting the publish.
    pub create_on_publish: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            channel_ttl_ms: 30 * 60 * 1000,
            session_connect_interval_ms: 30_000,
            session_max_idle_ms: 90_000,
            idle_channel_cycle_ms: 5 * 60 * 1000,
            idle_session_cycle_ms: 60_000,
            long_poll_timeout_ms: 30_000,
            reflecting_paths: Vec::new(),
            create_on_publish: false,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn channel_ttl(&self) -> Duration {
        Duration::from_millis(self.channel_ttl_ms)
    }

    #[must_use]
    pub fn session_max_idle(&self) -> Duration {
        Duration::from_millis(self.session_max_idle_ms)
    }

    #[must_use]
    pub fn idle_channel_cycle(&self) -> Duration {
        Duration::from_millis(self.idle_channel_cycle_ms)
    }

    #[must_use]
    pub fn idle_session_cycle(&self) -> Duration {
        Duration::from_millis(self.idle_session_cycle_ms)
    }

    #[must_use]
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    /// The longest a connect may wait for deliveries, whatever the client
    /// advises: `long_poll_timeout_ms`, capped at half of
    /// `session_max_idle_ms` so a waiting session is never idle-swept.
    #[must_use]
    pub fn long_poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms.min(self.session_max_idle_ms / 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_queue_size": 5, "reflecting_paths": ["/echo/**"]}"#)
                .unwrap();
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.reflecting_paths, vec!["/echo/**".to_string()]);
        assert_eq!(config.channel_ttl(), Duration::from_secs(1800));
        assert!(!config.create_on_publish);
    }

    #[test]
    fn test_long_poll_ceiling_stays_under_idle_limit() {
        let config = EngineConfig::default();
        assert_eq!(config.long_poll_ceiling(), Duration::from_secs(30));

        let tight = EngineConfig {
            session_max_idle_ms: 20_000,
            ..EngineConfig::default()
        };
        assert_eq!(tight.long_poll_ceiling(), Duration::from_secs(10));
    }
}
