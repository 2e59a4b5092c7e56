//! Session controller configuration.

use std::time::Duration;
use tablesync_core::{LogLimits, DEFAULT_DEPTH};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Namespace passed to the transport; peers must agree on it
    pub app_namespace: String,
    /// Name and color used for the host's own roster entry and dice rolls
    pub display_name: String,
    pub color: String,
    /// How often a host broadcasts its state digest. Zero disables it.
    pub digest_interval: Duration,
    pub history_depth: usize,
    pub log_limits: LogLimits,
    /// Quiet period after the last mutation before the session is saved
    pub persist_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_namespace: "tablesync".to_string(),
            display_name: "Game Master".to_string(),
            color: "#e53935".to_string(),
            digest_interval: Duration::from_secs(5),
            history_depth: DEFAULT_DEPTH,
            log_limits: LogLimits::default(),
            persist_debounce: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Short timers so tests run quickly.
    pub fn for_testing() -> Self {
        Self {
            digest_interval: Duration::from_millis(50),
            persist_debounce: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.app_namespace, "tablesync");
        assert_eq!(config.digest_interval, Duration::from_secs(5));
        assert_eq!(config.history_depth, 100);
        assert_eq!(config.log_limits.dice, 100);
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = SessionConfig::for_testing();
        assert!(config.digest_interval < Duration::from_secs(1));
        assert_eq!(config.app_namespace, "tablesync");
    }
}
