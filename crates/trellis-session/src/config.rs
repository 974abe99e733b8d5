//! Session service configuration
//!
//! Loaded from YAML or defaults, then overridden from `TRELLIS_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use trellis_core::{CoreError, Result};

/// Cleanup interval applied when a TTL is configured but no interval is.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Configuration shared by the session stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionServiceConfig {
    /// Session TTL in seconds (0 = never expires)
    #[serde(default)]
    pub session_ttl_secs: u64,

    /// App-state TTL in seconds (0 = never expires)
    #[serde(default)]
    pub app_state_ttl_secs: u64,

    /// User-state TTL in seconds (0 = never expires)
    #[serde(default)]
    pub user_state_ttl_secs: u64,

    /// Maximum events kept per session (0 = unlimited)
    #[serde(default)]
    pub session_event_limit: usize,

    /// Expired-row reaping interval in seconds (0 = default when any TTL is set)
    #[serde(default)]
    pub cleanup_interval_secs: u64,

    /// Route event persistence through the async worker pool
    #[serde(default)]
    pub enable_async_persist: bool,

    /// Persistence workers
    #[serde(default = "default_async_persister_num")]
    pub async_persister_num: usize,

    /// Per-worker persistence queue size
    #[serde(default = "default_persist_buffer_size")]
    pub persist_buffer_size: usize,

    /// Timeout of one persistence job in milliseconds
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// Summary workers
    #[serde(default = "default_summary_worker_num")]
    pub async_summary_num: usize,

    /// Per-worker summary queue size
    #[serde(default = "default_summary_queue_size")]
    pub summary_queue_size: usize,

    /// Timeout of one summary job in seconds
    #[serde(default = "default_summary_job_timeout_secs")]
    pub summary_job_timeout_secs: u64,

    /// Log hook errors instead of failing the call
    #[serde(default)]
    pub ignore_hook_errors: bool,
}

fn default_async_persister_num() -> usize {
    10
}

fn default_persist_buffer_size() -> usize {
    100
}

fn default_persist_timeout_ms() -> u64 {
    2_000
}

fn default_summary_worker_num() -> usize {
    3
}

fn default_summary_queue_size() -> usize {
    256
}

fn default_summary_job_timeout_secs() -> u64 {
    30
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 0,
            app_state_ttl_secs: 0,
            user_state_ttl_secs: 0,
            session_event_limit: 0,
            cleanup_interval_secs: 0,
            enable_async_persist: false,
            async_persister_num: default_async_persister_num(),
            persist_buffer_size: default_persist_buffer_size(),
            persist_timeout_ms: default_persist_timeout_ms(),
            async_summary_num: default_summary_worker_num(),
            summary_queue_size: default_summary_queue_size(),
            summary_job_timeout_secs: default_summary_job_timeout_secs(),
            ignore_hook_errors: false,
        }
    }
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => warn!("Invalid {} value: {}", name, raw),
        }
    }
}

fn ttl(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl SessionServiceConfig {
    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::ConfigurationError(format!("invalid session config: {}", e)))
    }

    /// Defaults overridden from the environment
    pub fn load() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `TRELLIS_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("TRELLIS_SESSION_TTL_SECS", &mut self.session_ttl_secs);
        override_from_env("TRELLIS_APP_STATE_TTL_SECS", &mut self.app_state_ttl_secs);
        override_from_env("TRELLIS_USER_STATE_TTL_SECS", &mut self.user_state_ttl_secs);
        override_from_env("TRELLIS_SESSION_EVENT_LIMIT", &mut self.session_event_limit);
        override_from_env("TRELLIS_CLEANUP_INTERVAL_SECS", &mut self.cleanup_interval_secs);
        override_from_env("TRELLIS_ENABLE_ASYNC_PERSIST", &mut self.enable_async_persist);
        override_from_env("TRELLIS_ASYNC_PERSISTER_NUM", &mut self.async_persister_num);
        override_from_env("TRELLIS_SUMMARY_WORKER_NUM", &mut self.async_summary_num);
        override_from_env("TRELLIS_SUMMARY_QUEUE_SIZE", &mut self.summary_queue_size);
        override_from_env("TRELLIS_SUMMARY_JOB_TIMEOUT_SECS", &mut self.summary_job_timeout_secs);
        override_from_env("TRELLIS_IGNORE_HOOK_ERRORS", &mut self.ignore_hook_errors);
        self
    }

    /// Session TTL, `None` when sessions never expire
    pub fn session_ttl(&self) -> Option<Duration> {
        ttl(self.session_ttl_secs)
    }

    /// App-state TTL
    pub fn app_state_ttl(&self) -> Option<Duration> {
        ttl(self.app_state_ttl_secs)
    }

    /// User-state TTL
    pub fn user_state_ttl(&self) -> Option<Duration> {
        ttl(self.user_state_ttl_secs)
    }

    /// Cleanup interval; `None` when nothing can expire.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        if self.cleanup_interval_secs > 0 {
            return Some(Duration::from_secs(self.cleanup_interval_secs));
        }
        let any_ttl = self.session_ttl_secs > 0 || self.app_state_ttl_secs > 0 || self.user_state_ttl_secs > 0;
        any_ttl.then(|| Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS))
    }

    /// Persistence job timeout
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    /// Summary job timeout
    pub fn summary_job_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionServiceConfig::default();
        assert_eq!(config.async_persister_num, 10);
        assert_eq!(config.persist_buffer_size, 100);
        assert_eq!(config.persist_timeout(), Duration::from_secs(2));
        assert_eq!(config.async_summary_num, 3);
        assert_eq!(config.summary_queue_size, 256);
        assert_eq!(config.summary_job_timeout(), Duration::from_secs(30));
        assert_eq!(config.cleanup_interval(), None);
        assert_eq!(config.session_ttl(), None);
    }

    #[test]
    fn yaml_with_partial_fields() {
        let config = SessionServiceConfig::from_yaml("session_ttl_secs: 60\nsession_event_limit: 3\n").unwrap();
        assert_eq!(config.session_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.session_event_limit, 3);
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS)));
        assert_eq!(config.async_persister_num, 10);
    }

    #[test]
    fn invalid_yaml_is_configuration_error() {
        let err = SessionServiceConfig::from_yaml("session_ttl_secs: [").unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }
}
