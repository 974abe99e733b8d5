//! Monitoring for the Trellis runtime: structured logging only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod logging;

pub use logging::{init_logging, init_test_tracing, LogExt};

fn default_service_name() -> String {
    "trellis".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Configuration for the logging subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup record
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g. "info,trellis_session=debug"); `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON lines instead of pretty output
    #[serde(default)]
    pub enable_json_logging: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `TRELLIS_SERVICE_NAME`, `TRELLIS_LOG_FILTER`, `TRELLIS_LOG_JSON`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("TRELLIS_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(filter) = std::env::var("TRELLIS_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Ok(json) = std::env::var("TRELLIS_LOG_JSON") {
            match json.parse::<bool>() {
                Ok(v) => config.enable_json_logging = v,
                Err(_) => warn!("Invalid TRELLIS_LOG_JSON value: {}, using default", json),
            }
        }
        config
    }
}
