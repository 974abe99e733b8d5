//! Structured logging on `tracing`.
//!
//! Pretty output for development, JSON lines for log aggregation. `RUST_LOG`
//! wins over the configured filter when set.

use anyhow::Context;
use tracing::{error, info, Subscriber};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::MonitoringConfig;

fn output_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer().pretty().with_target(true).with_thread_ids(true).boxed()
    }
}

/// Install the global subscriber. Fails when one is already installed.
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .with_context(|| format!("invalid log filter '{}'", config.log_filter))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(output_layer(config.enable_json_logging))
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    info!(
        service_name = %config.service_name,
        format = if config.enable_json_logging { "json" } else { "pretty" },
        "logging ready"
    );
    Ok(())
}

/// Log a `Result` in passing.
pub trait LogExt<T, E> {
    /// Log the error, if any, under `what`
    fn log_err(self, what: &str) -> Result<T, E>;

    /// Log `what` on success
    fn log_ok(self, what: &str) -> Result<T, E>;
}

impl<T, E: std::fmt::Display> LogExt<T, E> for Result<T, E> {
    fn log_err(self, what: &str) -> Result<T, E> {
        if let Err(e) = &self {
            error!(error = %e, "{}", what);
        }
        self
    }

    fn log_ok(self, what: &str) -> Result<T, E> {
        if self.is_ok() {
            info!("{}", what);
        }
        self
    }
}

/// Install a test-writer subscriber; repeated calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ext_passes_results_through() {
        init_test_tracing();
        let ok: Result<u8, String> = Ok(1);
        assert_eq!(ok.log_ok("fine").log_err("unused"), Ok(1));
        let err: Result<u8, String> = Err("bad".into());
        assert_eq!(err.log_err("failed"), Err("bad".to_string()));
    }

    #[test]
    fn second_init_reports_error() {
        init_test_tracing();
        assert!(init_logging(&MonitoringConfig::default()).is_err());
    }
}
