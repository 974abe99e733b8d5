//! Rate-limit retry with exponential backoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::model::{Model, ModelInfo, Request, ResponseStream};

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    90_000
}

fn default_max_attempts() -> u32 {
    10
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor between retries
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on a single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Run `op`, retrying only on rate-limit errors. Sleeps abort on cancellation.
pub async fn retry_on_rate_limit<T, F, Fut>(ctx: &Context, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_rate_limit() && attempt < attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "rate limited, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => {
                        return Err(CoreError::Cancelled("retry aborted by context cancellation".to_string()));
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Model wrapper applying [`retry_on_rate_limit`] to every call.
pub struct RateLimitRetryModel {
    inner: Arc<dyn Model>,
    config: RetryConfig,
}

impl RateLimitRetryModel {
    /// Wrap a model
    pub fn new(inner: Arc<dyn Model>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Model for RateLimitRetryModel {
    async fn generate_content(&self, ctx: &Context, request: Request) -> Result<ResponseStream> {
        retry_on_rate_limit(ctx, &self.config, || self.inner.generate_content(ctx, request.clone())).await
    }

    fn info(&self) -> ModelInfo {
        self.inner.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_schedule() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(cfg.delay_for_attempt(6), Duration::from_secs(64));
        assert_eq!(cfg.delay_for_attempt(7), Duration::from_secs(90));
        assert_eq!(cfg.delay_for_attempt(9), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_on_rate_limit(&Context::new(), &RetryConfig::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoreError::RateLimit("429".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_rate_limit(&Context::new(), &RetryConfig::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::RateLimit("429".into()))
        })
        .await;
        assert!(result.unwrap_err().is_rate_limit());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_rate_limit(&Context::new(), &RetryConfig::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::UpstreamError("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let ctx = Context::new();
        ctx.cancel();
        let result: Result<()> = retry_on_rate_limit(&ctx, &RetryConfig::default(), || async {
            Err(CoreError::RateLimit("429".into()))
        })
        .await;
        assert!(matches!(result, Err(CoreError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn model_wrapper_retries_rate_limited_calls() {
        let mut mock = crate::model::MockModel::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_generate_content()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(CoreError::RateLimit("429".into())));
        mock.expect_generate_content()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Box::pin(futures::stream::empty())));
        mock.expect_info().returning(|| ModelInfo { name: "mock".into() });

        let model = RateLimitRetryModel::new(Arc::new(mock), RetryConfig::default());
        assert_eq!(model.info().name, "mock");
        assert!(model.generate_content(&Context::new(), Request::default()).await.is_ok());
    }
}
