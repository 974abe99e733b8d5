//! Asynchronous event persistence.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use trellis_core::{Context, Event, Result};

use super::WorkerShards;
use crate::config::SessionServiceConfig;
use crate::session::{AppendOutcome, Key};

/// One append to write to the backing store.
#[derive(Debug, Clone)]
pub struct PersistJob {
    /// Session the event belongs to
    pub key: Key,
    /// The appended event
    pub event: Event,
    /// What the in-memory append did with it
    pub outcome: AppendOutcome,
}

/// Writes an applied append to durable storage.
#[async_trait]
pub trait EventPersister: Send + Sync {
    /// Persist one append
    async fn persist_event(&self, ctx: &Context, job: &PersistJob) -> Result<()>;
}

/// Worker pool writing appends in the background.
pub struct PersistPool {
    shards: Arc<WorkerShards<PersistJob>>,
}

impl std::fmt::Debug for PersistPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistPool").field("workers", &self.shards.len()).finish()
    }
}

impl PersistPool {
    /// Start `workers` workers with `buffer` queued jobs each.
    pub fn new(persister: Arc<dyn EventPersister>, workers: usize, buffer: usize, timeout: Duration) -> Self {
        let (shards, receivers) = WorkerShards::new("persist", workers, buffer);
        shards.spawn_workers(receivers, move |job: PersistJob| {
            let persister = Arc::clone(&persister);
            async move { run_job(persister.as_ref(), job, timeout).await }
        });
        Self { shards }
    }

    /// Pool sized from the service configuration
    pub fn from_config(persister: Arc<dyn EventPersister>, config: &SessionServiceConfig) -> Self {
        Self::new(persister, config.async_persister_num, config.persist_buffer_size, config.persist_timeout())
    }

    /// Queue a job, waiting for room. The job comes back when the pool is
    /// closed or the caller is cancelled; the caller then persists it itself.
    pub async fn submit(&self, ctx: &Context, job: PersistJob) -> std::result::Result<(), PersistJob> {
        let Some(sender) = self.shards.sender_for(&job.key.hash_key()) else {
            return Err(job);
        };
        tokio::select! {
            permit = sender.reserve() => match permit {
                Ok(permit) => {
                    permit.send(job);
                    Ok(())
                }
                Err(_) => Err(job),
            },
            _ = ctx.cancelled() => Err(job),
        }
    }

    /// Stop accepting jobs and wait for queued ones. Idempotent.
    pub async fn close(&self) {
        self.shards.close().await;
    }
}

async fn run_job(persister: &dyn EventPersister, job: PersistJob, timeout: Duration) {
    let ctx = Context::new();
    match tokio::time::timeout(timeout, persister.persist_event(&ctx, &job)).await {
        Ok(Ok(())) => debug!(session_id = %job.key.session_id, event_id = %job.event.id, "event persisted"),
        Ok(Err(e)) => error!(
            app_name = %job.key.app_name,
            session_id = %job.key.session_id,
            event_id = %job.event.id,
            error = %e,
            "async event persistence failed"
        ),
        Err(_) => error!(
            session_id = %job.key.session_id,
            event_id = %job.event.id,
            timeout_ms = timeout.as_millis() as u64,
            "async event persistence timed out"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use trellis_core::CoreError;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EventPersister for Recording {
        async fn persist_event(&self, _ctx: &Context, job: &PersistJob) -> Result<()> {
            if job.event.tag == "fail" {
                return Err(CoreError::StateStoreError("disk full".into()));
            }
            self.seen.lock().unwrap().push((job.key.session_id.clone(), job.event.content().to_string()));
            Ok(())
        }
    }

    fn job(session: &str, text: &str) -> PersistJob {
        PersistJob {
            key: Key::new("app", "u", session),
            event: Event::user_text("inv", text),
            outcome: AppendOutcome { appended: true, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn jobs_of_one_session_keep_order() {
        let persister = Arc::new(Recording::default());
        let pool = PersistPool::new(persister.clone(), 4, 8, Duration::from_secs(1));
        let ctx = Context::new();
        for i in 0..20 {
            tokio_test::assert_ok!(pool.submit(&ctx, job("s1", &format!("m{}", i))).await);
        }
        let mut failing = job("s2", "bad");
        failing.event.tag = "fail".into();
        pool.submit(&ctx, failing).await.unwrap();
        pool.close().await;

        let seen = persister.seen.lock().unwrap();
        let texts: Vec<_> = seen.iter().map(|(_, t)| t.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn submit_after_close_returns_job() {
        let pool = PersistPool::new(Arc::new(Recording::default()), 2, 2, Duration::from_secs(1));
        pool.close().await;
        pool.close().await;
        let back = pool.submit(&Context::new(), job("s1", "late")).await.unwrap_err();
        assert_eq!(back.event.content(), "late");
    }
}
