//! Asynchronous summarization.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use trellis_core::Context;

use super::WorkerShards;
use crate::config::SessionServiceConfig;
use crate::session::{Session, SUMMARY_FILTER_KEY_ALL_CONTENTS};
use crate::summary::{summarize_and_store, SessionSummarizer, SummaryStore};

/// One summarization request.
#[derive(Debug, Clone)]
pub struct SummaryJob {
    /// Branch to summarize, `""` for the whole session
    pub filter_key: String,
    /// Skip the delta and `should_summarize` checks
    pub force: bool,
    /// Snapshot of the session at enqueue time
    pub session: Session,
}

struct SummaryWorker {
    store: Arc<dyn SummaryStore>,
    summarizer: Arc<dyn SessionSummarizer>,
    timeout: Duration,
}

impl SummaryWorker {
    async fn run(&self, job: &SummaryJob) -> bool {
        let ctx = Context::new();
        let work = summarize_and_store(
            &ctx,
            self.store.as_ref(),
            self.summarizer.as_ref(),
            &job.session,
            &job.filter_key,
            job.force,
        );
        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(produced)) => produced.is_some(),
            Ok(Err(e)) => {
                error!(
                    session_id = %job.session.id,
                    filter_key = %job.filter_key,
                    error = %e,
                    "summary job failed"
                );
                false
            }
            Err(_) => {
                warn!(
                    session_id = %job.session.id,
                    filter_key = %job.filter_key,
                    timeout_secs = self.timeout.as_secs(),
                    "summary job timed out"
                );
                false
            }
        }
    }

    async fn process(&self, shards: &WorkerShards<SummaryJob>, job: SummaryJob) {
        let produced = self.run(&job).await;
        if !produced || job.filter_key == SUMMARY_FILTER_KEY_ALL_CONTENTS {
            return;
        }
        let cascade = SummaryJob { filter_key: SUMMARY_FILTER_KEY_ALL_CONTENTS.to_string(), ..job };
        let Some(sender) = shards.sender_for(&cascade.session.key().hash_key()) else {
            self.run(&cascade).await;
            return;
        };
        match sender.try_send(cascade) {
            Ok(()) => debug!("full-session summary queued"),
            Err(TrySendError::Full(cascade)) | Err(TrySendError::Closed(cascade)) => {
                debug!(session_id = %cascade.session.id, "summary queue busy, cascading inline");
                self.run(&cascade).await;
            }
        }
    }
}

/// Worker pool producing summaries in the background.
pub struct SummaryPool {
    shards: Arc<WorkerShards<SummaryJob>>,
    summarizer: Arc<dyn SessionSummarizer>,
}

impl std::fmt::Debug for SummaryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryPool").field("workers", &self.shards.len()).finish()
    }
}

impl SummaryPool {
    /// Start `workers` workers with `queue_size` queued jobs each.
    pub fn new(
        store: Arc<dyn SummaryStore>,
        summarizer: Arc<dyn SessionSummarizer>,
        workers: usize,
        queue_size: usize,
        timeout: Duration,
    ) -> Self {
        let (shards, receivers) = WorkerShards::new("summary", workers, queue_size);
        let worker = Arc::new(SummaryWorker { store, summarizer: Arc::clone(&summarizer), timeout });
        let handle = Arc::clone(&shards);
        shards.spawn_workers(receivers, move |job: SummaryJob| {
            let worker = Arc::clone(&worker);
            let shards = Arc::clone(&handle);
            async move { worker.process(&shards, job).await }
        });
        Self { shards, summarizer }
    }

    /// Pool sized from the service configuration
    pub fn from_config(
        store: Arc<dyn SummaryStore>,
        summarizer: Arc<dyn SessionSummarizer>,
        config: &SessionServiceConfig,
    ) -> Self {
        Self::new(
            store,
            summarizer,
            config.async_summary_num,
            config.summary_queue_size,
            config.summary_job_timeout(),
        )
    }

    /// Summarizer the workers use
    pub fn summarizer(&self) -> &Arc<dyn SessionSummarizer> {
        &self.summarizer
    }

    /// Queue without waiting. The job comes back when the queue is full,
    /// the pool is closed or the caller is cancelled; the caller then
    /// summarizes synchronously.
    pub fn try_enqueue(&self, ctx: &Context, job: SummaryJob) -> std::result::Result<(), SummaryJob> {
        if ctx.is_cancelled() {
            return Err(job);
        }
        let Some(sender) = self.shards.sender_for(&job.session.key().hash_key()) else {
            return Err(job);
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!(
                    session_id = %job.session.id,
                    filter_key = %job.filter_key,
                    "summary queue full, summarizing synchronously"
                );
                Err(job)
            }
            Err(TrySendError::Closed(job)) => Err(job),
        }
    }

    /// Stop accepting jobs and wait for queued ones. Idempotent.
    pub async fn close(&self) {
        self.shards.close().await;
    }
}
