//! Background memory extraction.
//!
//! Jobs are sharded by `(app, user)` so one user's extractions run in
//! order on one worker. A full queue falls back to extracting inline.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use trellis_core::{Context, CoreError, ErrorKind, Message, Result, Role};
use trellis_session::{Session, WorkerShards};

use crate::entry::{Entry, MemoryKey, UserKey};
use crate::extractor::{ExtractionContext, MemoryExtractor};
use crate::operation::Operation;
use crate::tool::ADD_TOOL_NAME;

/// Session state key holding the time of the newest extracted event.
pub const LAST_EXTRACT_AT_KEY: &str = "memory:last_extract_at";

fn default_async_memory_num() -> usize {
    1
}

fn default_memory_queue_size() -> usize {
    10
}

fn default_memory_job_timeout_secs() -> u64 {
    30
}

fn default_watermark_ttl_secs() -> u64 {
    3600
}

/// Auto-memory worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMemoryConfig {
    /// Number of workers
    #[serde(default = "default_async_memory_num")]
    pub async_memory_num: usize,
    /// Queued jobs per worker
    #[serde(default = "default_memory_queue_size")]
    pub memory_queue_size: usize,
    /// Deadline of one extraction
    #[serde(default = "default_memory_job_timeout_secs")]
    pub memory_job_timeout_secs: u64,
    /// How long a finished job's watermark is kept for sessions that never
    /// come back with it in their state
    #[serde(default = "default_watermark_ttl_secs")]
    pub watermark_ttl_secs: u64,
}

impl Default for AutoMemoryConfig {
    fn default() -> Self {
        Self {
            async_memory_num: default_async_memory_num(),
            memory_queue_size: default_memory_queue_size(),
            memory_job_timeout_secs: default_memory_job_timeout_secs(),
            watermark_ttl_secs: default_watermark_ttl_secs(),
        }
    }
}

impl AutoMemoryConfig {
    /// Job deadline as a `Duration`; zero falls back to the default.
    pub fn job_timeout(&self) -> Duration {
        let secs = if self.memory_job_timeout_secs == 0 {
            default_memory_job_timeout_secs()
        } else {
            self.memory_job_timeout_secs
        };
        Duration::from_secs(secs)
    }

    /// Watermark retention; never shorter than one job deadline.
    pub fn watermark_ttl(&self) -> Duration {
        Duration::from_secs(self.watermark_ttl_secs).max(self.job_timeout())
    }
}

/// Store operations the worker applies.
#[async_trait]
pub trait MemoryOperator: Send + Sync {
    /// Memories of a user, newest first; `0` reads all.
    async fn read_memories(&self, ctx: &Context, user_key: &UserKey, limit: usize) -> Result<Vec<Entry>>;
    /// Store a memory
    async fn add_memory(&self, ctx: &Context, user_key: &UserKey, memory: &str, topics: Vec<String>) -> Result<()>;
    /// Rewrite a memory
    async fn update_memory(&self, ctx: &Context, key: &MemoryKey, memory: &str, topics: Vec<String>) -> Result<()>;
    /// Remove a memory
    async fn delete_memory(&self, ctx: &Context, key: &MemoryKey) -> Result<()>;
    /// Remove all memories of a user
    async fn clear_memories(&self, ctx: &Context, user_key: &UserKey) -> Result<()>;
}

/// One extraction request.
#[derive(Debug, Clone)]
pub struct MemoryJob {
    /// Owner of the memories
    pub user_key: UserKey,
    /// `app:user:session` of the source session
    pub session_key: String,
    /// Timestamp of the newest scanned event
    pub latest_ts: DateTime<Utc>,
    /// Messages to extract from
    pub messages: Vec<Message>,
}

/// Parse `memory:last_extract_at` from the session state.
pub fn read_last_extract_at(session: &Session) -> Option<DateTime<Utc>> {
    let raw = session.get_state(LAST_EXTRACT_AT_KEY)?;
    let text = std::str::from_utf8(raw).ok()?;
    DateTime::parse_from_rfc3339(text).ok().map(|t| t.with_timezone(&Utc))
}

/// Record `ts` as the last extraction time.
pub fn write_last_extract_at(session: &mut Session, ts: DateTime<Utc>) {
    let text = ts.to_rfc3339_opts(SecondsFormat::Nanos, true);
    session.state.insert(LAST_EXTRACT_AT_KEY.to_string(), text.into_bytes());
}

/// User and assistant text of events newer than `since`, with the newest
/// timestamp seen. Tool calls and tool results are left out.
pub fn scan_delta_since(session: &Session, since: Option<DateTime<Utc>>) -> (DateTime<Utc>, Vec<Message>) {
    let mut latest = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut messages = Vec::new();
    for event in &session.events {
        if since.is_some_and(|since| event.timestamp <= since) {
            continue;
        }
        if event.timestamp > latest {
            latest = event.timestamp;
        }
        let Some(response) = &event.response else {
            continue;
        };
        for choice in &response.choices {
            let msg = &choice.message;
            let conversational = matches!(msg.role, Role::User | Role::Assistant);
            if conversational && msg.tool_id.is_none() && msg.tool_calls.is_empty() && !msg.content.is_empty() {
                messages.push(msg.clone());
            }
        }
    }
    (latest, messages)
}

struct WorkerCore {
    extractor: Arc<dyn MemoryExtractor>,
    operator: Arc<dyn MemoryOperator>,
    enabled: BTreeSet<String>,
    timeout: Duration,
    watermark_ttl: Duration,
    watermarks: DashMap<String, Watermark>,
}

/// Newest extracted event of a session, and when a job recorded it.
#[derive(Debug, Clone, Copy)]
struct Watermark {
    latest_ts: DateTime<Utc>,
    recorded_at: Instant,
}

impl WorkerCore {
    fn is_enabled(&self, tool: &str) -> bool {
        self.enabled.is_empty() || self.enabled.contains(tool)
    }

    fn record(&self, job: &MemoryJob) {
        let now = Instant::now();
        self.watermarks
            .entry(job.session_key.clone())
            .and_modify(|mark| {
                if mark.latest_ts < job.latest_ts {
                    mark.latest_ts = job.latest_ts;
                }
                mark.recorded_at = now;
            })
            .or_insert(Watermark { latest_ts: job.latest_ts, recorded_at: now });
        self.prune(now);
    }

    fn prune(&self, now: Instant) {
        let before = self.watermarks.len();
        self.watermarks.retain(|_, mark| now.duration_since(mark.recorded_at) < self.watermark_ttl);
        let evicted = before.saturating_sub(self.watermarks.len());
        if evicted > 0 {
            debug!(evicted, "expired memory watermarks dropped");
        }
    }

    /// Watermark of `session_key`. Dropped once `from_state` has caught up.
    fn watermark(&self, session_key: &str, from_state: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let mark = self.watermarks.get(session_key).map(|m| m.latest_ts)?;
        if from_state.is_some_and(|state| state >= mark) {
            self.watermarks.remove_if(session_key, |_, m| m.latest_ts <= mark);
            return None;
        }
        Some(mark)
    }

    async fn create_auto_memory(&self, ctx: &Context, job: &MemoryJob) -> Result<()> {
        let user = &job.user_key;
        let existing = match self.operator.read_memories(ctx, user, 0).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(app_name = %user.app_name, user_id = %user.user_id, error = %e, "failed to read existing memories");
                Vec::new()
            }
        };

        let ops = self.extractor.extract(ctx, &job.messages, &existing, &self.enabled).await.map_err(|e| {
            warn!(app_name = %user.app_name, user_id = %user.user_id, error = %e, "memory extraction failed");
            e
        })?;
        for op in ops {
            self.execute(ctx, user, op).await;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &Context, user: &UserKey, op: Operation) {
        if !self.is_enabled(op.tool_name()) {
            debug!(app_name = %user.app_name, user_id = %user.user_id, tool = op.tool_name(), "skipping disabled operation");
            return;
        }
        let tool = op.tool_name();
        let result = match op {
            Operation::Add { memory, topics } => self.operator.add_memory(ctx, user, &memory, topics).await,
            Operation::Update { memory_id, memory, topics } => {
                let key = MemoryKey::new(user.app_name.clone(), user.user_id.clone(), memory_id);
                match self.operator.update_memory(ctx, &key, &memory, topics.clone()).await {
                    Err(e) if e.kind() == ErrorKind::NotFound && self.is_enabled(ADD_TOOL_NAME) => {
                        debug!(memory_id = %key.memory_id, "update target missing, adding instead");
                        self.operator.add_memory(ctx, user, &memory, topics).await
                    }
                    other => other,
                }
            }
            Operation::Delete { memory_id } => {
                let key = MemoryKey::new(user.app_name.clone(), user.user_id.clone(), memory_id);
                self.operator.delete_memory(ctx, &key).await
            }
            Operation::Clear => self.operator.clear_memories(ctx, user).await,
        };
        if let Err(e) = result {
            warn!(app_name = %user.app_name, user_id = %user.user_id, tool, error = %e, "memory operation failed");
        }
    }

    async fn process(&self, job: MemoryJob) {
        let ctx = Context::new();
        match tokio::time::timeout(self.timeout, self.create_auto_memory(&ctx, &job)).await {
            Ok(Ok(())) => self.record(&job),
            Ok(Err(e)) => warn!(
                app_name = %job.user_key.app_name,
                user_id = %job.user_key.user_id,
                error = %e,
                "auto memory job failed"
            ),
            Err(_) => warn!(
                app_name = %job.user_key.app_name,
                user_id = %job.user_key.user_id,
                timeout_secs = self.timeout.as_secs(),
                "auto memory job timed out"
            ),
        }
    }
}

/// Sharded pool running memory extraction in the background.
pub struct AutoMemoryWorker {
    shards: Arc<WorkerShards<MemoryJob>>,
    core: Arc<WorkerCore>,
}

impl fmt::Debug for AutoMemoryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMemoryWorker")
            .field("workers", &self.shards.len())
            .field("enabled", &self.core.enabled)
            .field("timeout", &self.core.timeout)
            .finish()
    }
}

impl AutoMemoryWorker {
    /// Start the workers. `enabled` limits which operations are applied;
    /// empty allows all.
    pub fn new(
        config: &AutoMemoryConfig,
        extractor: Arc<dyn MemoryExtractor>,
        operator: Arc<dyn MemoryOperator>,
        enabled: BTreeSet<String>,
    ) -> Self {
        let (shards, receivers) = WorkerShards::new("auto_memory", config.async_memory_num, config.memory_queue_size);
        let core = Arc::new(WorkerCore {
            extractor,
            operator,
            enabled,
            timeout: config.job_timeout(),
            watermark_ttl: config.watermark_ttl(),
            watermarks: DashMap::new(),
        });
        let worker = Arc::clone(&core);
        shards.spawn_workers(receivers, move |job: MemoryJob| {
            let worker = Arc::clone(&worker);
            async move { worker.process(job).await }
        });
        Self { shards, core }
    }

    /// Newest extraction time known for the session, from its state or
    /// from background jobs that finished since it was loaded.
    pub fn last_extract_at(&self, session: &Session) -> Option<DateTime<Utc>> {
        let from_state = read_last_extract_at(session);
        let from_jobs = self.core.watermark(&session.key().hash_key(), from_state);
        from_state.max(from_jobs)
    }

    fn try_enqueue(&self, ctx: &Context, job: MemoryJob) -> std::result::Result<(), MemoryJob> {
        if ctx.is_cancelled() {
            return Err(job);
        }
        let hash_key = format!("{}:{}", job.user_key.app_name, job.user_key.user_id);
        let Some(sender) = self.shards.sender_for(&hash_key) else {
            return Err(job);
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!(app_name = %job.user_key.app_name, user_id = %job.user_key.user_id, "memory job queue full");
                Err(job)
            }
            Err(TrySendError::Closed(job)) => Err(job),
        }
    }

    /// Extract memories from the session's new messages.
    ///
    /// Queued when possible. Otherwise extraction runs inline and the
    /// session's `memory:last_extract_at` is advanced on success; a
    /// cancelled `ctx` skips the inline run.
    pub async fn enqueue_job(&self, ctx: &Context, session: &mut Session) -> Result<()> {
        let user_key = UserKey::new(session.app_name.clone(), session.user_id.clone());
        if user_key.check_user_key().is_err() {
            debug!("auto memory skipped: empty app or user");
            return Ok(());
        }

        let since = self.last_extract_at(session);
        let (latest_ts, messages) = scan_delta_since(session, since);
        if messages.is_empty() {
            debug!(app_name = %user_key.app_name, user_id = %user_key.user_id, "auto memory skipped: no new messages");
            return Ok(());
        }

        let extraction = ExtractionContext { user_key, messages, last_extract_at: since };
        if !self.core.extractor.should_extract(&extraction) {
            debug!(
                app_name = %extraction.user_key.app_name,
                user_id = %extraction.user_key.user_id,
                "auto memory skipped by checker"
            );
            return Ok(());
        }

        let job = MemoryJob {
            user_key: extraction.user_key,
            session_key: session.key().hash_key(),
            latest_ts,
            messages: extraction.messages,
        };
        let job = match self.try_enqueue(ctx, job) {
            Ok(()) => return Ok(()),
            Err(job) => job,
        };
        if ctx.is_cancelled() {
            debug!(app_name = %job.user_key.app_name, user_id = %job.user_key.user_id, "auto memory skipped: cancelled");
            return Ok(());
        }

        debug!(app_name = %job.user_key.app_name, user_id = %job.user_key.user_id, "processing memory job inline");
        let inline = ctx.detached();
        match tokio::time::timeout(self.core.timeout, self.core.create_auto_memory(&inline, &job)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoreError::Timeout(format!(
                    "memory extraction for {}/{} exceeded {}s",
                    job.user_key.app_name,
                    job.user_key.user_id,
                    self.core.timeout.as_secs()
                )))
            }
        }
        self.core.record(&job);
        write_last_extract_at(session, latest_ts);
        Ok(())
    }

    /// Stop accepting jobs and wait for queued ones. Idempotent.
    pub async fn close(&self) {
        self.shards.close().await;
    }
}
