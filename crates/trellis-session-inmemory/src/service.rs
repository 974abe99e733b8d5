//! In-memory `SessionService`.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use trellis_core::{Context, Event, Result, StateMap};
use trellis_session::summary::create_session_summary_with_cascade;
use trellis_session::{
    AppendEventBase, AppendEventContext, AppendEventHook, ConsecutiveUserHandler, GetOptions, GetSessionBase,
    GetSessionContext, GetSessionHook, Hooks, Key, Session, SessionService, SessionServiceConfig, SessionSummarizer,
    SummaryJob, SummaryPool, TrackEvent, UserKey,
};

use crate::store::Store;

/// Builder for [`InMemorySessionService`].
#[derive(Default)]
pub struct InMemorySessionServiceBuilder {
    config: SessionServiceConfig,
    hooks: Hooks,
    consecutive_handler: Option<ConsecutiveUserHandler>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
}

impl InMemorySessionServiceBuilder {
    /// Start from a configuration
    pub fn new(config: SessionServiceConfig) -> Self {
        let hooks = Hooks { ignore_errors: config.ignore_hook_errors, ..Default::default() };
        Self { config, hooks, ..Default::default() }
    }

    /// Add an append middleware
    pub fn with_append_event_hook(mut self, hook: Arc<dyn AppendEventHook>) -> Self {
        self.hooks.append_event.push(hook);
        self
    }

    /// Add a get middleware
    pub fn with_get_session_hook(mut self, hook: Arc<dyn GetSessionHook>) -> Self {
        self.hooks.get_session.push(hook);
        self
    }

    /// Handler for two adjacent user messages
    pub fn with_consecutive_user_handler(mut self, handler: ConsecutiveUserHandler) -> Self {
        self.consecutive_handler = Some(handler);
        self
    }

    /// Summarizer; enables the summary pool when workers are configured.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn SessionSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Build the service, starting the cleanup ticker and summary workers as configured.
    pub fn build(self) -> InMemorySessionService {
        let store = Arc::new(Store::new(self.config.clone()));
        let summary_pool = match &self.summarizer {
            Some(summarizer) if self.config.async_summary_num > 0 => Some(SummaryPool::from_config(
                store.clone(),
                Arc::clone(summarizer),
                &self.config,
            )),
            _ => None,
        };
        let stop = Context::new();
        let cleanup = self
            .config
            .cleanup_interval()
            .map(|interval| spawn_cleanup(Arc::clone(&store), interval, stop.clone()));
        info!(
            session_ttl_secs = self.config.session_ttl_secs,
            event_limit = self.config.session_event_limit,
            summary_workers = summary_pool.is_some(),
            "in-memory session service started"
        );
        InMemorySessionService {
            store,
            hooks: self.hooks,
            consecutive_handler: self.consecutive_handler,
            summarizer: self.summarizer,
            summary_pool,
            stop,
            cleanup: Mutex::new(cleanup),
        }
    }
}

fn spawn_cleanup(store: Arc<Store>, interval: Duration, stop: Context) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => store.cleanup_expired().await,
                _ = stop.cancelled() => break,
            }
        }
        debug!("session cleanup stopped");
    })
}

/// Session service keeping everything in process memory.
pub struct InMemorySessionService {
    store: Arc<Store>,
    hooks: Hooks,
    consecutive_handler: Option<ConsecutiveUserHandler>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
    summary_pool: Option<SummaryPool>,
    stop: Context,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InMemorySessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionService")
            .field("config", self.store.config())
            .field("hooks", &self.hooks)
            .field("summary_pool", &self.summary_pool)
            .finish()
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new(SessionServiceConfig::default())
    }
}

impl InMemorySessionService {
    /// Service with no hooks, handler or summarizer
    pub fn new(config: SessionServiceConfig) -> Self {
        InMemorySessionServiceBuilder::new(config).build()
    }

    /// Start a builder
    pub fn builder(config: SessionServiceConfig) -> InMemorySessionServiceBuilder {
        InMemorySessionServiceBuilder::new(config)
    }

    /// Drop every expired session and state now.
    pub async fn cleanup_expired(&self) {
        self.store.cleanup_expired().await;
    }

    async fn summarize_now(&self, ctx: &Context, session: &Session, filter_key: &str, force: bool) -> Result<()> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(());
        };
        create_session_summary_with_cascade(ctx, self.store.as_ref(), summarizer.as_ref(), session, filter_key, force)
            .await
    }
}

struct AppendBase<'a> {
    store: &'a Store,
    handler: Option<&'a ConsecutiveUserHandler>,
}

#[async_trait]
impl AppendEventBase for AppendBase<'_> {
    async fn append(&self, hctx: &mut AppendEventContext<'_>) -> Result<()> {
        self.store.append_event(hctx.session, hctx.event, self.handler).await?;
        Ok(())
    }
}

struct GetBase<'a> {
    store: &'a Store,
}

#[async_trait]
impl GetSessionBase for GetBase<'_> {
    async fn get(&self, hctx: &mut GetSessionContext<'_>) -> Result<Option<Session>> {
        self.store.get_session(&hctx.key, &hctx.options).await
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(&self, _ctx: &Context, key: Key, state: StateMap) -> Result<Session> {
        self.store.create_session(key, state).await
    }

    async fn get_session(&self, ctx: &Context, key: Key, opts: GetOptions) -> Result<Option<Session>> {
        key.check_session_key()?;
        let mut hctx = GetSessionContext { context: ctx, key, options: opts };
        self.hooks.run_get_session(&mut hctx, &GetBase { store: &self.store }).await
    }

    async fn list_sessions(&self, _ctx: &Context, user_key: UserKey, opts: GetOptions) -> Result<Vec<Session>> {
        self.store.list_sessions(&user_key, &opts).await
    }

    async fn delete_session(&self, _ctx: &Context, key: Key) -> Result<()> {
        self.store.delete_session(&key).await
    }

    async fn update_app_state(&self, _ctx: &Context, app_name: &str, state: StateMap) -> Result<()> {
        self.store.update_app_state(app_name, state).await
    }

    async fn delete_app_state(&self, _ctx: &Context, app_name: &str, key: &str) -> Result<()> {
        self.store.delete_app_state(app_name, key).await
    }

    async fn list_app_states(&self, _ctx: &Context, app_name: &str) -> Result<StateMap> {
        self.store.list_app_states(app_name).await
    }

    async fn update_user_state(&self, _ctx: &Context, user_key: UserKey, state: StateMap) -> Result<()> {
        self.store.update_user_state(&user_key, state).await
    }

    async fn list_user_states(&self, _ctx: &Context, user_key: UserKey) -> Result<StateMap> {
        self.store.list_user_states(&user_key).await
    }

    async fn delete_user_state(&self, _ctx: &Context, user_key: UserKey, key: &str) -> Result<()> {
        self.store.delete_user_state(&user_key, key).await
    }

    async fn update_session_state(&self, _ctx: &Context, key: Key, state: StateMap) -> Result<()> {
        self.store.update_session_state(&key, state).await
    }

    async fn append_event(&self, ctx: &Context, session: &mut Session, mut event: Event) -> Result<()> {
        let key = session.key();
        key.check_session_key()?;
        let mut hctx = AppendEventContext { context: ctx, session, event: &mut event, key };
        let base = AppendBase { store: &self.store, handler: self.consecutive_handler.as_ref() };
        self.hooks.run_append_event(&mut hctx, &base).await
    }

    async fn append_track_event(&self, _ctx: &Context, session: &mut Session, event: TrackEvent) -> Result<()> {
        self.store.append_track_event(session, event).await
    }

    async fn create_session_summary(&self, ctx: &Context, session: &Session, filter_key: &str, force: bool) -> Result<()> {
        session.key().check_session_key()?;
        self.summarize_now(ctx, session, filter_key, force).await
    }

    async fn enqueue_summary_job(&self, ctx: &Context, session: &Session, filter_key: &str, force: bool) -> Result<()> {
        session.key().check_session_key()?;
        let Some(pool) = &self.summary_pool else {
            return self.summarize_now(ctx, session, filter_key, force).await;
        };
        let job = SummaryJob { filter_key: filter_key.to_string(), force, session: session.clone() };
        match pool.try_enqueue(ctx, job) {
            Ok(()) => Ok(()),
            Err(job) => self.summarize_now(&ctx.detached(), &job.session, &job.filter_key, job.force).await,
        }
    }

    async fn get_session_summary_text(&self, _ctx: &Context, session: &Session, filter_key: &str) -> Result<Option<String>> {
        self.store.summary_text(session, filter_key).await
    }

    async fn close(&self) -> Result<()> {
        self.stop.cancel();
        let cleanup = self.cleanup.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = cleanup {
            let _ = handle.await;
        }
        if let Some(pool) = &self.summary_pool {
            pool.close().await;
        }
        Ok(())
    }
}
