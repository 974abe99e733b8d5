//! Memory service contract and its in-memory implementation.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use trellis_core::{Context, CoreError, Result, Tool};
use trellis_session::Session;

use crate::auto::{AutoMemoryConfig, AutoMemoryWorker, MemoryOperator};
use crate::entry::{Entry, Memory, MemoryKey, UserKey, DEFAULT_MEMORY_LIMIT};
use crate::extractor::MemoryExtractor;
use crate::tool::{build_tools, exposed_tool_names, resolve_enabled_tools};

/// Long-term memory of users.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Store a memory for the user
    async fn add_memory(&self, ctx: &Context, user_key: &UserKey, memory: &str, topics: Vec<String>) -> Result<()>;

    /// Rewrite a memory; `NotFound` when it does not exist.
    async fn update_memory(&self, ctx: &Context, key: &MemoryKey, memory: &str, topics: Vec<String>) -> Result<()>;

    /// Remove a memory; `NotFound` when it does not exist.
    async fn delete_memory(&self, ctx: &Context, key: &MemoryKey) -> Result<()>;

    /// Remove every memory of the user
    async fn clear_memories(&self, ctx: &Context, user_key: &UserKey) -> Result<()>;

    /// Most recently updated first; `0` reads all.
    async fn read_memories(&self, ctx: &Context, user_key: &UserKey, limit: usize) -> Result<Vec<Entry>>;

    /// Memories whose text or topics match the query
    async fn search_memories(&self, ctx: &Context, user_key: &UserKey, query: &str) -> Result<Vec<Entry>>;

    /// Tools exposed to the agent
    fn tools(&self) -> Vec<Arc<dyn Tool>>;

    /// Hand the session's new messages to background extraction.
    /// A no-op without an extractor.
    async fn enqueue_auto_memory_job(&self, ctx: &Context, session: &mut Session) -> Result<()>;

    /// Stop background work. Idempotent.
    async fn close(&self) -> Result<()>;
}

fn sort_newest_first(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn same_topics(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    a == b
}

/// Entries per user, guarded by the map's shard locks.
struct MemoryStore {
    users: DashMap<UserKey, HashMap<String, Entry>>,
    limit: usize,
}

impl MemoryStore {
    fn add(&self, user_key: &UserKey, memory: &str, topics: Vec<String>) -> Result<()> {
        user_key.check_user_key()?;
        if memory.is_empty() {
            return Err(CoreError::ValidationError("memory content is required".to_string()));
        }
        let now = Utc::now();
        let mut entries = self.users.entry(user_key.clone()).or_default();

        if let Some(existing) =
            entries.values_mut().find(|e| e.memory.memory == memory && same_topics(&e.memory.topics, &topics))
        {
            existing.updated_at = now;
            existing.memory.last_updated = Some(now);
            debug!(memory_id = %existing.id, "memory already stored, refreshed");
            return Ok(());
        }

        if self.limit > 0 && entries.len() >= self.limit {
            return Err(CoreError::ValidationError(format!(
                "memory limit exceeded for user {}, limit: {}, current: {}",
                user_key.user_id,
                self.limit,
                entries.len()
            )));
        }

        let id = Uuid::new_v4().to_string();
        entries.insert(
            id.clone(),
            Entry {
                id,
                app_name: user_key.app_name.clone(),
                user_id: user_key.user_id.clone(),
                memory: Memory { memory: memory.to_string(), topics, last_updated: Some(now) },
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    fn update(&self, key: &MemoryKey, memory: &str, topics: Vec<String>) -> Result<()> {
        key.check()?;
        if memory.is_empty() {
            return Err(CoreError::ValidationError("memory content is required".to_string()));
        }
        let not_found = || CoreError::NotFound(format!("memory {} not found", key.memory_id));
        let mut entries = self.users.get_mut(&key.user_key()).ok_or_else(not_found)?;
        let entry = entries.get_mut(&key.memory_id).ok_or_else(not_found)?;
        let now = Utc::now();
        entry.memory = Memory { memory: memory.to_string(), topics, last_updated: Some(now) };
        entry.updated_at = now;
        Ok(())
    }

    fn delete(&self, key: &MemoryKey) -> Result<()> {
        key.check()?;
        let removed = self.users.get_mut(&key.user_key()).and_then(|mut entries| entries.remove(&key.memory_id));
        match removed {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound(format!("memory {} not found", key.memory_id))),
        }
    }

    fn clear(&self, user_key: &UserKey) -> Result<()> {
        user_key.check_user_key()?;
        self.users.remove(user_key);
        Ok(())
    }

    fn read(&self, user_key: &UserKey, limit: usize) -> Result<Vec<Entry>> {
        user_key.check_user_key()?;
        let mut entries: Vec<Entry> =
            self.users.get(user_key).map(|m| m.values().cloned().collect()).unwrap_or_default();
        sort_newest_first(&mut entries);
        if limit > 0 {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn search(&self, user_key: &UserKey, query: &str) -> Result<Vec<Entry>> {
        user_key.check_user_key()?;
        let mut entries: Vec<Entry> = self
            .users
            .get(user_key)
            .map(|m| m.values().filter(|e| e.matches(query)).cloned().collect())
            .unwrap_or_default();
        sort_newest_first(&mut entries);
        Ok(entries)
    }
}

#[async_trait]
impl MemoryOperator for MemoryStore {
    async fn read_memories(&self, _ctx: &Context, user_key: &UserKey, limit: usize) -> Result<Vec<Entry>> {
        self.read(user_key, limit)
    }

    async fn add_memory(&self, _ctx: &Context, user_key: &UserKey, memory: &str, topics: Vec<String>) -> Result<()> {
        self.add(user_key, memory, topics)
    }

    async fn update_memory(&self, _ctx: &Context, key: &MemoryKey, memory: &str, topics: Vec<String>) -> Result<()> {
        self.update(key, memory, topics)
    }

    async fn delete_memory(&self, _ctx: &Context, key: &MemoryKey) -> Result<()> {
        self.delete(key)
    }

    async fn clear_memories(&self, _ctx: &Context, user_key: &UserKey) -> Result<()> {
        self.clear(user_key)
    }
}

/// Builder for [`InMemoryMemoryService`].
#[derive(Default)]
pub struct InMemoryMemoryServiceBuilder {
    memory_limit: Option<usize>,
    tool_overrides: BTreeMap<String, bool>,
    extractor: Option<Arc<dyn MemoryExtractor>>,
    auto_config: AutoMemoryConfig,
}

impl InMemoryMemoryServiceBuilder {
    /// Cap on memories per user; `0` removes the cap.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Enable or disable one memory tool, overriding the mode default.
    pub fn with_tool_enabled(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.tool_overrides.insert(name.into(), enabled);
        self
    }

    /// Extract memories in the background with `extractor`.
    pub fn with_extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Background worker settings
    pub fn with_auto_memory_config(mut self, config: AutoMemoryConfig) -> Self {
        self.auto_config = config;
        self
    }

    /// Build the service; starts the auto-memory worker when an extractor is set.
    pub fn build(self) -> InMemoryMemoryService {
        let store = Arc::new(MemoryStore {
            users: DashMap::new(),
            limit: self.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
        });
        let auto_mode = self.extractor.is_some();
        let enabled = resolve_enabled_tools(auto_mode, &self.tool_overrides);
        let worker = self.extractor.map(|extractor| {
            Arc::new(AutoMemoryWorker::new(&self.auto_config, extractor, store.clone(), enabled.clone()))
        });
        info!(limit = store.limit, auto_mode, tools = ?enabled, "memory service started");
        InMemoryMemoryService { store, enabled: Arc::new(enabled), auto_mode, worker }
    }
}

/// Memory service keeping entries in process memory.
#[derive(Clone)]
pub struct InMemoryMemoryService {
    store: Arc<MemoryStore>,
    enabled: Arc<BTreeSet<String>>,
    auto_mode: bool,
    worker: Option<Arc<AutoMemoryWorker>>,
}

impl fmt::Debug for InMemoryMemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMemoryService")
            .field("limit", &self.store.limit)
            .field("enabled", &self.enabled)
            .field("worker", &self.worker)
            .finish()
    }
}

impl Default for InMemoryMemoryService {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl InMemoryMemoryService {
    /// Service with default limit and the agent-managed tool set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder
    pub fn builder() -> InMemoryMemoryServiceBuilder {
        InMemoryMemoryServiceBuilder::default()
    }

    /// Enabled tool names, including background-only ones
    pub fn enabled_tools(&self) -> &BTreeSet<String> {
        &self.enabled
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn add_memory(&self, _ctx: &Context, user_key: &UserKey, memory: &str, topics: Vec<String>) -> Result<()> {
        self.store.add(user_key, memory, topics)
    }

    async fn update_memory(&self, _ctx: &Context, key: &MemoryKey, memory: &str, topics: Vec<String>) -> Result<()> {
        self.store.update(key, memory, topics)
    }

    async fn delete_memory(&self, _ctx: &Context, key: &MemoryKey) -> Result<()> {
        self.store.delete(key)
    }

    async fn clear_memories(&self, _ctx: &Context, user_key: &UserKey) -> Result<()> {
        self.store.clear(user_key)
    }

    async fn read_memories(&self, _ctx: &Context, user_key: &UserKey, limit: usize) -> Result<Vec<Entry>> {
        self.store.read(user_key, limit)
    }

    async fn search_memories(&self, _ctx: &Context, user_key: &UserKey, query: &str) -> Result<Vec<Entry>> {
        self.store.search(user_key, query)
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let names = exposed_tool_names(self.auto_mode, &self.enabled);
        build_tools(Arc::new(self.clone()), &names)
    }

    async fn enqueue_auto_memory_job(&self, ctx: &Context, session: &mut Session) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.enqueue_job(ctx, session).await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(worker) = &self.worker {
            worker.close().await;
        }
        Ok(())
    }
}
