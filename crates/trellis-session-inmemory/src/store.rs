//! Storage behind the in-memory session service.
//!
//! Apps live in a `DashMap`; every app guards its sessions, user state and
//! app state with one `tokio::sync::RwLock`. Expiry uses `tokio::time::Instant`
//! so paused-clock tests can advance past a TTL.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use trellis_core::{Context, CoreError, Event, Result, StateMap};
use trellis_session::session::{normalize_app_state, normalize_user_state, persistable_session_state, validate_session_state_keys};
use trellis_session::summary::{pick_summary_text, store_if_newer, SummaryStore};
use trellis_session::{
    AppendOutcome, ConsecutiveUserHandler, GetOptions, Key, ScopedDelta, Session, SessionServiceConfig, Summary,
    TrackEvent, UserKey, STATE_PREFIX_APP, STATE_PREFIX_TEMP, STATE_PREFIX_USER,
};

/// A value with an optional deadline
#[derive(Debug, Clone, Default)]
pub(crate) struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self { value, expires_at: deadline(ttl) }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    fn live(&self) -> Option<&T> {
        (!self.is_expired(Instant::now())).then_some(&self.value)
    }

    fn live_mut(&mut self) -> Option<&mut T> {
        if self.is_expired(Instant::now()) {
            return None;
        }
        Some(&mut self.value)
    }

    fn refresh(&mut self, ttl: Option<Duration>) {
        self.expires_at = deadline(ttl);
    }
}

#[derive(Default)]
struct AppData {
    sessions: HashMap<String, HashMap<String, Expiring<Session>>>,
    user_state: HashMap<String, Expiring<StateMap>>,
    app_state: Expiring<StateMap>,
}

impl AppData {
    fn live_app_state(&self) -> StateMap {
        self.app_state.live().cloned().unwrap_or_default()
    }

    fn live_user_state(&self, user_id: &str) -> StateMap {
        self.user_state.get(user_id).and_then(Expiring::live).cloned().unwrap_or_default()
    }

    fn stored_mut(&mut self, key: &Key) -> Result<&mut Expiring<Session>> {
        let entry = self
            .sessions
            .get_mut(&key.user_id)
            .and_then(|sessions| sessions.get_mut(&key.session_id))
            .ok_or_else(|| CoreError::NotFound(format!("session not found: {}", key.session_id)))?;
        if entry.is_expired(Instant::now()) {
            return Err(CoreError::Expired(format!("session expired: {}", key.session_id)));
        }
        Ok(entry)
    }

    fn view(&self, stored: &Session, opts: &GetOptions) -> Session {
        let mut copy = stored.clone();
        copy.apply_event_filtering(opts);
        copy.merge_scoped_state(&self.live_app_state(), &self.live_user_state(&stored.user_id));
        copy
    }

    fn merge_user_delta(&mut self, user_id: &str, delta: StateMap, ttl: Option<Duration>) {
        let entry = self
            .user_state
            .entry(user_id.to_string())
            .or_insert_with(|| Expiring::new(StateMap::new(), ttl));
        if entry.is_expired(Instant::now()) {
            entry.value.clear();
        }
        entry.value.extend(delta);
        entry.refresh(ttl);
    }

    fn merge_app_delta(&mut self, delta: StateMap, ttl: Option<Duration>) {
        if self.app_state.is_expired(Instant::now()) {
            self.app_state.value.clear();
        }
        self.app_state.value.extend(delta);
        self.app_state.refresh(ttl);
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, sessions| {
            let before = sessions.len();
            sessions.retain(|_, s| !s.is_expired(now));
            removed += before - sessions.len();
            !sessions.is_empty()
        });
        self.user_state.retain(|_, s| !s.is_expired(now));
        if self.app_state.is_expired(now) {
            self.app_state = Expiring::default();
        }
        removed
    }
}

/// Sessions of one app
#[derive(Default)]
pub(crate) struct AppSessions {
    data: RwLock<AppData>,
}

/// Shared state of the in-memory service
pub(crate) struct Store {
    apps: DashMap<String, Arc<AppSessions>>,
    config: SessionServiceConfig,
}

impl Store {
    pub(crate) fn new(config: SessionServiceConfig) -> Self {
        Self { apps: DashMap::new(), config }
    }

    pub(crate) fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    fn app(&self, app_name: &str) -> Option<Arc<AppSessions>> {
        self.apps.get(app_name).map(|entry| Arc::clone(entry.value()))
    }

    fn app_or_create(&self, app_name: &str) -> Arc<AppSessions> {
        Arc::clone(self.apps.entry(app_name.to_string()).or_default().value())
    }

    pub(crate) async fn create_session(&self, mut key: Key, state: StateMap) -> Result<Session> {
        key.check_user_key()?;
        if key.session_id.is_empty() {
            key.session_id = Uuid::new_v4().to_string();
        }

        let mut stored = Session::new(key.app_name.clone(), key.user_id.clone(), key.session_id.clone());
        stored.state = persistable_session_state(&state);

        let app = self.app_or_create(&key.app_name);
        let mut data = app.data.write().await;
        let ttl = self.config.user_state_ttl();
        data.user_state
            .entry(key.user_id.clone())
            .or_insert_with(|| Expiring::new(StateMap::new(), ttl));

        let mut created = data.view(&stored, &GetOptions::default());
        for (k, v) in state.iter().filter(|(k, _)| k.starts_with(STATE_PREFIX_TEMP)) {
            created.state.insert(k.clone(), v.clone());
        }
        data.sessions
            .entry(key.user_id.clone())
            .or_default()
            .insert(key.session_id.clone(), Expiring::new(stored, self.config.session_ttl()));
        debug!(app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id, "session created");
        Ok(created)
    }

    pub(crate) async fn get_session(&self, key: &Key, opts: &GetOptions) -> Result<Option<Session>> {
        key.check_session_key()?;
        let Some(app) = self.app(&key.app_name) else {
            return Ok(None);
        };
        let mut data = app.data.write().await;
        let ttl = self.config.session_ttl();
        let stored = match data.stored_mut(key) {
            Ok(entry) => {
                entry.refresh(ttl);
                entry.value.clone()
            }
            Err(CoreError::NotFound(_)) | Err(CoreError::Expired(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(data.view(&stored, opts)))
    }

    pub(crate) async fn list_sessions(&self, user_key: &UserKey, opts: &GetOptions) -> Result<Vec<Session>> {
        user_key.check_user_key()?;
        let Some(app) = self.app(&user_key.app_name) else {
            return Ok(Vec::new());
        };
        let mut data = app.data.write().await;
        let ttl = self.config.session_ttl();
        let Some(sessions) = data.sessions.get_mut(&user_key.user_id) else {
            return Ok(Vec::new());
        };
        // listed sessions count as read, same as get_session
        let live: Vec<Session> = sessions
            .values_mut()
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| {
                entry.refresh(ttl);
                entry.value.clone()
            })
            .collect();
        let mut out: Vec<Session> = live.iter().map(|s| data.view(s, opts)).collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub(crate) async fn delete_session(&self, key: &Key) -> Result<()> {
        key.check_session_key()?;
        let Some(app) = self.app(&key.app_name) else {
            return Ok(());
        };
        let mut data = app.data.write().await;
        if let Some(sessions) = data.sessions.get_mut(&key.user_id) {
            sessions.remove(&key.session_id);
            if sessions.is_empty() {
                data.sessions.remove(&key.user_id);
            }
        }
        Ok(())
    }

    pub(crate) async fn update_app_state(&self, app_name: &str, state: StateMap) -> Result<()> {
        if app_name.is_empty() {
            return Err(CoreError::ValidationError("appName is required".to_string()));
        }
        let app = self.app_or_create(app_name);
        let mut data = app.data.write().await;
        data.merge_app_delta(normalize_app_state(state), self.config.app_state_ttl());
        Ok(())
    }

    pub(crate) async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        if app_name.is_empty() {
            return Err(CoreError::ValidationError("appName is required".to_string()));
        }
        let Some(app) = self.app(app_name) else {
            return Ok(());
        };
        let key = key.strip_prefix(STATE_PREFIX_APP).unwrap_or(key);
        app.data.write().await.app_state.value.remove(key);
        Ok(())
    }

    pub(crate) async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        if app_name.is_empty() {
            return Err(CoreError::ValidationError("appName is required".to_string()));
        }
        match self.app(app_name) {
            Some(app) => Ok(app.data.read().await.live_app_state()),
            None => Ok(StateMap::new()),
        }
    }

    pub(crate) async fn update_user_state(&self, user_key: &UserKey, state: StateMap) -> Result<()> {
        user_key.check_user_key()?;
        let state = normalize_user_state(state)?;
        let app = self.app_or_create(&user_key.app_name);
        let mut data = app.data.write().await;
        data.merge_user_delta(&user_key.user_id, state, self.config.user_state_ttl());
        Ok(())
    }

    pub(crate) async fn list_user_states(&self, user_key: &UserKey) -> Result<StateMap> {
        user_key.check_user_key()?;
        match self.app(&user_key.app_name) {
            Some(app) => Ok(app.data.read().await.live_user_state(&user_key.user_id)),
            None => Ok(StateMap::new()),
        }
    }

    pub(crate) async fn delete_user_state(&self, user_key: &UserKey, key: &str) -> Result<()> {
        user_key.check_user_key()?;
        let Some(app) = self.app(&user_key.app_name) else {
            return Ok(());
        };
        let key = key.strip_prefix(STATE_PREFIX_USER).unwrap_or(key);
        let mut data = app.data.write().await;
        if let Some(state) = data.user_state.get_mut(&user_key.user_id) {
            state.value.remove(key);
            if state.value.is_empty() {
                data.user_state.remove(&user_key.user_id);
            }
        }
        Ok(())
    }

    pub(crate) async fn update_session_state(&self, key: &Key, state: StateMap) -> Result<()> {
        key.check_session_key()?;
        validate_session_state_keys(&state)?;
        let app = self
            .app(&key.app_name)
            .ok_or_else(|| CoreError::NotFound(format!("session not found: {}", key.session_id)))?;
        let mut data = app.data.write().await;
        let entry = data.stored_mut(key)?;
        entry.value.state.extend(state);
        entry.value.updated_at = Utc::now();
        entry.refresh(self.config.session_ttl());
        Ok(())
    }

    /// Apply `event` to the caller's session and to the stored copy under
    /// one write lock. The caller's session is untouched when the stored
    /// session is missing or expired.
    pub(crate) async fn append_event(
        &self,
        session: &mut Session,
        event: &Event,
        handler: Option<&ConsecutiveUserHandler>,
    ) -> Result<AppendOutcome> {
        let key = session.key();
        key.check_session_key()?;
        let app = self
            .app(&key.app_name)
            .ok_or_else(|| CoreError::NotFound(format!("app not found: {}", key.app_name)))?;
        let limit = self.config.session_event_limit;

        let mut data = app.data.write().await;
        let entry = data.stored_mut(&key)?;
        let outcome = session.update_user_session(event, limit, handler);

        let stored = &mut entry.value;
        outcome.handler_changes.apply(&mut stored.events);
        if outcome.appended {
            stored.events.push(event.clone());
            if limit > 0 && stored.events.len() > limit {
                let excess = stored.events.len() - limit;
                stored.events.drain(..excess);
            }
        }
        stored.updated_at = Utc::now();
        let delta = ScopedDelta::split(&event.state_delta);
        stored.state.extend(delta.session);
        entry.refresh(self.config.session_ttl());

        if !delta.app.is_empty() {
            data.merge_app_delta(delta.app, self.config.app_state_ttl());
        }
        if !delta.user.is_empty() {
            data.merge_user_delta(&key.user_id, delta.user, self.config.user_state_ttl());
        }
        debug!(session_id = %key.session_id, event_id = %event.id, appended = outcome.appended, "event appended");
        Ok(outcome)
    }

    pub(crate) async fn append_track_event(&self, session: &mut Session, event: TrackEvent) -> Result<()> {
        let key = session.key();
        key.check_session_key()?;
        if event.track.is_empty() {
            return Err(CoreError::ValidationError("track name is required".to_string()));
        }
        let app = self
            .app(&key.app_name)
            .ok_or_else(|| CoreError::NotFound(format!("app not found: {}", key.app_name)))?;
        let mut data = app.data.write().await;
        let entry = data.stored_mut(&key)?;
        entry.value.append_track_event(event.clone());
        entry.refresh(self.config.session_ttl());
        session.append_track_event(event);
        Ok(())
    }

    pub(crate) async fn summary_text(&self, session: &Session, filter_key: &str) -> Result<Option<String>> {
        let key = session.key();
        key.check_session_key()?;
        let Some(app) = self.app(&key.app_name) else {
            return Ok(None);
        };
        let data = app.data.read().await;
        let stored = data
            .sessions
            .get(&key.user_id)
            .and_then(|sessions| sessions.get(&key.session_id))
            .and_then(Expiring::live);
        Ok(match stored {
            Some(stored) => pick_summary_text(&stored.summaries, filter_key, Some(stored.created_at)),
            None => pick_summary_text(&session.summaries, filter_key, Some(session.created_at)),
        })
    }

    /// Drop everything whose TTL has elapsed.
    pub(crate) async fn cleanup_expired(&self) {
        let apps: Vec<(String, Arc<AppSessions>)> =
            self.apps.iter().map(|e| (e.key().clone(), Arc::clone(e.value()))).collect();
        let now = Instant::now();
        for (name, app) in apps {
            let removed = app.data.write().await.remove_expired(now);
            if removed > 0 {
                debug!(app_name = %name, removed, "expired sessions removed");
            }
        }
    }
}

#[async_trait]
impl SummaryStore for Store {
    async fn load_summary(&self, _ctx: &Context, key: &Key, filter_key: &str) -> Result<Option<Summary>> {
        let Some(app) = self.app(&key.app_name) else {
            return Ok(None);
        };
        let data = app.data.read().await;
        Ok(data
            .sessions
            .get(&key.user_id)
            .and_then(|sessions| sessions.get(&key.session_id))
            .and_then(Expiring::live)
            .and_then(|s| s.summaries.get(filter_key).cloned()))
    }

    async fn store_summary(&self, _ctx: &Context, key: &Key, filter_key: &str, summary: Summary) -> Result<bool> {
        let Some(app) = self.app(&key.app_name) else {
            return Ok(false);
        };
        let mut data = app.data.write().await;
        let stored = data
            .sessions
            .get_mut(&key.user_id)
            .and_then(|sessions| sessions.get_mut(&key.session_id))
            .and_then(Expiring::live_mut);
        match stored {
            Some(stored) => Ok(store_if_newer(&mut stored.summaries, filter_key, summary)),
            None => {
                debug!(session_id = %key.session_id, "summary dropped, session gone");
                Ok(false)
            }
        }
    }
}
