//! Transactions behind the SQLite session service.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqliteConnection;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use trellis_core::{Context, CoreError, Event, Result, StateMap};
use trellis_session::session::{normalize_app_state, normalize_user_state, persistable_session_state, validate_session_state_keys};
use trellis_session::summary::{pick_summary_text, SummaryStore};
use trellis_session::{
    AppendOutcome, EventPersister, GetOptions, Key, PersistJob, ScopedDelta, Session, SessionServiceConfig, Summary,
    TrackEvent, UserKey, STATE_PREFIX_APP, STATE_PREFIX_TEMP, STATE_PREFIX_USER,
};

use crate::connection::{commit, SqliteDatabase};
use crate::repositories as repo;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>, now: i64) -> Option<i64> {
    ttl.map(|ttl| now + ttl.as_millis() as i64)
}

fn require_app(app_name: &str) -> Result<()> {
    if app_name.is_empty() {
        return Err(CoreError::ValidationError("appName is required".to_string()));
    }
    Ok(())
}

/// Take the write lock and check the session is live.
async fn lock_live_session(conn: &mut SqliteConnection, key: &Key, now: i64) -> Result<repo::SessionRow> {
    if !repo::touch_session(conn, key, now).await? {
        return Err(CoreError::NotFound(format!("session not found: {}", key.session_id)));
    }
    let row = repo::fetch_session(conn, key)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("session not found: {}", key.session_id)))?;
    if row.is_expired(now) {
        return Err(CoreError::Expired(format!("session expired: {}", key.session_id)));
    }
    Ok(row)
}

/// Assemble the full session view from its rows.
async fn load_session(conn: &mut SqliteConnection, key: &Key, now: i64) -> Result<Option<Session>> {
    let Some(row) = repo::fetch_session(conn, key).await? else {
        return Ok(None);
    };
    if row.is_expired(now) {
        return Ok(None);
    }
    let mut session = Session::new(key.app_name.clone(), key.user_id.clone(), key.session_id.clone());
    session.state = row.state;
    session.created_at = repo::to_datetime(row.created_at)?;
    session.updated_at = repo::to_datetime(row.updated_at)?;
    session.events = repo::load_events(conn, key).await?;
    session.tracks = repo::load_tracks(conn, key).await?;
    session.summaries = repo::load_summaries(conn, key, now).await?;

    let app_state = repo::load_app_state(conn, &key.app_name, now).await?;
    let user_state = repo::load_user_state(conn, &key.user_key(), now).await?;
    session.merge_scoped_state(&app_state, &user_state);
    Ok(Some(session))
}

/// Shared state of the SQLite service
pub(crate) struct Store {
    db: SqliteDatabase,
    config: SessionServiceConfig,
}

impl Store {
    pub(crate) fn new(db: SqliteDatabase, config: SessionServiceConfig) -> Self {
        Self { db, config }
    }

    pub(crate) fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    pub(crate) async fn create_session(&self, mut key: Key, state: StateMap) -> Result<Session> {
        key.check_user_key()?;
        if key.session_id.is_empty() {
            key.session_id = Uuid::new_v4().to_string();
        }
        let now = now_millis();
        let stored_state = persistable_session_state(&state);

        let mut tx = self.db.begin().await?;
        if repo::delete_expired_session(&mut tx, &key, now).await? {
            debug!(session_id = %key.session_id, "expired session replaced");
        }
        repo::insert_session(&mut tx, &key, &stored_state, now, expiry(self.config.session_ttl(), now)).await?;
        let app_state = repo::load_app_state(&mut tx, &key.app_name, now).await?;
        let user_state = repo::load_user_state(&mut tx, &key.user_key(), now).await?;
        commit(tx).await?;

        let mut session = Session::new(key.app_name.clone(), key.user_id.clone(), key.session_id.clone());
        session.created_at = repo::to_datetime(now)?;
        session.updated_at = session.created_at;
        session.state = stored_state;
        session.merge_scoped_state(&app_state, &user_state);
        for (k, v) in state.iter().filter(|(k, _)| k.starts_with(STATE_PREFIX_TEMP)) {
            session.state.insert(k.clone(), v.clone());
        }
        debug!(app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id, "session created");
        Ok(session)
    }

    pub(crate) async fn get_session(&self, key: &Key, opts: &GetOptions) -> Result<Option<Session>> {
        key.check_session_key()?;
        let now = now_millis();
        let mut tx = self.db.begin().await?;
        if let Some(expires_at) = expiry(self.config.session_ttl(), now) {
            if !repo::refresh_expiry(&mut tx, key, now, expires_at).await? {
                return Ok(None);
            }
        }
        let session = load_session(&mut tx, key, now).await?;
        commit(tx).await?;

        Ok(session.map(|mut s| {
            s.apply_event_filtering(opts);
            s
        }))
    }

    pub(crate) async fn list_sessions(&self, user_key: &UserKey, opts: &GetOptions) -> Result<Vec<Session>> {
        user_key.check_user_key()?;
        let now = now_millis();
        let expires_at = expiry(self.config.session_ttl(), now);
        let mut tx = self.db.begin().await?;
        let ids = repo::list_session_ids(&mut tx, user_key, now).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let key = Key::new(user_key.app_name.clone(), user_key.user_id.clone(), id);
            if let Some(expires_at) = expires_at {
                repo::refresh_expiry(&mut tx, &key, now, expires_at).await?;
            }
            if let Some(mut session) = load_session(&mut tx, &key, now).await? {
                session.apply_event_filtering(opts);
                out.push(session);
            }
        }
        commit(tx).await?;
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub(crate) async fn delete_session(&self, key: &Key) -> Result<()> {
        key.check_session_key()?;
        let mut tx = self.db.begin().await?;
        repo::delete_session(&mut tx, key).await?;
        commit(tx).await
    }

    pub(crate) async fn update_app_state(&self, app_name: &str, state: StateMap) -> Result<()> {
        require_app(app_name)?;
        let now = now_millis();
        let state = normalize_app_state(state);
        let mut tx = self.db.begin().await?;
        repo::upsert_app_state(&mut tx, app_name, &state, now, expiry(self.config.app_state_ttl(), now)).await?;
        commit(tx).await
    }

    pub(crate) async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        require_app(app_name)?;
        let key = key.strip_prefix(STATE_PREFIX_APP).unwrap_or(key);
        let mut conn = self.db.acquire().await?;
        repo::delete_app_state(&mut conn, app_name, key).await
    }

    pub(crate) async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        require_app(app_name)?;
        let mut conn = self.db.acquire().await?;
        repo::load_app_state(&mut conn, app_name, now_millis()).await
    }

    pub(crate) async fn update_user_state(&self, user_key: &UserKey, state: StateMap) -> Result<()> {
        user_key.check_user_key()?;
        let state = normalize_user_state(state)?;
        let now = now_millis();
        let mut tx = self.db.begin().await?;
        repo::upsert_user_state(&mut tx, user_key, &state, now, expiry(self.config.user_state_ttl(), now)).await?;
        commit(tx).await
    }

    pub(crate) async fn list_user_states(&self, user_key: &UserKey) -> Result<StateMap> {
        user_key.check_user_key()?;
        let mut conn = self.db.acquire().await?;
        repo::load_user_state(&mut conn, user_key, now_millis()).await
    }

    pub(crate) async fn delete_user_state(&self, user_key: &UserKey, key: &str) -> Result<()> {
        user_key.check_user_key()?;
        let key = key.strip_prefix(STATE_PREFIX_USER).unwrap_or(key);
        let mut conn = self.db.acquire().await?;
        repo::delete_user_state(&mut conn, user_key, key).await
    }

    pub(crate) async fn update_session_state(&self, key: &Key, state: StateMap) -> Result<()> {
        key.check_session_key()?;
        validate_session_state_keys(&state)?;
        let now = now_millis();
        let mut tx = self.db.begin().await?;
        let mut row = lock_live_session(&mut tx, key, now).await?;
        row.state.extend(state);
        repo::update_session(&mut tx, key, &row.state, now, expiry(self.config.session_ttl(), now)).await?;
        commit(tx).await
    }

    /// Write one applied append: handler edits, the event itself, eviction
    /// beyond the event limit, the state delta and the TTL, in one transaction.
    pub(crate) async fn persist_append(&self, key: &Key, event: &Event, outcome: &AppendOutcome) -> Result<()> {
        let now = now_millis();
        let expires_at = expiry(self.config.session_ttl(), now);
        let mut tx = self.db.begin().await?;
        let mut row = lock_live_session(&mut tx, key, now).await?;

        for id in &outcome.handler_changes.removed {
            repo::delete_event(&mut tx, key, id).await?;
        }
        for up in &outcome.handler_changes.upserted {
            repo::upsert_event(&mut tx, key, &up.event, now, expires_at).await?;
        }
        if outcome.appended {
            repo::insert_event(&mut tx, key, event, now, expires_at).await?;
            if self.config.session_event_limit > 0 {
                let evicted = repo::evict_events(&mut tx, key, self.config.session_event_limit).await?;
                if evicted > 0 {
                    debug!(session_id = %key.session_id, evicted, "old events evicted");
                }
            }
        }

        let delta = ScopedDelta::split(&event.state_delta);
        row.state.extend(delta.session);
        repo::update_session(&mut tx, key, &row.state, now, expires_at).await?;
        if let Some(expires_at) = expires_at {
            repo::refresh_expiry(&mut tx, key, now, expires_at).await?;
        }
        if !delta.app.is_empty() {
            let app_expiry = expiry(self.config.app_state_ttl(), now);
            repo::upsert_app_state(&mut tx, &key.app_name, &delta.app, now, app_expiry).await?;
        }
        if !delta.user.is_empty() {
            let user_expiry = expiry(self.config.user_state_ttl(), now);
            repo::upsert_user_state(&mut tx, &key.user_key(), &delta.user, now, user_expiry).await?;
        }
        commit(tx).await?;
        debug!(session_id = %key.session_id, event_id = %event.id, appended = outcome.appended, "event persisted");
        Ok(())
    }

    pub(crate) async fn append_track_event(&self, key: &Key, event: &TrackEvent) -> Result<()> {
        key.check_session_key()?;
        if event.track.is_empty() {
            return Err(CoreError::ValidationError("track name is required".to_string()));
        }
        let now = now_millis();
        let expires_at = expiry(self.config.session_ttl(), now);
        let mut tx = self.db.begin().await?;
        lock_live_session(&mut tx, key, now).await?;
        repo::insert_track_event(&mut tx, key, event, expires_at).await?;
        if let Some(expires_at) = expires_at {
            repo::refresh_expiry(&mut tx, key, now, expires_at).await?;
        }
        commit(tx).await
    }

    pub(crate) async fn summary_text(&self, session: &Session, filter_key: &str) -> Result<Option<String>> {
        let key = session.key();
        key.check_session_key()?;
        let now = now_millis();
        let mut conn = self.db.acquire().await?;
        let Some(row) = repo::fetch_session(&mut conn, &key).await?.filter(|r| !r.is_expired(now)) else {
            return Ok(pick_summary_text(&session.summaries, filter_key, Some(session.created_at)));
        };
        let summaries = repo::load_summaries(&mut conn, &key, now).await?;
        Ok(pick_summary_text(&summaries, filter_key, Some(repo::to_datetime(row.created_at)?)))
    }

    /// Reap expired rows in every table.
    pub(crate) async fn cleanup_expired(&self) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        let removed = repo::delete_expired(&mut conn, now_millis()).await?;
        if removed > 0 {
            debug!(removed, "expired rows removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl EventPersister for Store {
    async fn persist_event(&self, _ctx: &Context, job: &PersistJob) -> Result<()> {
        self.persist_append(&job.key, &job.event, &job.outcome).await
    }
}

#[async_trait]
impl SummaryStore for Store {
    async fn load_summary(&self, _ctx: &Context, key: &Key, filter_key: &str) -> Result<Option<Summary>> {
        let mut conn = self.db.acquire().await?;
        repo::load_summary(&mut conn, key, filter_key, now_millis()).await
    }

    async fn store_summary(&self, _ctx: &Context, key: &Key, filter_key: &str, summary: Summary) -> Result<bool> {
        let now = now_millis();
        let mut conn = self.db.acquire().await?;
        let stored =
            repo::store_summary(&mut conn, key, filter_key, &summary, now, expiry(self.config.session_ttl(), now)).await?;
        if !stored {
            debug!(session_id = %key.session_id, filter_key, "summary not stored, session gone or newer summary present");
        }
        Ok(stored)
    }
}
