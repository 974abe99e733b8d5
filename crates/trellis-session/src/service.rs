//! The session store contract.

use async_trait::async_trait;

use trellis_core::{Context, Event, Result, StateMap};

use crate::session::{GetOptions, Key, Session, TrackEvent, UserKey};

/// Durable, concurrent storage of sessions, their events, summaries and
/// app/user scoped state.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session; an empty `key.session_id` gets a UUID. The returned
    /// session carries app and user state under their prefixes.
    async fn create_session(&self, ctx: &Context, key: Key, state: StateMap) -> Result<Session>;

    /// `None` when missing or expired. Applies event filtering and refreshes the TTL.
    async fn get_session(&self, ctx: &Context, key: Key, opts: GetOptions) -> Result<Option<Session>>;

    /// Every live session of a user, filtered like `get_session`.
    async fn list_sessions(&self, ctx: &Context, user_key: UserKey, opts: GetOptions) -> Result<Vec<Session>>;

    /// Delete a session with its events, summaries and tracks. Idempotent.
    async fn delete_session(&self, ctx: &Context, key: Key) -> Result<()>;

    /// Merge app-scope state; keys may carry the `app:` prefix.
    async fn update_app_state(&self, ctx: &Context, app_name: &str, state: StateMap) -> Result<()>;

    /// Delete one app-scope key.
    async fn delete_app_state(&self, ctx: &Context, app_name: &str, key: &str) -> Result<()>;

    /// Live app-scope state, unprefixed.
    async fn list_app_states(&self, ctx: &Context, app_name: &str) -> Result<StateMap>;

    /// Merge user-scope state. `app:` and `temp:` keys are rejected.
    async fn update_user_state(&self, ctx: &Context, user_key: UserKey, state: StateMap) -> Result<()>;

    /// Live user-scope state, unprefixed.
    async fn list_user_states(&self, ctx: &Context, user_key: UserKey) -> Result<StateMap>;

    /// Delete one user-scope key.
    async fn delete_user_state(&self, ctx: &Context, user_key: UserKey, key: &str) -> Result<()>;

    /// Write session-scope state directly. `app:` and `user:` keys are rejected.
    async fn update_session_state(&self, ctx: &Context, key: Key, state: StateMap) -> Result<()>;

    /// Apply an event to `session` and persist it.
    async fn append_event(&self, ctx: &Context, session: &mut Session, event: Event) -> Result<()>;

    /// Append a side-channel record to a named track.
    async fn append_track_event(&self, ctx: &Context, session: &mut Session, event: TrackEvent) -> Result<()>;

    /// Summarize synchronously, cascading branch summaries to the full-session key.
    async fn create_session_summary(&self, ctx: &Context, session: &Session, filter_key: &str, force: bool) -> Result<()>;

    /// Queue a summary job; falls back to synchronous work when the queue is full.
    async fn enqueue_summary_job(&self, ctx: &Context, session: &Session, filter_key: &str, force: bool) -> Result<()>;

    /// Latest summary text for the key, falling back to the full-session summary.
    async fn get_session_summary_text(&self, ctx: &Context, session: &Session, filter_key: &str) -> Result<Option<String>>;

    /// Stop background work. Idempotent.
    async fn close(&self) -> Result<()>;
}
