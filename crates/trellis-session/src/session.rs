//! Session domain model: keys, state scopes, event log and filtering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use trellis_core::hash::{murmur3_32, session_hash_key};
use trellis_core::{CoreError, Event, Result, StateMap};

use crate::consecutive::ConsecutiveUserHandler;

/// Prefix of app-scoped state keys
pub const STATE_PREFIX_APP: &str = "app:";
/// Prefix of user-scoped state keys
pub const STATE_PREFIX_USER: &str = "user:";
/// Prefix of session-local keys that are never persisted
pub const STATE_PREFIX_TEMP: &str = "temp:";
/// Filter key of the full-session summary
pub const SUMMARY_FILTER_KEY_ALL_CONTENTS: &str = "";

/// Identifies one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Key {
    /// Application name
    pub app_name: String,
    /// User identifier
    pub user_id: String,
    /// Session identifier
    pub session_id: String,
}

impl Key {
    /// Build a key
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into(), session_id: session_id.into() }
    }

    /// All three parts must be present.
    pub fn check_session_key(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)?;
        if self.session_id.is_empty() {
            return Err(CoreError::ValidationError("sessionID is required".to_string()));
        }
        Ok(())
    }

    /// App and user must be present; the session id may be empty.
    pub fn check_user_key(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)
    }

    /// The owning user
    pub fn user_key(&self) -> UserKey {
        UserKey { app_name: self.app_name.clone(), user_id: self.user_id.clone() }
    }

    /// `app:user:session`, the shard hash input
    pub fn hash_key(&self) -> String {
        session_hash_key(&self.app_name, &self.user_id, &self.session_id)
    }
}

/// Identifies one user of one app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UserKey {
    /// Application name
    pub app_name: String,
    /// User identifier
    pub user_id: String,
}

impl UserKey {
    /// Build a key
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into() }
    }

    /// App and user must be present.
    pub fn check_user_key(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)
    }
}

fn check_user_key(app_name: &str, user_id: &str) -> Result<()> {
    if app_name.is_empty() {
        return Err(CoreError::ValidationError("appName is required".to_string()));
    }
    if user_id.is_empty() {
        return Err(CoreError::ValidationError("userID is required".to_string()));
    }
    Ok(())
}

/// Summary of a session's events under one filter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Summary text
    pub summary: String,
    /// Topics extracted alongside the summary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Timestamp of the newest event the summary covers
    pub updated_at: DateTime<Utc>,
}

/// Side-channel record appended to a named track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEvent {
    /// Track name
    pub track: String,
    /// Arbitrary JSON payload
    pub payload: serde_json::Value,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl TrackEvent {
    /// New track event stamped now
    pub fn new(track: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { track: track.into(), payload, timestamp: Utc::now() }
    }
}

/// Read options for `get_session` / `list_sessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetOptions {
    /// Keep at most the last N events (0 = all)
    pub event_num: usize,
    /// Keep events at or after this time
    pub event_time: Option<DateTime<Utc>>,
}

impl GetOptions {
    /// Keep at most the last `n` events
    pub fn with_event_num(mut self, n: usize) -> Self {
        self.event_num = n;
        self
    }

    /// Keep events at or after `t`
    pub fn with_event_time(mut self, t: DateTime<Utc>) -> Self {
        self.event_time = Some(t);
        self
    }
}

/// Where an event inserted by a consecutive-user handler belongs.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedEvent {
    /// Id of the event it follows in the log, `None` for the head
    pub after: Option<String>,
    /// The new or rewritten event
    pub event: Event,
}

/// Log edits made by a consecutive-user handler, replayed on stored copies.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventChanges {
    /// Events added or rewritten
    pub upserted: Vec<UpsertedEvent>,
    /// Ids of events removed
    pub removed: Vec<String>,
}

impl EventChanges {
    fn diff(before: &[Event], after: &[Event]) -> Self {
        let before_by_id: HashMap<&str, &Event> = before.iter().map(|e| (e.id.as_str(), e)).collect();
        let after_ids: HashSet<&str> = after.iter().map(|e| e.id.as_str()).collect();

        let mut upserted = Vec::new();
        for (i, e) in after.iter().enumerate() {
            let changed = match before_by_id.get(e.id.as_str()) {
                Some(old) => *old != e,
                None => true,
            };
            if changed {
                upserted.push(UpsertedEvent {
                    after: i.checked_sub(1).map(|p| after[p].id.clone()),
                    event: e.clone(),
                });
            }
        }
        let removed = before
            .iter()
            .filter(|e| !after_ids.contains(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();
        Self { upserted, removed }
    }

    /// True when the handler left the log untouched
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    /// Replay the edits on another copy of the same log.
    pub fn apply(&self, events: &mut Vec<Event>) {
        if !self.removed.is_empty() {
            let removed: HashSet<&str> = self.removed.iter().map(String::as_str).collect();
            events.retain(|e| !removed.contains(e.id.as_str()));
        }
        for up in &self.upserted {
            if let Some(existing) = events.iter_mut().find(|e| e.id == up.event.id) {
                *existing = up.event.clone();
                continue;
            }
            let pos = match &up.after {
                Some(anchor) => events.iter().position(|e| &e.id == anchor).map(|p| p + 1),
                None => Some(0),
            };
            match pos {
                Some(p) => events.insert(p, up.event.clone()),
                None => events.push(up.event.clone()),
            }
        }
    }
}

/// Result of applying one event to a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppendOutcome {
    /// The event entered the log
    pub appended: bool,
    /// Edits made by the consecutive-user handler
    pub handler_changes: EventChanges,
}

/// A conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: String,
    /// Application name
    pub app_name: String,
    /// User id
    pub user_id: String,
    /// Merged state (session keys plus promoted `app:` / `user:` keys)
    #[serde(default)]
    pub state: StateMap,
    /// Event log
    #[serde(default)]
    pub events: Vec<Event>,
    /// Named side-channel tracks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tracks: BTreeMap<String, Vec<TrackEvent>>,
    /// Summaries keyed by filter key
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub summaries: HashMap<String, Summary>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// murmur3 of `app:user:session`, fixed at construction
    #[serde(skip)]
    pub hash: u32,
}

impl Session {
    /// Empty session stamped now
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        let (app_name, user_id, id) = (app_name.into(), user_id.into(), id.into());
        let hash = murmur3_32(&session_hash_key(&app_name, &user_id, &id));
        Self {
            id,
            app_name,
            user_id,
            state: StateMap::new(),
            events: Vec::new(),
            tracks: BTreeMap::new(),
            summaries: HashMap::new(),
            created_at: now,
            updated_at: now,
            hash,
        }
    }

    /// Recompute `hash` after deserialization.
    pub fn with_rehash(mut self) -> Self {
        self.hash = murmur3_32(&self.key().hash_key());
        self
    }

    /// Key of this session
    pub fn key(&self) -> Key {
        Key::new(self.app_name.clone(), self.user_id.clone(), self.id.clone())
    }

    /// Raw state value
    pub fn get_state(&self, key: &str) -> Option<&[u8]> {
        self.state.get(key).map(Vec::as_slice)
    }

    /// Drop leading events until the first user event; empty if none.
    pub fn ensure_event_start_with_user(&mut self) {
        match self.events.iter().position(Event::is_user_message) {
            Some(0) => {}
            Some(start) => {
                self.events.drain(..start);
            }
            None => self.events.clear(),
        }
    }

    /// Time filter, then last-N window, then the user-start rule. When the
    /// window holds no user event, the last user event of the unfiltered log
    /// is prepended if one exists.
    pub fn apply_event_filtering(&mut self, opts: &GetOptions) {
        let original = std::mem::take(&mut self.events);
        let mut events: Vec<Event> = match opts.event_time {
            Some(t) => match original.iter().position(|e| e.timestamp >= t) {
                Some(start) => original[start..].to_vec(),
                None => Vec::new(),
            },
            None => original.clone(),
        };

        if opts.event_num > 0 && events.len() > opts.event_num {
            events.drain(..events.len() - opts.event_num);
        }

        if let Some(start) = events.iter().position(Event::is_user_message) {
            events.drain(..start);
            self.events = events;
            return;
        }
        if let Some(last_user) = original.iter().rev().find(|e| e.is_user_message()) {
            events.insert(0, last_user.clone());
            self.events = events;
            return;
        }
        self.events = Vec::new();
    }

    /// Merge an event's state delta into the session state.
    pub fn apply_event_state_delta(&mut self, event: &Event) {
        for (k, v) in &event.state_delta {
            self.state.insert(k.clone(), v.clone());
        }
    }

    /// Apply an event to this in-memory session: consecutive-user handling,
    /// append when the event has valid content, window to `event_limit`,
    /// then merge the state delta.
    pub fn update_user_session(
        &mut self,
        event: &Event,
        event_limit: usize,
        handler: Option<&ConsecutiveUserHandler>,
    ) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        if event.is_valid_content() {
            let mut keep = true;
            if let (Some(handler), Some(prev)) = (handler, self.events.last()) {
                if prev.is_user_message() && event.is_user_message() {
                    let prev = prev.clone();
                    let before = self.events.clone();
                    keep = handler(self, &prev, event);
                    outcome.handler_changes = EventChanges::diff(&before, &self.events);
                    debug!(
                        session_id = %self.id,
                        keep,
                        upserted = outcome.handler_changes.upserted.len(),
                        removed = outcome.handler_changes.removed.len(),
                        "consecutive user messages handled"
                    );
                }
            }
            if keep {
                self.events.push(event.clone());
                outcome.appended = true;
                self.apply_event_filtering(&GetOptions::default().with_event_num(event_limit));
            }
        }
        self.updated_at = Utc::now();
        self.apply_event_state_delta(event);
        outcome
    }

    /// Append a record to a named track.
    pub fn append_track_event(&mut self, event: TrackEvent) {
        self.tracks.entry(event.track.clone()).or_default().push(event);
        self.updated_at = Utc::now();
    }

    /// Overlay app and user scope state under their prefixes.
    pub fn merge_scoped_state(&mut self, app_state: &StateMap, user_state: &StateMap) {
        for (k, v) in app_state {
            self.state.insert(format!("{}{}", STATE_PREFIX_APP, k), v.clone());
        }
        for (k, v) in user_state {
            self.state.insert(format!("{}{}", STATE_PREFIX_USER, k), v.clone());
        }
    }
}

/// A state delta split by scope; `temp:` keys are dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopedDelta {
    /// App-scope keys, prefix stripped
    pub app: StateMap,
    /// User-scope keys, prefix stripped
    pub user: StateMap,
    /// Session-scope keys
    pub session: StateMap,
}

impl ScopedDelta {
    /// Partition a delta by reserved prefix.
    pub fn split(delta: &StateMap) -> Self {
        let mut out = Self::default();
        for (k, v) in delta {
            if let Some(rest) = k.strip_prefix(STATE_PREFIX_APP) {
                out.app.insert(rest.to_string(), v.clone());
            } else if let Some(rest) = k.strip_prefix(STATE_PREFIX_USER) {
                out.user.insert(rest.to_string(), v.clone());
            } else if !k.starts_with(STATE_PREFIX_TEMP) {
                out.session.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

/// Session-scope state to persist: drops `temp:`, `app:` and `user:` keys.
pub fn persistable_session_state(state: &StateMap) -> StateMap {
    state
        .iter()
        .filter(|(k, _)| {
            !k.starts_with(STATE_PREFIX_TEMP) && !k.starts_with(STATE_PREFIX_APP) && !k.starts_with(STATE_PREFIX_USER)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Reject `app:` / `user:` keys on a direct session-state write.
pub fn validate_session_state_keys(state: &StateMap) -> Result<()> {
    for k in state.keys() {
        if k.starts_with(STATE_PREFIX_APP) {
            return Err(CoreError::ValidationError(format!(
                "key {} has app: prefix, use update_app_state instead",
                k
            )));
        }
        if k.starts_with(STATE_PREFIX_USER) {
            return Err(CoreError::ValidationError(format!(
                "key {} has user: prefix, use update_user_state instead",
                k
            )));
        }
    }
    Ok(())
}

/// Validate a user-scope write and strip the `user:` prefix.
pub fn normalize_user_state(state: StateMap) -> Result<StateMap> {
    let mut out = StateMap::with_capacity(state.len());
    for (k, v) in state {
        if k.starts_with(STATE_PREFIX_APP) || k.starts_with(STATE_PREFIX_TEMP) {
            return Err(CoreError::ValidationError(format!(
                "key {} is not allowed in user state",
                k
            )));
        }
        let k = k.strip_prefix(STATE_PREFIX_USER).map(str::to_string).unwrap_or(k);
        out.insert(k, v);
    }
    Ok(out)
}

/// Strip the `app:` prefix from app-scope keys.
pub fn normalize_app_state(state: StateMap) -> StateMap {
    state
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(STATE_PREFIX_APP) {
            Some(rest) => (rest.to_string(), v),
            None => (k, v),
        })
        .collect()
}
