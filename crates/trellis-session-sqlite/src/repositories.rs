//! Row-level SQL. Every function runs on a borrowed connection so callers
//! can compose them inside one transaction.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqliteConnection};
use std::collections::{BTreeMap, HashMap};

use trellis_core::{CoreError, Event, Result, StateMap};
use trellis_session::{Key, Summary, TrackEvent, UserKey};

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

fn db_err(what: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |e| CoreError::StateStoreError(format!("{}: {}", what, e))
}

pub(crate) fn to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CoreError::SerializationError(format!("invalid timestamp: {}", ms)))
}

/// A `session_states` row
#[derive(Debug, Clone)]
pub(crate) struct SessionRow {
    pub state: StateMap,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

impl SessionRow {
    pub(crate) fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

pub(crate) async fn fetch_session(conn: &mut SqliteConnection, key: &Key) -> Result<Option<SessionRow>> {
    let row = sqlx::query(
        "SELECT state, created_at, updated_at, expires_at FROM session_states
         WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("get session state failed"))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let state: Vec<u8> = row.try_get("state").map_err(db_err("read session state failed"))?;
    Ok(Some(SessionRow {
        state: serde_json::from_slice(&state)?,
        created_at: row.try_get("created_at").map_err(db_err("read created_at failed"))?,
        updated_at: row.try_get("updated_at").map_err(db_err("read updated_at failed"))?,
        expires_at: row.try_get("expires_at").map_err(db_err("read expires_at failed"))?,
    }))
}

/// Session ids of a user that are still live
pub(crate) async fn list_session_ids(conn: &mut SqliteConnection, user_key: &UserKey, now: i64) -> Result<Vec<String>> {
    sqlx::query_scalar(&format!(
        "SELECT session_id FROM session_states WHERE app_name = ? AND user_id = ? AND {}",
        LIVE
    ))
    .bind(&user_key.app_name)
    .bind(&user_key.user_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("list sessions failed"))
}

pub(crate) async fn insert_session(
    conn: &mut SqliteConnection,
    key: &Key,
    state: &StateMap,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    let state = serde_json::to_vec(state)?;
    let result = sqlx::query(
        "INSERT INTO session_states (app_name, user_id, session_id, state, created_at, updated_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(state)
    .bind(now)
    .bind(now)
    .bind(expires_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(CoreError::Conflict(format!("session already exists: {}", key.session_id)))
        }
        Err(e) => Err(CoreError::StateStoreError(format!("create session failed: {}", e))),
    }
}

/// Drop an expired session row so its id can be reused.
pub(crate) async fn delete_expired_session(conn: &mut SqliteConnection, key: &Key, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM session_states
         WHERE app_name = ? AND user_id = ? AND session_id = ? AND expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_err("delete expired session failed"))?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    delete_session_children(conn, key).await?;
    Ok(true)
}

/// Bump `updated_at`; false when the row does not exist. Used as the first
/// statement of a write transaction so the write lock is taken up front.
pub(crate) async fn touch_session(conn: &mut SqliteConnection, key: &Key, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE session_states SET updated_at = ? WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(now)
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err("update session failed"))?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn update_session(
    conn: &mut SqliteConnection,
    key: &Key,
    state: &StateMap,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    let state = serde_json::to_vec(state)?;
    sqlx::query(
        "UPDATE session_states SET state = ?, updated_at = ?, expires_at = ?
         WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(state)
    .bind(now)
    .bind(expires_at)
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err("update session state failed"))?;
    Ok(())
}

/// Push the deadline of a live session and all of its rows; false when the
/// session is missing or already expired.
pub(crate) async fn refresh_expiry(conn: &mut SqliteConnection, key: &Key, now: i64, expires_at: i64) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE session_states SET expires_at = ? WHERE app_name = ? AND user_id = ? AND session_id = ? AND {}",
        LIVE
    ))
    .bind(expires_at)
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_err("refresh session ttl failed"))?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    for table in ["session_events", "session_summaries", "session_track_events"] {
        sqlx::query(&format!(
            "UPDATE {} SET expires_at = ? WHERE app_name = ? AND user_id = ? AND session_id = ?",
            table
        ))
        .bind(expires_at)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("refresh session ttl failed"))?;
    }
    Ok(true)
}

async fn delete_session_children(conn: &mut SqliteConnection, key: &Key) -> Result<()> {
    for table in ["session_events", "session_summaries", "session_track_events"] {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE app_name = ? AND user_id = ? AND session_id = ?",
            table
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete session rows failed"))?;
    }
    Ok(())
}

pub(crate) async fn delete_session(conn: &mut SqliteConnection, key: &Key) -> Result<()> {
    sqlx::query("DELETE FROM session_states WHERE app_name = ? AND user_id = ? AND session_id = ?")
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete session state failed"))?;
    delete_session_children(conn, key).await
}

/// Events oldest first, ties broken by insertion order
pub(crate) async fn load_events(conn: &mut SqliteConnection, key: &Key) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT event_data FROM session_events
         WHERE app_name = ? AND user_id = ? AND session_id = ?
         ORDER BY timestamp ASC, id ASC",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("get events failed"))?;

    rows.iter()
        .map(|row| {
            let data: Vec<u8> = row.try_get("event_data").map_err(db_err("read event failed"))?;
            Ok(serde_json::from_slice(&data)?)
        })
        .collect()
}

pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    key: &Key,
    event: &Event,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    let data = serde_json::to_vec(event)?;
    sqlx::query(
        "INSERT INTO session_events
             (app_name, user_id, session_id, event_id, event_data, timestamp, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(&event.id)
    .bind(data)
    .bind(event.timestamp.timestamp_millis())
    .bind(now)
    .bind(expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("create event failed"))?;
    Ok(())
}

/// Rewrite an event in place, inserting it when it is not stored yet.
pub(crate) async fn upsert_event(
    conn: &mut SqliteConnection,
    key: &Key,
    event: &Event,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    let data = serde_json::to_vec(event)?;
    let result = sqlx::query(
        "UPDATE session_events SET event_data = ?, timestamp = ?
         WHERE app_name = ? AND user_id = ? AND session_id = ? AND event_id = ?",
    )
    .bind(data)
    .bind(event.timestamp.timestamp_millis())
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(&event.id)
    .execute(&mut *conn)
    .await
    .map_err(db_err("update event failed"))?;
    if result.rows_affected() == 0 {
        insert_event(conn, key, event, now, expires_at).await?;
    }
    Ok(())
}

pub(crate) async fn delete_event(conn: &mut SqliteConnection, key: &Key, event_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM session_events WHERE app_name = ? AND user_id = ? AND session_id = ? AND event_id = ?")
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(event_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete event failed"))?;
    Ok(())
}

/// Delete the oldest events beyond `limit`; returns how many went.
pub(crate) async fn evict_events(conn: &mut SqliteConnection, key: &Key, limit: usize) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM session_events WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err("count events failed"))?;

    let excess = count - limit as i64;
    if excess <= 0 {
        return Ok(0);
    }
    let result = sqlx::query(
        "DELETE FROM session_events WHERE id IN (
             SELECT id FROM session_events
             WHERE app_name = ? AND user_id = ? AND session_id = ?
             ORDER BY timestamp ASC, id ASC
             LIMIT ?
         )",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(excess)
    .execute(&mut *conn)
    .await
    .map_err(db_err("delete old events failed"))?;
    Ok(result.rows_affected())
}

pub(crate) async fn load_tracks(conn: &mut SqliteConnection, key: &Key) -> Result<BTreeMap<String, Vec<TrackEvent>>> {
    let rows = sqlx::query(
        "SELECT event_data FROM session_track_events
         WHERE app_name = ? AND user_id = ? AND session_id = ?
         ORDER BY timestamp ASC, id ASC",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("get track events failed"))?;

    let mut tracks: BTreeMap<String, Vec<TrackEvent>> = BTreeMap::new();
    for row in rows {
        let data: Vec<u8> = row.try_get("event_data").map_err(db_err("read track event failed"))?;
        let event: TrackEvent = serde_json::from_slice(&data)?;
        tracks.entry(event.track.clone()).or_default().push(event);
    }
    Ok(tracks)
}

pub(crate) async fn insert_track_event(
    conn: &mut SqliteConnection,
    key: &Key,
    event: &TrackEvent,
    expires_at: Option<i64>,
) -> Result<()> {
    let data = serde_json::to_vec(event)?;
    sqlx::query(
        "INSERT INTO session_track_events (app_name, user_id, session_id, track, event_data, timestamp, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(&event.track)
    .bind(data)
    .bind(event.timestamp.timestamp_millis())
    .bind(expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err("create track event failed"))?;
    Ok(())
}

pub(crate) async fn load_summaries(conn: &mut SqliteConnection, key: &Key, now: i64) -> Result<HashMap<String, Summary>> {
    let rows = sqlx::query(&format!(
        "SELECT filter_key, summary FROM session_summaries
         WHERE app_name = ? AND user_id = ? AND session_id = ? AND {}",
        LIVE
    ))
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("get summaries failed"))?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let filter_key: String = row.try_get("filter_key").map_err(db_err("read summary failed"))?;
        let data: Vec<u8> = row.try_get("summary").map_err(db_err("read summary failed"))?;
        out.insert(filter_key, serde_json::from_slice(&data)?);
    }
    Ok(out)
}

pub(crate) async fn load_summary(
    conn: &mut SqliteConnection,
    key: &Key,
    filter_key: &str,
    now: i64,
) -> Result<Option<Summary>> {
    let data: Option<Vec<u8>> = sqlx::query_scalar(&format!(
        "SELECT summary FROM session_summaries
         WHERE app_name = ? AND user_id = ? AND session_id = ? AND filter_key = ? AND {}",
        LIVE
    ))
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(filter_key)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("get summary failed"))?;
    data.map(|d| serde_json::from_slice(&d).map_err(CoreError::from)).transpose()
}

/// Upsert only when `summary` is strictly newer than the stored one (at
/// millisecond precision) and the session is live. One statement, so concurrent writers cannot interleave.
pub(crate) async fn store_summary(
    conn: &mut SqliteConnection,
    key: &Key,
    filter_key: &str,
    summary: &Summary,
    now: i64,
    expires_at: Option<i64>,
) -> Result<bool> {
    let data = serde_json::to_vec(summary)?;
    let result = sqlx::query(
        "INSERT INTO session_summaries (app_name, user_id, session_id, filter_key, summary, updated_at, expires_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
         WHERE EXISTS (
             SELECT 1 FROM session_states
             WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
               AND (expires_at IS NULL OR expires_at > ?8)
         )
         ON CONFLICT (app_name, user_id, session_id, filter_key) DO UPDATE SET
             summary = excluded.summary,
             updated_at = excluded.updated_at,
             expires_at = excluded.expires_at
         WHERE excluded.updated_at > session_summaries.updated_at",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(filter_key)
    .bind(data)
    .bind(summary.updated_at.timestamp_millis())
    .bind(expires_at)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_err("store summary failed"))?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn load_app_state(conn: &mut SqliteConnection, app_name: &str, now: i64) -> Result<StateMap> {
    let rows = sqlx::query(&format!("SELECT state_key, value FROM app_states WHERE app_name = ? AND {}", LIVE))
        .bind(app_name)
        .bind(now)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("get app states failed"))?;
    collect_state(rows)
}

pub(crate) async fn upsert_app_state(
    conn: &mut SqliteConnection,
    app_name: &str,
    state: &StateMap,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    for (k, v) in state {
        sqlx::query(
            "INSERT INTO app_states (app_name, state_key, value, updated_at, expires_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (app_name, state_key) DO UPDATE SET
                 value = excluded.value, updated_at = excluded.updated_at, expires_at = excluded.expires_at",
        )
        .bind(app_name)
        .bind(k)
        .bind(v)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err("update app state failed"))?;
    }
    Ok(())
}

pub(crate) async fn delete_app_state(conn: &mut SqliteConnection, app_name: &str, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM app_states WHERE app_name = ? AND state_key = ?")
        .bind(app_name)
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete app state failed"))?;
    Ok(())
}

pub(crate) async fn load_user_state(conn: &mut SqliteConnection, user_key: &UserKey, now: i64) -> Result<StateMap> {
    let rows = sqlx::query(&format!(
        "SELECT state_key, value FROM user_states WHERE app_name = ? AND user_id = ? AND {}",
        LIVE
    ))
    .bind(&user_key.app_name)
    .bind(&user_key.user_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("get user states failed"))?;
    collect_state(rows)
}

pub(crate) async fn upsert_user_state(
    conn: &mut SqliteConnection,
    user_key: &UserKey,
    state: &StateMap,
    now: i64,
    expires_at: Option<i64>,
) -> Result<()> {
    for (k, v) in state {
        sqlx::query(
            "INSERT INTO user_states (app_name, user_id, state_key, value, updated_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (app_name, user_id, state_key) DO UPDATE SET
                 value = excluded.value, updated_at = excluded.updated_at, expires_at = excluded.expires_at",
        )
        .bind(&user_key.app_name)
        .bind(&user_key.user_id)
        .bind(k)
        .bind(v)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err("update user state failed"))?;
    }
    Ok(())
}

pub(crate) async fn delete_user_state(conn: &mut SqliteConnection, user_key: &UserKey, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM user_states WHERE app_name = ? AND user_id = ? AND state_key = ?")
        .bind(&user_key.app_name)
        .bind(&user_key.user_id)
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete user state failed"))?;
    Ok(())
}

fn collect_state(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<StateMap> {
    let mut state = StateMap::with_capacity(rows.len());
    for row in rows {
        let k: String = row.try_get("state_key").map_err(db_err("read state key failed"))?;
        let v: Vec<u8> = row.try_get("value").map_err(db_err("read state value failed"))?;
        state.insert(k, v);
    }
    Ok(state)
}

/// Reap every expired row; returns the number of rows removed.
pub(crate) async fn delete_expired(conn: &mut SqliteConnection, now: i64) -> Result<u64> {
    let mut removed = 0;
    for table in [
        "session_states",
        "session_events",
        "session_summaries",
        "session_track_events",
        "app_states",
        "user_states",
    ] {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?",
            table
        ))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err("cleanup expired rows failed"))?;
        removed += result.rows_affected();
    }
    Ok(removed)
}
