/// Generate SQL migrations for the SQLite session store
///
/// Applied in order; each name is recorded in `_trellis_migrations` so a
/// migration runs once per database.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "20250101000000_session_tables",
            r#"
            CREATE TABLE IF NOT EXISTS session_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                state BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                UNIQUE (app_name, user_id, session_id)
            );

            CREATE TABLE IF NOT EXISTS session_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                event_data BLOB NOT NULL,
                timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS session_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                filter_key TEXT NOT NULL,
                summary BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                UNIQUE (app_name, user_id, session_id, filter_key)
            );

            CREATE TABLE IF NOT EXISTS session_track_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                track TEXT NOT NULL,
                event_data BLOB NOT NULL,
                timestamp INTEGER NOT NULL,
                expires_at INTEGER
            );
            "#,
        ),
        (
            "20250101000001_scoped_state_tables",
            r#"
            CREATE TABLE IF NOT EXISTS app_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                state_key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                UNIQUE (app_name, state_key)
            );

            CREATE TABLE IF NOT EXISTS user_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                state_key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                UNIQUE (app_name, user_id, state_key)
            );
            "#,
        ),
        (
            "20250101000002_indexes",
            r#"
            -- Event reads and eviction walk one session in timestamp order
            CREATE INDEX IF NOT EXISTS idx_session_events_session_ts
                ON session_events(app_name, user_id, session_id, timestamp);

            CREATE INDEX IF NOT EXISTS idx_session_events_event_id
                ON session_events(app_name, user_id, session_id, event_id);

            CREATE INDEX IF NOT EXISTS idx_session_track_events_session
                ON session_track_events(app_name, user_id, session_id, track);

            -- Cleanup scans
            CREATE INDEX IF NOT EXISTS idx_session_states_expires_at ON session_states(expires_at);
            CREATE INDEX IF NOT EXISTS idx_session_events_expires_at ON session_events(expires_at);
            CREATE INDEX IF NOT EXISTS idx_session_summaries_expires_at ON session_summaries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_session_track_events_expires_at ON session_track_events(expires_at);
            CREATE INDEX IF NOT EXISTS idx_app_states_expires_at ON app_states(expires_at);
            CREATE INDEX IF NOT EXISTS idx_user_states_expires_at ON user_states(expires_at);
            "#,
        ),
    ]
}
