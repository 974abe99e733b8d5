//! SQLite session service for the Trellis runtime
//!
//! Stores sessions, their events, summaries, tracks and scoped state in
//! SQLite through sqlx. Timestamps are epoch milliseconds; every row
//! carries an optional `expires_at` that a background ticker reaps.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::env;

pub mod connection;
pub mod migrations;
mod repositories;
pub mod service;
mod store;

pub use connection::SqliteDatabase;
pub use service::{SqliteSessionService, SqliteSessionServiceBuilder};

fn default_database_url() -> String {
    "sqlite://trellis.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_run_migrations() -> bool {
    true
}

/// Configuration for the SQLite connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database URL, e.g. `sqlite://trellis.db` or `sqlite::memory:`
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Timeout for acquiring a connection from the pool (in seconds)
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Whether to run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl SqliteConfig {
    /// Private in-memory database, one connection
    pub fn in_memory() -> Self {
        Self { database_url: "sqlite::memory:".to_string(), max_connections: 1, ..Default::default() }
    }

    /// Apply `TRELLIS_SQLITE_URL` and `TRELLIS_SQLITE_MAX_CONNECTIONS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("TRELLIS_SQLITE_URL") {
            self.database_url = url;
        }
        if let Ok(raw) = env::var("TRELLIS_SQLITE_MAX_CONNECTIONS") {
            match raw.parse() {
                Ok(n) => self.max_connections = n,
                Err(_) => tracing::warn!("Invalid TRELLIS_SQLITE_MAX_CONNECTIONS value: {}", raw),
            }
        }
        self
    }

    /// The URL names a private in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}
