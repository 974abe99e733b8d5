use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use trellis_core::{CoreError, Result};

use crate::migrations::generate_migrations;
use crate::SqliteConfig;

/// Database connection manager for SQLite
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open the pool and, when configured, run migrations.
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| CoreError::ConfigurationError(format!("invalid database url: {}", e)))?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if config.is_in_memory() {
            // every connection to :memory: is its own database
            pool_options = pool_options.max_connections(1).min_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| CoreError::StateStoreError(format!("Failed to connect to SQLite: {}", e)))?;
        debug!(url = %config.database_url, "Connected to SQLite database");

        let db = Self { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Apply pending migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _trellis_migrations (name TEXT PRIMARY KEY, applied_at INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::StateStoreError(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in generate_migrations() {
            let applied: Option<String> = sqlx::query_scalar("SELECT name FROM _trellis_migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CoreError::StateStoreError(format!("Failed to read migrations: {}", e)))?;
            if applied.is_some() {
                continue;
            }

            debug!("Applying migration: {}", name);
            let mut tx = self.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::StateStoreError(format!("Failed to run migration {}: {}", name, e)))?;
            sqlx::query("INSERT INTO _trellis_migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(Utc::now().timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::StateStoreError(format!("Failed to record migration {}: {}", name, e)))?;
            commit(tx).await?;
        }

        info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| CoreError::StateStoreError(format!("Failed to begin transaction: {}", e)))
    }

    pub(crate) async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| CoreError::StateStoreError(format!("Failed to acquire connection: {}", e)))
    }
}

pub(crate) async fn commit(tx: Transaction<'static, Sqlite>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| CoreError::StateStoreError(format!("Failed to commit transaction: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() -> Result<()> {
        let db = SqliteDatabase::connect(&SqliteConfig::in_memory()).await?;
        db.run_migrations().await?;

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _trellis_migrations")
            .fetch_one(db.pool())
            .await
            .map_err(|e| CoreError::StateStoreError(e.to_string()))?;
        assert_eq!(applied as usize, generate_migrations().len());
        Ok(())
    }
}
