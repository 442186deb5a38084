//! Database module for SQLite persistence
//!
//! Stores per-user versions, the change log and the commit ledger, and
//! implements the sync storage traits over them.

mod change_log;
mod schema;
mod versions;

pub use schema::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::sync::UserLocks;

/// Create a new database connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// SQLite-backed version store and change log.
///
/// Every CAS, sweep and discard is a single statement, so SQLite's write
/// serialization makes each of them atomic against the others.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    locks: UserLocks,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, locks: UserLocks) -> Self {
        Self { pool, locks }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> SqliteStore {
    // One connection: every connection to `sqlite::memory:` is its own database
    let pool = create_pool(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap();
    SqliteStore::new(pool, UserLocks::default())
}
