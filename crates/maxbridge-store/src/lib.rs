//! # maxbridge-store
//!
//! The bridge's relational store: five tables mapping Max chats, users and
//! messages onto their Matrix counterparts. One [`Store`] handle is shared by
//! every component and is safe to use concurrently from any task.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod message;
mod migrations;
mod portal;
mod puppet;
mod reaction;
mod user;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;

pub use message::MessageRow;
pub use portal::PortalRow;
pub use puppet::PuppetRow;
pub use reaction::ReactionRow;
pub use user::UserRow;

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Shared handle to the bridge database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database at the given URI and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(uri)
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open a private in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;
        // A single connection keeps every query on the same in-memory DB.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_reach_current_version() {
        let store = Store::in_memory().await.unwrap();
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = Store::in_memory().await.unwrap();
        migrations::run(store.pool()).await.unwrap();
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }
}
