//! User rows: one per authenticated Matrix user.

use sqlx::FromRow;

use crate::{Store, StoreError};

/// One row of the `user` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct UserRow {
    /// Matrix user id (primary key).
    pub mxid: String,
    /// Max numeric user id, null until the first login response.
    pub max_user_id: Option<i64>,
    /// User-mode login token.
    pub max_token: Option<String>,
    /// Connection mode: `bot` or `user`.
    pub connection_mode: Option<String>,
    /// Bot-mode token.
    pub bot_token: Option<String>,
}

impl UserRow {
    /// Whether this user has credentials for either mode.
    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        self.bot_token.is_some() || self.max_token.is_some()
    }

    /// Look up a user by Matrix user id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_mxid(store: &Store, mxid: &str) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM \"user\" WHERE mxid = ?")
            .bind(mxid)
            .fetch_optional(store.pool())
            .await?)
    }

    /// All users with stored credentials.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn all_logged_in(store: &Store) -> Result<Vec<Self>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM \"user\" WHERE bot_token IS NOT NULL OR max_token IS NOT NULL",
        )
        .fetch_all(store.pool())
        .await?)
    }

    /// Insert or update this user.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn upsert(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO \"user\" (mxid, max_user_id, max_token, connection_mode, bot_token)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (mxid) DO UPDATE SET
             max_user_id = excluded.max_user_id, max_token = excluded.max_token,
             connection_mode = excluded.connection_mode, bot_token = excluded.bot_token",
        )
        .bind(&self.mxid)
        .bind(self.max_user_id)
        .bind(&self.max_token)
        .bind(&self.connection_mode)
        .bind(&self.bot_token)
        .execute(store.pool())
        .await?;
        Ok(())
    }
}
