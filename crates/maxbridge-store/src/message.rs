//! Message correlation rows: Max message id to Matrix event id and back.

use sqlx::FromRow;

use crate::{Store, StoreError};

/// One row of the `message` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct MessageRow {
    /// Max chat the message belongs to.
    pub max_chat_id: i64,
    /// Max message id.
    pub max_msg_id: String,
    /// Matrix event id.
    pub mxid: String,
    /// Matrix room id.
    pub mx_room: String,
    /// Message timestamp in milliseconds.
    pub timestamp: Option<i64>,
}

impl MessageRow {
    /// Look up a correlation by `(chat id, max message id)`.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_max_id(
        store: &Store,
        chat_id: i64,
        msg_id: &str,
    ) -> Result<Option<Self>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM message WHERE max_chat_id = ? AND max_msg_id = ?")
                .bind(chat_id)
                .bind(msg_id)
                .fetch_optional(store.pool())
                .await?,
        )
    }

    /// Look up a correlation by Matrix event id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_mxid(store: &Store, mxid: &str) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM message WHERE mxid = ?")
            .bind(mxid)
            .fetch_optional(store.pool())
            .await?)
    }

    /// Insert this correlation. Duplicate Max ids are ignored: the first
    /// write for a message wins, which makes the echo race idempotent.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn insert(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO message (max_chat_id, max_msg_id, mxid, mx_room, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(self.max_chat_id)
        .bind(&self.max_msg_id)
        .bind(&self.mxid)
        .bind(&self.mx_room)
        .bind(self.timestamp)
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Number of correlations recorded for a chat.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn count_by_chat(store: &Store, chat_id: i64) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM message WHERE max_chat_id = ?")
                .bind(chat_id)
                .fetch_one(store.pool())
                .await?,
        )
    }

    /// Delete a correlation by `(chat id, max message id)`.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn delete_by_max_id(
        store: &Store,
        chat_id: i64,
        msg_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message WHERE max_chat_id = ? AND max_msg_id = ?")
            .bind(chat_id)
            .bind(msg_id)
            .execute(store.pool())
            .await?;
        Ok(())
    }
}
