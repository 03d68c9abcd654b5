//! Reaction correlation rows.
//!
//! Max allows at most one reaction per user per message, hence the
//! `(chat, message, sender)` lookup next to the Matrix-event-id key.

use sqlx::FromRow;

use crate::{Store, StoreError};

/// One row of the `reaction` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct ReactionRow {
    /// Matrix event id of the reaction annotation (primary key).
    pub mxid: String,
    /// Chat of the reacted-to message.
    pub max_chat_id: i64,
    /// Max id of the reacted-to message.
    pub max_msg_id: String,
    /// Max user who reacted.
    pub max_sender_id: i64,
    /// The emoji.
    pub reaction: String,
}

impl ReactionRow {
    /// Look up a reaction by the Matrix event id of the annotation.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_mxid(store: &Store, mxid: &str) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM reaction WHERE mxid = ?")
            .bind(mxid)
            .fetch_optional(store.pool())
            .await?)
    }

    /// Look up a reaction by `(chat, message, sender)`.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_max_ids(
        store: &Store,
        chat_id: i64,
        msg_id: &str,
        sender_id: i64,
    ) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM reaction
             WHERE max_chat_id = ? AND max_msg_id = ? AND max_sender_id = ?",
        )
        .bind(chat_id)
        .bind(msg_id)
        .bind(sender_id)
        .fetch_optional(store.pool())
        .await?)
    }

    /// Insert or update this reaction.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn upsert(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reaction (mxid, max_chat_id, max_msg_id, max_sender_id, reaction)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (mxid) DO UPDATE SET reaction = excluded.reaction",
        )
        .bind(&self.mxid)
        .bind(self.max_chat_id)
        .bind(&self.max_msg_id)
        .bind(self.max_sender_id)
        .bind(&self.reaction)
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Delete a reaction by its Matrix event id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn delete_by_mxid(store: &Store, mxid: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM reaction WHERE mxid = ?")
            .bind(mxid)
            .execute(store.pool())
            .await?;
        Ok(())
    }

    /// Delete a reaction by `(chat, message, sender)`.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn delete_by_max_ids(
        store: &Store,
        chat_id: i64,
        msg_id: &str,
        sender_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM reaction
             WHERE max_chat_id = ? AND max_msg_id = ? AND max_sender_id = ?",
        )
        .bind(chat_id)
        .bind(msg_id)
        .bind(sender_id)
        .execute(store.pool())
        .await?;
        Ok(())
    }
}
