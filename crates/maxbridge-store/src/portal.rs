//! Portal rows: one per Max chat, binding it to a Matrix room.

use sqlx::FromRow;

use crate::{Store, StoreError};

/// One row of the `portal` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct PortalRow {
    /// Max chat id (primary key).
    pub max_chat_id: i64,
    /// Matrix room id, null until the room is materialized.
    pub mxid: Option<String>,
    /// Display name of the chat.
    pub name: Option<String>,
    /// Whether the Matrix room is flagged encrypted.
    pub encrypted: bool,
    /// Relay user for unauthenticated senders.
    pub relay_user_id: Option<String>,
}

impl PortalRow {
    /// Look up a portal by Max chat id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_chat_id(store: &Store, chat_id: i64) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM portal WHERE max_chat_id = ?")
            .bind(chat_id)
            .fetch_optional(store.pool())
            .await?)
    }

    /// Look up a portal by Matrix room id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_mxid(store: &Store, mxid: &str) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM portal WHERE mxid = ?")
            .bind(mxid)
            .fetch_optional(store.pool())
            .await?)
    }

    /// All portals that have a Matrix room.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn all_with_room(store: &Store) -> Result<Vec<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM portal WHERE mxid IS NOT NULL")
            .fetch_all(store.pool())
            .await?)
    }

    /// Insert or update this portal.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn upsert(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO portal (max_chat_id, mxid, name, encrypted, relay_user_id)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (max_chat_id) DO UPDATE SET
             mxid = excluded.mxid, name = excluded.name,
             encrypted = excluded.encrypted, relay_user_id = excluded.relay_user_id",
        )
        .bind(self.max_chat_id)
        .bind(&self.mxid)
        .bind(&self.name)
        .bind(self.encrypted)
        .bind(&self.relay_user_id)
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Delete this portal.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn delete(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM portal WHERE max_chat_id = ?")
            .bind(self.max_chat_id)
            .execute(store.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_lookup_both_keys() {
        let store = Store::in_memory().await.unwrap();
        let portal = PortalRow {
            max_chat_id: 42,
            mxid: Some("!room:example.com".to_string()),
            name: Some("Bob".to_string()),
            ..PortalRow::default()
        };
        portal.upsert(&store).await.unwrap();

        let by_chat = PortalRow::get_by_chat_id(&store, 42).await.unwrap().unwrap();
        assert_eq!(by_chat.mxid.as_deref(), Some("!room:example.com"));

        let by_room = PortalRow::get_by_mxid(&store, "!room:example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_room.max_chat_id, 42);
    }

    #[tokio::test]
    async fn room_id_is_unique() {
        let store = Store::in_memory().await.unwrap();
        PortalRow {
            max_chat_id: 1,
            mxid: Some("!dup:example.com".to_string()),
            ..PortalRow::default()
        }
        .upsert(&store)
        .await
        .unwrap();
        let clash = PortalRow {
            max_chat_id: 2,
            mxid: Some("!dup:example.com".to_string()),
            ..PortalRow::default()
        }
        .upsert(&store)
        .await;
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn shadow_portals_not_listed() {
        let store = Store::in_memory().await.unwrap();
        PortalRow {
            max_chat_id: 3,
            ..PortalRow::default()
        }
        .upsert(&store)
        .await
        .unwrap();
        assert!(PortalRow::all_with_room(&store).await.unwrap().is_empty());
    }
}
