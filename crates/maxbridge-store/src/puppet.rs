//! Puppet rows: one per remote Max user.

use sqlx::FromRow;

use crate::{Store, StoreError};

/// One row of the `puppet` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct PuppetRow {
    /// Max user id (primary key).
    pub max_user_id: i64,
    /// Last known display name.
    pub name: Option<String>,
    /// Last known username.
    pub username: Option<String>,
    /// Avatar content URI on the homeserver.
    pub avatar_mxc: Option<String>,
    /// Whether the ghost's display name has been set.
    pub name_set: bool,
    /// Whether the ghost's avatar has been set.
    pub avatar_set: bool,
    /// Whether the ghost account exists on the homeserver.
    pub is_registered: bool,
}

impl PuppetRow {
    /// Look up a puppet by Max user id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_by_user_id(store: &Store, user_id: i64) -> Result<Option<Self>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM puppet WHERE max_user_id = ?")
            .bind(user_id)
            .fetch_optional(store.pool())
            .await?)
    }

    /// Insert or update this puppet.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn upsert(&self, store: &Store) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO puppet
             (max_user_id, name, username, avatar_mxc, name_set, avatar_set, is_registered)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (max_user_id) DO UPDATE SET
             name = excluded.name, username = excluded.username,
             avatar_mxc = excluded.avatar_mxc, name_set = excluded.name_set,
             avatar_set = excluded.avatar_set, is_registered = excluded.is_registered",
        )
        .bind(self.max_user_id)
        .bind(&self.name)
        .bind(&self.username)
        .bind(&self.avatar_mxc)
        .bind(self.name_set)
        .bind(self.avatar_set)
        .bind(self.is_registered)
        .execute(store.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_updates_flags() {
        let store = Store::in_memory().await.unwrap();
        let mut puppet = PuppetRow {
            max_user_id: 200,
            name: Some("Bob".to_string()),
            ..PuppetRow::default()
        };
        puppet.upsert(&store).await.unwrap();

        puppet.name_set = true;
        puppet.avatar_mxc = Some("mxc://example.com/abc".to_string());
        puppet.upsert(&store).await.unwrap();

        let loaded = PuppetRow::get_by_user_id(&store, 200).await.unwrap().unwrap();
        assert!(loaded.name_set);
        assert!(!loaded.avatar_set);
        assert_eq!(loaded.avatar_mxc.as_deref(), Some("mxc://example.com/abc"));
    }
}
