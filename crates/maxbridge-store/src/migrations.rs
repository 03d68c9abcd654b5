//! Numbered one-way schema migrations, tracked by `PRAGMA user_version`.

use sqlx::SqlitePool;

use crate::StoreError;

/// The schema version this build requires.
pub const CURRENT_VERSION: i64 = 3;

/// Bring the schema up to [`CURRENT_VERSION`].
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    while version < CURRENT_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "applying schema migration");
        match next {
            1 => upgrade_v1(pool).await?,
            2 => upgrade_v2(pool).await?,
            3 => upgrade_v3(pool).await?,
            other => {
                return Err(StoreError::Migration(format!(
                    "no migration registered for version {other}"
                )));
            }
        }
        sqlx::query(&format!("PRAGMA user_version = {next}"))
            .execute(pool)
            .await?;
        version = next;
    }
    Ok(())
}

/// Initial schema.
async fn upgrade_v1(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE portal (
            max_chat_id   BIGINT PRIMARY KEY,
            mxid          TEXT UNIQUE,
            name          TEXT,
            encrypted     BOOLEAN NOT NULL DEFAULT false,
            relay_user_id TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE puppet (
            max_user_id BIGINT PRIMARY KEY,
            name        TEXT,
            username    TEXT,
            avatar_mxc  TEXT,
            name_set    BOOLEAN NOT NULL DEFAULT false,
            avatar_set  BOOLEAN NOT NULL DEFAULT false
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE \"user\" (
            mxid            TEXT PRIMARY KEY,
            max_user_id     BIGINT,
            max_token       TEXT,
            connection_mode VARCHAR(10),
            bot_token       TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE message (
            max_chat_id BIGINT NOT NULL,
            max_msg_id  TEXT NOT NULL,
            mxid        TEXT NOT NULL,
            mx_room     TEXT NOT NULL,
            timestamp   BIGINT,
            PRIMARY KEY (max_chat_id, max_msg_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX idx_message_mxid ON message (mxid)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE reaction (
            mxid          TEXT PRIMARY KEY,
            max_chat_id   BIGINT NOT NULL,
            max_msg_id    TEXT NOT NULL,
            max_sender_id BIGINT NOT NULL,
            reaction      TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Track which ghosts have been registered with the homeserver.
async fn upgrade_v2(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("ALTER TABLE puppet ADD COLUMN is_registered BOOLEAN NOT NULL DEFAULT false")
        .execute(pool)
        .await?;
    Ok(())
}

/// Index for the one-reaction-per-user-per-message lookup.
async fn upgrade_v3(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reaction_max_ids
         ON reaction (max_chat_id, max_msg_id, max_sender_id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}
