use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, ChatKind, ContentState, MemberRole, MessageId, MessageKind, UserId};

/// The local-first store. Every durable effect of the sync engine lands here
/// before and independently of server acknowledgment; the `messages.id`
/// primary key is the second (authoritative) layer of de-duplication behind
/// the engine's in-memory processed set.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub public_key: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub name: String,
    pub kind: ChatKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub content_state: ContentState,
    pub sent_at: DateTime<Utc>,
    pub transmitted_at: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A pooled in-memory database is one database per connection; keep a
        // single connection so every query sees the same schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(
        &self,
        user_id: &UserId,
        username: &str,
        public_key: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, public_key) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username,
                 public_key = COALESCE(excluded.public_key, users.public_key)",
        )
        .bind(&user_id.0)
        .bind(username)
        .bind(public_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, public_key, last_seen_at FROM users WHERE id = ?")
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<String, _>(0)),
            username: r.get::<String, _>(1),
            public_key: r.get::<Option<String>, _>(2),
            last_seen_at: r.get::<Option<DateTime<Utc>>, _>(3),
        }))
    }

    pub async fn touch_last_seen(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = ? WHERE id = ?")
            .bind(at)
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_chat(
        &self,
        chat_id: &ChatId,
        name: &str,
        kind: ChatKind,
        created_by: &UserId,
    ) -> Result<()> {
        sqlx::query("INSERT INTO chats (id, name, kind, created_by) VALUES (?, ?, ?, ?)")
            .bind(&chat_id.0)
            .bind(name)
            .bind(match kind {
                ChatKind::Direct => "direct",
                ChatKind::Group => "group",
            })
            .bind(&created_by.0)
            .execute(&self.pool)
            .await?;
        self.add_member(chat_id, created_by, MemberRole::Owner).await?;
        Ok(())
    }

    pub async fn add_member(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        role: MemberRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET role = excluded.role",
        )
        .bind(&chat_id.0)
        .bind(&user_id.0)
        .bind(match role {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chats_for_user(&self, user_id: &UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.kind, c.created_by, c.created_at, c.updated_at
             FROM chats c
             INNER JOIN chat_members m ON m.chat_id = c.id
             WHERE m.user_id = ?
             ORDER BY c.updated_at DESC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredChat {
                chat_id: ChatId(r.get::<String, _>(0)),
                name: r.get::<String, _>(1),
                kind: match r.get::<String, _>(2).as_str() {
                    "direct" => ChatKind::Direct,
                    _ => ChatKind::Group,
                },
                created_by: UserId(r.get::<String, _>(3)),
                created_at: r.get::<DateTime<Utc>, _>(4),
                updated_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    /// The reconciler's join target set for the current user.
    pub async fn chat_ids_for_user(&self, user_id: &UserId) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT chat_id FROM chat_members WHERE user_id = ? ORDER BY chat_id")
            .bind(&user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChatId(r.get::<String, _>(0)))
            .collect())
    }

    /// Inserts a message if (and only if) its id has never been seen, and
    /// advances the chat's `updated_at` high-water mark in the same
    /// transaction. Returns whether a row was actually inserted; a duplicate
    /// id is a successful no-op.
    pub async fn save_message(&self, message: &StoredMessage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, kind, content, content_state, sent_at, transmitted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.message_id.0)
        .bind(&message.chat_id.0)
        .bind(&message.sender_id.0)
        .bind(match message.kind {
            MessageKind::Text => "text",
            MessageKind::System => "system",
        })
        .bind(&message.content)
        .bind(message.content_state.as_str())
        .bind(message.sent_at)
        .bind(message.transmitted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ? AND updated_at < ?")
                .bind(message.sent_at)
                .bind(&message.chat_id.0)
                .bind(message.sent_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn mark_transmitted(&self, message_id: &MessageId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE messages SET transmitted_at = ? WHERE id = ? AND transmitted_at IS NULL")
            .bind(at)
            .bind(&message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Messages for one chat in display order: `(sent_at, id)` ascending,
    /// with ties broken by the id string. `offset` counts back from the
    /// newest message.
    pub async fn chat_messages(
        &self,
        chat_id: &ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(
            "SELECT id, chat_id, sender_id, kind, content, content_state, sent_at, transmitted_at
             FROM messages
             WHERE chat_id = ?
             ORDER BY sent_at DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(&chat_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Locally durable sends that were never handed to the transport. This is
    /// the hook for re-sync after an outbox TTL discard: the outbox is never
    /// the only path to eventual delivery.
    pub async fn undelivered_messages(&self, sender_id: &UserId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, sender_id, kind, content, content_state, sent_at, transmitted_at
             FROM messages
             WHERE sender_id = ? AND transmitted_at IS NULL
             ORDER BY sent_at ASC, id ASC",
        )
        .bind(&sender_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn save_chat_key(&self, chat_id: &ChatId, key_bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_keys (chat_id, key_bytes, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(chat_id) DO UPDATE SET key_bytes = excluded.key_bytes, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&chat_id.0)
        .bind(key_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recipient_key_for_chat(&self, chat_id: &ChatId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT key_bytes FROM chat_keys WHERE chat_id = ?")
            .bind(&chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<String, _>(0)),
        chat_id: ChatId(r.get::<String, _>(1)),
        sender_id: UserId(r.get::<String, _>(2)),
        kind: match r.get::<String, _>(3).as_str() {
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        },
        content: r.get::<String, _>(4),
        content_state: ContentState::parse(&r.get::<String, _>(5)),
        sent_at: r.get::<DateTime<Utc>, _>(6),
        transmitted_at: r.get::<Option<DateTime<Utc>>, _>(7),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
