use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shared::domain::{ChatId, MessageId, UserId};
use storage::{Storage, StoredChat, StoredMessage};

/// Durable, process-independent storage as the engine sees it. A message
/// counts as sent only once `save_message` has returned; subscribers are
/// notified strictly after the write.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn chats_for_user(&self, user_id: &UserId) -> Result<Vec<StoredChat>>;
    /// Idempotent insert keyed on the message id; returns whether a row was
    /// actually created.
    async fn save_message(&self, message: &StoredMessage) -> Result<bool>;
    async fn chat_messages(
        &self,
        chat_id: &ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>>;
    async fn recipient_key_for_chat(&self, chat_id: &ChatId) -> Result<Option<Vec<u8>>>;
    async fn mark_transmitted(&self, message_id: &MessageId, at: DateTime<Utc>) -> Result<()>;
    async fn undelivered_messages(&self, sender_id: &UserId) -> Result<Vec<StoredMessage>>;
}

/// The reconciler's authoritative join target set. Kept separate from
/// [`LocalStore`] so the engine's dependency on chat membership is an
/// explicit injected capability rather than a hidden cyclic import.
#[async_trait]
pub trait ChatMembershipProvider: Send + Sync {
    async fn chat_ids_for_user(&self, user_id: &UserId) -> Result<Vec<ChatId>>;
}

#[async_trait]
impl LocalStore for Storage {
    async fn chats_for_user(&self, user_id: &UserId) -> Result<Vec<StoredChat>> {
        Storage::chats_for_user(self, user_id).await
    }

    async fn save_message(&self, message: &StoredMessage) -> Result<bool> {
        Storage::save_message(self, message).await
    }

    async fn chat_messages(
        &self,
        chat_id: &ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        Storage::chat_messages(self, chat_id, limit, offset).await
    }

    async fn recipient_key_for_chat(&self, chat_id: &ChatId) -> Result<Option<Vec<u8>>> {
        Storage::recipient_key_for_chat(self, chat_id).await
    }

    async fn mark_transmitted(&self, message_id: &MessageId, at: DateTime<Utc>) -> Result<()> {
        Storage::mark_transmitted(self, message_id, at).await
    }

    async fn undelivered_messages(&self, sender_id: &UserId) -> Result<Vec<StoredMessage>> {
        Storage::undelivered_messages(self, sender_id).await
    }
}

#[async_trait]
impl ChatMembershipProvider for Storage {
    async fn chat_ids_for_user(&self, user_id: &UserId) -> Result<Vec<ChatId>> {
        Storage::chat_ids_for_user(self, user_id).await
    }
}
