use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

impl MessageId {
    /// Compound id: millisecond timestamp, sender id, random suffix.
    ///
    /// The timestamp prefix keeps ids from one sender roughly ordered by send
    /// time; the uuid suffix makes the id globally unique even when two
    /// messages share a millisecond. The id is assigned exactly once and is
    /// the de-duplication key for the lifetime of the message.
    pub fn generate(sent_at: DateTime<Utc>, sender: &UserId) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            sent_at.timestamp_millis(),
            sender.0,
            &suffix[..8]
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
}

/// What the locally persisted `content` column actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentState {
    /// Plaintext is available: the message decrypted cleanly, or it is the
    /// sender's own authoritative copy.
    Clear,
    /// Sent in the clear after an encryption failure.
    Unencrypted,
    /// Decryption failed; `content` retains the base64 envelope verbatim.
    DecryptFailed,
}

impl ContentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentState::Clear => "clear",
            ContentState::Unencrypted => "unencrypted",
            ContentState::DecryptFailed => "decrypt_failed",
        }
    }

    pub fn parse(value: &str) -> ContentState {
        match value {
            "unencrypted" => ContentState::Unencrypted,
            "decrypt_failed" => ContentState::DecryptFailed,
            _ => ContentState::Clear,
        }
    }
}
