use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Frames the client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        user_id: UserId,
        username: String,
        token: String,
    },
    JoinChat {
        chat_id: ChatId,
    },
    SendMessage {
        message: MessageFrame,
    },
    Typing {
        chat_id: ChatId,
        is_typing: bool,
    },
}

/// Frames the relay sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JoinedChat {
        chat_id: ChatId,
    },
    JoinChatError {
        chat_id: ChatId,
        error: String,
    },
    NewMessage {
        message: MessageFrame,
    },
    UserTyping {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub kind: MessageKind,
    pub envelope: Envelope,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeEncryption {
    Sealed,
    Plain,
}

/// Opaque message body as it travels over the wire. The relay never looks
/// inside; `encryption` only tells the receiving client whether to run the
/// payload through its crypto gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub encryption: EnvelopeEncryption,
    pub payload_b64: String,
}

impl Envelope {
    pub fn sealed(ciphertext: &[u8]) -> Self {
        Self {
            encryption: EnvelopeEncryption::Sealed,
            payload_b64: STANDARD.encode(ciphertext),
        }
    }

    pub fn plain(text: &str) -> Self {
        Self {
            encryption: EnvelopeEncryption::Plain,
            payload_b64: STANDARD.encode(text.as_bytes()),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.payload_b64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_snake_case_tags() {
        let frame = ClientFrame::JoinChat {
            chat_id: ChatId::from("c-9"),
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "join_chat");
        assert_eq!(json["payload"]["chat_id"], "c-9");
    }

    #[test]
    fn plain_envelope_round_trips_payload() {
        let envelope = Envelope::plain("bonjour");
        assert_eq!(envelope.encryption, EnvelopeEncryption::Plain);
        assert_eq!(envelope.payload().expect("decode"), b"bonjour");
    }
}
