use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    domain::{ConversationId, DeliveryOption, MessageId, TempMessageId, UserId},
    error::ProtocolFault,
};

/// Transport-level frame shared by both directions of the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub uploaded_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub is_scheduled: bool,
    /// Echo of the correlation id the sender attached to `send_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempMessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablishedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRefPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatusPayload {
    pub user_id: UserId,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidData {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the message router can push down the live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    ConnectionEstablished(ConnectionEstablishedPayload),
    NewMessage(MessagePayload),
    UserTyping(TypingPayload),
    UserStoppedTyping(TypingPayload),
    MessageRead(ReadReceiptPayload),
    UserStatusChanged(UserStatusPayload),
    ScheduledMessageDelivered(MessagePayload),
    MessageSent(MessageRefPayload),
    MessageDelivered(MessageRefPayload),
    Pong(PongPayload),
    Error(ProtocolFault),
}

impl InboundEvent {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, DecodeError> {
        let Envelope { kind, data } = envelope;
        let event = match kind.as_str() {
            "connection_established" => {
                // Older routers send no payload at all.
                let data = if data.is_null() {
                    Value::Object(Default::default())
                } else {
                    data
                };
                Self::ConnectionEstablished(payload(&kind, data)?)
            }
            "new_message" => Self::NewMessage(payload(&kind, data)?),
            "user_typing" => Self::UserTyping(payload(&kind, data)?),
            "user_stopped_typing" => Self::UserStoppedTyping(payload(&kind, data)?),
            "message_read" => Self::MessageRead(payload(&kind, data)?),
            "user_status_changed" => Self::UserStatusChanged(payload(&kind, data)?),
            "scheduled_message_delivered" => Self::ScheduledMessageDelivered(payload(&kind, data)?),
            "message_sent" => Self::MessageSent(payload(&kind, data)?),
            "message_delivered" => Self::MessageDelivered(payload(&kind, data)?),
            "pong" => {
                let data = if data.is_null() {
                    Value::Object(Default::default())
                } else {
                    data
                };
                Self::Pong(payload(&kind, data)?)
            }
            "error" => Self::Error(payload(&kind, data)?),
            _ => return Err(DecodeError::UnknownType(kind)),
        };
        Ok(event)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::NewMessage(_) => "new_message",
            Self::UserTyping(_) => "user_typing",
            Self::UserStoppedTyping(_) => "user_stopped_typing",
            Self::MessageRead(_) => "message_read",
            Self::UserStatusChanged(_) => "user_status_changed",
            Self::ScheduledMessageDelivered(_) => "scheduled_message_delivered",
            Self::MessageSent(_) => "message_sent",
            Self::MessageDelivered(_) => "message_delivered",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidData {
        kind: kind.to_string(),
        source,
    })
}

/// Socket-bound actions emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        client_ref: TempMessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    MarkRead {
        message_id: MessageId,
    },
    Ping {
        timestamp: i64,
    },
}

impl OutboundAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::JoinConversation { .. } => "join_conversation",
            Self::MarkRead { .. } => "mark_read",
            Self::Ping { .. } => "ping",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// Side-channel (request/response) contracts.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub is_group: bool,
    pub display_name: String,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<UserId>,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUploadPayload {
    pub original_name: String,
    pub mime_type: String,
    pub data_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    pub scheduled_delivery: DeliveryOption,
    #[serde(default)]
    pub attachments: Vec<AttachmentUploadPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageResponse {
    pub scheduled: bool,
    /// Present when the store accepted the message for immediate delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: MessagePayload,
    #[serde(default)]
    pub score: f64,
}
