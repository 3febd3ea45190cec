//! Client-side entities owned by the conversation store.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, TempMessageId, UserId},
    protocol::{AttachmentPayload, ConversationSummary, MessagePayload},
};

use crate::delivery::DeliveryStatus;

/// A message is addressed by exactly one of these at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Local(TempMessageId),
}

impl MessageKey {
    pub fn server_id(&self) -> Option<MessageId> {
        match self {
            MessageKey::Server(id) => Some(*id),
            MessageKey::Local(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub uploaded_by: UserId,
}

impl From<AttachmentPayload> for Attachment {
    fn from(value: AttachmentPayload) -> Self {
        Self {
            filename: value.filename,
            original_name: value.original_name,
            mime_type: value.mime_type,
            size_bytes: value.size_bytes,
            uploaded_by: value.uploaded_by,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub attachments: Vec<Attachment>,
    pub is_scheduled: bool,
}

impl Message {
    pub fn pending(
        temp_id: TempMessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: String,
    ) -> Self {
        Self {
            key: MessageKey::Local(temp_id),
            conversation_id,
            sender_id,
            content,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sending,
            attachments: Vec::new(),
            is_scheduled: false,
        }
    }

    pub fn confirmed(payload: MessagePayload, delivery_status: DeliveryStatus) -> Self {
        Self {
            key: MessageKey::Server(payload.id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            content: payload.content,
            created_at: payload.created_at,
            delivery_status,
            attachments: payload.attachments.into_iter().map(Attachment::from).collect(),
            is_scheduled: payload.is_scheduled,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        self.key.server_id()
    }

    /// Content with HTML-significant characters escaped, ready for a renderer.
    pub fn escaped_content(&self) -> String {
        escape_html(&self.content)
    }

    /// One-line preview used for the conversation list.
    pub fn preview(&self) -> String {
        let trimmed = self.content.trim();
        if trimmed.is_empty() {
            if let Some(first) = self.attachments.first() {
                return format!("[attachment] {}", first.original_name);
            }
        }
        let mut preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        if trimmed.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        preview
    }
}

const PREVIEW_CHARS: usize = 80;

/// Escapes HTML-significant characters in untrusted message text.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub display_name: String,
    pub participant_ids: BTreeSet<UserId>,
    pub last_message_preview: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Only tracked for 1:1 conversations.
    pub online_status: HashMap<UserId, bool>,
}

impl From<ConversationSummary> for Conversation {
    fn from(value: ConversationSummary) -> Self {
        Self {
            id: value.id,
            is_group: value.is_group,
            display_name: value.display_name,
            participant_ids: value.participant_ids.into_iter().collect(),
            last_message_preview: value.last_message_preview,
            last_message_time: value.last_message_time,
            unread_count: value.unread_count,
            online_status: HashMap::new(),
        }
    }
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
