//! Routes attachment-bearing and deferred sends over the request/response
//! side-channel instead of the live connection.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    domain::{ConversationId, DeliveryOption},
    protocol::{AttachmentUploadPayload, MessagePayload, PostMessageRequest},
};
use tracing::{info, warn};

use crate::{
    error::{ClientError, ClientResult},
    side_channel::MessageStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A message as composed by the user, before it is sent anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeDraft {
    pub conversation_id: ConversationId,
    pub content: String,
    pub delivery: DeliveryOption,
    pub attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRoute {
    /// `send_message` over the duplex connection with an optimistic render.
    Live,
    /// `post message` over the side-channel, no optimistic render.
    Gateway,
}

impl ComposeDraft {
    pub fn text(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            delivery: DeliveryOption::Immediate,
            attachments: Vec::new(),
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryOption) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.content.trim().is_empty() && self.attachments.is_empty() {
            return Err(ClientError::Validation(
                "message needs text or at least one attachment".to_string(),
            ));
        }
        Ok(())
    }

    pub fn route(&self) -> SendRoute {
        if self.attachments.is_empty() && self.delivery.is_immediate() {
            SendRoute::Live
        } else {
            SendRoute::Gateway
        }
    }

    fn to_request(&self) -> PostMessageRequest {
        PostMessageRequest {
            content: self.content.clone(),
            scheduled_delivery: self.delivery,
            attachments: self
                .attachments
                .iter()
                .map(|attachment| AttachmentUploadPayload {
                    original_name: attachment.original_name.clone(),
                    mime_type: attachment.mime_type.clone(),
                    data_b64: STANDARD.encode(&attachment.bytes),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// Accepted for later; a `scheduled_message_delivered` event follows.
    Scheduled,
    /// Stored right away. The stored message is present when the service
    /// returns it.
    Confirmed(Option<MessagePayload>),
}

#[derive(Clone)]
pub struct ScheduledDeliveryGateway {
    store: Arc<dyn MessageStore>,
}

impl ScheduledDeliveryGateway {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Submits a draft. On failure the draft comes back inside
    /// `ClientError::Upload` so nothing the user typed or attached is lost.
    pub async fn submit(&self, draft: ComposeDraft) -> ClientResult<GatewayOutcome> {
        draft.validate()?;
        let conversation_id = draft.conversation_id;
        let request = draft.to_request();

        match self.store.post_message(conversation_id, request).await {
            Ok(response) if response.scheduled => {
                info!(
                    conversation_id = conversation_id.0,
                    delivery = ?draft.delivery,
                    "gateway: message scheduled"
                );
                Ok(GatewayOutcome::Scheduled)
            }
            Ok(response) => Ok(GatewayOutcome::Confirmed(response.message)),
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    attachments = draft.attachments.len(),
                    "gateway: post message failed: {err:#}"
                );
                Err(ClientError::Upload {
                    reason: format!("{err:#}"),
                    draft: Box::new(draft),
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
