use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{MessageId, TempMessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Payload of the router's `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}{message}", code_prefix(.code))]
pub struct ProtocolFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Set when the fault refers to one specific message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Correlation id of the refused `send_message`, for sends the server
    /// never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempMessageId>,
}

impl ProtocolFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            message_id: None,
            client_ref: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn for_message(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn for_send(mut self, client_ref: TempMessageId) -> Self {
        self.client_ref = Some(client_ref);
        self
    }
}

fn code_prefix(code: &Option<ErrorCode>) -> String {
    code.map(|code| format!("{code:?}: ")).unwrap_or_default()
}
