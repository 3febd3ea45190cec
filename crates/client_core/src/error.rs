use shared::domain::ConversationId;
use thiserror::Error;

use crate::gateway::ComposeDraft;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    Validation(String),
    /// The side-channel rejected or failed a send. The draft is returned
    /// untouched so the caller can offer a retry.
    #[error("message upload failed: {reason}")]
    Upload {
        draft: Box<ComposeDraft>,
        reason: String,
    },
    #[error("connection lost after {attempts} reconnect attempts; reload to continue")]
    ConnectionLost { attempts: u32 },
    #[error("conversation {0} is unknown or has been deleted")]
    UnknownConversation(ConversationId),
    #[error("conversations were already loaded; use refresh_conversations")]
    AlreadySynced,
    #[error("chat session has shut down")]
    SessionClosed,
    #[error(transparent)]
    SideChannel(#[from] anyhow::Error),
}

impl ClientError {
    /// Hands back the draft of a failed upload, if this error carries one.
    pub fn into_draft(self) -> Option<ComposeDraft> {
        match self {
            ClientError::Upload { draft, .. } => Some(*draft),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
