//! In-memory fakes shared by the unit tests.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ConversationSummary, CreateConversationRequest, MessagePage, MessagePayload,
        PostMessageRequest, PostMessageResponse, SearchHit, UserSummary,
    },
};
use tokio::sync::Mutex;

use crate::side_channel::MessageStore;

#[derive(Debug, Clone)]
pub(crate) enum PostBehavior {
    Scheduled,
    Confirm(Option<MessagePayload>),
    Fail(String),
}

pub(crate) struct FakeMessageStore {
    pub conversations: Vec<ConversationSummary>,
    pub history: HashMap<ConversationId, Vec<MessagePayload>>,
    pub post_behavior: Mutex<PostBehavior>,
    pub posted: Mutex<Vec<(ConversationId, PostMessageRequest)>>,
    pub history_requests: Mutex<Vec<(ConversationId, MessagePage)>>,
    pub deleted_conversations: Mutex<Vec<ConversationId>>,
    pub removed_messages: Mutex<Vec<MessageId>>,
}

impl FakeMessageStore {
    pub fn new(conversations: Vec<ConversationSummary>) -> Self {
        Self {
            conversations,
            history: HashMap::new(),
            post_behavior: Mutex::new(PostBehavior::Scheduled),
            posted: Mutex::new(Vec::new()),
            history_requests: Mutex::new(Vec::new()),
            deleted_conversations: Mutex::new(Vec::new()),
            removed_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(
        mut self,
        conversation_id: ConversationId,
        page: Vec<MessagePayload>,
    ) -> Self {
        self.history.insert(conversation_id, page);
        self
    }

    pub fn with_post_behavior(self, behavior: PostBehavior) -> Self {
        *self.post_behavior.try_lock().expect("uncontended") = behavior;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl MessageStore for FakeMessageStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.conversations.clone())
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        Ok(vec![UserSummary {
            id: UserId(2),
            display_name: "Alice".to_string(),
            is_online: true,
        }])
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            id: ConversationId(900),
            is_group: request.is_group,
            display_name: request.name.unwrap_or_else(|| "direct".to_string()),
            participant_ids: request.participant_ids,
            last_message_preview: None,
            last_message_time: None,
            unread_count: 0,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<MessagePayload>> {
        self.history_requests
            .lock()
            .await
            .push((conversation_id, page));
        Ok(self
            .history
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_message(
        &self,
        conversation_id: ConversationId,
        request: PostMessageRequest,
    ) -> Result<PostMessageResponse> {
        self.posted.lock().await.push((conversation_id, request));
        match self.post_behavior.lock().await.clone() {
            PostBehavior::Scheduled => Ok(PostMessageResponse {
                scheduled: true,
                message: None,
            }),
            PostBehavior::Confirm(message) => Ok(PostMessageResponse {
                scheduled: false,
                message,
            }),
            PostBehavior::Fail(reason) => Err(anyhow!(reason)),
        }
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.removed_messages.lock().await.push(message_id);
        Ok(())
    }

    async fn archive_message(&self, message_id: MessageId) -> Result<()> {
        self.removed_messages.lock().await.push(message_id);
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.deleted_conversations.lock().await.push(conversation_id);
        Ok(())
    }

    async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> Result<Vec<SearchHit>> {
        Ok(self
            .history
            .get(&conversation_id)
            .into_iter()
            .flatten()
            .filter(|message| message.content.contains(query))
            .map(|message| SearchHit {
                message: message.clone(),
                score: 1.0,
            })
            .collect())
    }
}

pub(crate) fn summary(id: i64, participants: &[i64]) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId(id),
        is_group: participants.len() > 2,
        display_name: format!("conversation {id}"),
        participant_ids: participants.iter().copied().map(UserId).collect(),
        last_message_preview: None,
        last_message_time: None,
        unread_count: 0,
    }
}

pub(crate) fn message(id: i64, conversation_id: i64, sender: i64, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender),
        content: content.to_string(),
        created_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 8, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(id),
        attachments: Vec::new(),
        is_scheduled: false,
        client_ref: None,
    }
}
