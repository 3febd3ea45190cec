//! Request/response access to the external message-store service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{
        ConversationSummary, CreateConversationRequest, MessagePage, MessagePayload,
        PostMessageRequest, PostMessageResponse, SearchHit, UserSummary,
    },
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn list_users(&self) -> Result<Vec<UserSummary>>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<MessagePayload>>;
    async fn post_message(
        &self,
        conversation_id: ConversationId,
        request: PostMessageRequest,
    ) -> Result<PostMessageResponse>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn archive_message(&self, message_id: MessageId) -> Result<()>;
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()>;
    /// Ranking is entirely up to the service.
    async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> Result<Vec<SearchHit>>;
}

#[derive(Serialize)]
struct SearchQuery<'a> {
    q: &'a str,
}

/// `MessageStore` over the service's JSON HTTP API.
#[derive(Clone)]
pub struct HttpMessageStore {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpMessageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .authorize(self.http.get(self.url("/conversations")))
            .send()
            .await?
            .error_for_status()
            .context("list conversations")?
            .json()
            .await?;
        Ok(conversations)
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>> {
        let users = self
            .authorize(self.http.get(self.url("/users")))
            .send()
            .await?
            .error_for_status()
            .context("list users")?
            .json()
            .await?;
        Ok(users)
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .authorize(self.http.post(self.url("/conversations")))
            .json(&request)
            .send()
            .await?
            .error_for_status()
            .context("create conversation")?
            .json()
            .await?;
        Ok(conversation)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<MessagePayload>> {
        let path = format!("/conversations/{}/messages", conversation_id.0);
        let messages = self
            .authorize(self.http.get(self.url(&path)))
            .query(&page)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("list messages for conversation {}", conversation_id.0))?
            .json()
            .await?;
        Ok(messages)
    }

    async fn post_message(
        &self,
        conversation_id: ConversationId,
        request: PostMessageRequest,
    ) -> Result<PostMessageResponse> {
        let path = format!("/conversations/{}/messages", conversation_id.0);
        let response = self
            .authorize(self.http.post(self.url(&path)))
            .json(&request)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("post message to conversation {}", conversation_id.0))?
            .json()
            .await?;
        Ok(response)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let path = format!("/messages/{}", message_id.0);
        self.authorize(self.http.delete(self.url(&path)))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("delete message {}", message_id.0))?;
        Ok(())
    }

    async fn archive_message(&self, message_id: MessageId) -> Result<()> {
        let path = format!("/messages/{}/archive", message_id.0);
        self.authorize(self.http.post(self.url(&path)))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("archive message {}", message_id.0))?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let path = format!("/conversations/{}", conversation_id.0);
        self.authorize(self.http.delete(self.url(&path)))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("delete conversation {}", conversation_id.0))?;
        Ok(())
    }

    async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> Result<Vec<SearchHit>> {
        let path = format!("/conversations/{}/messages/search", conversation_id.0);
        let hits = self
            .authorize(self.http.get(self.url(&path)))
            .query(&SearchQuery { q: query })
            .send()
            .await?
            .error_for_status()
            .context("search messages")?
            .json()
            .await?;
        Ok(hits)
    }
}

#[cfg(test)]
#[path = "tests/side_channel_tests.rs"]
mod tests;
