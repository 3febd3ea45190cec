//! Authoritative in-memory index of conversations and their messages.
//!
//! Only the session actor holds a `ConversationStore`, so every mutation
//! below runs on the single dispatch path.

use std::collections::{HashMap, HashSet};

use shared::domain::{ConversationId, MessageId, TempMessageId, UserId};
use tracing::debug;

use crate::{
    delivery::{transition, DeliveryEvent, DeliveryStatus},
    error::{ClientError, ClientResult},
    types::{Conversation, Message, MessageKey},
};

#[derive(Debug)]
pub struct ConversationStore {
    local_user: UserId,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    active: Option<ConversationId>,
    deleted: HashSet<ConversationId>,
    synced: bool,
}

/// What `select` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub previous: Option<ConversationId>,
}

impl ConversationStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            conversations: HashMap::new(),
            messages: HashMap::new(),
            active: None,
            deleted: HashSet::new(),
            synced: false,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Initial full sync. Only allowed once per session.
    pub fn load(&mut self, conversations: Vec<Conversation>) -> ClientResult<()> {
        if self.synced {
            return Err(ClientError::AlreadySynced);
        }
        self.replace_all(conversations);
        Ok(())
    }

    /// Wholesale refresh requested by the user. Summaries, previews and
    /// unread counts come from the server; known messages, 1:1 presence and
    /// the active selection survive for conversations still listed.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        let incoming: HashMap<ConversationId, Conversation> = conversations
            .into_iter()
            .filter(|conversation| !self.deleted.contains(&conversation.id))
            .map(|mut conversation| {
                if let Some(previous) = self.conversations.get_mut(&conversation.id) {
                    if !conversation.is_group {
                        conversation.online_status = std::mem::take(&mut previous.online_status);
                        conversation
                            .online_status
                            .retain(|user_id, _| conversation.participant_ids.contains(user_id));
                    }
                }
                (conversation.id, conversation)
            })
            .collect();

        self.messages.retain(|id, _| incoming.contains_key(id));
        if let Some(active) = self.active {
            if !incoming.contains_key(&active) {
                self.active = None;
            }
        }
        self.conversations = incoming;
        self.synced = true;
    }

    /// Adds a conversation created after the initial sync.
    pub fn insert(&mut self, conversation: Conversation) -> bool {
        if self.deleted.contains(&conversation.id) {
            return false;
        }
        self.conversations.insert(conversation.id, conversation);
        true
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    pub fn accepts(&self, id: ConversationId) -> bool {
        self.conversations.contains_key(&id)
    }

    /// Conversations ordered most-recent activity first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn is_active(&self, id: ConversationId) -> bool {
        self.active == Some(id)
    }

    pub fn select(&mut self, id: ConversationId) -> ClientResult<Selection> {
        if !self.conversations.contains_key(&id) {
            return Err(ClientError::UnknownConversation(id));
        }
        let previous = self.active.replace(id);
        Ok(Selection { previous })
    }

    /// Zeroes the unread count. Returns the newest server message from
    /// another participant, which is what a read receipt should name.
    pub fn mark_read(&mut self, id: ConversationId) -> ClientResult<Option<MessageId>> {
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(ClientError::UnknownConversation(id))?;
        conversation.unread_count = 0;

        let local_user = self.local_user;
        let newest = self.messages.get(&id).and_then(|messages| {
            messages
                .iter()
                .rev()
                .filter(|message| message.sender_id != local_user)
                .find_map(Message::server_id)
        });
        Ok(newest)
    }

    /// Removes a conversation for good. Later events naming it are dropped.
    pub fn delete(&mut self, id: ConversationId) -> bool {
        self.deleted.insert(id);
        self.messages.remove(&id);
        if self.active == Some(id) {
            self.active = None;
        }
        self.conversations.remove(&id).is_some()
    }

    /// Folds a newly inserted message into its conversation's preview and
    /// unread count.
    pub fn update_from_message(&mut self, message: &Message) -> Option<Conversation> {
        let is_active = self.is_active(message.conversation_id);
        let local_user = self.local_user;
        let Some(conversation) = self.conversations.get_mut(&message.conversation_id) else {
            debug!(
                conversation_id = message.conversation_id.0,
                "store: message for unknown conversation ignored"
            );
            return None;
        };

        let is_newer = conversation
            .last_message_time
            .map_or(true, |time| message.created_at >= time);
        if is_newer {
            conversation.last_message_preview = Some(message.preview());
            conversation.last_message_time = Some(message.created_at);
        }
        if message.sender_id != local_user && !is_active {
            conversation.unread_count += 1;
        }
        Some(conversation.clone())
    }

    pub fn set_online(&mut self, user_id: UserId, online: bool) -> Vec<Conversation> {
        let mut changed = Vec::new();
        for conversation in self.conversations.values_mut() {
            if conversation.is_group || !conversation.participant_ids.contains(&user_id) {
                continue;
            }
            if conversation.online_status.insert(user_id, online) != Some(online) {
                changed.push(conversation.clone());
            }
        }
        changed.sort_by_key(|conversation| conversation.id);
        changed
    }

    pub fn messages(&self, id: ConversationId) -> &[Message] {
        self.messages.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_server_message(&self, id: ConversationId, message_id: MessageId) -> bool {
        self.messages(id)
            .iter()
            .any(|message| message.server_id() == Some(message_id))
    }

    pub fn find(&self, key: MessageKey) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|messages| messages.iter())
            .find(|message| message.key == key)
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    /// Swaps a placeholder for its confirmed counterpart in the same slot.
    pub fn replace_local(
        &mut self,
        temp_id: TempMessageId,
        confirmed: Message,
    ) -> Result<(), Message> {
        let Some(messages) = self.messages.get_mut(&confirmed.conversation_id) else {
            return Err(confirmed);
        };
        match messages
            .iter_mut()
            .find(|message| message.key == MessageKey::Local(temp_id))
        {
            Some(slot) => {
                *slot = confirmed;
                Ok(())
            }
            None => Err(confirmed),
        }
    }

    /// Merges a history page, skipping messages already known, and keeps the
    /// conversation ordered by creation time.
    pub fn merge_history(&mut self, id: ConversationId, page: Vec<Message>) -> usize {
        if !self.conversations.contains_key(&id) {
            return 0;
        }
        let messages = self.messages.entry(id).or_default();
        let known: HashSet<MessageId> = messages.iter().filter_map(Message::server_id).collect();
        let before = messages.len();
        messages.extend(
            page.into_iter()
                .filter(|message| message.server_id().is_some_and(|id| !known.contains(&id))),
        );
        messages.sort_by_key(|message| message.created_at);
        messages.len() - before
    }

    pub fn oldest_server_message(&self, id: ConversationId) -> Option<MessageId> {
        self.messages(id).iter().find_map(Message::server_id)
    }

    pub fn remove_message(&mut self, message_id: MessageId) -> Option<Message> {
        for messages in self.messages.values_mut() {
            if let Some(index) = messages
                .iter()
                .position(|message| message.server_id() == Some(message_id))
            {
                return Some(messages.remove(index));
            }
        }
        None
    }

    /// Applies a delivery event to one message. Returns the new status only
    /// when it actually changed.
    pub fn apply_delivery(
        &mut self,
        key: MessageKey,
        event: DeliveryEvent,
    ) -> Option<DeliveryStatus> {
        let message = self
            .messages
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|message| message.key == key)?;
        let next = transition(message.delivery_status, event);
        if next == message.delivery_status {
            return None;
        }
        message.delivery_status = next;
        Some(next)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
