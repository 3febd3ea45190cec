//! Matches optimistic local messages to their server-confirmed versions and
//! applies inbound message events idempotently.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use shared::{
    domain::{ConversationId, MessageId, TempMessageId},
    protocol::MessagePayload,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    delivery::{DeliveryEvent, DeliveryStatus},
    store::ConversationStore,
    types::{Conversation, Message, MessageKey},
};

#[derive(Debug, Clone, Copy)]
struct PendingSend {
    temp_id: TempMessageId,
    /// Set once the `send_message` frame reached an open link.
    written_at: Option<Instant>,
    /// Already failed by the ack timeout. Stays queued so a late echo still
    /// claims it in order.
    timed_out: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// A placeholder was swapped for the confirmed message.
    Replaced {
        temp_id: TempMessageId,
        message: Message,
        conversation: Option<Conversation>,
    },
    Inserted {
        message: Message,
        conversation: Option<Conversation>,
    },
    /// Already known by server id; nothing changed.
    Duplicate(MessageId),
    /// Conversation deleted or never synced.
    Ignored(ConversationId),
}

#[derive(Debug, Default)]
pub struct MessageReconciler {
    pending: HashMap<ConversationId, VecDeque<PendingSend>>,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders a local send optimistically and remembers it for matching.
    pub fn stage_local_send(
        &mut self,
        store: &mut ConversationStore,
        conversation_id: ConversationId,
        content: String,
    ) -> Message {
        let temp_id = TempMessageId::generate();
        let message = Message::pending(temp_id, conversation_id, store.local_user(), content);
        store.push_message(message.clone());
        store.update_from_message(&message);
        self.pending
            .entry(conversation_id)
            .or_default()
            .push_back(PendingSend {
                temp_id,
                written_at: None,
                timed_out: false,
            });
        message
    }

    pub fn mark_written(&mut self, temp_id: TempMessageId, now: Instant) {
        if let Some(pending) = self
            .pending
            .values_mut()
            .flat_map(|queue| queue.iter_mut())
            .find(|pending| pending.temp_id == temp_id)
        {
            pending.written_at.get_or_insert(now);
        }
    }

    pub fn pending_count(&self, conversation_id: ConversationId) -> usize {
        self.pending.get(&conversation_id).map_or(0, VecDeque::len)
    }

    /// Applies a live `new_message` event.
    pub fn apply_confirmed(
        &mut self,
        store: &mut ConversationStore,
        payload: MessagePayload,
    ) -> Reconciled {
        let conversation_id = payload.conversation_id;
        if !store.accepts(conversation_id) {
            return Reconciled::Ignored(conversation_id);
        }
        if store.contains_server_message(conversation_id, payload.id) {
            debug!(
                conversation_id = conversation_id.0,
                message_id = payload.id.0,
                "reconciler: duplicate confirmed message dropped"
            );
            return Reconciled::Duplicate(payload.id);
        }

        if payload.sender_id == store.local_user() {
            if let Some(temp_id) = self.claim_placeholder(store, &payload) {
                let message = Message::confirmed(payload, DeliveryStatus::Sent);
                return match store.replace_local(temp_id, message.clone()) {
                    Ok(()) => {
                        let conversation = store.update_from_message(&message);
                        Reconciled::Replaced {
                            temp_id,
                            message,
                            conversation,
                        }
                    }
                    // Placeholder vanished from the store; keep the message anyway.
                    Err(message) => self.insert(store, message),
                };
            }
            let message = Message::confirmed(payload, DeliveryStatus::Sent);
            return self.insert(store, message);
        }

        let status = if store.is_active(conversation_id) {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };
        self.insert(store, Message::confirmed(payload, status))
    }

    /// Applies `scheduled_message_delivered`: always a plain insert, since
    /// scheduled sends never create placeholders.
    pub fn apply_scheduled(
        &mut self,
        store: &mut ConversationStore,
        payload: MessagePayload,
    ) -> Reconciled {
        self.insert_stored(store, payload, true)
    }

    /// Applies a message the side-channel stored and returned right away.
    pub fn apply_stored(
        &mut self,
        store: &mut ConversationStore,
        payload: MessagePayload,
    ) -> Reconciled {
        self.insert_stored(store, payload, false)
    }

    fn insert_stored(
        &mut self,
        store: &mut ConversationStore,
        payload: MessagePayload,
        scheduled: bool,
    ) -> Reconciled {
        let conversation_id = payload.conversation_id;
        if !store.accepts(conversation_id) {
            return Reconciled::Ignored(conversation_id);
        }
        if store.contains_server_message(conversation_id, payload.id) {
            return Reconciled::Duplicate(payload.id);
        }
        let status = if payload.sender_id != store.local_user() && store.is_active(conversation_id)
        {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };
        let mut message = Message::confirmed(payload, status);
        message.is_scheduled |= scheduled;
        self.insert(store, message)
    }

    /// Fails placeholders whose frame has been on the wire longer than
    /// `timeout` without an echo.
    pub fn expire_unacknowledged(
        &mut self,
        store: &mut ConversationStore,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(TempMessageId, DeliveryStatus)> {
        let mut expired = Vec::new();
        for pending in self.pending.values_mut().flat_map(|queue| queue.iter_mut()) {
            let overdue = !pending.timed_out
                && pending
                    .written_at
                    .is_some_and(|written_at| now.duration_since(written_at) >= timeout);
            if overdue {
                pending.timed_out = true;
                expired.push(pending.temp_id);
            }
        }
        fail_placeholders(store, expired, DeliveryEvent::AckTimedOut)
    }

    /// Earliest instant an acknowledgement timeout could fire.
    pub fn next_ack_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending
            .values()
            .flat_map(|queue| queue.iter())
            .filter(|pending| !pending.timed_out)
            .filter_map(|pending| pending.written_at)
            .min()
            .map(|written_at| written_at + timeout)
    }

    /// Reconnection gave up: everything still in flight fails.
    pub fn fail_all(
        &mut self,
        store: &mut ConversationStore,
    ) -> Vec<(TempMessageId, DeliveryStatus)> {
        let all: Vec<TempMessageId> = self
            .pending
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|pending| pending.temp_id))
            .collect();
        fail_placeholders(store, all, DeliveryEvent::ReconnectExhausted)
    }

    /// The server refused a live send naming this placeholder.
    pub fn reject(
        &mut self,
        store: &mut ConversationStore,
        temp_id: TempMessageId,
    ) -> Option<DeliveryStatus> {
        for queue in self.pending.values_mut() {
            queue.retain(|pending| pending.temp_id != temp_id);
        }
        self.pending.retain(|_, queue| !queue.is_empty());
        store.apply_delivery(MessageKey::Local(temp_id), DeliveryEvent::Rejected)
    }

    pub fn forget_conversation(&mut self, conversation_id: ConversationId) {
        self.pending.remove(&conversation_id);
    }

    /// Picks the placeholder a self-authored echo confirms: the one named by
    /// its correlation id if present, otherwise the oldest pending one.
    fn claim_placeholder(
        &mut self,
        store: &ConversationStore,
        payload: &MessagePayload,
    ) -> Option<TempMessageId> {
        let conversation_id = payload.conversation_id;
        if let Some(client_ref) = payload.client_ref {
            if let Some(queue) = self.pending.get_mut(&conversation_id) {
                queue.retain(|pending| pending.temp_id != client_ref);
            }
            if store.find(MessageKey::Local(client_ref)).is_some() {
                return Some(client_ref);
            }
            info!(
                conversation_id = conversation_id.0,
                "reconciler: echo references an unknown placeholder"
            );
            return None;
        }
        // Placeholders are text-only and immediate; anything else came from
        // the gateway.
        if !payload.attachments.is_empty() || payload.is_scheduled {
            return None;
        }

        let queue = self.pending.get_mut(&conversation_id)?;
        let claimed = queue.pop_front().map(|pending| pending.temp_id);
        if queue.is_empty() {
            self.pending.remove(&conversation_id);
        }
        claimed
    }

    fn insert(&mut self, store: &mut ConversationStore, message: Message) -> Reconciled {
        store.push_message(message.clone());
        let conversation = store.update_from_message(&message);
        Reconciled::Inserted {
            message,
            conversation,
        }
    }
}

fn fail_placeholders(
    store: &mut ConversationStore,
    temp_ids: Vec<TempMessageId>,
    event: DeliveryEvent,
) -> Vec<(TempMessageId, DeliveryStatus)> {
    temp_ids
        .into_iter()
        .filter_map(|temp_id| {
            store
                .apply_delivery(MessageKey::Local(temp_id), event)
                .map(|status| (temp_id, status))
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
