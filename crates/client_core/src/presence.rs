//! Typing presence: the local debounce state machine and the remote typing
//! indicators with TTL expiry.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::OutboundAction,
};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTyping {
    Idle,
    Typing,
}

#[derive(Debug)]
pub struct PresenceTracker {
    debounce: Duration,
    ttl: Duration,
    /// Conversations the local user is typing in, with the instant the
    /// debounce elapses.
    local: HashMap<ConversationId, Instant>,
    remote: HashMap<(ConversationId, UserId), Instant>,
}

impl PresenceTracker {
    pub fn new(debounce: Duration, ttl: Duration) -> Self {
        Self {
            debounce,
            ttl,
            local: HashMap::new(),
            remote: HashMap::new(),
        }
    }

    pub fn local_state(&self, conversation_id: ConversationId) -> LocalTyping {
        if self.local.contains_key(&conversation_id) {
            LocalTyping::Typing
        } else {
            LocalTyping::Idle
        }
    }

    /// Registers a keystroke. Only the idle → typing edge emits an action;
    /// further keystrokes just push the debounce deadline out.
    pub fn keystroke(
        &mut self,
        conversation_id: ConversationId,
        now: Instant,
    ) -> Option<OutboundAction> {
        let deadline = now + self.debounce;
        match self.local.insert(conversation_id, deadline) {
            Some(_) => None,
            None => Some(OutboundAction::TypingStart { conversation_id }),
        }
    }

    /// Ends local typing right away, e.g. because the message was sent.
    pub fn stop_local(&mut self, conversation_id: ConversationId) -> Option<OutboundAction> {
        self.local
            .remove(&conversation_id)
            .map(|_| OutboundAction::TypingStop { conversation_id })
    }

    /// Returns `typing_stop` for every conversation whose debounce elapsed.
    pub fn poll_local(&mut self, now: Instant) -> Vec<OutboundAction> {
        let mut elapsed: Vec<ConversationId> = self
            .local
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(conversation_id, _)| *conversation_id)
            .collect();
        elapsed.sort();
        elapsed
            .into_iter()
            .filter_map(|conversation_id| self.stop_local(conversation_id))
            .collect()
    }

    /// Records a remote start-typing event. Returns true when the set of
    /// typing users changed.
    pub fn remote_started(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        now: Instant,
    ) -> bool {
        self.remote
            .insert((conversation_id, user_id), now + self.ttl)
            .is_none()
    }

    pub fn remote_stopped(&mut self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.remote.remove(&(conversation_id, user_id)).is_some()
    }

    /// Drops remote indicators past their TTL and returns the conversations
    /// whose typing set changed.
    pub fn expire_remote(&mut self, now: Instant) -> BTreeSet<ConversationId> {
        let mut changed = BTreeSet::new();
        self.remote.retain(|(conversation_id, _), expires_at| {
            let keep = *expires_at > now;
            if !keep {
                changed.insert(*conversation_id);
            }
            keep
        });
        changed
    }

    pub fn clear_remote(&mut self, conversation_id: ConversationId) -> bool {
        let before = self.remote.len();
        self.remote.retain(|(id, _), _| *id != conversation_id);
        before != self.remote.len()
    }

    pub fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .remote
            .keys()
            .filter(|(id, _)| *id == conversation_id)
            .map(|(_, user_id)| *user_id)
            .collect();
        users.sort();
        users
    }

    /// Earliest instant at which a debounce or TTL timer needs servicing.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.local
            .values()
            .chain(self.remote.values())
            .min()
            .copied()
    }

    pub fn reset(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
