use shared::protocol::OutboundAction;

/// Socket-bound actions issued while the link was down, replayed in order on
/// the next open. Lives in memory only.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    actions: Vec<OutboundAction>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends without de-duplication. Heartbeats are dropped: a ping only
    /// means something on a live link.
    pub fn enqueue(&mut self, action: OutboundAction) -> bool {
        if matches!(action, OutboundAction::Ping { .. }) {
            return false;
        }
        self.actions.push(action);
        true
    }

    /// Hands over everything queued, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.actions)
    }

    /// Puts actions that could not be written back ahead of anything queued
    /// since, keeping their original order.
    pub fn restore(&mut self, mut actions: Vec<OutboundAction>) {
        actions.append(&mut self.actions);
        self.actions = actions;
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::{ConversationId, MessageId};

    use super::*;

    #[test]
    fn drains_in_original_order_then_empties() {
        let mut queue = OutboundQueue::new();
        let typing = OutboundAction::TypingStart {
            conversation_id: ConversationId(7),
        };
        let read = OutboundAction::MarkRead {
            message_id: MessageId(3),
        };
        queue.enqueue(typing.clone());
        queue.enqueue(read.clone());
        queue.enqueue(typing.clone());

        assert_eq!(queue.drain(), vec![typing.clone(), read, typing]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn restored_actions_go_back_in_front() {
        let mut queue = OutboundQueue::new();
        let first = OutboundAction::TypingStop {
            conversation_id: ConversationId(1),
        };
        let second = OutboundAction::TypingStop {
            conversation_id: ConversationId(2),
        };
        let later = OutboundAction::MarkRead {
            message_id: MessageId(9),
        };
        queue.enqueue(later.clone());
        queue.restore(vec![first.clone(), second.clone()]);

        assert_eq!(queue.drain(), vec![first, second, later]);
    }

    #[test]
    fn pings_are_never_queued() {
        let mut queue = OutboundQueue::new();
        assert!(!queue.enqueue(OutboundAction::Ping { timestamp: 1 }));
        assert_eq!(queue.len(), 0);
    }
}
