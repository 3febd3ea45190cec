//! Per-message delivery status as a pure transition function.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => u8::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// `message_sent`, or the server echo of a local send.
    SendConfirmed,
    /// `message_delivered`, or arrival while the conversation is active.
    Delivered,
    ReadReceipt,
    /// Server `error` naming the message.
    Rejected,
    ReconnectExhausted,
    AckTimedOut,
}

/// Computes the next status. Progress only moves forward; `Read` and
/// `Failed` never change again.
pub fn transition(current: DeliveryStatus, event: DeliveryEvent) -> DeliveryStatus {
    if current.is_terminal() {
        return current;
    }

    match event {
        DeliveryEvent::SendConfirmed => advance(current, DeliveryStatus::Sent),
        DeliveryEvent::Delivered => advance(current, DeliveryStatus::Delivered),
        DeliveryEvent::ReadReceipt => advance(current, DeliveryStatus::Read),
        DeliveryEvent::Rejected => DeliveryStatus::Failed,
        DeliveryEvent::ReconnectExhausted | DeliveryEvent::AckTimedOut => {
            if current == DeliveryStatus::Sending {
                DeliveryStatus::Failed
            } else {
                current
            }
        }
    }
}

fn advance(current: DeliveryStatus, target: DeliveryStatus) -> DeliveryStatus {
    if target.rank() > current.rank() {
        target
    } else {
        current
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
