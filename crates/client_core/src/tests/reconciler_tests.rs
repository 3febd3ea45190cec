use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use shared::domain::UserId;

use super::*;

const ME: UserId = UserId(1);
const ALICE: UserId = UserId(2);

fn conversation(id: i64) -> Conversation {
    Conversation {
        id: ConversationId(id),
        is_group: false,
        display_name: format!("conversation {id}"),
        participant_ids: BTreeSet::from([ME, ALICE]),
        last_message_preview: None,
        last_message_time: None,
        unread_count: 0,
        online_status: Default::default(),
    }
}

fn store_with(ids: &[i64]) -> ConversationStore {
    let mut store = ConversationStore::new(ME);
    store
        .load(ids.iter().copied().map(conversation).collect())
        .expect("load");
    store
}

fn payload(id: i64, conversation_id: i64, sender: UserId, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: sender,
        content: content.to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, id as u32 % 60).unwrap(),
        attachments: Vec::new(),
        is_scheduled: false,
        client_ref: None,
    }
}

#[test]
fn echo_of_local_send_replaces_placeholder_in_place() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();

    let placeholder = reconciler.stage_local_send(&mut store, ConversationId(7), "hello".into());
    assert_eq!(placeholder.delivery_status, DeliveryStatus::Sending);
    assert!(matches!(placeholder.key, MessageKey::Local(_)));
    assert_eq!(store.messages(ConversationId(7)).len(), 1);

    let outcome = reconciler.apply_confirmed(&mut store, payload(42, 7, ME, "hello"));
    assert!(matches!(outcome, Reconciled::Replaced { .. }));

    let messages = store.messages(ConversationId(7));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Server(MessageId(42)));
    assert_eq!(messages[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(reconciler.pending_count(ConversationId(7)), 0);
}

#[test]
fn confirmations_claim_placeholders_in_fifo_order() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();

    let a = reconciler.stage_local_send(&mut store, ConversationId(7), "A".into());
    let b = reconciler.stage_local_send(&mut store, ConversationId(7), "B".into());

    let first = reconciler.apply_confirmed(&mut store, payload(100, 7, ME, "A"));
    let Reconciled::Replaced { temp_id, .. } = first else {
        panic!("expected replacement, got {first:?}");
    };
    assert_eq!(MessageKey::Local(temp_id), a.key);
    assert!(store.find(b.key).is_some());

    let second = reconciler.apply_confirmed(&mut store, payload(101, 7, ME, "B"));
    let Reconciled::Replaced { temp_id, .. } = second else {
        panic!("expected replacement, got {second:?}");
    };
    assert_eq!(MessageKey::Local(temp_id), b.key);

    let ids: Vec<_> = store
        .messages(ConversationId(7))
        .iter()
        .map(|message| message.key)
        .collect();
    assert_eq!(
        ids,
        vec![
            MessageKey::Server(MessageId(100)),
            MessageKey::Server(MessageId(101))
        ]
    );
}

#[test]
fn correlation_id_beats_arrival_order() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();

    let a = reconciler.stage_local_send(&mut store, ConversationId(7), "A".into());
    let b = reconciler.stage_local_send(&mut store, ConversationId(7), "B".into());
    let MessageKey::Local(b_ref) = b.key else {
        panic!("placeholder must be local");
    };

    let mut echo_b = payload(201, 7, ME, "B");
    echo_b.client_ref = Some(b_ref);
    reconciler.apply_confirmed(&mut store, echo_b);

    assert!(store.find(a.key).is_some(), "A must still be pending");
    assert!(store.find(b.key).is_none());
    assert_eq!(reconciler.pending_count(ConversationId(7)), 1);

    // A's echo without a correlation id still finds A through FIFO.
    let outcome = reconciler.apply_confirmed(&mut store, payload(202, 7, ME, "A"));
    assert!(matches!(outcome, Reconciled::Replaced { temp_id, .. } if MessageKey::Local(temp_id) == a.key));
}

#[test]
fn applying_same_event_twice_is_a_no_op() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();

    let event = payload(5, 7, ALICE, "shift swap?");
    reconciler.apply_confirmed(&mut store, event.clone());
    let after_once: Vec<Message> = store.messages(ConversationId(7)).to_vec();
    let unread_once = store.conversation(ConversationId(7)).unwrap().unread_count;

    let outcome = reconciler.apply_confirmed(&mut store, event);
    assert_eq!(outcome, Reconciled::Duplicate(MessageId(5)));
    assert_eq!(store.messages(ConversationId(7)), after_once.as_slice());
    assert_eq!(
        store.conversation(ConversationId(7)).unwrap().unread_count,
        unread_once
    );
}

#[test]
fn remote_message_in_active_conversation_counts_as_delivered() {
    let mut store = store_with(&[7, 8]);
    store.select(ConversationId(7)).expect("select");
    let mut reconciler = MessageReconciler::new();

    reconciler.apply_confirmed(&mut store, payload(1, 7, ALICE, "in view"));
    reconciler.apply_confirmed(&mut store, payload(2, 8, ALICE, "elsewhere"));

    assert_eq!(
        store.messages(ConversationId(7))[0].delivery_status,
        DeliveryStatus::Delivered
    );
    assert_eq!(store.conversation(ConversationId(7)).unwrap().unread_count, 0);
    assert_eq!(
        store.messages(ConversationId(8))[0].delivery_status,
        DeliveryStatus::Sent
    );
    assert_eq!(store.conversation(ConversationId(8)).unwrap().unread_count, 1);
}

#[test]
fn unread_grows_by_exactly_the_remote_messages() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();

    for id in 0..5 {
        reconciler.apply_confirmed(&mut store, payload(id, 7, ALICE, "ping"));
    }
    reconciler.stage_local_send(&mut store, ConversationId(7), "mine".into());
    reconciler.apply_confirmed(&mut store, payload(50, 7, ME, "mine"));
    reconciler.apply_confirmed(&mut store, payload(51, 7, ME, "from another tab"));

    assert_eq!(store.conversation(ConversationId(7)).unwrap().unread_count, 5);
}

#[test]
fn scheduled_delivery_is_a_pure_insert() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let placeholder = reconciler.stage_local_send(&mut store, ConversationId(7), "live".into());

    let outcome = reconciler.apply_scheduled(&mut store, payload(300, 7, ME, "scheduled"));
    assert!(matches!(outcome, Reconciled::Inserted { ref message, .. } if message.is_scheduled));
    assert!(store.find(placeholder.key).is_some(), "placeholder untouched");
    assert_eq!(reconciler.pending_count(ConversationId(7)), 1);
    assert_eq!(store.messages(ConversationId(7)).len(), 2);

    let again = reconciler.apply_scheduled(&mut store, payload(300, 7, ME, "scheduled"));
    assert_eq!(again, Reconciled::Duplicate(MessageId(300)));
}

#[test]
fn events_for_deleted_conversations_are_ignored() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    store.delete(ConversationId(7));

    assert_eq!(
        reconciler.apply_confirmed(&mut store, payload(1, 7, ALICE, "late")),
        Reconciled::Ignored(ConversationId(7))
    );
    assert_eq!(
        reconciler.apply_scheduled(&mut store, payload(2, 7, ALICE, "late")),
        Reconciled::Ignored(ConversationId(7))
    );
    assert!(store.messages(ConversationId(7)).is_empty());
}

#[test]
fn only_written_placeholders_time_out() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let timeout = Duration::from_secs(30);
    let start = Instant::now();

    let written = reconciler.stage_local_send(&mut store, ConversationId(7), "on the wire".into());
    let queued = reconciler.stage_local_send(&mut store, ConversationId(7), "still queued".into());
    let MessageKey::Local(written_id) = written.key else {
        panic!("placeholder must be local");
    };
    reconciler.mark_written(written_id, start);

    assert_eq!(reconciler.next_ack_deadline(timeout), Some(start + timeout));
    assert!(reconciler
        .expire_unacknowledged(&mut store, start + Duration::from_secs(29), timeout)
        .is_empty());

    let failed = reconciler.expire_unacknowledged(&mut store, start + timeout, timeout);
    assert_eq!(failed, vec![(written_id, DeliveryStatus::Failed)]);
    assert_eq!(
        store.find(queued.key).unwrap().delivery_status,
        DeliveryStatus::Sending
    );
    // Failed once; it stays claimable but never fails again.
    assert_eq!(reconciler.pending_count(ConversationId(7)), 2);
    assert_eq!(reconciler.next_ack_deadline(timeout), None);
    assert!(reconciler
        .expire_unacknowledged(&mut store, start + timeout * 3, timeout)
        .is_empty());
}

#[test]
fn late_echo_after_timeout_replaces_the_failed_placeholder() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let timeout = Duration::from_secs(30);
    let start = Instant::now();

    let a = reconciler.stage_local_send(&mut store, ConversationId(7), "A".into());
    let MessageKey::Local(a_id) = a.key else {
        panic!("placeholder must be local");
    };
    reconciler.mark_written(a_id, start);
    let failed = reconciler.expire_unacknowledged(&mut store, start + timeout, timeout);
    assert_eq!(failed, vec![(a_id, DeliveryStatus::Failed)]);

    let b = reconciler.stage_local_send(&mut store, ConversationId(7), "B".into());

    let late = reconciler.apply_confirmed(&mut store, payload(100, 7, ME, "A"));
    assert!(matches!(late, Reconciled::Replaced { temp_id, .. } if temp_id == a_id));
    let next = reconciler.apply_confirmed(&mut store, payload(101, 7, ME, "B"));
    assert!(matches!(next, Reconciled::Replaced { temp_id, .. } if MessageKey::Local(temp_id) == b.key));

    let view: Vec<(MessageKey, &str, DeliveryStatus)> = store
        .messages(ConversationId(7))
        .iter()
        .map(|message| (message.key, message.content.as_str(), message.delivery_status))
        .collect();
    assert_eq!(
        view,
        vec![
            (MessageKey::Server(MessageId(100)), "A", DeliveryStatus::Sent),
            (MessageKey::Server(MessageId(101)), "B", DeliveryStatus::Sent),
        ]
    );
}

#[test]
fn rejected_send_fails_and_leaves_the_queue() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let refused = reconciler.stage_local_send(&mut store, ConversationId(7), "nope".into());
    let kept = reconciler.stage_local_send(&mut store, ConversationId(7), "fine".into());
    let MessageKey::Local(refused_id) = refused.key else {
        panic!("placeholder must be local");
    };

    assert_eq!(
        reconciler.reject(&mut store, refused_id),
        Some(DeliveryStatus::Failed)
    );
    assert_eq!(reconciler.pending_count(ConversationId(7)), 1);

    // The next echo without a correlation id belongs to the surviving send.
    let outcome = reconciler.apply_confirmed(&mut store, payload(9, 7, ME, "fine"));
    assert!(matches!(outcome, Reconciled::Replaced { temp_id, .. } if MessageKey::Local(temp_id) == kept.key));
    assert_eq!(
        store.find(refused.key).unwrap().delivery_status,
        DeliveryStatus::Failed
    );
}

#[test]
fn scheduled_echo_does_not_claim_a_live_placeholder() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let placeholder = reconciler.stage_local_send(&mut store, ConversationId(7), "live".into());

    let mut deferred = payload(500, 7, ME, "later today");
    deferred.is_scheduled = true;
    let outcome = reconciler.apply_confirmed(&mut store, deferred);

    assert!(matches!(outcome, Reconciled::Inserted { ref message, .. } if message.is_scheduled));
    assert_eq!(
        store.find(placeholder.key).unwrap().delivery_status,
        DeliveryStatus::Sending
    );
    assert_eq!(reconciler.pending_count(ConversationId(7)), 1);
}

#[test]
fn reconnect_exhaustion_fails_every_pending_send() {
    let mut store = store_with(&[7, 8]);
    let mut reconciler = MessageReconciler::new();
    reconciler.stage_local_send(&mut store, ConversationId(7), "a".into());
    reconciler.stage_local_send(&mut store, ConversationId(8), "b".into());

    let failed = reconciler.fail_all(&mut store);
    assert_eq!(failed.len(), 2);
    assert!(failed
        .iter()
        .all(|(_, status)| *status == DeliveryStatus::Failed));
    assert_eq!(reconciler.pending_count(ConversationId(7)), 0);
}

#[test]
fn gateway_echo_with_files_leaves_text_placeholders_alone() {
    let mut store = store_with(&[7]);
    let mut reconciler = MessageReconciler::new();
    let placeholder = reconciler.stage_local_send(&mut store, ConversationId(7), "typed".into());

    let mut with_file = payload(400, 7, ME, "");
    with_file.attachments.push(shared::protocol::AttachmentPayload {
        filename: "a1b2.pdf".to_string(),
        original_name: "rota.pdf".to_string(),
        mime_type: "application/pdf".to_string(),
        size_bytes: 8,
        uploaded_by: ME,
    });
    let stored = reconciler.apply_stored(&mut store, with_file.clone());
    assert!(matches!(stored, Reconciled::Inserted { ref message, .. } if !message.is_scheduled));

    // The live echo of the same message is a duplicate, not a confirmation.
    assert_eq!(
        reconciler.apply_confirmed(&mut store, with_file),
        Reconciled::Duplicate(MessageId(400))
    );
    assert!(store.find(placeholder.key).is_some());
    assert_eq!(reconciler.pending_count(ConversationId(7)), 1);
}
