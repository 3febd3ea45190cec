use shared::domain::{ConversationId, MessageId};

use super::*;
use crate::transport::memory;

fn manager(connector: memory::MemoryConnector) -> ConnectionManager {
    ConnectionManager::new(Arc::new(connector), &EngineConfig::default())
}

fn typing(id: i64) -> OutboundAction {
    OutboundAction::TypingStart {
        conversation_id: ConversationId(id),
    }
}

#[tokio::test]
async fn actions_queue_while_closed_and_replay_in_order() {
    let (connector, mut router) = memory::pair();
    let mut connection = manager(connector);

    assert_eq!(
        connection.send_or_queue(typing(1)).await.expect("queue"),
        Sent::Queued
    );
    connection
        .send_or_queue(OutboundAction::MarkRead {
            message_id: MessageId(4),
        })
        .await
        .expect("queue");
    assert_eq!(
        connection
            .send_or_queue(OutboundAction::Ping { timestamp: 1 })
            .await
            .expect("ping"),
        Sent::Dropped
    );
    assert_eq!(connection.queued(), 2);

    connection.open().await.expect("open");
    assert_eq!(connection.status(), ConnectionStatus::Open);
    let flush = connection.flush_queue().await;
    assert!(flush.error.is_none());
    assert_eq!(flush.written.len(), 2);
    assert_eq!(connection.queued(), 0);

    let mut peer = router.accept().await.expect("peer");
    assert_eq!(peer.recv().await, Some(typing(1)));
    assert_eq!(
        peer.recv().await,
        Some(OutboundAction::MarkRead {
            message_id: MessageId(4)
        })
    );

    assert_eq!(
        connection.send_or_queue(typing(2)).await.expect("write"),
        Sent::Written
    );
    assert_eq!(peer.recv().await, Some(typing(2)));
}

#[tokio::test]
async fn failed_handshake_leaves_link_closed() {
    let (connector, router) = memory::pair();
    router.set_refusing(true);
    let mut connection = manager(connector);

    assert!(connection.open().await.is_err());
    assert_eq!(connection.status(), ConnectionStatus::Closed);
    assert_eq!(router.connect_attempts().len(), 1);
}

#[tokio::test]
async fn reconnect_budget_runs_out_and_discards_queue() {
    let (connector, _router) = memory::pair();
    let mut connection = manager(connector);
    connection.send_or_queue(typing(1)).await.expect("queue");

    let now = Instant::now();
    let delays: Vec<Duration> = (0..5)
        .map(|_| match connection.schedule_reconnect(now) {
            Reconnect::Scheduled { delay, .. } => delay,
            other => panic!("expected a scheduled retry, got {other:?}"),
        })
        .collect();
    assert_eq!(
        delays,
        [1, 2, 4, 8, 16]
            .map(Duration::from_secs)
            .to_vec()
    );

    assert_eq!(
        connection.schedule_reconnect(now),
        Reconnect::Exhausted { attempts: 5 }
    );
    assert_eq!(connection.status(), ConnectionStatus::Lost);
    assert_eq!(connection.queued(), 0);
    assert_eq!(
        connection.send_or_queue(typing(2)).await.expect("dropped"),
        Sent::Dropped
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_fires_at_its_deadline() {
    let (connector, _router) = memory::pair();
    let mut connection = manager(connector);
    let start = Instant::now();
    connection.schedule_reconnect(start);

    let event = connection.next_event().await;
    assert!(matches!(event, LinkEvent::ReconnectDue));
    assert_eq!(Instant::now() - start, Duration::from_secs(1));
    assert!(!connection.reconnect_pending());
}

#[tokio::test(start_paused = true)]
async fn open_link_surfaces_frames_heartbeats_and_close() {
    let (connector, mut router) = memory::pair();
    let mut connection = manager(connector);
    connection.open().await.expect("open");
    let peer = router.accept().await.expect("peer");

    peer.push_raw(r#"{"type":"pong","data":null}"#).expect("push");
    assert!(matches!(connection.next_event().await, LinkEvent::Frame(text) if text.contains("pong")));

    let opened = Instant::now();
    assert!(matches!(
        connection.next_event().await,
        LinkEvent::HeartbeatDue
    ));
    assert_eq!(Instant::now() - opened, Duration::from_secs(25));

    drop(peer);
    assert!(matches!(
        connection.next_event().await,
        LinkEvent::Closed(None)
    ));
    connection.drop_link();
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn successful_open_resets_attempts() {
    let (connector, mut router) = memory::pair();
    let mut connection = manager(connector);
    connection.schedule_reconnect(Instant::now());
    connection.schedule_reconnect(Instant::now());
    assert_eq!(connection.reconnect_attempts(), 2);

    connection.open().await.expect("open");
    assert_eq!(connection.reconnect_attempts(), 0);
    assert!(router.accept().await.is_some());

    connection.close().await;
    assert_eq!(connection.status(), ConnectionStatus::Closed);
    assert!(!connection.reconnect_pending());
}
