//! Delivery engine behavior against the in-memory store: fan-out, ordering,
//! idempotent retries, unread bookkeeping and delivery receipts.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsFrame;
use messaging_service::error::AppError;
use messaging_service::services::DeliveryEngine;
use messaging_service::store::{ConversationStore, MemoryConversationStore};
use messaging_service::websocket::ConnectionRegistry;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

fn engine() -> (
    Arc<DeliveryEngine>,
    Arc<MemoryConversationStore>,
    ConnectionRegistry,
) {
    let store = Arc::new(MemoryConversationStore::new());
    let registry = ConnectionRegistry::new(256);
    let engine = Arc::new(DeliveryEngine::new(store.clone(), registry.clone(), None));
    (engine, store, registry)
}

async fn drain_events(rx: &mut Receiver<WsFrame>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(WsFrame::Text(txt))) => events.push(serde_json::from_str(&txt).unwrap()),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    events
}

fn sequences_of(events: &[serde_json::Value]) -> Vec<i64> {
    events
        .iter()
        .filter(|e| e["type"] == "message.created")
        .map(|e| e["message"]["sequence"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn send_fans_out_to_all_participants_and_marks_delivery() {
    let (engine, store, registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();

    let (_cx, mut rx_x) = registry.register(x).await;
    let (_cy1, mut rx_y1) = registry.register(y).await;
    let (_cy2, mut rx_y2) = registry.register(y).await;

    let message = engine.send(conv.id, x, "hello", "n1", None).await.unwrap();
    assert_eq!(message.sequence, 1);
    // Both participants were online at push time.
    assert!(message.delivered_to.contains(&x));
    assert!(message.delivered_to.contains(&y));

    // Every connection of every participant observes the message, the
    // sender's own devices included.
    for rx in [&mut rx_x, &mut rx_y1, &mut rx_y2] {
        let events = drain_events(rx).await;
        assert_eq!(sequences_of(&events), vec![1]);
    }
}

#[tokio::test]
async fn duplicate_nonce_is_idempotent_and_fans_out_once() {
    let (engine, store, registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();
    let (_cy, mut rx_y) = registry.register(y).await;

    let first = engine.send(conv.id, x, "hi", "n1", None).await.unwrap();
    // Timeout-triggered client retry with the same nonce.
    let second = engine.send(conv.id, x, "hi", "n1", None).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(store.latest_sequence(conv.id).await.unwrap(), 1);

    let events = drain_events(&mut rx_y).await;
    assert_eq!(sequences_of(&events), vec![1], "retry must not re-fan-out");
}

#[tokio::test]
async fn concurrent_senders_agree_on_one_order() {
    let (engine, store, registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();

    let (_cx, mut rx_x) = registry.register(x).await;
    let (_cy, mut rx_y) = registry.register(y).await;

    let a = {
        let engine = engine.clone();
        let conv = conv.id;
        tokio::spawn(async move {
            for i in 0..5 {
                engine
                    .send(conv, x, &format!("from x {i}"), &format!("x{i}"), None)
                    .await
                    .unwrap();
            }
        })
    };
    let b = {
        let engine = engine.clone();
        let conv = conv.id;
        tokio::spawn(async move {
            for i in 0..5 {
                engine
                    .send(conv, y, &format!("from y {i}"), &format!("y{i}"), None)
                    .await
                    .unwrap();
            }
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    let seen_by_x = sequences_of(&drain_events(&mut rx_x).await);
    let seen_by_y = sequences_of(&drain_events(&mut rx_y).await);

    assert_eq!(seen_by_x.len(), 10);
    assert_eq!(seen_by_x, seen_by_y, "all recipients observe the same order");
    let mut sorted = seen_by_x.clone();
    sorted.sort();
    assert_eq!(seen_by_x, sorted, "events arrive in sequence order");
    assert_eq!(sorted, (1..=10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn unread_increments_unless_recipient_is_viewing() {
    let (engine, store, registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();

    // y offline: counter goes up.
    engine.send(conv.id, x, "one", "n1", None).await.unwrap();
    let page = store.list_for_user(y, None, 10).await.unwrap();
    assert_eq!(page.conversations[0].unread_count, 1);

    // y online and focused on the conversation: counter untouched.
    let (cy, _rx_y) = registry.register(y).await;
    registry.set_focus(y, cy, Some(conv.id)).await;
    engine.send(conv.id, x, "two", "n2", None).await.unwrap();
    let page = store.list_for_user(y, None, 10).await.unwrap();
    assert_eq!(page.conversations[0].unread_count, 1);

    // Online but looking elsewhere still counts as unread.
    registry.set_focus(y, cy, Some(Uuid::new_v4())).await;
    engine.send(conv.id, x, "three", "n3", None).await.unwrap();
    let page = store.list_for_user(y, None, 10).await.unwrap();
    assert_eq!(page.conversations[0].unread_count, 2);
}

#[tokio::test]
async fn offline_recipient_is_not_marked_delivered_until_push_succeeds() {
    let (engine, store, _registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();

    let message = engine.send(conv.id, x, "hi", "n1", None).await.unwrap();
    assert!(
        !message.delivered_to.contains(&y),
        "offline participant must not be marked delivered"
    );

    let page = store.list_messages(conv.id, y, None, 50).await.unwrap();
    assert!(!page.messages[0].delivered_to.contains(&y));
}

#[tokio::test]
async fn validation_rejects_empty_content_and_outsiders() {
    let (engine, store, _registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();

    assert!(matches!(
        engine.send(conv.id, x, "   \n ", "n1", None).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        engine.send(conv.id, Uuid::new_v4(), "hi", "n1", None).await,
        Err(AppError::Forbidden)
    ));
    assert!(matches!(
        engine.send(Uuid::new_v4(), x, "hi", "n1", None).await,
        Err(AppError::NotFound)
    ));
    assert_eq!(store.latest_sequence(conv.id).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_direct_conversation_creation_converges() {
    let store = Arc::new(MemoryConversationStore::new());
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

    let (first, second) = tokio::join!(
        store.get_or_create_direct(x, y),
        store.get_or_create_direct(y, x)
    );
    assert_eq!(first.unwrap().id, second.unwrap().id);
}

#[tokio::test]
async fn reply_to_must_live_in_the_same_conversation() {
    let (engine, store, _registry) = engine();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = store.get_or_create_direct(x, y).await.unwrap();
    let other = store.get_or_create_direct(x, Uuid::new_v4()).await.unwrap();

    let original = engine.send(conv.id, x, "hi", "n1", None).await.unwrap();
    let reply = engine
        .send(conv.id, y, "re: hi", "n2", Some(original.id))
        .await
        .unwrap();
    assert_eq!(reply.reply_to, Some(original.id));

    assert!(matches!(
        engine
            .send(other.id, x, "cross-reply", "n3", Some(original.id))
            .await,
        Err(AppError::Validation(_))
    ));
}
