//! End-to-end WebSocket tests: real sockets against the full router, RS256
//! tokens, in-memory store.

mod common;

use common::*;
use futures_util::SinkExt;
use messaging_service::store::ConversationStore;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

async fn unread_count_eventually(ws: &mut WsClient, expected: i64) {
    for _ in 0..50 {
        let event = next_event_of(ws, "unread.updated").await;
        if event["count"] == expected {
            return;
        }
    }
    panic!("unread count never reached {expected}");
}

#[tokio::test]
async fn upgrade_is_rejected_for_bad_tokens() {
    let app = start_app().await;
    assert!(
        tokio_tungstenite::connect_async(app.ws_url("not-a-jwt"))
            .await
            .is_err(),
        "invalid token must not upgrade"
    );

    let expired = expired_token(Uuid::new_v4());
    assert!(
        tokio_tungstenite::connect_async(app.ws_url(&expired))
            .await
            .is_err(),
        "expired token must not upgrade"
    );
}

#[tokio::test]
async fn in_band_auth_opens_the_session() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_y = connect_ws(&app.ws_url(&mint_token(y))).await;

    // x connects without a token and authenticates with its first event.
    let mut ws_x = connect_ws(&app.ws_url_unauthenticated()).await;
    send_event(&mut ws_x, json!({"type": "auth", "token": mint_token(x)})).await;
    send_event(&mut ws_x, json!({"type": "typing.start", "conversation_id": conv.id})).await;

    let event = next_event_of(&mut ws_y, "typing.changed").await;
    assert_eq!(event["user_id"], x.to_string());
    assert_eq!(event["is_typing"], true);
}

#[tokio::test]
async fn typing_indicator_clears_after_ttl_without_a_stop_event() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    let mut ws_y = connect_ws(&app.ws_url(&mint_token(y))).await;

    send_event(&mut ws_x, json!({"type": "typing.start", "conversation_id": conv.id})).await;
    let started = next_event_of(&mut ws_y, "typing.changed").await;
    assert_eq!(started["is_typing"], true);

    // x drops without ever sending typing.stop.
    ws_x.close(None).await.ok();

    // The TTL sweeper must deliver the stop on x's behalf.
    let stopped = next_event_of(&mut ws_y, "typing.changed").await;
    assert_eq!(stopped["user_id"], x.to_string());
    assert_eq!(stopped["is_typing"], false);
}

#[tokio::test]
async fn messages_fan_out_to_every_device_in_sequence_order() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    let mut ws_y1 = connect_ws(&app.ws_url(&mint_token(y))).await;
    let mut ws_y2 = connect_ws(&app.ws_url(&mint_token(y))).await;

    for i in 1..=3 {
        send_event(
            &mut ws_x,
            json!({
                "type": "send",
                "conversation_id": conv.id,
                "content": format!("msg {i}"),
                "client_nonce": format!("n{i}"),
            }),
        )
        .await;
    }

    for ws in [&mut ws_x, &mut ws_y1, &mut ws_y2] {
        let mut sequences = Vec::new();
        while sequences.len() < 3 {
            let event = next_event_of(ws, "message.created").await;
            sequences.push(event["message"]["sequence"].as_i64().unwrap());
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn read_events_produce_receipts_and_sync_unread_across_tabs() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    let mut ws_y1 = connect_ws(&app.ws_url(&mint_token(y))).await;
    let mut ws_y2 = connect_ws(&app.ws_url(&mint_token(y))).await;

    send_event(
        &mut ws_x,
        json!({
            "type": "send",
            "conversation_id": conv.id,
            "content": "hello",
            "client_nonce": "n1",
        }),
    )
    .await;

    // Both of y's tabs see the counter go up. (The connect-time sync may have
    // already queued a zero-count event; wait for the value, not the frame.)
    unread_count_eventually(&mut ws_y1, 1).await;
    unread_count_eventually(&mut ws_y2, 1).await;

    // Tab 1 reads; tab 2 must agree, and x gets the watermark receipt.
    send_event(
        &mut ws_y1,
        json!({"type": "read", "conversation_id": conv.id, "up_to_sequence": 1}),
    )
    .await;

    unread_count_eventually(&mut ws_y2, 0).await;

    let receipt = next_event_of(&mut ws_x, "read.receipt").await;
    assert_eq!(receipt["user_id"], y.to_string());
    assert_eq!(receipt["up_to_sequence"], 1);
}

#[tokio::test]
async fn resume_replays_messages_past_the_cursor() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    // x sends while y has no connection at all.
    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    for i in 1..=4 {
        send_event(
            &mut ws_x,
            json!({
                "type": "send",
                "conversation_id": conv.id,
                "content": format!("offline msg {i}"),
                "client_nonce": format!("n{i}"),
            }),
        )
        .await;
        next_event_of(&mut ws_x, "message.created").await;
    }

    // y reconnects having last seen sequence 1.
    let mut ws_y = connect_ws(&app.ws_url(&mint_token(y))).await;
    send_event(
        &mut ws_y,
        json!({"type": "resume", "conversation_id": conv.id, "after_sequence": 1}),
    )
    .await;

    let mut sequences = Vec::new();
    while sequences.len() < 3 {
        let event = next_event_of(&mut ws_y, "message.created").await;
        sequences.push(event["message"]["sequence"].as_i64().unwrap());
    }
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[tokio::test]
async fn presence_transitions_reach_conversation_contacts() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_y = connect_ws(&app.ws_url(&mint_token(y))).await;

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    let online = next_event_of(&mut ws_y, "presence.changed").await;
    assert_eq!(online["user_id"], x.to_string());
    assert_eq!(online["status"], "online");

    // Ungraceful drop: offline only after the grace period, which the test
    // config keeps short.
    ws_x.close(None).await.ok();
    let offline = next_event_of(&mut ws_y, "presence.changed").await;
    assert_eq!(offline["user_id"], x.to_string());
    assert_eq!(offline["status"], "offline");
}

#[tokio::test]
async fn malformed_events_get_an_error_without_losing_the_connection() {
    let app = start_app().await;
    let x = Uuid::new_v4();
    let y = Uuid::new_v4();
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    ws_x.send(WsMessage::Text("{\"type\":\"nonsense\"}".into()))
        .await
        .unwrap();

    let error = next_event_of(&mut ws_x, "error").await;
    assert_eq!(error["code"], "invalid_event");

    // The connection survives and keeps working.
    send_event(
        &mut ws_x,
        json!({
            "type": "send",
            "conversation_id": conv.id,
            "content": "still alive",
            "client_nonce": "n1",
        }),
    )
    .await;
    let created = next_event_of(&mut ws_x, "message.created").await;
    assert_eq!(created["message"]["content"], "still alive");
}

#[tokio::test]
async fn send_errors_go_only_to_the_offending_connection() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = app.state.store.get_or_create_direct(x, y).await.unwrap();

    let mut ws_x = connect_ws(&app.ws_url(&mint_token(x))).await;
    send_event(
        &mut ws_x,
        json!({
            "type": "send",
            "conversation_id": conv.id,
            "content": "   ",
            "client_nonce": "n1",
        }),
    )
    .await;
    let error = next_event_of(&mut ws_x, "error").await;
    assert_eq!(error["code"], "validation_error");

    // An outsider cannot send into a conversation at all.
    let outsider = Uuid::new_v4();
    let mut ws_o = connect_ws(&app.ws_url(&mint_token(outsider))).await;
    send_event(
        &mut ws_o,
        json!({
            "type": "send",
            "conversation_id": conv.id,
            "content": "let me in",
            "client_nonce": "n2",
        }),
    )
    .await;
    let error = next_event_of(&mut ws_o, "error").await;
    assert_eq!(error["code"], "forbidden");

    tokio::time::sleep(Duration::from_millis(50)).await;
}
