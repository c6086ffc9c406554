//! Collaborator-facing HTTP surface: auth, conversation management, history
//! paging, unread counters and soft deletion.

mod common;

use common::*;
use serde_json::json;
use uuid::Uuid;

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_direct(app: &TestApp, me: Uuid, other: Uuid) -> serde_json::Value {
    client()
        .post(format!("{}/api/v1/conversations/direct", app.base_url))
        .bearer_auth(mint_token(me))
        .json(&json!({"other_user_id": other}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn send_message(
    app: &TestApp,
    me: Uuid,
    conversation_id: &str,
    content: &str,
    nonce: &str,
) -> serde_json::Value {
    client()
        .post(format!(
            "{}/api/v1/conversations/{conversation_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(me))
        .json(&json!({"content": content, "client_nonce": nonce}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn introspection_is_open_but_the_api_requires_a_token() {
    let app = start_app().await;

    let health = client()
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let metrics = client()
        .get(format!("{}/metrics", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);

    let unauthorized = client()
        .get(format!("{}/api/v1/conversations", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);
    let body: serde_json::Value = unauthorized.json().await.unwrap();
    assert_eq!(body["error_type"], "authentication_error");

    let expired = client()
        .get(format!("{}/api/v1/conversations", app.base_url))
        .bearer_auth(expired_token(Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(expired.status(), 401);
}

#[tokio::test]
async fn direct_conversation_creation_is_idempotent_over_http() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

    let first = create_direct(&app, x, y).await;
    let second = create_direct(&app, y, x).await;
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["kind"], "direct");

    let with_self = client()
        .post(format!("{}/api/v1/conversations/direct", app.base_url))
        .bearer_auth(mint_token(x))
        .json(&json!({"other_user_id": x}))
        .send()
        .await
        .unwrap();
    assert_eq!(with_self.status(), 400);
}

#[tokio::test]
async fn group_creation_includes_the_creator() {
    let app = start_app().await;
    let creator = Uuid::new_v4();
    let others = [Uuid::new_v4(), Uuid::new_v4()];

    let resp = client()
        .post(format!("{}/api/v1/conversations/groups", app.base_url))
        .bearer_auth(mint_token(creator))
        .json(&json!({"title": "hiring sync", "participant_ids": others}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "group");
    let participants = body["participant_ids"].as_array().unwrap();
    assert_eq!(participants.len(), 3);
    assert!(participants.contains(&json!(creator.to_string())));

    let empty = client()
        .post(format!("{}/api/v1/conversations/groups", app.base_url))
        .bearer_auth(mint_token(creator))
        .json(&json!({"participant_ids": [creator]}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);
}

#[tokio::test]
async fn history_pages_newest_first_with_a_sequence_cursor() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = create_direct(&app, x, y).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();

    for i in 1..=5 {
        send_message(&app, x, &conv_id, &format!("msg {i}"), &format!("n{i}")).await;
    }

    let page: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages?page_size=2",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sequence"], 5);
    assert_eq!(messages[1]["sequence"], 4);
    assert_eq!(page["has_more"], true);

    let rest: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages?page_size=50&before_sequence=4",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = rest["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(rest["has_more"], false);

    // An outsider gets nothing.
    let outsider = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(outsider.status(), 403);
}

#[tokio::test]
async fn http_send_retries_with_the_same_nonce_return_one_message() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = create_direct(&app, x, y).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let first = send_message(&app, x, &conv_id, "hi", "n1").await;
    let retry = send_message(&app, x, &conv_id, "hi", "n1").await;
    assert_eq!(first["id"], retry["id"]);

    let page: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(x))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unread_counts_follow_sends_reads_and_deletions() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = create_direct(&app, x, y).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let m1 = send_message(&app, x, &conv_id, "one", "n1").await;
    send_message(&app, x, &conv_id, "two", "n2").await;

    // Offline recipient accumulated two unread, visible in the listing.
    let list: serde_json::Value = client()
        .get(format!("{}/api/v1/conversations", app.base_url))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["conversations"][0]["unread_count"], 2);
    // The sender's own counter stays at zero.
    let list_x: serde_json::Value = client()
        .get(format!("{}/api/v1/conversations", app.base_url))
        .bearer_auth(mint_token(x))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list_x["conversations"][0]["unread_count"], 0);

    // Deleting an unread message removes it from the count.
    let m1_id = m1["id"].as_str().unwrap();
    let deleted = client()
        .delete(format!(
            "{}/api/v1/conversations/{conv_id}/messages/{m1_id}",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    // Mark everything read: the watermark covers the remaining message.
    let read: serde_json::Value = client()
        .post(format!(
            "{}/api/v1/conversations/{conv_id}/read",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["unread_count"], 0);

    // x sees y in read_by of the surviving message; the deleted one is gone
    // from y's view but not from x's.
    let for_x: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(x))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = for_x["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[0]["read_by"]
        .as_array()
        .unwrap()
        .contains(&json!(y.to_string())));

    let for_y: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(for_y["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn delivered_to_stays_empty_for_recipients_who_were_never_pushed() {
    let app = start_app().await;
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = create_direct(&app, x, y).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();

    send_message(&app, x, &conv_id, "hi", "n1").await;

    let page: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/conversations/{conv_id}/messages",
            app.base_url
        ))
        .bearer_auth(mint_token(y))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let delivered = page["messages"][0]["delivered_to"].as_array().unwrap();
    assert!(
        !delivered.contains(&json!(y.to_string())),
        "no live connection, no delivery receipt"
    );
}

#[tokio::test]
async fn conversation_listing_orders_by_latest_activity() {
    let app = start_app().await;
    let me = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let conv_a = create_direct(&app, me, a).await;
    let conv_b = create_direct(&app, me, b).await;
    let conv_a_id = conv_a["id"].as_str().unwrap().to_string();
    let conv_b_id = conv_b["id"].as_str().unwrap().to_string();

    send_message(&app, me, &conv_b_id, "newer thread", "n1").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    send_message(&app, me, &conv_a_id, "newest thread", "n2").await;

    let list: serde_json::Value = client()
        .get(format!("{}/api/v1/conversations", app.base_url))
        .bearer_auth(mint_token(me))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conversations = list["conversations"].as_array().unwrap();
    assert_eq!(conversations[0]["id"], conv_a["id"]);
    assert_eq!(conversations[1]["id"], conv_b["id"]);
}
