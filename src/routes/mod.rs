use crate::state::AppState;
use axum::middleware;
use axum::{
    routing::{delete, get, post},
    Json, Router,
};

pub mod conversations;
use conversations::{
    create_direct_conversation, create_group_conversation, list_conversations, mark_as_read,
};
pub mod messages;
use messages::{delete_message, list_messages, send_message};

use crate::websocket::handlers::ws_handler;

// OpenAPI endpoint handler
async fn openapi_json() -> Json<serde_json::Value> {
    use utoipa::OpenApi;
    Json(serde_json::to_value(crate::openapi::ApiDoc::openapi()).unwrap_or_default())
}

pub fn build_router() -> Router<AppState> {
    // Service introspection endpoints (no API version prefix, no auth; these
    // stay reachable for healthchecks and scrapes)
    let introspection = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/openapi.json", get(openapi_json));

    let rest_v1 = Router::new()
        .route("/conversations/direct", post(create_direct_conversation))
        .route("/conversations/groups", post(create_group_conversation))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:id/messages", post(send_message))
        .route("/conversations/:id/messages", get(list_messages))
        .route(
            "/conversations/:id/messages/:message_id",
            delete(delete_message),
        )
        .route("/conversations/:id/read", post(mark_as_read))
        .layer(middleware::from_fn(
            crate::middleware::auth::auth_middleware,
        ));

    // The WebSocket endpoint authenticates in the handler (query token,
    // header, or in-band auth event) because upgrade requests cannot always
    // carry an Authorization header.
    let api_v1 = rest_v1
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(crate::metrics::track_http_metrics));

    let router = introspection.merge(axum::Router::new().nest("/api/v1", api_v1));

    crate::middleware::with_defaults(router)
}
