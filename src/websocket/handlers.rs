use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics;
use crate::middleware::auth::user_id_from_token;
use crate::state::AppState;
use crate::store::ConversationStore;
use crate::websocket::events::{ClientEvent, ServerEvent};

/// Messages replayed per `resume` request. Anything older comes through the
/// paged history endpoint instead.
const RESUME_BATCH_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params.token.clone().or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string())
    });

    // A token on the upgrade request is verified before the socket opens;
    // without one the client must authenticate in-band with its first event.
    let pre_auth = match token {
        Some(t) => match user_id_from_token(&t) {
            Ok(user_id) => Some(user_id),
            Err(_) => return axum::http::StatusCode::UNAUTHORIZED.into_response(),
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(state, pre_auth, socket))
}

/// Waits for the first in-band `auth` event. Authentication is fatal on
/// failure and bounded by the configured timeout; the connection is closed
/// either way, never retried server-side.
async fn wait_for_auth(socket: &mut WebSocket, state: &AppState) -> Result<Uuid, AppError> {
    let wait = async {
        while let Some(frame) = socket.recv().await {
            let txt = match frame {
                Ok(Message::Text(txt)) => txt,
                Ok(Message::Close(_)) | Err(_) => return Err(AppError::Unauthorized),
                _ => continue,
            };
            return match serde_json::from_str::<ClientEvent>(&txt) {
                Ok(ClientEvent::Auth { token }) => user_id_from_token(&token),
                _ => Err(AppError::Unauthorized),
            };
        }
        Err(AppError::Unauthorized)
    };
    match tokio::time::timeout(state.config.ws_auth_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Unauthorized),
    }
}

async fn handle_socket(state: AppState, pre_auth: Option<Uuid>, mut socket: WebSocket) {
    let user_id = match pre_auth {
        Some(user_id) => user_id,
        None => match wait_for_auth(&mut socket, &state).await {
            Ok(user_id) => user_id,
            Err(e) => {
                let event = ServerEvent::from_app_error(&e);
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = socket.send(Message::Text(payload)).await;
                }
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
    };

    let (connection_id, mut rx) = state.registry.register(user_id).await;
    metrics::WS_CONNECTIONS.inc();
    state.presence.on_connect(user_id, connection_id).await;
    debug!(%user_id, %connection_id, "websocket connected");

    // Freshly opened tabs catch up on unread counters immediately.
    if let Err(e) = state.unread.sync_to_devices(user_id).await {
        warn!(error = %e, %user_id, "initial unread sync failed");
    }

    let (mut sender, mut receiver) = socket.split();

    'session: loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break 'session;
                        }
                    }
                    // Queue closed: the registry shed this connection
                    // (backpressure) or the process is shutting down.
                    None => break 'session,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(txt))) => {
                        state.presence.touch(user_id).await;
                        for reply in route_event(&state, user_id, connection_id, &txt).await {
                            let payload = match serde_json::to_string(&reply) {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            if sender.send(Message::Text(payload)).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Heartbeat; pong frames are produced by the protocol
                        // layer. Only presence cares.
                        state.presence.touch(user_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break 'session,
                    _ => {}
                }
            }
        }
    }

    state.registry.deregister(user_id, connection_id).await;
    metrics::WS_CONNECTIONS.dec();
    state.presence.clone().on_disconnect(user_id, connection_id).await;
    debug!(%user_id, %connection_id, "websocket disconnected");
}

/// Routes one inbound event. Returned events go back to this connection only;
/// everything else (fan-out, receipts, counters) flows through the registry.
async fn route_event(
    state: &AppState,
    user_id: Uuid,
    connection_id: Uuid,
    raw: &str,
) -> Vec<ServerEvent> {
    let event = match serde_json::from_str::<ClientEvent>(raw) {
        Ok(event) => event,
        Err(e) => {
            return vec![ServerEvent::error(
                "invalid_event",
                format!("unrecognized event: {e}"),
            )];
        }
    };

    match event {
        // Already authenticated; a repeated auth is a no-op keepalive.
        ClientEvent::Auth { .. } => Vec::new(),

        ClientEvent::Send {
            conversation_id,
            content,
            client_nonce,
            reply_to,
        } => {
            match state
                .delivery
                .send(conversation_id, user_id, &content, &client_nonce, reply_to)
                .await
            {
                // The sender's own devices (this one included) received the
                // message through the fan-out already.
                Ok(_) => Vec::new(),
                Err(e) => vec![ServerEvent::from_app_error(&e)],
            }
        }

        ClientEvent::TypingStart { conversation_id } => {
            match state.typing.start_typing(conversation_id, user_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![ServerEvent::from_app_error(&e)],
            }
        }

        ClientEvent::TypingStop { conversation_id } => {
            match state.typing.stop_typing(conversation_id, user_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![ServerEvent::from_app_error(&e)],
            }
        }

        ClientEvent::Read {
            conversation_id,
            up_to_sequence,
        } => {
            state
                .registry
                .set_focus(user_id, connection_id, Some(conversation_id))
                .await;
            match state
                .unread
                .mark_conversation_read(conversation_id, user_id, Some(up_to_sequence))
                .await
            {
                Ok(_) => Vec::new(),
                Err(e) => vec![ServerEvent::from_app_error(&e)],
            }
        }

        ClientEvent::Resume {
            conversation_id,
            after_sequence,
        } => {
            match state.store.is_participant(conversation_id, user_id).await {
                Ok(true) => {}
                Ok(false) => return vec![ServerEvent::from_app_error(&AppError::Forbidden)],
                Err(e) => return vec![ServerEvent::from_app_error(&e)],
            }
            state
                .registry
                .set_focus(user_id, connection_id, Some(conversation_id))
                .await;
            match state
                .store
                .messages_after(conversation_id, user_id, after_sequence, RESUME_BATCH_LIMIT)
                .await
            {
                Ok(mut messages) => {
                    // Replay counts as delivery: the recipient is online now.
                    for message in &mut messages {
                        if message.delivered_to.contains(&user_id) {
                            continue;
                        }
                        match state
                            .store
                            .mark_delivered(conversation_id, message.id, user_id)
                            .await
                        {
                            Ok(()) => message.delivered_to.push(user_id),
                            Err(e) => {
                                warn!(error = %e, message_id = %message.id, "mark_delivered on resume failed");
                            }
                        }
                    }
                    messages
                        .into_iter()
                        .map(|message| ServerEvent::MessageCreated { message })
                        .collect()
                }
                Err(e) => vec![ServerEvent::from_app_error(&e)],
            }
        }
    }
}
