//! WebSocket upgrade and routing of inbound room envelopes.

use crate::api::{with_conn, ApiError};
use crate::chat::{self, Actor, MessageDraft};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::middleware::{bearer_token, resolve_identity};
use crate::session::{InboundHandler, Session, SessionSettings};
use crate::AppState;
use axum::{
    extract::{ConnectInfo, Extension, Path, Query, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use roomcast_rooms::is_member;
use roomcast_types::MessageKind;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};

/// Query parameters for the WebSocket connection.
///
/// Browsers cannot set headers on an upgrade request, so the token may come
/// from the query string. A bearer header wins when both are present.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// Routes a session's envelopes to the shared room operations.
pub struct RoomEvents {
    state: Arc<AppState>,
}

impl RoomEvents {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

impl InboundHandler for RoomEvents {
    async fn handle(&self, envelope: Envelope) -> Result<(), ApiError> {
        let state = self.state.as_ref();
        let room_id = envelope.room_id;
        let actor = Actor {
            user_id: envelope.sender_id,
            display_name: envelope.sender_display_name,
        };

        match envelope.kind {
            EnvelopeKind::Message => {
                let kind = if envelope.attachment_url.is_some() {
                    MessageKind::File
                } else {
                    MessageKind::Text
                };
                let draft = MessageDraft {
                    body: envelope.body.unwrap_or_default(),
                    kind,
                    attachment_url: envelope.attachment_url,
                    attachment_name: envelope.attachment_name,
                    reply_to_id: envelope.reply_to_id,
                };
                chat::send_message(state, &actor, room_id, draft).await?;
            }
            EnvelopeKind::Edit => {
                let message_id = required(envelope.message_id, "message_id")?;
                let body = required(envelope.body, "body")?;
                chat::edit(state, &actor, room_id, message_id, body).await?;
            }
            EnvelopeKind::Delete => {
                let message_id = required(envelope.message_id, "message_id")?;
                chat::delete(state, &actor, room_id, message_id).await?;
            }
            EnvelopeKind::Read => {
                chat::mark_read(state, &actor, room_id).await?;
            }
            EnvelopeKind::ReactionAdd => {
                let message_id = required(envelope.message_id, "message_id")?;
                let emoji = required(envelope.emoji, "emoji")?;
                chat::add_reaction(state, &actor, room_id, message_id, emoji).await?;
            }
            EnvelopeKind::ReactionRemove => {
                let message_id = required(envelope.message_id, "message_id")?;
                let emoji = required(envelope.emoji, "emoji")?;
                chat::remove_reaction(state, &actor, room_id, message_id, emoji).await?;
            }
            EnvelopeKind::Typing => {
                chat::typing(state, &actor, room_id).await;
            }
            EnvelopeKind::Join | EnvelopeKind::Leave | EnvelopeKind::Error => {
                return Err(ApiError::BadRequest(format!(
                    "{:?} envelopes are server-only",
                    envelope.kind
                )));
            }
        }
        Ok(())
    }
}

/// Handler for `GET /ws/rooms/{room_id}`.
///
/// Authenticates the caller and checks room membership before upgrading;
/// a refused caller never reaches the hub.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(room_id): Path<i64>,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers)
        .map(str::to_string)
        .or(params.token)
    else {
        tracing::warn!(remote_addr = %addr, room_id, "websocket connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let user = match resolve_identity(&state, token).await {
        Ok(user) => user,
        Err(code) => {
            tracing::warn!(remote_addr = %addr, room_id, status = %code, "websocket auth failed");
            return code.into_response();
        }
    };

    let user_id = user.id;
    let member = with_conn(&state.pool, move |conn| Ok(is_member(conn, room_id, user_id)?)).await;
    match member {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(remote_addr = %addr, room_id, user_id, "websocket refused: not a member");
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => return e.into_response(),
    }

    tracing::info!(remote_addr = %addr, room_id, user_id, "websocket auth success");

    let settings = SessionSettings::from(&state.chat);
    let max_frame_bytes = state.chat.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| {
            let session = Session::open(state.hub.clone(), room_id, Actor::from(&user), settings);
            session.run(socket, RoomEvents::new(state))
        })
}
