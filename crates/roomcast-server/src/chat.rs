//! Durable room events: authorize, commit, then broadcast.
//!
//! REST handlers and live sessions both go through these functions, so a
//! message posted over HTTP and one sent over the socket produce the same
//! rows and the same envelope. Broadcasting happens only after the write has
//! committed; a failed write broadcasts nothing.

use roomcast_rooms::{
    add_reaction as store_reaction, create_message, delete_message as soft_delete, edit_message,
    get_message, mark_read as store_read, member_role, remove_reaction as drop_reaction,
    CreateMessageParams, Message, Reaction, User,
};
use roomcast_types::{MemberRole, MessageKind, RoomAction};
use rusqlite::Connection;
use serde::Deserialize;

use crate::api::{with_conn, ApiError};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::AppState;

/// Longest emoji string accepted for a reaction, in characters.
const MAX_EMOJI_CHARS: usize = 32;

/// Who is acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub display_name: String,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            display_name: user.display_name.clone(),
        }
    }
}

/// Client-supplied fields of a new message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to_id: Option<i64>,
}

/// Returns the actor's role, or `Forbidden` if they are not in the active room.
pub(crate) fn require_member(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
) -> Result<MemberRole, ApiError> {
    member_role(conn, room_id, user_id)?
        .ok_or_else(|| ApiError::Forbidden(format!("not a member of room {room_id}")))
}

/// Like [`require_member`], but also checks that the role permits `action`.
pub(crate) fn require_permission(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
    action: RoomAction,
) -> Result<MemberRole, ApiError> {
    let role = require_member(conn, room_id, user_id)?;
    if !role.permits(action) {
        return Err(ApiError::Forbidden(format!(
            "role {role} may not {action:?} in room {room_id}"
        )));
    }
    Ok(role)
}

/// Loads a live message and checks it belongs to `room_id`.
fn message_in_room(conn: &Connection, room_id: i64, message_id: i64) -> Result<Message, ApiError> {
    let message = get_message(conn, message_id)?;
    if message.room_id != room_id || message.is_deleted {
        return Err(ApiError::NotFound(format!("message {message_id}")));
    }
    Ok(message)
}

fn validate_draft(draft: &MessageDraft, max_body_len: usize) -> Result<(), ApiError> {
    if draft.body.trim().is_empty() && draft.attachment_url.is_none() {
        return Err(ApiError::BadRequest(
            "message needs a body or an attachment".to_string(),
        ));
    }
    validate_body_len(&draft.body, max_body_len)
}

fn validate_body_len(body: &str, max_body_len: usize) -> Result<(), ApiError> {
    if body.len() > max_body_len {
        return Err(ApiError::BadRequest(format!(
            "message body exceeds maximum length of {max_body_len} bytes"
        )));
    }
    Ok(())
}

fn validate_emoji(emoji: &str) -> Result<(), ApiError> {
    let chars = emoji.chars().count();
    if emoji.trim().is_empty() || chars > MAX_EMOJI_CHARS {
        return Err(ApiError::BadRequest(format!(
            "emoji must be 1 to {MAX_EMOJI_CHARS} characters"
        )));
    }
    Ok(())
}

fn message_envelope(kind: EnvelopeKind, actor: &Actor, message: &Message) -> Envelope {
    let mut envelope = Envelope::new(kind, message.room_id, actor.user_id, &actor.display_name)
        .with_message_id(message.id)
        .with_payload(message);
    if kind != EnvelopeKind::Delete {
        envelope.body = Some(message.body.clone());
        envelope.attachment_url = message.attachment_url.clone();
        envelope.attachment_name = message.attachment_name.clone();
        envelope.reply_to_id = message.reply_to_id;
    }
    envelope
}

/// Persists a new message and broadcasts it to the room.
pub async fn send_message(
    state: &AppState,
    actor: &Actor,
    room_id: i64,
    draft: MessageDraft,
) -> Result<Message, ApiError> {
    validate_draft(&draft, state.chat.max_body_len)?;

    let user_id = actor.user_id;
    let message = with_conn(&state.pool, move |conn| {
        require_permission(conn, room_id, user_id, RoomAction::Post)?;
        let params = CreateMessageParams {
            room_id,
            user_id,
            body: draft.body,
            kind: draft.kind,
            attachment_url: draft.attachment_url,
            attachment_name: draft.attachment_name,
            reply_to_id: draft.reply_to_id,
        };
        Ok(create_message(conn, &params)?)
    })
    .await?;

    let delivered = state
        .hub
        .broadcast(room_id, &message_envelope(EnvelopeKind::Message, actor, &message))
        .await;
    tracing::debug!(room_id, message_id = message.id, delivered, "message broadcast");
    Ok(message)
}

/// Replaces the body of the actor's own message.
pub async fn edit(
    state: &AppState,
    actor: &Actor,
    room_id: i64,
    message_id: i64,
    body: String,
) -> Result<Message, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("message body is empty".to_string()));
    }
    validate_body_len(&body, state.chat.max_body_len)?;

    let user_id = actor.user_id;
    let message = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user_id)?;
        let existing = message_in_room(conn, room_id, message_id)?;
        if existing.user_id != user_id {
            return Err(ApiError::Forbidden(
                "only the author may edit a message".to_string(),
            ));
        }
        Ok(edit_message(conn, message_id, &body)?)
    })
    .await?;

    state
        .hub
        .broadcast(room_id, &message_envelope(EnvelopeKind::Edit, actor, &message))
        .await;
    Ok(message)
}

/// Soft-deletes a message. Authors may delete their own; moderators and
/// owners may delete anyone's.
pub async fn delete(
    state: &AppState,
    actor: &Actor,
    room_id: i64,
    message_id: i64,
) -> Result<Message, ApiError> {
    let user_id = actor.user_id;
    let message = with_conn(&state.pool, move |conn| {
        let role = require_member(conn, room_id, user_id)?;
        let existing = message_in_room(conn, room_id, message_id)?;
        if existing.user_id != user_id && !role.permits(RoomAction::ModerateMessages) {
            return Err(ApiError::Forbidden(
                "only the author or a moderator may delete a message".to_string(),
            ));
        }
        Ok(soft_delete(conn, message_id)?)
    })
    .await?;

    state
        .hub
        .broadcast(room_id, &message_envelope(EnvelopeKind::Delete, actor, &message))
        .await;
    Ok(message)
}

/// Clears the actor's unread counter and tells the room how far they read.
pub async fn mark_read(state: &AppState, actor: &Actor, room_id: i64) -> Result<String, ApiError> {
    let user_id = actor.user_id;
    let last_read_at = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user_id)?;
        Ok(store_read(conn, room_id, user_id)?)
    })
    .await?;

    let envelope = Envelope::new(EnvelopeKind::Read, room_id, actor.user_id, &actor.display_name)
        .with_payload(&serde_json::json!({ "last_read_at": last_read_at }));
    state.hub.broadcast(room_id, &envelope).await;
    Ok(last_read_at)
}

pub async fn add_reaction(
    state: &AppState,
    actor: &Actor,
    room_id: i64,
    message_id: i64,
    emoji: String,
) -> Result<Reaction, ApiError> {
    validate_emoji(&emoji)?;

    let user_id = actor.user_id;
    let reaction = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user_id)?;
        message_in_room(conn, room_id, message_id)?;
        Ok(store_reaction(conn, message_id, user_id, &emoji)?)
    })
    .await?;

    let envelope = Envelope::new(
        EnvelopeKind::ReactionAdd,
        room_id,
        actor.user_id,
        &actor.display_name,
    )
    .with_message_id(message_id)
    .with_emoji(reaction.emoji.clone())
    .with_payload(&reaction);
    state.hub.broadcast(room_id, &envelope).await;
    Ok(reaction)
}

pub async fn remove_reaction(
    state: &AppState,
    actor: &Actor,
    room_id: i64,
    message_id: i64,
    emoji: String,
) -> Result<(), ApiError> {
    validate_emoji(&emoji)?;

    let user_id = actor.user_id;
    let removed = emoji.clone();
    with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user_id)?;
        message_in_room(conn, room_id, message_id)?;
        Ok(drop_reaction(conn, message_id, user_id, &removed)?)
    })
    .await?;

    let envelope = Envelope::new(
        EnvelopeKind::ReactionRemove,
        room_id,
        actor.user_id,
        &actor.display_name,
    )
    .with_message_id(message_id)
    .with_emoji(emoji);
    state.hub.broadcast(room_id, &envelope).await;
    Ok(())
}

/// Relays a typing indicator. Nothing is stored.
pub async fn typing(state: &AppState, actor: &Actor, room_id: i64) -> usize {
    let envelope = Envelope::new(EnvelopeKind::Typing, room_id, actor.user_id, &actor.display_name);
    state.hub.broadcast(room_id, &envelope).await
}
