//! REST handlers for rooms, members, messages and reactions.
//!
//! Every handler authenticates through [`IdentityContext`], checks the
//! caller's role in the room, runs the store call on a blocking thread and
//! only then touches the hub.

use crate::api::{with_conn, ApiError};
use crate::chat::{self, require_member, require_permission, Actor, MessageDraft};
use crate::middleware::IdentityContext;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};
use roomcast_rooms::{
    add_members, create_room, deactivate_room, delete_room, get_membership, get_room,
    list_members, list_messages, list_reactions, list_rooms_by_kind, list_user_rooms,
    remove_member, room_stats, search_messages, set_muted, total_unread, update_member_role,
    update_room, CreateRoomParams, Membership, Message, Page, Reaction, Room, RoomStats,
    UpdateRoomParams, UserRoom,
};
use roomcast_types::{MemberRole, RoomAction, RoomKind};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const MAX_NAME_LEN: usize = 256;
const MAX_DESCRIPTION_LEN: usize = 2048;

/// `page`/`limit` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    pub kind: RoomKind,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub kind: RoomKind,
    pub name: String,
    pub description: Option<String>,
    pub group_id: Option<i64>,
    pub item_id: Option<i64>,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddMembersRequest {
    pub user_ids: Vec<i64>,
    pub role: Option<MemberRole>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: MemberRole,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

fn validate_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "room name must be 1 to {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<(), ApiError> {
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(ApiError::BadRequest(format!(
            "room description exceeds {MAX_DESCRIPTION_LEN} bytes"
        )));
    }
    Ok(())
}

/// Owners are made only by creating a room.
fn assignable(role: MemberRole) -> Result<MemberRole, ApiError> {
    if role == MemberRole::Owner {
        return Err(ApiError::BadRequest(
            "the owner role cannot be assigned".to_string(),
        ));
    }
    Ok(role)
}

/// Handler for `POST /api/rooms`.
pub async fn create_room_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_name(&payload.name)?;
    validate_description(payload.description.as_deref())?;

    let mut member_ids = payload.member_ids;
    member_ids.retain(|id| *id != user.id);
    member_ids.sort_unstable();
    member_ids.dedup();
    if payload.kind == RoomKind::Direct && member_ids.len() != 1 {
        return Err(ApiError::BadRequest(
            "a direct room has exactly one other member".to_string(),
        ));
    }

    let params = CreateRoomParams {
        kind: payload.kind,
        name: payload.name,
        description: payload.description,
        group_id: payload.group_id,
        item_id: payload.item_id,
        created_by: user.id,
        member_ids,
    };
    let room = with_conn(&state.pool, move |conn| Ok(create_room(conn, &params)?)).await?;
    tracing::info!(room_id = room.id, kind = %room.kind, created_by = user.id, "room created");

    Ok((StatusCode::CREATED, Json(room)))
}

/// Handler for `GET /api/rooms`: the caller's rooms, most recently active first.
pub async fn list_my_rooms_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<UserRoom>>, ApiError> {
    let page = state.chat.page_request(query.page, query.limit);
    let rooms = with_conn(&state.pool, move |conn| Ok(list_user_rooms(conn, user.id, page)?)).await?;
    Ok(Json(rooms))
}

/// Handler for `GET /api/rooms/discover?kind=`: active rooms of one kind.
pub async fn discover_rooms_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Page<Room>>, ApiError> {
    let page = state.chat.page_request(query.page, query.limit);
    let kind = query.kind;
    let rooms = with_conn(&state.pool, move |conn| Ok(list_rooms_by_kind(conn, kind, page)?)).await?;
    Ok(Json(rooms))
}

/// Handler for `GET /api/rooms/{room_id}`.
pub async fn get_room_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<Json<Room>, ApiError> {
    let room = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(get_room(conn, room_id)?)
    })
    .await?;
    Ok(Json(room))
}

/// Handler for `PATCH /api/rooms/{room_id}`.
pub async fn update_room_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Json(payload): Json<UpdateRoomParams>,
) -> Result<Json<Room>, ApiError> {
    if let Some(name) = &payload.name {
        validate_name(name)?;
    }
    validate_description(payload.description.as_deref())?;

    let room = with_conn(&state.pool, move |conn| {
        require_permission(conn, room_id, user.id, RoomAction::UpdateRoom)?;
        Ok(update_room(conn, room_id, &payload)?)
    })
    .await?;
    Ok(Json(room))
}

/// Handler for `DELETE /api/rooms/{room_id}`: removes the room and all of
/// its content, then closes every live session in it.
pub async fn delete_room_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    with_conn(&state.pool, move |conn| {
        require_permission(conn, room_id, user.id, RoomAction::DeleteRoom)?;
        Ok(delete_room(conn, room_id)?)
    })
    .await?;

    let closed = state.hub.disconnect_room(room_id).await;
    tracing::info!(room_id, deleted_by = user.id, sessions_closed = closed, "room deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/rooms/{room_id}/deactivate`: archives the room
/// and closes its live sessions. Rows are kept.
pub async fn deactivate_room_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    with_conn(&state.pool, move |conn| {
        require_permission(conn, room_id, user.id, RoomAction::DeleteRoom)?;
        Ok(deactivate_room(conn, room_id)?)
    })
    .await?;

    state.hub.disconnect_room(room_id).await;
    tracing::info!(room_id, deactivated_by = user.id, "room deactivated");
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /api/rooms/{room_id}/members`.
pub async fn list_members_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<Json<Vec<Membership>>, ApiError> {
    let members = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(list_members(conn, room_id)?)
    })
    .await?;
    Ok(Json(members))
}

/// Handler for `POST /api/rooms/{room_id}/members`.
pub async fn add_members_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Json(payload): Json<AddMembersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.user_ids.is_empty() {
        return Err(ApiError::BadRequest("user_ids is empty".to_string()));
    }
    let role = assignable(payload.role.unwrap_or(MemberRole::Member))?;

    let added = with_conn(&state.pool, move |conn| {
        let actor_role = require_permission(conn, room_id, user.id, RoomAction::ManageMembers)?;
        if role == MemberRole::Moderator && actor_role != MemberRole::Owner {
            return Err(ApiError::Forbidden(
                "only the owner may appoint moderators".to_string(),
            ));
        }
        let room = get_room(conn, room_id)?;
        if room.kind == RoomKind::Direct {
            return Err(ApiError::BadRequest(
                "direct rooms cannot take new members".to_string(),
            ));
        }
        Ok(add_members(conn, room_id, &payload.user_ids, role)?)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(json!({ "added": added }))))
}

/// Handler for `PATCH /api/rooms/{room_id}/members/{user_id}`.
pub async fn update_member_role_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, target_id)): Path<(i64, i64)>,
    Json(payload): Json<UpdateRoleRequest>,
) -> Result<Json<Membership>, ApiError> {
    let role = assignable(payload.role)?;

    let membership = with_conn(&state.pool, move |conn| {
        let actor_role = require_member(conn, room_id, user.id)?;
        if actor_role != MemberRole::Owner {
            return Err(ApiError::Forbidden(
                "only the owner may change roles".to_string(),
            ));
        }
        if target_id == user.id {
            return Err(ApiError::BadRequest(
                "the owner cannot change their own role".to_string(),
            ));
        }
        Ok(update_member_role(conn, room_id, target_id, role)?)
    })
    .await
    .map_err(not_member_is_not_found)?;
    Ok(Json(membership))
}

/// Handler for `DELETE /api/rooms/{room_id}/members/{user_id}`.
///
/// Members may always leave. Removing someone else needs `ManageMembers`,
/// and nobody can remove the owner.
pub async fn remove_member_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, target_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    with_conn(&state.pool, move |conn| {
        if target_id != user.id {
            require_permission(conn, room_id, user.id, RoomAction::ManageMembers)?;
        }
        let target = get_membership(conn, room_id, target_id)?;
        if target.role == MemberRole::Owner && target_id != user.id {
            return Err(ApiError::Forbidden(
                "the room owner cannot be removed".to_string(),
            ));
        }
        Ok(remove_member(conn, room_id, target_id)?)
    })
    .await
    .map_err(not_member_is_not_found)?;

    state.hub.disconnect_member(room_id, target_id).await;
    tracing::info!(room_id, user_id = target_id, removed_by = user.id, "member removed");
    Ok(StatusCode::NO_CONTENT)
}

/// A missing target membership is a missing resource, not a refusal.
fn not_member_is_not_found(e: ApiError) -> ApiError {
    match e {
        ApiError::Forbidden(msg) if msg.starts_with("not a member") => ApiError::NotFound(msg),
        other => other,
    }
}

/// Handler for `PUT /api/rooms/{room_id}/mute`.
pub async fn set_muted_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Json(payload): Json<MuteRequest>,
) -> Result<Json<Membership>, ApiError> {
    let membership = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(set_muted(conn, room_id, user.id, payload.muted)?)
    })
    .await?;
    Ok(Json(membership))
}

/// Handler for `GET /api/rooms/{room_id}/messages`: page 1 is the newest,
/// each page reads oldest to newest.
pub async fn list_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Message>>, ApiError> {
    let page = state.chat.page_request(query.page, query.limit);
    let messages = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(list_messages(conn, room_id, page)?)
    })
    .await?;
    Ok(Json(messages))
}

/// Handler for `GET /api/rooms/{room_id}/messages/search?q=`.
pub async fn search_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Page<Message>>, ApiError> {
    let needle = query.q.trim().to_string();
    if needle.is_empty() {
        return Err(ApiError::BadRequest("q is empty".to_string()));
    }
    let page = state.chat.page_request(query.page, query.limit);
    let messages = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(search_messages(conn, room_id, &needle, page)?)
    })
    .await?;
    Ok(Json(messages))
}

/// Handler for `POST /api/rooms/{room_id}/messages`.
pub async fn send_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
    Json(draft): Json<MessageDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let message = chat::send_message(&state, &Actor::from(&user), room_id, draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Handler for `PATCH /api/rooms/{room_id}/messages/{message_id}`.
pub async fn edit_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, message_id)): Path<(i64, i64)>,
    Json(payload): Json<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = chat::edit(&state, &Actor::from(&user), room_id, message_id, payload.body).await?;
    Ok(Json(message))
}

/// Handler for `DELETE /api/rooms/{room_id}/messages/{message_id}`.
pub async fn delete_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, message_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    chat::delete(&state, &Actor::from(&user), room_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /api/rooms/{room_id}/messages/{message_id}/reactions`.
pub async fn list_reactions_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, message_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<Reaction>>, ApiError> {
    let reactions = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        let message = roomcast_rooms::get_message(conn, message_id)?;
        if message.room_id != room_id {
            return Err(ApiError::NotFound(format!("message {message_id}")));
        }
        Ok(list_reactions(conn, message_id)?)
    })
    .await?;
    Ok(Json(reactions))
}

/// Handler for `POST /api/rooms/{room_id}/messages/{message_id}/reactions`.
pub async fn add_reaction_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, message_id)): Path<(i64, i64)>,
    Json(payload): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reaction =
        chat::add_reaction(&state, &Actor::from(&user), room_id, message_id, payload.emoji).await?;
    Ok((StatusCode::CREATED, Json(reaction)))
}

/// Handler for `DELETE /api/rooms/{room_id}/messages/{message_id}/reactions?emoji=`.
pub async fn remove_reaction_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path((room_id, message_id)): Path<(i64, i64)>,
    Query(payload): Query<ReactionRequest>,
) -> Result<StatusCode, ApiError> {
    chat::remove_reaction(&state, &Actor::from(&user), room_id, message_id, payload.emoji).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/rooms/{room_id}/read`.
pub async fn mark_read_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let last_read_at = chat::mark_read(&state, &Actor::from(&user), room_id).await?;
    Ok(Json(json!({ "room_id": room_id, "last_read_at": last_read_at })))
}

/// Handler for `GET /api/rooms/{room_id}/stats`.
pub async fn room_stats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<Json<RoomStats>, ApiError> {
    let stats = with_conn(&state.pool, move |conn| {
        require_member(conn, room_id, user.id)?;
        Ok(room_stats(conn, room_id)?)
    })
    .await?;
    Ok(Json(stats))
}

/// Handler for `GET /api/rooms/{room_id}/presence`: who is connected now.
pub async fn room_presence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(room_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    with_conn(&state.pool, move |conn| require_member(conn, room_id, user.id)).await?;

    let online = state.hub.room_users(room_id).await;
    let sessions = state.hub.room_size(room_id).await;
    Ok(Json(json!({
        "room_id": room_id,
        "online": online,
        "sessions": sessions,
    })))
}

/// Handler for `GET /api/chat/unread`.
pub async fn total_unread_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
) -> Result<Json<Value>, ApiError> {
    let unread = with_conn(&state.pool, move |conn| Ok(total_unread(conn, user.id)?)).await?;
    Ok(Json(json!({ "unread": unread })))
}

/// Handler for `GET /api/chat/online`.
pub async fn online_users_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Value> {
    let online = state.hub.online_users().await;
    Json(json!({ "online": online }))
}
