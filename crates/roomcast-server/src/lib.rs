//! Roomcast server library logic.

pub mod api;
pub mod api_rooms;
pub mod api_ws;
pub mod chat;
pub mod config;
pub mod envelope;
pub mod hub;
pub mod middleware;
pub mod session;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Extension, Json, Router,
};
use config::ChatConfig;
use hub::RoomHub;
use roomcast_db::DbPool;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Live sessions per room and global presence.
    pub hub: RoomHub,
    /// Session timing and content limits.
    pub chat: ChatConfig,
}

impl AppState {
    pub fn new(pool: DbPool, chat: ChatConfig) -> Self {
        Self {
            pool,
            hub: RoomHub::new(),
            chat,
        }
    }
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/rooms",
            post(api_rooms::create_room_handler).get(api_rooms::list_my_rooms_handler),
        )
        .route("/api/rooms/discover", get(api_rooms::discover_rooms_handler))
        .route(
            "/api/rooms/{room_id}",
            get(api_rooms::get_room_handler)
                .patch(api_rooms::update_room_handler)
                .delete(api_rooms::delete_room_handler),
        )
        .route(
            "/api/rooms/{room_id}/deactivate",
            post(api_rooms::deactivate_room_handler),
        )
        .route(
            "/api/rooms/{room_id}/members",
            get(api_rooms::list_members_handler).post(api_rooms::add_members_handler),
        )
        .route(
            "/api/rooms/{room_id}/members/{user_id}",
            patch(api_rooms::update_member_role_handler).delete(api_rooms::remove_member_handler),
        )
        .route("/api/rooms/{room_id}/mute", put(api_rooms::set_muted_handler))
        .route(
            "/api/rooms/{room_id}/messages",
            get(api_rooms::list_messages_handler).post(api_rooms::send_message_handler),
        )
        .route(
            "/api/rooms/{room_id}/messages/search",
            get(api_rooms::search_messages_handler),
        )
        .route(
            "/api/rooms/{room_id}/messages/{message_id}",
            patch(api_rooms::edit_message_handler).delete(api_rooms::delete_message_handler),
        )
        .route(
            "/api/rooms/{room_id}/messages/{message_id}/reactions",
            get(api_rooms::list_reactions_handler)
                .post(api_rooms::add_reaction_handler)
                .delete(api_rooms::remove_reaction_handler),
        )
        .route("/api/rooms/{room_id}/read", post(api_rooms::mark_read_handler))
        .route("/api/rooms/{room_id}/stats", get(api_rooms::room_stats_handler))
        .route(
            "/api/rooms/{room_id}/presence",
            get(api_rooms::room_presence_handler),
        )
        .route("/api/chat/unread", get(api_rooms::total_unread_handler))
        .route("/api/chat/online", get(api_rooms::online_users_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws/rooms/{room_id}", get(api_ws::ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
