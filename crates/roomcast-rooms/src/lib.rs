//! Rooms, memberships, messages and reactions for Roomcast.
//!
//! Every function here is synchronous and takes a borrowed
//! [`rusqlite::Connection`]; callers on an async runtime run them inside
//! `spawn_blocking` with a pooled connection. Functions that touch more than
//! one row set open an `IMMEDIATE` transaction so concurrent writers queue on
//! SQLite's write lock instead of failing with a stale snapshot.
//!
//! Nothing in this crate performs authorization. Callers consult
//! [`directory`] and [`roomcast_types::MemberRole::permits`] first.

pub mod directory;
pub mod members;
pub mod messages;
pub mod reactions;
pub mod rooms;
pub mod users;

pub use directory::{is_member, member_role};
pub use members::{
    add_member, add_members, get_membership, list_members, mark_read, remove_member, set_muted,
    total_unread, update_member_role, Membership,
};
pub use messages::{
    create_message, delete_message, edit_message, get_message, list_messages, search_messages,
    CreateMessageParams, Message, ReplyPreview,
};
pub use reactions::{add_reaction, list_reactions, remove_reaction, Reaction};
pub use rooms::{
    create_room, deactivate_room, delete_room, get_room, list_rooms_by_kind, list_user_rooms,
    room_stats, update_room, CreateRoomParams, Room, RoomStats, UpdateRoomParams, UserRoom,
};
pub use users::{create_user, find_user_by_token, get_user, User};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during room operations.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("user {user_id} is not a member of room {room_id}")]
    NotMember { room_id: i64, user_id: i64 },
    #[error("reaction already exists")]
    DuplicateReaction,
    #[error("a room may bind to a group or an item, and its kind must allow it")]
    InvalidBinding,
    #[error("reply target {0} is not a message in this room")]
    InvalidReply(i64),
}

impl RoomError {
    /// Returns `true` if the underlying SQLite error is a constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            RoomError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ffi::ErrorCode::ConstraintViolation
        )
    }
}

/// One page of a paginated read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub limit: u32,
}

impl PageRequest {
    /// Builds a request, treating `0` as `1` for both fields.
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    fn offset(self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.limit)
    }
}

/// A page of results together with the unpaginated total.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            limit: request.limit,
        }
    }
}

/// Current time in the same RFC 3339 millisecond form the schema defaults use.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn write_tx(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

/// Parses a text column into one of the label enums from `roomcast-types`.
pub(crate) fn parse_label<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
