//! Identity lookups against the `users` table.
//!
//! Account management lives elsewhere; Roomcast only resolves bearer tokens
//! to identities. `create_user` exists for seeding and tests.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::RoomError;

/// An authenticated identity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: String,
}

const USER_COLUMNS: &str = "id, display_name, is_active, created_at";

/// Inserts a user with the given bearer token.
pub fn create_user(conn: &Connection, display_name: &str, token: &str) -> Result<User, RoomError> {
    let user = conn.query_row(
        &format!("INSERT INTO users (display_name, token) VALUES (?1, ?2) RETURNING {USER_COLUMNS}"),
        params![display_name, token],
        map_row_to_user,
    )?;
    Ok(user)
}

/// Resolves a bearer token. Inactive users are returned as-is; the caller
/// decides whether to reject them.
pub fn find_user_by_token(conn: &Connection, token: &str) -> Result<User, RoomError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE token = ?1"),
        [token],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| RoomError::NotFound("user for token".to_string()))
}

/// Retrieves a user by ID.
pub fn get_user(conn: &Connection, user_id: i64) -> Result<User, RoomError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [user_id],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| RoomError::NotFound(format!("user {user_id}")))
}

fn map_row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        display_name: row.get(1)?,
        is_active: row.get(2)?,
        created_at: row.get(3)?,
    })
}
