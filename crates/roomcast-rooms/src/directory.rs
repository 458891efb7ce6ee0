//! Membership lookups consulted before any hub registration or mutation.
//!
//! Both queries only see active rooms, so a deactivated room refuses new
//! connections and writes without extra checks at the call sites.

use roomcast_types::MemberRole;
use rusqlite::{params, Connection, OptionalExtension};

use crate::RoomError;

/// Returns `true` if `user_id` belongs to the active room `room_id`.
pub fn is_member(conn: &Connection, room_id: i64, user_id: i64) -> Result<bool, RoomError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM room_members m
            JOIN rooms r ON r.id = m.room_id
            WHERE m.room_id = ?1 AND m.user_id = ?2 AND r.is_active = 1
        )",
        params![room_id, user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Returns the member's role, or `None` if they are not in the active room.
pub fn member_role(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
) -> Result<Option<MemberRole>, RoomError> {
    let role = conn
        .query_row(
            "SELECT m.role FROM room_members m
             JOIN rooms r ON r.id = m.room_id
             WHERE m.room_id = ?1 AND m.user_id = ?2 AND r.is_active = 1",
            params![room_id, user_id],
            |row| crate::parse_label(row, 0),
        )
        .optional()?;
    Ok(role)
}
