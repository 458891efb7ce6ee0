//! Room memberships and per-member read state.
//!
//! `unread_count` has exactly two writers: [`crate::create_message`] bumps it
//! for everyone except the author, and [`mark_read`] zeroes it.

use roomcast_types::MemberRole;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{now_timestamp, parse_label, write_tx, RoomError};

/// A user's membership in a room.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Membership {
    pub room_id: i64,
    pub user_id: i64,
    pub display_name: String,
    pub role: MemberRole,
    pub last_read_at: Option<String>,
    pub unread_count: i64,
    pub is_muted: bool,
    pub joined_at: String,
}

const MEMBER_COLUMNS: &str = "m.room_id, m.user_id, u.display_name, m.role, m.last_read_at,
    m.unread_count, m.is_muted, m.joined_at";

fn ensure_active_room(conn: &Connection, room_id: i64) -> Result<(), RoomError> {
    let active: Option<bool> = conn
        .query_row("SELECT is_active FROM rooms WHERE id = ?1", [room_id], |row| {
            row.get(0)
        })
        .optional()?;
    match active {
        Some(true) => Ok(()),
        _ => Err(RoomError::NotFound(format!("room {room_id}"))),
    }
}

/// Adds a user to an active room. Adding an existing member is a no-op and
/// keeps their current role.
pub fn add_member(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
    role: MemberRole,
) -> Result<Membership, RoomError> {
    ensure_active_room(conn, room_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)",
        params![room_id, user_id, role.as_str()],
    )?;
    get_membership(conn, room_id, user_id)
}

/// Adds several users in one transaction. Returns how many were new.
pub fn add_members(
    conn: &Connection,
    room_id: i64,
    user_ids: &[i64],
    role: MemberRole,
) -> Result<usize, RoomError> {
    let tx = write_tx(conn)?;
    ensure_active_room(&tx, room_id)?;
    let mut added = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)",
        )?;
        for user_id in user_ids {
            added += stmt.execute(params![room_id, user_id, role.as_str()])?;
        }
    }
    tx.commit()?;
    tracing::debug!(room_id, added, requested = user_ids.len(), "members added");
    Ok(added)
}

/// Removes a membership.
pub fn remove_member(conn: &Connection, room_id: i64, user_id: i64) -> Result<(), RoomError> {
    let count = conn.execute(
        "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id],
    )?;
    if count == 0 {
        return Err(RoomError::NotMember { room_id, user_id });
    }
    Ok(())
}

/// Retrieves one membership.
pub fn get_membership(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
) -> Result<Membership, RoomError> {
    conn.query_row(
        &format!(
            "SELECT {MEMBER_COLUMNS} FROM room_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.room_id = ?1 AND m.user_id = ?2"
        ),
        params![room_id, user_id],
        map_row_to_member,
    )
    .optional()?
    .ok_or(RoomError::NotMember { room_id, user_id })
}

/// Lists all members of a room in join order.
pub fn list_members(conn: &Connection, room_id: i64) -> Result<Vec<Membership>, RoomError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMBER_COLUMNS} FROM room_members m
         JOIN users u ON u.id = m.user_id
         WHERE m.room_id = ?1
         ORDER BY m.joined_at ASC, m.id ASC"
    ))?;

    let rows = stmt.query_map([room_id], map_row_to_member)?;
    let mut members = Vec::new();
    for row in rows {
        members.push(row?);
    }
    Ok(members)
}

/// Changes a member's role and returns the updated membership.
pub fn update_member_role(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
    role: MemberRole,
) -> Result<Membership, RoomError> {
    let count = conn.execute(
        "UPDATE room_members SET role = ?3 WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id, role.as_str()],
    )?;
    if count == 0 {
        return Err(RoomError::NotMember { room_id, user_id });
    }
    get_membership(conn, room_id, user_id)
}

/// Mutes or unmutes a room for one member and returns the updated membership.
pub fn set_muted(
    conn: &Connection,
    room_id: i64,
    user_id: i64,
    muted: bool,
) -> Result<Membership, RoomError> {
    let count = conn.execute(
        "UPDATE room_members SET is_muted = ?3 WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id, muted],
    )?;
    if count == 0 {
        return Err(RoomError::NotMember { room_id, user_id });
    }
    get_membership(conn, room_id, user_id)
}

/// Stamps the member's read time and zeroes their unread counter.
///
/// Returns the new `last_read_at`.
pub fn mark_read(conn: &Connection, room_id: i64, user_id: i64) -> Result<String, RoomError> {
    let now = now_timestamp();
    let count = conn.execute(
        "UPDATE room_members SET last_read_at = ?3, unread_count = 0
         WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id, now],
    )?;
    if count == 0 {
        return Err(RoomError::NotMember { room_id, user_id });
    }
    Ok(now)
}

/// Sums a user's unread counters across active rooms.
pub fn total_unread(conn: &Connection, user_id: i64) -> Result<i64, RoomError> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(m.unread_count), 0) FROM room_members m
         JOIN rooms r ON r.id = m.room_id
         WHERE m.user_id = ?1 AND r.is_active = 1",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn map_row_to_member(row: &Row) -> rusqlite::Result<Membership> {
    Ok(Membership {
        room_id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        role: parse_label(row, 3)?,
        last_read_at: row.get(4)?,
        unread_count: row.get(5)?,
        is_muted: row.get(6)?,
        joined_at: row.get(7)?,
    })
}
