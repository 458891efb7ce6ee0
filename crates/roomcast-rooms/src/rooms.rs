//! Room lifecycle: create, read, update, deactivate and delete.

use roomcast_types::{MemberRole, RoomKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{now_timestamp, parse_label, write_tx, Page, PageRequest, RoomError};

/// A chat room.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Room {
    pub id: i64,
    pub kind: RoomKind,
    pub name: String,
    pub description: Option<String>,
    /// External group this room belongs to, if any.
    pub group_id: Option<i64>,
    /// Catalog item this room discusses, if any.
    pub item_id: Option<i64>,
    pub created_by: i64,
    pub is_active: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A room as seen from one member's room list.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserRoom {
    #[serde(flatten)]
    pub room: Room,
    pub role: MemberRole,
    pub unread_count: i64,
    pub is_muted: bool,
}

/// Parameters for creating a new room.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomParams {
    pub kind: RoomKind,
    pub name: String,
    pub description: Option<String>,
    pub group_id: Option<i64>,
    pub item_id: Option<i64>,
    /// Becomes the room's owner.
    pub created_by: i64,
    /// Added as plain members alongside the owner.
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

/// Parameters for updating a room. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRoomParams {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Message and member counts for a room.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomStats {
    pub room_id: i64,
    pub message_count: i64,
    pub member_count: i64,
}

const ROOM_COLUMNS: &str = "r.id, r.kind, r.name, r.description, r.group_id, r.item_id,
    r.created_by, r.is_active, r.last_message, r.last_message_at, r.created_at, r.updated_at";

fn validate_binding(params: &CreateRoomParams) -> Result<(), RoomError> {
    let valid = match params.kind {
        RoomKind::Group => params.group_id.is_none() || params.item_id.is_none(),
        RoomKind::Direct => params.group_id.is_none() && params.item_id.is_none(),
        RoomKind::Topic => params.item_id.is_some() && params.group_id.is_none(),
    };
    if valid {
        Ok(())
    } else {
        Err(RoomError::InvalidBinding)
    }
}

/// Creates a room and its initial memberships in one transaction.
///
/// The creator is added as [`MemberRole::Owner`]; every id in `member_ids`
/// other than the creator is added as [`MemberRole::Member`].
pub fn create_room(conn: &Connection, params: &CreateRoomParams) -> Result<Room, RoomError> {
    validate_binding(params)?;

    let tx = write_tx(conn)?;
    let room_id: i64 = tx.query_row(
        "INSERT INTO rooms (kind, name, description, group_id, item_id, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING id",
        params![
            params.kind.as_str(),
            params.name,
            params.description,
            params.group_id,
            params.item_id,
            params.created_by,
        ],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)",
        params![room_id, params.created_by, MemberRole::Owner.as_str()],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)",
        )?;
        for user_id in params.member_ids.iter().filter(|id| **id != params.created_by) {
            stmt.execute(params![room_id, user_id, MemberRole::Member.as_str()])?;
        }
    }

    let room = select_room(&tx, room_id)?;
    tx.commit()?;

    tracing::info!(
        room_id,
        kind = %room.kind,
        created_by = params.created_by,
        "room created"
    );
    Ok(room)
}

/// Retrieves a room by ID, active or not.
pub fn get_room(conn: &Connection, room_id: i64) -> Result<Room, RoomError> {
    select_room(conn, room_id)
}

fn select_room(conn: &Connection, room_id: i64) -> Result<Room, RoomError> {
    conn.query_row(
        &format!("SELECT {ROOM_COLUMNS} FROM rooms r WHERE r.id = ?1"),
        [room_id],
        map_row_to_room,
    )
    .optional()?
    .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))
}

/// Lists the active rooms a user belongs to, most recently active first.
///
/// Rooms that have never seen a message sort after those that have, newest
/// room first.
pub fn list_user_rooms(
    conn: &Connection,
    user_id: i64,
    page: PageRequest,
) -> Result<Page<UserRoom>, RoomError> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM room_members m
         JOIN rooms r ON r.id = m.room_id
         WHERE m.user_id = ?1 AND r.is_active = 1",
        [user_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {ROOM_COLUMNS}, m.role, m.unread_count, m.is_muted
         FROM room_members m
         JOIN rooms r ON r.id = m.room_id
         WHERE m.user_id = ?1 AND r.is_active = 1
         ORDER BY r.last_message_at DESC NULLS LAST, r.created_at DESC, r.id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![user_id, page.limit, page.offset()], |row| {
        Ok(UserRoom {
            room: map_row_to_room(row)?,
            role: parse_label(row, 12)?,
            unread_count: row.get(13)?,
            is_muted: row.get(14)?,
        })
    })?;

    let mut rooms = Vec::new();
    for row in rows {
        rooms.push(row?);
    }
    Ok(Page::new(rooms, total, page))
}

/// Lists active rooms of one kind, newest first.
pub fn list_rooms_by_kind(
    conn: &Connection,
    kind: RoomKind,
    page: PageRequest,
) -> Result<Page<Room>, RoomError> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rooms WHERE kind = ?1 AND is_active = 1",
        [kind.as_str()],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {ROOM_COLUMNS} FROM rooms r
         WHERE r.kind = ?1 AND r.is_active = 1
         ORDER BY r.created_at DESC, r.id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        params![kind.as_str(), page.limit, page.offset()],
        map_row_to_room,
    )?;

    let mut rooms = Vec::new();
    for row in rows {
        rooms.push(row?);
    }
    Ok(Page::new(rooms, total, page))
}

/// Updates a room's name and/or description in a single statement.
pub fn update_room(
    conn: &Connection,
    room_id: i64,
    updates: &UpdateRoomParams,
) -> Result<Room, RoomError> {
    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(name) = &updates.name {
        values.push(Box::new(name.clone()));
        set_parts.push(format!("name = ?{}", values.len()));
    }
    if let Some(description) = &updates.description {
        values.push(Box::new(description.clone()));
        set_parts.push(format!("description = ?{}", values.len()));
    }

    if set_parts.is_empty() {
        return get_room(conn, room_id);
    }

    values.push(Box::new(now_timestamp()));
    set_parts.push(format!("updated_at = ?{}", values.len()));
    values.push(Box::new(room_id));
    let sql = format!(
        "UPDATE rooms SET {} WHERE id = ?{}",
        set_parts.join(", "),
        values.len()
    );

    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    if conn.execute(&sql, params.as_slice())? == 0 {
        return Err(RoomError::NotFound(format!("room {room_id}")));
    }
    get_room(conn, room_id)
}

/// Marks a room inactive. Its rows stay in place; membership checks and
/// new messages are refused from now on.
pub fn deactivate_room(conn: &Connection, room_id: i64) -> Result<(), RoomError> {
    let count = conn.execute(
        "UPDATE rooms SET is_active = 0, updated_at = ?2 WHERE id = ?1",
        params![room_id, now_timestamp()],
    )?;
    if count == 0 {
        return Err(RoomError::NotFound(format!("room {room_id}")));
    }
    tracing::info!(room_id, "room deactivated");
    Ok(())
}

/// Deletes a room and everything in it.
///
/// Children go first: reactions, then messages, then memberships, then the
/// room row. All four deletes commit together.
pub fn delete_room(conn: &Connection, room_id: i64) -> Result<(), RoomError> {
    let tx = write_tx(conn)?;
    let reactions = tx.execute(
        "DELETE FROM reactions
         WHERE message_id IN (SELECT id FROM messages WHERE room_id = ?1)",
        [room_id],
    )?;
    let messages = tx.execute("DELETE FROM messages WHERE room_id = ?1", [room_id])?;
    let members = tx.execute("DELETE FROM room_members WHERE room_id = ?1", [room_id])?;
    if tx.execute("DELETE FROM rooms WHERE id = ?1", [room_id])? == 0 {
        return Err(RoomError::NotFound(format!("room {room_id}")));
    }
    tx.commit()?;

    tracing::info!(room_id, reactions, messages, members, "room deleted");
    Ok(())
}

/// Counts live messages and members of a room.
pub fn room_stats(conn: &Connection, room_id: i64) -> Result<RoomStats, RoomError> {
    conn.query_row(
        "SELECT r.id,
            (SELECT COUNT(*) FROM messages WHERE room_id = r.id AND is_deleted = 0),
            (SELECT COUNT(*) FROM room_members WHERE room_id = r.id)
         FROM rooms r WHERE r.id = ?1",
        [room_id],
        |row| {
            Ok(RoomStats {
                room_id: row.get(0)?,
                message_count: row.get(1)?,
                member_count: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))
}

fn map_row_to_room(row: &Row) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        kind: parse_label(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        group_id: row.get(4)?,
        item_id: row.get(5)?,
        created_by: row.get(6)?,
        is_active: row.get(7)?,
        last_message: row.get(8)?,
        last_message_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{group_room, setup_db, user};
    use crate::{create_message, list_members, CreateMessageParams};
    use roomcast_types::MessageKind;

    fn text(room_id: i64, user_id: i64, body: &str) -> CreateMessageParams {
        CreateMessageParams {
            room_id,
            user_id,
            body: body.to_string(),
            kind: MessageKind::Text,
            attachment_url: None,
            attachment_name: None,
            reply_to_id: None,
        }
    }

    #[test]
    fn create_room_adds_owner_and_members() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");

        let room = group_room(&conn, &alice, &[&bob, &alice]);
        assert_eq!(room.kind, RoomKind::Group);
        assert!(room.is_active);
        assert_eq!(room.last_message, None);

        let members = list_members(&conn, room.id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user_id, alice.id);
        assert_eq!(members[0].role, MemberRole::Owner);
        assert_eq!(members[1].user_id, bob.id);
        assert_eq!(members[1].role, MemberRole::Member);
    }

    #[test]
    fn binding_rules_follow_room_kind() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let mut params = CreateRoomParams {
            kind: RoomKind::Topic,
            name: "Book club".to_string(),
            description: None,
            group_id: None,
            item_id: None,
            created_by: alice.id,
            member_ids: vec![],
        };
        assert!(matches!(
            create_room(&conn, &params),
            Err(RoomError::InvalidBinding)
        ));

        params.item_id = Some(42);
        let room = create_room(&conn, &params).unwrap();
        assert_eq!(room.item_id, Some(42));

        params.kind = RoomKind::Direct;
        assert!(matches!(
            create_room(&conn, &params),
            Err(RoomError::InvalidBinding)
        ));

        params.kind = RoomKind::Group;
        params.group_id = Some(7);
        assert!(matches!(
            create_room(&conn, &params),
            Err(RoomError::InvalidBinding)
        ));
    }

    #[test]
    fn failed_member_insert_rolls_back_room() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let params = CreateRoomParams {
            kind: RoomKind::Group,
            name: "General".to_string(),
            description: None,
            group_id: None,
            item_id: None,
            created_by: alice.id,
            member_ids: vec![9_999],
        };
        let err = create_room(&conn, &params).unwrap_err();
        assert!(err.is_constraint_violation());

        let rooms: i64 = conn
            .query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rooms, 0);
    }

    #[test]
    fn update_room_partial() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);

        let updated = update_room(
            &conn,
            room.id,
            &UpdateRoomParams {
                description: Some("all things".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.name, "General");
        assert_eq!(updated.description.as_deref(), Some("all things"));

        let unchanged = update_room(&conn, room.id, &UpdateRoomParams::default()).unwrap();
        assert_eq!(unchanged.description.as_deref(), Some("all things"));

        assert!(matches!(
            update_room(
                &conn,
                999,
                &UpdateRoomParams {
                    name: Some("ghost".to_string()),
                    ..Default::default()
                }
            ),
            Err(RoomError::NotFound(_))
        ));
    }

    #[test]
    fn user_rooms_order_by_recent_activity() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let quiet = group_room(&conn, &alice, &[]);
        let busy = group_room(&conn, &alice, &[]);
        let retired = group_room(&conn, &alice, &[]);
        deactivate_room(&conn, retired.id).unwrap();

        create_message(&conn, &text(busy.id, alice.id, "ping")).unwrap();

        let page = list_user_rooms(&conn, alice.id, PageRequest::new(1, 10)).unwrap();
        assert_eq!(page.total, 2);
        let ids: Vec<i64> = page.items.iter().map(|r| r.room.id).collect();
        assert_eq!(ids, vec![busy.id, quiet.id]);
        assert_eq!(page.items[0].role, MemberRole::Owner);

        let second = list_user_rooms(&conn, alice.id, PageRequest::new(2, 1)).unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].room.id, quiet.id);
    }

    #[test]
    fn rooms_by_kind_skips_inactive() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let a = group_room(&conn, &alice, &[]);
        let b = group_room(&conn, &alice, &[]);
        deactivate_room(&conn, a.id).unwrap();

        let page = list_rooms_by_kind(&conn, RoomKind::Group, PageRequest::new(1, 20)).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, b.id);

        let none = list_rooms_by_kind(&conn, RoomKind::Direct, PageRequest::new(1, 20)).unwrap();
        assert!(none.items.is_empty());
    }

    #[test]
    fn delete_room_removes_children_first() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let room = group_room(&conn, &alice, &[&bob]);
        let first = create_message(&conn, &text(room.id, alice.id, "hello")).unwrap();
        let mut reply = text(room.id, bob.id, "hi");
        reply.reply_to_id = Some(first.id);
        create_message(&conn, &reply).unwrap();
        crate::add_reaction(&conn, first.id, bob.id, "👍").unwrap();

        delete_room(&conn, room.id).unwrap();

        for table in ["reactions", "messages", "room_members", "rooms"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty");
        }
        assert!(matches!(
            delete_room(&conn, room.id),
            Err(RoomError::NotFound(_))
        ));
    }

    #[test]
    fn stats_count_live_messages() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let room = group_room(&conn, &alice, &[&bob]);
        create_message(&conn, &text(room.id, alice.id, "one")).unwrap();
        let two = create_message(&conn, &text(room.id, alice.id, "two")).unwrap();
        crate::delete_message(&conn, two.id).unwrap();

        let stats = room_stats(&conn, room.id).unwrap();
        assert_eq!(
            stats,
            RoomStats {
                room_id: room.id,
                message_count: 1,
                member_count: 2,
            }
        );
    }
}
