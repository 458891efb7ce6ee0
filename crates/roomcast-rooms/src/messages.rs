//! Message persistence.
//!
//! [`create_message`] is the one write that fans out: the message row, the
//! room's last-message summary and every other member's unread counter
//! commit together or not at all.

use roomcast_types::MessageKind;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{now_timestamp, parse_label, write_tx, Page, PageRequest, RoomError};

/// A stored message, hydrated with its author's display name and a preview
/// of the message it replies to.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub room_id: i64,
    pub user_id: i64,
    pub sender_display_name: String,
    pub body: String,
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to_id: Option<i64>,
    /// Absent when there is no reply target or it has been deleted.
    pub reply_to: Option<ReplyPreview>,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
    pub created_at: String,
}

/// The quoted part of a reply.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReplyPreview {
    pub id: i64,
    pub user_id: i64,
    pub sender_display_name: String,
    pub body: String,
}

/// Parameters for creating a new message.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageParams {
    pub room_id: i64,
    pub user_id: i64,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to_id: Option<i64>,
}

impl CreateMessageParams {
    /// Text stored in the room's `last_message` column.
    fn summary(&self) -> String {
        if !self.body.is_empty() {
            return self.body.clone();
        }
        match &self.attachment_name {
            Some(name) => name.clone(),
            None => format!("[{}]", self.kind),
        }
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.user_id, u.display_name, m.body, m.kind,
        m.attachment_url, m.attachment_name, m.reply_to_id,
        m.is_edited, m.edited_at, m.is_deleted, m.created_at,
        p.id, p.user_id, pu.display_name, p.body
    FROM messages m
    JOIN users u ON u.id = m.user_id
    LEFT JOIN messages p ON p.id = m.reply_to_id AND p.is_deleted = 0
    LEFT JOIN users pu ON pu.id = p.user_id";

/// Stores a message and applies its side effects atomically.
///
/// Within one transaction: inserts the row, sets the room's `last_message`
/// and `last_message_at`, and increments `unread_count` for every member
/// except the author. The room must exist and be active. A reply target,
/// when given, must be a message in the same room.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<Message, RoomError> {
    let tx = write_tx(conn)?;

    let active: Option<bool> = tx
        .query_row(
            "SELECT is_active FROM rooms WHERE id = ?1",
            [params.room_id],
            |row| row.get(0),
        )
        .optional()?;
    if active != Some(true) {
        return Err(RoomError::NotFound(format!("room {}", params.room_id)));
    }

    if let Some(reply_to_id) = params.reply_to_id {
        let in_room: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND room_id = ?2)",
            params![reply_to_id, params.room_id],
            |row| row.get(0),
        )?;
        if !in_room {
            return Err(RoomError::InvalidReply(reply_to_id));
        }
    }

    let now = now_timestamp();
    let message_id: i64 = tx.query_row(
        "INSERT INTO messages (
            room_id, user_id, body, kind, attachment_url, attachment_name,
            reply_to_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING id",
        params![
            params.room_id,
            params.user_id,
            params.body,
            params.kind.as_str(),
            params.attachment_url,
            params.attachment_name,
            params.reply_to_id,
            now,
        ],
        |row| row.get(0),
    )?;

    tx.execute(
        "UPDATE rooms SET last_message = ?2, last_message_at = ?3 WHERE id = ?1",
        params![params.room_id, params.summary(), now],
    )?;

    let notified = tx.execute(
        "UPDATE room_members SET unread_count = unread_count + 1
         WHERE room_id = ?1 AND user_id != ?2",
        params![params.room_id, params.user_id],
    )?;

    let message = select_message(&tx, message_id)?;
    tx.commit()?;

    tracing::debug!(
        room_id = params.room_id,
        message_id,
        notified,
        "message stored"
    );
    Ok(message)
}

/// Retrieves a message by ID, including soft-deleted ones.
pub fn get_message(conn: &Connection, message_id: i64) -> Result<Message, RoomError> {
    select_message(conn, message_id)
}

fn select_message(conn: &Connection, message_id: i64) -> Result<Message, RoomError> {
    conn.query_row(
        &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
        [message_id],
        map_row_to_message,
    )
    .optional()?
    .ok_or_else(|| RoomError::NotFound(format!("message {message_id}")))
}

/// Lists a room's live messages, one page at a time.
///
/// Page 1 holds the newest messages. Rows are fetched newest first and then
/// reversed, so each page reads oldest to newest.
pub fn list_messages(
    conn: &Connection,
    room_id: i64,
    page: PageRequest,
) -> Result<Page<Message>, RoomError> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE room_id = ?1 AND is_deleted = 0",
        [room_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "{MESSAGE_SELECT}
         WHERE m.room_id = ?1 AND m.is_deleted = 0
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![room_id, page.limit, page.offset()], map_row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    messages.reverse();
    Ok(Page::new(messages, total, page))
}

/// Replaces a live message's body and marks it edited.
pub fn edit_message(conn: &Connection, message_id: i64, body: &str) -> Result<Message, RoomError> {
    let count = conn.execute(
        "UPDATE messages SET body = ?2, is_edited = 1, edited_at = ?3
         WHERE id = ?1 AND is_deleted = 0",
        params![message_id, body, now_timestamp()],
    )?;
    if count == 0 {
        return Err(RoomError::NotFound(format!("message {message_id}")));
    }
    select_message(conn, message_id)
}

/// Soft-deletes a message. Deleting twice reports `NotFound`.
pub fn delete_message(conn: &Connection, message_id: i64) -> Result<Message, RoomError> {
    let count = conn.execute(
        "UPDATE messages SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
        [message_id],
    )?;
    if count == 0 {
        return Err(RoomError::NotFound(format!("message {message_id}")));
    }
    select_message(conn, message_id)
}

/// Case-insensitive substring search over a room's live messages, newest first.
pub fn search_messages(
    conn: &Connection,
    room_id: i64,
    query: &str,
    page: PageRequest,
) -> Result<Page<Message>, RoomError> {
    let pattern = format!("%{}%", escape_like(query));

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE room_id = ?1 AND is_deleted = 0 AND body LIKE ?2 ESCAPE '\\'",
        params![room_id, pattern],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "{MESSAGE_SELECT}
         WHERE m.room_id = ?1 AND m.is_deleted = 0 AND m.body LIKE ?2 ESCAPE '\\'
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt.query_map(
        params![room_id, pattern, page.limit, page.offset()],
        map_row_to_message,
    )?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(Page::new(messages, total, page))
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let preview_id: Option<i64> = row.get(13)?;
    let reply_to = match preview_id {
        Some(id) => Some(ReplyPreview {
            id,
            user_id: row.get(14)?,
            sender_display_name: row.get(15)?,
            body: row.get(16)?,
        }),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        sender_display_name: row.get(3)?,
        body: row.get(4)?,
        kind: parse_label(row, 5)?,
        attachment_url: row.get(6)?,
        attachment_name: row.get(7)?,
        reply_to_id: row.get(8)?,
        reply_to,
        is_edited: row.get(9)?,
        edited_at: row.get(10)?,
        is_deleted: row.get(11)?,
        created_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{group_room, setup_db, user};
    use crate::{add_member, deactivate_room, get_membership, get_room, mark_read};
    use roomcast_types::MemberRole;

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
    fn create_message_applies_all_effects() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let carol = user(&conn, "carol");
        let room = group_room(&conn, &alice, &[&bob, &carol]);

        let msg = create_message(&conn, &text(room.id, alice.id, "hello")).unwrap();
        assert_eq!(msg.sender_display_name, "alice");
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(!msg.is_edited);

        let room = get_room(&conn, room.id).unwrap();
        assert_eq!(room.last_message.as_deref(), Some("hello"));
        assert_eq!(room.last_message_at.as_deref(), Some(msg.created_at.as_str()));

        assert_eq!(get_membership(&conn, room.id, alice.id).unwrap().unread_count, 0);
        assert_eq!(get_membership(&conn, room.id, bob.id).unwrap().unread_count, 1);
        assert_eq!(get_membership(&conn, room.id, carol.id).unwrap().unread_count, 1);
    }

    #[test]
    fn read_then_new_message_scenario() {
        let conn = setup_db();
        let u1 = user(&conn, "u1");
        let u2 = user(&conn, "u2");
        let r1 = group_room(&conn, &u1, &[]);
        add_member(&conn, r1.id, u2.id, MemberRole::Member).unwrap();

        create_message(&conn, &text(r1.id, u1.id, "hello")).unwrap();
        assert_eq!(get_membership(&conn, r1.id, u2.id).unwrap().unread_count, 1);
        assert_eq!(get_room(&conn, r1.id).unwrap().last_message.as_deref(), Some("hello"));

        mark_read(&conn, r1.id, u2.id).unwrap();
        assert_eq!(get_membership(&conn, r1.id, u2.id).unwrap().unread_count, 0);

        create_message(&conn, &text(r1.id, u1.id, "hi again")).unwrap();
        assert_eq!(get_membership(&conn, r1.id, u2.id).unwrap().unread_count, 1);
    }

    #[test]
    fn failed_create_leaves_no_trace() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let room = group_room(&conn, &alice, &[&bob]);

        // Fail the last of the three writes; the first two must roll back with it.
        conn.execute_batch(
            "CREATE TEMP TRIGGER fail_unread BEFORE UPDATE OF unread_count ON room_members
             BEGIN SELECT RAISE(ABORT, 'unread update refused'); END;",
        )
        .unwrap();
        let err = create_message(&conn, &text(room.id, alice.id, "lost")).unwrap_err();
        assert!(err.is_constraint_violation());

        let room = get_room(&conn, room.id).unwrap();
        assert_eq!(room.last_message, None);
        assert_eq!(get_membership(&conn, room.id, bob.id).unwrap().unread_count, 0);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn inactive_or_missing_room_is_not_found() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);
        deactivate_room(&conn, room.id).unwrap();

        assert!(matches!(
            create_message(&conn, &text(room.id, alice.id, "late")),
            Err(RoomError::NotFound(_))
        ));
        assert!(matches!(
            create_message(&conn, &text(404, alice.id, "nowhere")),
            Err(RoomError::NotFound(_))
        ));
    }

    #[test]
    fn replies_carry_a_preview_and_stay_in_room() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let room = group_room(&conn, &alice, &[&bob]);
        let other = group_room(&conn, &alice, &[]);

        let original = create_message(&conn, &text(room.id, alice.id, "question?")).unwrap();
        let mut reply = text(room.id, bob.id, "answer");
        reply.reply_to_id = Some(original.id);
        let reply = create_message(&conn, &reply).unwrap();

        let preview = reply.reply_to.expect("reply should carry a preview");
        assert_eq!(preview.id, original.id);
        assert_eq!(preview.sender_display_name, "alice");
        assert_eq!(preview.body, "question?");

        let mut cross = text(other.id, alice.id, "wrong room");
        cross.reply_to_id = Some(original.id);
        assert!(matches!(
            create_message(&conn, &cross),
            Err(RoomError::InvalidReply(id)) if id == original.id
        ));

        delete_message(&conn, original.id).unwrap();
        let reloaded = get_message(&conn, reply.id).unwrap();
        assert_eq!(reloaded.reply_to_id, Some(original.id));
        assert_eq!(reloaded.reply_to, None);
    }

    #[test]
    fn attachment_without_body_summarises_room() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);

        let mut params = text(room.id, alice.id, "");
        params.kind = MessageKind::Image;
        params.attachment_url = Some("https://cdn.example/cat.png".to_string());
        create_message(&conn, &params).unwrap();
        assert_eq!(get_room(&conn, room.id).unwrap().last_message.as_deref(), Some("[image]"));

        params.kind = MessageKind::File;
        params.attachment_name = Some("notes.pdf".to_string());
        create_message(&conn, &params).unwrap();
        assert_eq!(get_room(&conn, room.id).unwrap().last_message.as_deref(), Some("notes.pdf"));
    }

    #[test]
    fn list_messages_pages_are_chronological() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);
        for i in 1..=5 {
            create_message(&conn, &text(room.id, alice.id, &format!("m{i}"))).unwrap();
        }
        let hidden = create_message(&conn, &text(room.id, alice.id, "oops")).unwrap();
        delete_message(&conn, hidden.id).unwrap();

        let newest = list_messages(&conn, room.id, PageRequest::new(1, 2)).unwrap();
        assert_eq!(newest.total, 5);
        let bodies: Vec<&str> = newest.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m5"]);

        let older = list_messages(&conn, room.id, PageRequest::new(2, 2)).unwrap();
        let bodies: Vec<&str> = older.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3"]);

        let oldest = list_messages(&conn, room.id, PageRequest::new(3, 2)).unwrap();
        let bodies: Vec<&str> = oldest.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m1"]);
    }

    #[test]
    fn edit_and_delete() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);
        let msg = create_message(&conn, &text(room.id, alice.id, "tpyo")).unwrap();

        let edited = edit_message(&conn, msg.id, "typo").unwrap();
        assert_eq!(edited.body, "typo");
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());

        let deleted = delete_message(&conn, msg.id).unwrap();
        assert!(deleted.is_deleted);
        assert!(matches!(
            delete_message(&conn, msg.id),
            Err(RoomError::NotFound(_))
        ));
        assert!(matches!(
            edit_message(&conn, msg.id, "again"),
            Err(RoomError::NotFound(_))
        ));
        assert!(get_message(&conn, msg.id).unwrap().is_deleted);
    }

    #[test]
    fn search_is_case_insensitive_and_literal() {
        let conn = setup_db();
        let alice = user(&conn, "alice");
        let room = group_room(&conn, &alice, &[]);
        create_message(&conn, &text(room.id, alice.id, "Meeting at noon")).unwrap();
        create_message(&conn, &text(room.id, alice.id, "lunch after the meeting")).unwrap();
        create_message(&conn, &text(room.id, alice.id, "100% agreed")).unwrap();
        create_message(&conn, &text(room.id, alice.id, "1000 agreed")).unwrap();

        let hits = search_messages(&conn, room.id, "MEETING", PageRequest::new(1, 10)).unwrap();
        assert_eq!(hits.total, 2);
        assert_eq!(hits.items[0].body, "lunch after the meeting");

        let percent = search_messages(&conn, room.id, "0%", PageRequest::new(1, 10)).unwrap();
        assert_eq!(percent.total, 1);
        assert_eq!(percent.items[0].body, "100% agreed");
    }
}
