//! Emoji reactions on messages.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::RoomError;

/// One user's emoji on one message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Reaction {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub created_at: String,
}

/// Adds a reaction to a live message.
///
/// A user may put several different emoji on the same message, but each
/// (message, user, emoji) triple at most once; a repeat fails with
/// [`RoomError::DuplicateReaction`].
pub fn add_reaction(
    conn: &Connection,
    message_id: i64,
    user_id: i64,
    emoji: &str,
) -> Result<Reaction, RoomError> {
    let live: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1 AND is_deleted = 0)",
        [message_id],
        |row| row.get(0),
    )?;
    if !live {
        return Err(RoomError::NotFound(format!("message {message_id}")));
    }

    conn.query_row(
        "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)
         RETURNING id, message_id, user_id, emoji, created_at",
        params![message_id, user_id, emoji],
        map_row_to_reaction,
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            RoomError::DuplicateReaction
        }
        other => RoomError::Database(other),
    })
}

/// Removes a reaction. Removing one that does not exist is `NotFound`.
pub fn remove_reaction(
    conn: &Connection,
    message_id: i64,
    user_id: i64,
    emoji: &str,
) -> Result<(), RoomError> {
    let count = conn.execute(
        "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
        params![message_id, user_id, emoji],
    )?;
    if count == 0 {
        return Err(RoomError::NotFound(format!(
            "reaction {emoji} on message {message_id}"
        )));
    }
    Ok(())
}

/// Lists a message's reactions, oldest first.
pub fn list_reactions(conn: &Connection, message_id: i64) -> Result<Vec<Reaction>, RoomError> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, user_id, emoji, created_at
         FROM reactions WHERE message_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt.query_map([message_id], map_row_to_reaction)?;
    let mut reactions = Vec::new();
    for row in rows {
        reactions.push(row?);
    }
    Ok(reactions)
}

fn map_row_to_reaction(row: &Row) -> rusqlite::Result<Reaction> {
    Ok(Reaction {
        id: row.get(0)?,
        message_id: row.get(1)?,
        user_id: row.get(2)?,
        emoji: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{group_room, setup_db, user};
    use crate::{create_message, delete_message, CreateMessageParams, Message};
    use roomcast_types::MessageKind;

    fn message(conn: &Connection) -> (Message, crate::User) {
        let alice = user(conn, "alice");
        let bob = user(conn, "bob");
        let room = group_room(conn, &alice, &[&bob]);
        let msg = create_message(
            conn,
            &CreateMessageParams {
                room_id: room.id,
                user_id: alice.id,
                body: "react to me".to_string(),
                kind: MessageKind::Text,
                attachment_url: None,
                attachment_name: None,
                reply_to_id: None,
            },
        )
        .unwrap();
        (msg, bob)
    }

    #[test]
    fn duplicate_reaction_is_rejected() {
        let conn = setup_db();
        let (msg, bob) = message(&conn);

        add_reaction(&conn, msg.id, bob.id, "🎉").unwrap();
        assert!(matches!(
            add_reaction(&conn, msg.id, bob.id, "🎉"),
            Err(RoomError::DuplicateReaction)
        ));

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![msg.id, bob.id, "🎉"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn distinct_emoji_from_same_user() {
        let conn = setup_db();
        let (msg, bob) = message(&conn);

        add_reaction(&conn, msg.id, bob.id, "👍").unwrap();
        add_reaction(&conn, msg.id, bob.id, "❤️").unwrap();
        let all = list_reactions(&conn, msg.id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].emoji, "👍");

        remove_reaction(&conn, msg.id, bob.id, "👍").unwrap();
        assert!(matches!(
            remove_reaction(&conn, msg.id, bob.id, "👍"),
            Err(RoomError::NotFound(_))
        ));
        assert_eq!(list_reactions(&conn, msg.id).unwrap().len(), 1);
    }

    #[test]
    fn deleted_message_takes_no_reactions() {
        let conn = setup_db();
        let (msg, bob) = message(&conn);
        delete_message(&conn, msg.id).unwrap();

        assert!(matches!(
            add_reaction(&conn, msg.id, bob.id, "👍"),
            Err(RoomError::NotFound(_))
        ));
    }
}
