use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::ChatMessage;

/// Write a message into the top-level collection. This store is separate
/// from the per-room log the gateway appends to; nothing reconciles the two.
pub fn create_message(
    conn: &Connection,
    room_id: &str,
    sender_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    if room_id.is_empty() || sender_id.is_empty() || text.is_empty() {
        return Err(anyhow!("missing_field"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO messages (id, room_id, sender_id, text, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), room_id, sender_id, text, now],
    )?;
    Ok(ChatMessage {
        id,
        room_id: room_id.into(),
        sender_id: sender_id.into(),
        text: text.into(),
        created_at: now,
    })
}

/// All messages of a room in creation order, oldest first.
pub fn list_messages(conn: &Connection, room_id: &str) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, sender_id, text, created_at FROM messages \
         WHERE room_id = ?1 ORDER BY created_at, rowid",
    )?;
    let messages = stmt
        .query_map([room_id], |row| {
            Ok(ChatMessage {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                room_id: row.get(1)?,
                sender_id: row.get(2)?,
                text: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn create_and_validate() {
        let conn = db::init_db(":memory:").unwrap();
        assert!(create_message(&conn, "r", "s", "").is_err());
        assert!(create_message(&conn, "", "s", "hi").is_err());
        let m = create_message(&conn, "r", "s", "hi").unwrap();
        assert_eq!(m.text, "hi");
    }

    #[test]
    fn list_in_creation_order() {
        let conn = db::init_db(":memory:").unwrap();
        create_message(&conn, "r", "a", "m1").unwrap();
        create_message(&conn, "r", "b", "m2").unwrap();
        create_message(&conn, "other", "a", "m3").unwrap();
        let msgs = list_messages(&conn, "r").unwrap();
        let texts: Vec<_> = msgs.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2"]);
        assert!(list_messages(&conn, "empty").unwrap().is_empty());
    }

    #[test]
    fn does_not_touch_room_log() {
        let conn = db::init_db(":memory:").unwrap();
        create_message(&conn, "r", "a", "hello").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM room_messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
