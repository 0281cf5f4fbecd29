use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{Room, RoomDetail, RoomMessage};

/// Create a chat room owned by a teacher.
pub fn create_room(conn: &Connection, name: &str, teacher_id: &str) -> Result<Room> {
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO rooms (id, name, teacher_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), name, teacher_id, now],
    )?;
    Ok(Room {
        id,
        name: name.into(),
        teacher_id: teacher_id.into(),
        students: Vec::new(),
        created_at: now,
    })
}

fn load_members(conn: &Connection, room_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT student_id FROM room_members WHERE room_id = ?1 ORDER BY rowid")?;
    let members = stmt
        .query_map([room_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

fn get_room(conn: &Connection, id: &str) -> Result<Option<Room>> {
    let mut stmt =
        conn.prepare("SELECT id, name, teacher_id, created_at FROM rooms WHERE id = ?1")?;
    let room = stmt
        .query_row([id], |row| {
            Ok(Room {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                name: row.get(1)?,
                teacher_id: row.get(2)?,
                students: Vec::new(),
                created_at: row.get(3)?,
            })
        })
        .optional()?;
    match room {
        Some(mut room) => {
            room.students = load_members(conn, id)?;
            Ok(Some(room))
        }
        None => Ok(None),
    }
}

/// Add a student to a room's member set. Idempotent: joining twice leaves
/// the membership unchanged. Fails with `room_not_found` for unknown rooms.
pub fn join_room(conn: &Connection, room_id: &str, student_id: &str) -> Result<Room> {
    let Some(_) = get_room(conn, room_id)? else {
        return Err(anyhow!("room_not_found"));
    };
    conn.execute(
        "INSERT OR IGNORE INTO room_members (room_id, student_id) VALUES (?1, ?2)",
        params![room_id, student_id],
    )?;
    get_room(conn, room_id)?.ok_or_else(|| anyhow!("room_not_found"))
}

/// Fetch a room together with its embedded message log in append order.
pub fn get_room_detail(conn: &Connection, id: &str) -> Result<Option<RoomDetail>> {
    let Some(room) = get_room(conn, id)? else {
        return Ok(None);
    };
    let messages = list_room_messages(conn, id)?;
    Ok(Some(RoomDetail { room, messages }))
}

/// The gateway's persistence target: append one message to the room's
/// embedded log. Fails with `room_not_found` when the room row is missing;
/// the gateway logs and swallows that.
pub fn append_room_message(
    conn: &Connection,
    room_id: &str,
    sender_id: &str,
    text: &str,
    created_at: i64,
) -> Result<RoomMessage> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM rooms WHERE id = ?1", [room_id], |row| {
            row.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(anyhow!("room_not_found"));
    }
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO room_messages (id, room_id, sender_id, text, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), room_id, sender_id, text, created_at],
    )?;
    Ok(RoomMessage {
        id,
        sender_id: sender_id.into(),
        text: text.into(),
        created_at,
    })
}

/// The embedded log in append order.
pub fn list_room_messages(conn: &Connection, room_id: &str) -> Result<Vec<RoomMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, text, created_at FROM room_messages \
         WHERE room_id = ?1 ORDER BY rowid",
    )?;
    let messages = stmt
        .query_map([room_id], |row| {
            Ok(RoomMessage {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                sender_id: row.get(1)?,
                text: row.get(2)?,
                created_at: row.get(3)?,
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
    fn create_and_join_idempotent() {
        let conn = db::init_db(":memory:").unwrap();
        let room = create_room(&conn, "Algebra 101", "teacher-1").unwrap();
        let rid = room.id.to_string();
        let joined = join_room(&conn, &rid, "student-1").unwrap();
        assert_eq!(joined.students, vec!["student-1"]);
        let joined = join_room(&conn, &rid, "student-1").unwrap();
        assert_eq!(joined.students, vec!["student-1"]);
        let joined = join_room(&conn, &rid, "student-2").unwrap();
        assert_eq!(joined.students.len(), 2);
        assert!(join_room(&conn, "missing", "student-1").is_err());
    }

    #[test]
    fn log_appends_in_order() {
        let conn = db::init_db(":memory:").unwrap();
        let room = create_room(&conn, "R", "t").unwrap();
        let rid = room.id.to_string();
        append_room_message(&conn, &rid, "a", "first", 10).unwrap();
        append_room_message(&conn, &rid, "b", "second", 10).unwrap();
        append_room_message(&conn, &rid, "a", "third", 11).unwrap();
        let log = list_room_messages(&conn, &rid).unwrap();
        let texts: Vec<_> = log.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let detail = get_room_detail(&conn, &rid).unwrap().unwrap();
        assert_eq!(detail.messages.len(), 3);
        assert!(get_room_detail(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn append_requires_room_row() {
        let conn = db::init_db(":memory:").unwrap();
        let err = append_room_message(&conn, "no-such-room", "a", "hi", 0).unwrap_err();
        assert_eq!(err.to_string(), "room_not_found");
    }
}
