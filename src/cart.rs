use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{CartEntry, CourseRef};

/// List a user's cart with the course title, price and owning teacher
/// joined in.
pub fn list_cart(conn: &Connection, user_id: &str) -> Result<Vec<CartEntry>> {
    let mut stmt = conn.prepare(
        "SELECT ci.user_id, ci.created_at, c.id, c.title, c.price, c.teacher_id \
         FROM cart_items ci JOIN courses c ON c.id = ci.course_id \
         WHERE ci.user_id = ?1 ORDER BY ci.created_at",
    )?;
    let entries = stmt
        .query_map([user_id], |row| {
            Ok(CartEntry {
                user_id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                created_at: row.get(1)?,
                course: CourseRef {
                    id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap(),
                    title: row.get(3)?,
                    price: row.get(4)?,
                    teacher_id: Uuid::parse_str(row.get::<_, String>(5)?.as_str()).unwrap(),
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Check whether a course is already in a user's cart.
pub fn find_item(conn: &Connection, user_id: &str, course_id: &str) -> Result<bool> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM cart_items WHERE user_id = ?1 AND course_id = ?2")?;
    let exists: Option<i64> = stmt
        .query_row(params![user_id, course_id], |row| row.get(0))
        .optional()?;
    Ok(exists.is_some())
}

/// Add a course to a user's cart. Duplicate checks are the caller's job.
pub fn add_item(conn: &Connection, user_id: &str, course_id: &str) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO cart_items (user_id, course_id, created_at) VALUES (?1, ?2, ?3)",
        params![user_id, course_id, now],
    )?;
    Ok(())
}

/// Remove a (user, course) pair. Returns the number of rows deleted, which
/// the handler reports back verbatim.
pub fn remove_item(conn: &Connection, user_id: &str, course_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM cart_items WHERE user_id = ?1 AND course_id = ?2",
        params![user_id, course_id],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth, courses, db, model::Role};

    #[test]
    fn add_list_remove() {
        let conn = db::init_db(":memory:").unwrap();
        let t = auth::create_user(&conn, "prof", "p@example.com", "h", Role::Teacher).unwrap();
        let s = auth::create_user(&conn, "kid", "k@example.com", "h", Role::Student).unwrap();
        let c = courses::create_course(&conn, &t, "Algebra", "d", 49.0, "math", None, None)
            .unwrap();
        let sid = s.id.to_string();
        let cid = c.id.to_string();

        assert!(!find_item(&conn, &sid, &cid).unwrap());
        add_item(&conn, &sid, &cid).unwrap();
        assert!(find_item(&conn, &sid, &cid).unwrap());

        let entries = list_cart(&conn, &sid).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].course.title, "Algebra");
        assert_eq!(entries[0].course.price, 49.0);
        assert_eq!(entries[0].course.teacher_id, t.id);

        assert_eq!(remove_item(&conn, &sid, &cid).unwrap(), 1);
        assert_eq!(remove_item(&conn, &sid, &cid).unwrap(), 0);
        assert!(list_cart(&conn, &sid).unwrap().is_empty());
    }

    #[test]
    fn duplicate_pair_rejected_by_schema() {
        let conn = db::init_db(":memory:").unwrap();
        let t = auth::create_user(&conn, "prof", "p@example.com", "h", Role::Teacher).unwrap();
        let s = auth::create_user(&conn, "kid", "k@example.com", "h", Role::Student).unwrap();
        let c = courses::create_course(&conn, &t, "A", "d", 1.0, "math", None, None).unwrap();
        add_item(&conn, &s.id.to_string(), &c.id.to_string()).unwrap();
        assert!(add_item(&conn, &s.id.to_string(), &c.id.to_string()).is_err());
    }
}
