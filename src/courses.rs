use anyhow::{anyhow, Result};
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{Course, CourseDetail, Review, User, UserRef};

const COURSE_COLS: &str =
    "c.id, c.title, c.description, c.price, c.category, c.rating, c.created_at, \
     u.id, u.username, u.email";

fn row_to_course(row: &rusqlite::Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        title: row.get(1)?,
        description: row.get(2)?,
        price: row.get(3)?,
        category: row.get(4)?,
        rating: row.get(5)?,
        created_at: row.get(6)?,
        teacher: UserRef {
            id: Uuid::parse_str(row.get::<_, String>(7)?.as_str()).unwrap(),
            username: row.get(8)?,
            email: row.get(9)?,
        },
        videos: Vec::new(),
    })
}

fn load_videos(conn: &Connection, course_id: &Uuid) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT url FROM course_videos WHERE course_id = ?1 ORDER BY position")?;
    let urls = stmt
        .query_map([course_id.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(urls)
}

/// Create a course owned by a teacher, with an optional initial video link.
pub fn create_course(
    conn: &Connection,
    teacher: &User,
    title: &str,
    description: &str,
    price: f64,
    category: &str,
    rating: Option<f64>,
    video_url: Option<&str>,
) -> Result<Course> {
    let rating = rating.unwrap_or(0.0);
    if !(0.0..=5.0).contains(&rating) {
        return Err(anyhow!("invalid_rating"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO courses (id, title, description, teacher_id, price, category, rating, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.to_string(),
            title,
            description,
            teacher.id.to_string(),
            price,
            category,
            rating,
            now
        ],
    )?;
    let mut videos = Vec::new();
    if let Some(url) = video_url {
        append_video(conn, &id, url)?;
        videos.push(url.to_string());
    }
    Ok(Course {
        id,
        title: title.into(),
        description: description.into(),
        price,
        category: category.into(),
        rating,
        created_at: now,
        teacher: UserRef {
            id: teacher.id,
            username: teacher.username.clone(),
            email: teacher.email.clone(),
        },
        videos,
    })
}

/// List all courses with their owning teacher joined in.
pub fn list_courses(conn: &Connection) -> Result<Vec<Course>> {
    let sql = format!(
        "SELECT {COURSE_COLS} FROM courses c JOIN users u ON u.id = c.teacher_id ORDER BY c.created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut courses = stmt
        .query_map([], row_to_course)?
        .collect::<Result<Vec<_>, _>>()?;
    for course in &mut courses {
        course.videos = load_videos(conn, &course.id)?;
    }
    Ok(courses)
}

/// Fetch one course with its videos and reviews.
pub fn get_course(conn: &Connection, id: &str) -> Result<Option<CourseDetail>> {
    let sql = format!(
        "SELECT {COURSE_COLS} FROM courses c JOIN users u ON u.id = c.teacher_id WHERE c.id = ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let Some(mut course) = stmt.query_row([id], row_to_course).optional()? else {
        return Ok(None);
    };
    course.videos = load_videos(conn, &course.id)?;
    let mut stmt = conn.prepare(
        "SELECT r.id, r.rating, r.comment, r.created_at, u.id, u.username, u.email \
         FROM reviews r JOIN users u ON u.id = r.student_id \
         WHERE r.course_id = ?1 ORDER BY r.created_at",
    )?;
    let reviews = stmt
        .query_map([id], |row| {
            Ok(Review {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                rating: row.get(1)?,
                comment: row.get(2)?,
                created_at: row.get(3)?,
                student: UserRef {
                    id: Uuid::parse_str(row.get::<_, String>(4)?.as_str()).unwrap(),
                    username: row.get(5)?,
                    email: row.get(6)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(CourseDetail { course, reviews }))
}

/// Replace a course's editable fields. Ownership is checked by the caller.
pub fn update_course(
    conn: &Connection,
    id: &str,
    title: &str,
    description: &str,
    price: f64,
    category: &str,
    rating: f64,
) -> Result<()> {
    if !(0.0..=5.0).contains(&rating) {
        return Err(anyhow!("invalid_rating"));
    }
    let changed = conn.execute(
        "UPDATE courses SET title = ?2, description = ?3, price = ?4, category = ?5, rating = ?6 \
         WHERE id = ?1",
        params![id, title, description, price, category, rating],
    )?;
    if changed == 0 {
        anyhow::bail!("not_found");
    }
    Ok(())
}

/// Append a video URL to the end of a course's video list.
pub fn append_video(conn: &Connection, course_id: &Uuid, url: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO course_videos (course_id, position, url) \
         SELECT ?1, COALESCE(MAX(position), -1) + 1, ?2 FROM course_videos WHERE course_id = ?1",
        params![course_id.to_string(), url],
    )?;
    Ok(())
}

pub fn delete_course(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM course_videos WHERE course_id = ?1", [id])?;
    conn.execute("DELETE FROM reviews WHERE course_id = ?1", [id])?;
    let changed = conn.execute("DELETE FROM courses WHERE id = ?1", [id])?;
    if changed == 0 {
        anyhow::bail!("not_found");
    }
    Ok(())
}

/// Add a student review and recompute the course rating as the mean of all
/// its reviews.
pub fn add_review(
    conn: &Connection,
    course_id: &str,
    student: &User,
    rating: f64,
    comment: &str,
) -> Result<CourseDetail> {
    if !(0.0..=5.0).contains(&rating) {
        return Err(anyhow!("invalid_rating"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO reviews (id, course_id, student_id, rating, comment, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            course_id,
            student.id.to_string(),
            rating,
            comment,
            now
        ],
    )?;
    let avg: f64 = conn.query_row(
        "SELECT AVG(rating) FROM reviews WHERE course_id = ?1",
        [course_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE courses SET rating = ?2 WHERE id = ?1",
        params![course_id, avg],
    )?;
    get_course(conn, course_id)?.ok_or_else(|| anyhow!("not_found"))
}

/// Catalog filter; every field is optional and unset fields do not constrain.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct CourseFilter {
    pub category: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub rating: Option<f64>,
    pub teacher: Option<String>,
}

/// List courses matching a filter: exact category, price range, minimum
/// rating, owning teacher id.
pub fn filter_courses(conn: &Connection, filter: &CourseFilter) -> Result<Vec<Course>> {
    let mut sql = format!(
        "SELECT {COURSE_COLS} FROM courses c JOIN users u ON u.id = c.teacher_id WHERE 1=1"
    );
    let mut values: Vec<Value> = Vec::new();
    if let Some(category) = &filter.category {
        sql.push_str(&format!(" AND c.category = ?{}", values.len() + 1));
        values.push(Value::Text(category.clone()));
    }
    if let Some(min) = filter.min_price {
        sql.push_str(&format!(" AND c.price >= ?{}", values.len() + 1));
        values.push(Value::Real(min));
    }
    if let Some(max) = filter.max_price {
        sql.push_str(&format!(" AND c.price <= ?{}", values.len() + 1));
        values.push(Value::Real(max));
    }
    if let Some(rating) = filter.rating {
        sql.push_str(&format!(" AND c.rating >= ?{}", values.len() + 1));
        values.push(Value::Real(rating));
    }
    if let Some(teacher) = &filter.teacher {
        sql.push_str(&format!(" AND c.teacher_id = ?{}", values.len() + 1));
        values.push(Value::Text(teacher.clone()));
    }
    sql.push_str(" ORDER BY c.created_at");
    let mut stmt = conn.prepare(&sql)?;
    let mut courses = stmt
        .query_map(rusqlite::params_from_iter(values), row_to_course)?
        .collect::<Result<Vec<_>, _>>()?;
    for course in &mut courses {
        course.videos = load_videos(conn, &course.id)?;
    }
    Ok(courses)
}

/// Case-insensitive title substring search.
pub fn search_courses(conn: &Connection, title: &str) -> Result<Vec<Course>> {
    let sql = format!(
        "SELECT {COURSE_COLS} FROM courses c JOIN users u ON u.id = c.teacher_id \
         WHERE c.title LIKE ?1 ORDER BY c.created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let pattern = format!("%{}%", title);
    let mut courses = stmt
        .query_map([pattern], row_to_course)?
        .collect::<Result<Vec<_>, _>>()?;
    for course in &mut courses {
        course.videos = load_videos(conn, &course.id)?;
    }
    Ok(courses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth, db, model::Role};

    fn teacher(conn: &Connection) -> User {
        auth::create_user(conn, "prof", "prof@example.com", "h", Role::Teacher).unwrap()
    }

    fn student(conn: &Connection) -> User {
        auth::create_user(conn, "kid", "kid@example.com", "h", Role::Student).unwrap()
    }

    #[test]
    fn create_and_fetch() {
        let conn = db::init_db(":memory:").unwrap();
        let t = teacher(&conn);
        let c = create_course(
            &conn,
            &t,
            "Algebra",
            "Linear algebra basics",
            49.0,
            "math",
            None,
            Some("https://youtu.be/abc"),
        )
        .unwrap();
        let detail = get_course(&conn, &c.id.to_string()).unwrap().unwrap();
        assert_eq!(detail.course.title, "Algebra");
        assert_eq!(detail.course.teacher.username, "prof");
        assert_eq!(detail.course.videos, vec!["https://youtu.be/abc"]);
        assert!(detail.reviews.is_empty());
        assert!(get_course(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn update_appends_videos_in_order() {
        let conn = db::init_db(":memory:").unwrap();
        let t = teacher(&conn);
        let c = create_course(&conn, &t, "A", "d", 10.0, "math", None, None).unwrap();
        append_video(&conn, &c.id, "/uploads/videos/one").unwrap();
        append_video(&conn, &c.id, "/uploads/videos/two").unwrap();
        update_course(&conn, &c.id.to_string(), "B", "d2", 12.0, "cs", 4.0).unwrap();
        let detail = get_course(&conn, &c.id.to_string()).unwrap().unwrap();
        assert_eq!(detail.course.title, "B");
        assert_eq!(detail.course.price, 12.0);
        assert_eq!(
            detail.course.videos,
            vec!["/uploads/videos/one", "/uploads/videos/two"]
        );
        assert!(update_course(&conn, "missing", "B", "d", 1.0, "c", 0.0).is_err());
    }

    #[test]
    fn delete_removes_children() {
        let conn = db::init_db(":memory:").unwrap();
        let t = teacher(&conn);
        let s = student(&conn);
        let c = create_course(&conn, &t, "A", "d", 10.0, "math", None, Some("v")).unwrap();
        add_review(&conn, &c.id.to_string(), &s, 4.0, "good").unwrap();
        delete_course(&conn, &c.id.to_string()).unwrap();
        assert!(get_course(&conn, &c.id.to_string()).unwrap().is_none());
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM course_videos", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        assert!(delete_course(&conn, &c.id.to_string()).is_err());
    }

    #[test]
    fn review_recomputes_average() {
        let conn = db::init_db(":memory:").unwrap();
        let t = teacher(&conn);
        let s = student(&conn);
        let s2 = auth::create_user(&conn, "kid2", "kid2@example.com", "h", Role::Student).unwrap();
        let c = create_course(&conn, &t, "A", "d", 10.0, "math", None, None).unwrap();
        let detail = add_review(&conn, &c.id.to_string(), &s, 5.0, "great").unwrap();
        assert_eq!(detail.course.rating, 5.0);
        let detail = add_review(&conn, &c.id.to_string(), &s2, 2.0, "meh").unwrap();
        assert_eq!(detail.course.rating, 3.5);
        assert_eq!(detail.reviews.len(), 2);
        assert!(add_review(&conn, &c.id.to_string(), &s, 7.0, "nope").is_err());
    }

    #[test]
    fn filter_and_search() {
        let conn = db::init_db(":memory:").unwrap();
        let t = teacher(&conn);
        create_course(&conn, &t, "Algebra I", "d", 20.0, "math", Some(4.0), None).unwrap();
        create_course(&conn, &t, "Poetry", "d", 50.0, "arts", Some(2.0), None).unwrap();

        let filter = CourseFilter {
            category: Some("math".into()),
            ..Default::default()
        };
        let hits = filter_courses(&conn, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Algebra I");

        let filter = CourseFilter {
            min_price: Some(30.0),
            ..Default::default()
        };
        assert_eq!(filter_courses(&conn, &filter).unwrap()[0].title, "Poetry");

        let filter = CourseFilter {
            rating: Some(3.0),
            teacher: Some(t.id.to_string()),
            ..Default::default()
        };
        assert_eq!(
            filter_courses(&conn, &filter).unwrap()[0].title,
            "Algebra I"
        );

        let hits = search_courses(&conn, "algebra").unwrap();
        assert_eq!(hits.len(), 1);
        assert!(search_courses(&conn, "chemistry").unwrap().is_empty());
    }
}
