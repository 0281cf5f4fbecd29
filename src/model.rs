use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account role. Teachers own courses and rooms; students buy courses,
/// review them and join rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

/// Minimal user shape joined into course and review listings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    pub rating: f64,
    pub created_at: i64,
    pub teacher: UserRef,
    pub videos: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Review {
    pub id: Uuid,
    pub rating: f64,
    pub comment: String,
    pub created_at: i64,
    pub student: UserRef,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CourseDetail {
    #[serde(flatten)]
    pub course: Course,
    pub reviews: Vec<Review>,
}

/// Course shape joined into cart listings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CourseRef {
    pub id: Uuid,
    pub title: String,
    pub price: f64,
    pub teacher_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CartEntry {
    pub user_id: Uuid,
    pub course: CourseRef,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub teacher_id: String,
    pub students: Vec<String>,
    pub created_at: i64,
}

/// One entry of a room's embedded message log, appended by the gateway.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub text: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoomDetail {
    #[serde(flatten)]
    pub room: Room,
    pub messages: Vec<RoomMessage>,
}

/// A message in the top-level chat collection, written over REST.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: i64,
}
