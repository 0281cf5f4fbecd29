use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::model::{Role, User};

/// Lifetime of issued tokens. No refresh flow; a token is valid until it
/// expires.
pub const TOKEN_TTL: Duration = Duration::hours(1);

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| anyhow!(e))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims carried by issued tokens: the user id, their role and expiry.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

/// Issue a token for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user_id: &str, role: Role, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.into(),
        role,
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a token and return its claims if valid and unexpired.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Insert a new user. Fails with `duplicate_email` when the email is taken.
pub fn create_user(
    conn: &Connection,
    username: &str,
    email: &str,
    password_hash: &str,
    role: Role,
) -> Result<User> {
    let id = Uuid::new_v4();
    let res = conn.execute(
        "INSERT INTO users (id, username, email, password_hash, role) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), username, email, password_hash, role.as_str()],
    );
    match res {
        Ok(_) => Ok(User {
            id,
            username: username.into(),
            email: email.into(),
            role,
        }),
        Err(e) => {
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) {
                Err(anyhow!("duplicate_email"))
            } else {
                Err(e.into())
            }
        }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        username: row.get(1)?,
        email: row.get(2)?,
        role: Role::parse(row.get::<_, String>(3)?.as_str()).unwrap_or(Role::Student),
    })
}

/// Look up a user by email, returning the stored password hash alongside.
pub fn find_user_by_email(conn: &Connection, email: &str) -> Result<Option<(User, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, email, role, password_hash FROM users WHERE email = ?1",
    )?;
    let found = stmt
        .query_row([email], |row| {
            let user = row_to_user(row)?;
            let hash: String = row.get(4)?;
            Ok((user, hash))
        })
        .optional()?;
    Ok(found)
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    let mut stmt = conn.prepare("SELECT id, username, email, role FROM users WHERE id = ?1")?;
    let user = stmt.query_row([id], row_to_user).optional()?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hash));
        assert!(!verify_password("bad", &hash));
    }

    #[test]
    fn jwt_issue_and_verify() {
        let secret = b"secret";
        let token = issue_jwt(secret, "user-1", Role::Teacher, Duration::seconds(60)).unwrap();
        let claims = verify_jwt(secret, &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, Role::Teacher);
    }

    #[test]
    fn jwt_expiry() {
        let secret = b"secret";
        let token = issue_jwt(secret, "user-1", Role::Student, Duration::seconds(-120)).unwrap();
        assert!(verify_jwt(secret, &token).is_err());
    }

    #[test]
    fn jwt_wrong_secret_rejected() {
        let token = issue_jwt(b"one", "user-1", Role::Student, Duration::seconds(60)).unwrap();
        assert!(verify_jwt(b"two", &token).is_err());
    }

    #[test]
    fn unique_email() {
        let conn = db::init_db(":memory:").unwrap();
        create_user(&conn, "alice", "alice@example.com", "h", Role::Student).unwrap();
        let err = create_user(&conn, "other", "alice@example.com", "h", Role::Teacher);
        assert_eq!(err.unwrap_err().to_string(), "duplicate_email");
    }

    #[test]
    fn lookup_round_trip() {
        let conn = db::init_db(":memory:").unwrap();
        let created = create_user(&conn, "bob", "bob@example.com", "hash", Role::Teacher).unwrap();
        let (user, hash) = find_user_by_email(&conn, "bob@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(user.id, created.id);
        assert_eq!(user.role, Role::Teacher);
        assert_eq!(hash, "hash");
        assert!(find_user_by_email(&conn, "nobody@example.com")
            .unwrap()
            .is_none());
        let by_id = get_user(&conn, &created.id.to_string()).unwrap().unwrap();
        assert_eq!(by_id.username, "bob");
    }
}
