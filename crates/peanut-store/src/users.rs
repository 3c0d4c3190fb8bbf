use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Role, User};

impl Database {
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, email, display_name, password_hash, role, totp_secret,
                                    totp_enabled, backup_codes, created_at, updated_at, last_login_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    user.id,
                    user.email.to_lowercase(),
                    user.display_name,
                    user.password_hash,
                    user.role.as_str(),
                    user.totp_secret,
                    user.totp_enabled,
                    serde_json::to_string(&user.backup_codes)?,
                    user.created_at.to_rfc3339(),
                    user.updated_at.to_rfc3339(),
                    user.last_login_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DuplicateEmail
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email.to_lowercase()],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Whole-row replacement; entities are immutable snapshots.
    pub fn update_user(&self, user: &User) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users
             SET display_name = ?2, password_hash = ?3, role = ?4, totp_secret = ?5,
                 totp_enabled = ?6, backup_codes = ?7, updated_at = ?8, last_login_at = ?9
             WHERE id = ?1",
            params![
                user.id,
                user.display_name,
                user.password_hash,
                user.role.as_str(),
                user.totp_secret,
                user.totp_enabled,
                serde_json::to_string(&user.backup_codes)?,
                user.updated_at.to_rfc3339(),
                user.last_login_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn count_users(&self) -> Result<u64> {
        let count: u64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }
}

const USER_COLUMNS: &str = "id, email, display_name, password_hash, role, totp_secret, \
                            totp_enabled, backup_codes, created_at, updated_at, last_login_at";

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(4)?;
    let backup_json: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;
    let last_login_str: Option<String> = row.get(10)?;

    let role = Role::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown role: {role_str}").into(),
        )
    })?;
    let backup_codes: Vec<String> = serde_json::from_str(&backup_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        password_hash: row.get(3)?,
        role,
        totp_secret: row.get(5)?,
        totp_enabled: row.get(6)?,
        backup_codes,
        created_at: parse_ts(8, &created_str)?,
        updated_at: parse_ts(9, &updated_str)?,
        last_login_at: last_login_str.as_deref().map(|s| parse_ts(10, s)).transpose()?,
    })
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
