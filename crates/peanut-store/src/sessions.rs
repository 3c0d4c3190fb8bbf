use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Session;

impl Database {
    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sessions (id, user_id, created_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.user_id,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                session.revoked,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        self.conn()
            .query_row(
                "SELECT id, user_id, created_at, expires_at, revoked
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn revoke_session(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("UPDATE sessions SET revoked = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drop expired rows. Called opportunistically when minting a session.
    pub fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created_str: String = row.get(2)?;
    let expires_str: String = row.get(3)?;

    let parse = |idx: usize, s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    };

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: parse(2, &created_str)?,
        expires_at: parse(3, &expires_str)?,
        revoked: row.get(4)?,
    })
}
