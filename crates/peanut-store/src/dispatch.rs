use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::DispatchSession;

impl Database {
    pub fn get_dispatch_session(&self, id: &str) -> Result<DispatchSession> {
        self.conn()
            .query_row(
                "SELECT id, agent_id, model, peanuts, request_count, created_at, updated_at
                 FROM dispatch_sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Fold one dispatch outcome into the session's peanut counter,
    /// creating the row on first use.
    pub fn record_dispatch(
        &mut self,
        session_id: &str,
        agent_id: &str,
        model: &str,
        tokens_used: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchSession> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO dispatch_sessions
                 (id, agent_id, model, peanuts, request_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 agent_id = excluded.agent_id,
                 model = excluded.model,
                 peanuts = peanuts + excluded.peanuts,
                 request_count = request_count + 1,
                 updated_at = excluded.updated_at",
            params![session_id, agent_id, model, tokens_used, now.to_rfc3339()],
        )?;

        let session = tx.query_row(
            "SELECT id, agent_id, model, peanuts, request_count, created_at, updated_at
             FROM dispatch_sessions WHERE id = ?1",
            params![session_id],
            row_to_session,
        )?;

        tx.commit()?;
        Ok(session)
    }

    pub fn list_dispatch_sessions(&self) -> Result<Vec<DispatchSession>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, agent_id, model, peanuts, request_count, created_at, updated_at
             FROM dispatch_sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchSession> {
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

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

    Ok(DispatchSession {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        model: row.get(2)?,
        peanuts: row.get(3)?,
        request_count: row.get(4)?,
        created_at: parse(5, &created_str)?,
        updated_at: parse(6, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peanuts_accumulate() {
        let mut db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let first = db
            .record_dispatch("s1", "a1", "qwen2.5:7b", 120, now)
            .unwrap();
        assert_eq!(first.peanuts, 120);
        assert_eq!(first.request_count, 1);

        let second = db
            .record_dispatch("s1", "a2", "mistral:7b", 30, now)
            .unwrap();
        assert_eq!(second.peanuts, 150);
        assert_eq!(second.request_count, 2);
        assert_eq!(second.agent_id.as_deref(), Some("a2"));
    }

    #[test]
    fn sessions_are_separate() {
        let mut db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.record_dispatch("s1", "a1", "m", 10, now).unwrap();
        db.record_dispatch("s2", "a1", "m", 20, now).unwrap();

        assert_eq!(db.get_dispatch_session("s1").unwrap().peanuts, 10);
        assert_eq!(db.get_dispatch_session("s2").unwrap().peanuts, 20);
        assert_eq!(db.list_dispatch_sessions().unwrap().len(), 2);
    }

    #[test]
    fn missing_session_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_dispatch_session("nope"),
            Err(StoreError::NotFound)
        ));
    }
}
