//! Audit log persistence.
//!
//! The append runs latest-fingerprint lookup and insert inside one
//! transaction so concurrent writers cannot observe the same predecessor
//! and fork the chain.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{AuditEntry, AuditFilter};

impl Database {
    /// Append one entry. The builder receives the current chain head
    /// fingerprint (or `GENESIS` handling is up to the caller via `None`)
    /// and must return the fully fingerprinted entry to insert.
    pub fn append_audit<F>(&mut self, build: F) -> Result<AuditEntry>
    where
        F: FnOnce(Option<String>) -> AuditEntry,
    {
        let tx = self.conn_mut().transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT fingerprint FROM audit_log ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let entry = build(previous);

        tx.execute(
            "INSERT INTO audit_log (id, action, actor_user_id, actor_email, ip, user_agent,
                                    resource_type, resource_id, details, previous_fingerprint,
                                    fingerprint, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.id,
                entry.action,
                entry.actor_user_id,
                entry.actor_email,
                entry.ip,
                entry.user_agent,
                entry.resource_type,
                entry.resource_id,
                serde_json::to_string(&entry.details)?,
                entry.previous_fingerprint,
                entry.fingerprint,
                entry.timestamp_iso(),
            ],
        )?;

        tx.commit()?;
        Ok(entry)
    }

    /// Filtered page of entries, newest first, plus the total match count.
    pub fn query_audit(
        &self,
        filter: &AuditFilter,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<AuditEntry>, u64)> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(actor) = &filter.actor_id {
            clauses.push("actor_user_id = ?");
            args.push(actor.clone());
        }
        if let Some(action) = &filter.action {
            clauses.push("action = ?");
            args.push(action.clone());
        }
        if let Some(rtype) = &filter.resource_type {
            clauses.push("resource_type = ?");
            args.push(rtype.clone());
        }
        if let Some(from) = &filter.from {
            clauses.push("timestamp >= ?");
            args.push(from.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        if let Some(to) = &filter.to {
            clauses.push("timestamp <= ?");
            args.push(to.to_rfc3339_opts(SecondsFormat::Micros, true));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: u64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM audit_log {where_sql}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT id, action, actor_user_id, actor_email, ip, user_agent, resource_type,
                    resource_id, details, previous_fingerprint, fingerprint, timestamp
             FROM audit_log {where_sql}
             ORDER BY timestamp DESC, rowid DESC
             LIMIT {limit} OFFSET {offset}"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_entry)?;
        let entries = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)?;

        Ok((entries, total))
    }

    /// Current chain head, if any.
    pub fn latest_audit_fingerprint(&self) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT fingerprint FROM audit_log ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Sqlite(other)),
            })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let details_json: String = row.get(8)?;
    let ts_str: String = row.get(11)?;

    let details: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&details_json)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AuditEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        actor_user_id: row.get(2)?,
        actor_email: row.get(3)?,
        ip: row.get(4)?,
        user_agent: row.get(5)?,
        resource_type: row.get(6)?,
        resource_id: row.get(7)?,
        details,
        previous_fingerprint: row.get(9)?,
        fingerprint: row.get(10)?,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(db: &mut Database, action: &str) -> AuditEntry {
        db.append_audit(|prev| AuditEntry {
            id: format!("id-{action}-{}", prev.as_deref().unwrap_or("genesis").len()),
            action: action.into(),
            actor_user_id: Some("u1".into()),
            actor_email: None,
            ip: None,
            user_agent: None,
            resource_type: Some("agent".into()),
            resource_id: None,
            details: serde_json::Map::new(),
            previous_fingerprint: prev.unwrap_or_else(|| "GENESIS".into()),
            fingerprint: format!("fp-{action}"),
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn append_links_to_previous() {
        let mut db = Database::open_in_memory().unwrap();

        let first = push(&mut db, "auth.login");
        assert_eq!(first.previous_fingerprint, "GENESIS");

        let second = push(&mut db, "agent.created");
        assert_eq!(second.previous_fingerprint, first.fingerprint);

        assert_eq!(
            db.latest_audit_fingerprint().unwrap().as_deref(),
            Some(second.fingerprint.as_str())
        );
    }

    #[test]
    fn query_orders_and_filters() {
        let mut db = Database::open_in_memory().unwrap();
        push(&mut db, "auth.login");
        push(&mut db, "agent.created");
        push(&mut db, "agent.created");

        let (all, total) = db.query_audit(&AuditFilter::default(), 50, 0).unwrap();
        assert_eq!(total, 3);
        assert_eq!(all.len(), 3);
        // Newest first.
        assert!(all[0].timestamp >= all[2].timestamp);

        let filter = AuditFilter {
            action: Some("agent.created".into()),
            ..Default::default()
        };
        let (filtered, total) = db.query_audit(&filter, 50, 0).unwrap();
        assert_eq!(total, 2);
        assert!(filtered.iter().all(|e| e.action == "agent.created"));
    }

    #[test]
    fn pagination() {
        let mut db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            push(&mut db, &format!("user.created{i}"));
        }

        let (page, total) = db.query_audit(&AuditFilter::default(), 2, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn time_range_filter() {
        let mut db = Database::open_in_memory().unwrap();
        let before = Utc::now();
        push(&mut db, "auth.login");
        let after = Utc::now();

        let hit = AuditFilter {
            from: Some(before),
            to: Some(after),
            ..Default::default()
        };
        assert_eq!(db.query_audit(&hit, 50, 0).unwrap().1, 1);

        let miss = AuditFilter {
            to: Some(before - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(db.query_audit(&miss, 50, 0).unwrap().1, 0);
    }
}
