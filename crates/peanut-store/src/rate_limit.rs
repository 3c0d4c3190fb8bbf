//! Rate-limit window counters.
//!
//! One row per `(key, window_start)` bucket. The increment and the read
//! happen in the same transaction; stale buckets for the key are pruned
//! first so the table stays bounded without a sweeper task.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

fn iso_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap_or_default())
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    /// Prune this key's buckets older than `prune_before_ms`, then bump the
    /// counter for `window_start_ms` and return its new value.
    pub fn increment_rate_window(
        &mut self,
        key: &str,
        window_start_ms: i64,
        prune_before_ms: i64,
    ) -> Result<u64> {
        let window_start = iso_ms(window_start_ms);
        let prune_before = iso_ms(prune_before_ms);

        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "DELETE FROM rate_limit_windows WHERE key = ?1 AND window_start < ?2",
            params![key, prune_before],
        )?;

        tx.execute(
            "INSERT INTO rate_limit_windows (key, window_start, count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(key, window_start) DO UPDATE SET count = count + 1",
            params![key, window_start],
        )?;

        let count: u64 = tx.query_row(
            "SELECT count FROM rate_limit_windows WHERE key = ?1 AND window_start = ?2",
            params![key, window_start],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(count)
    }

    #[cfg(test)]
    fn rate_window_rows(&self, key: &str) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn().prepare(
            "SELECT window_start, count FROM rate_limit_windows WHERE key = ?1 ORDER BY window_start",
        )?;
        let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_within_window() {
        let mut db = Database::open_in_memory().unwrap();

        for expected in 1..=5 {
            let count = db
                .increment_rate_window("login:1.2.3.4", 60_000, 0)
                .unwrap();
            assert_eq!(count, expected);
        }
    }

    #[test]
    fn windows_are_independent() {
        let mut db = Database::open_in_memory().unwrap();

        assert_eq!(db.increment_rate_window("k", 0, -600_000).unwrap(), 1);
        assert_eq!(db.increment_rate_window("k", 60_000, -540_000).unwrap(), 1);
        assert_eq!(db.increment_rate_window("other", 0, -600_000).unwrap(), 1);
    }

    #[test]
    fn stale_windows_are_pruned() {
        let mut db = Database::open_in_memory().unwrap();

        db.increment_rate_window("k", 0, -600_000).unwrap();
        // Ten windows later the first bucket falls out of retention.
        db.increment_rate_window("k", 660_000, 60_000).unwrap();

        let rows = db.rate_window_rows("k").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 1);
    }

    #[test]
    fn prune_leaves_other_keys_alone() {
        let mut db = Database::open_in_memory().unwrap();

        db.increment_rate_window("a", 0, -600_000).unwrap();
        db.increment_rate_window("b", 660_000, 60_000).unwrap();

        assert_eq!(db.rate_window_rows("a").unwrap().len(), 1);
    }
}
