//! SQLite reading store: one database file holding the `sensor_data` table.
//!
//! WAL mode lets visualizer processes read while the ingestion session writes;
//! `busy_timeout` is the only coordination between writers. Every `write`
//! runs in autocommit mode, so a reading is durable once the call returns.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use crate::core::errors::{Result, TwinError};
use crate::ingest::reading::{Reading, TIMESTAMP_FORMAT, parse_timestamp};

/// A row of `sensor_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub id: i64,
    pub topic: String,
    /// Timestamp text exactly as stored.
    pub timestamp: String,
    pub value: f64,
}

impl StoredReading {
    /// Convert back to a [`Reading`], parsing the stored timestamp.
    pub fn to_reading(&self) -> Result<Reading> {
        Ok(Reading::new(
            self.topic.clone(),
            parse_timestamp(&self.timestamp)?,
            self.value,
        ))
    }
}

/// One SQLite database of readings.
pub struct ReadingStore {
    conn: Connection,
    path: PathBuf,
}

impl ReadingStore {
    /// Open (or create) the database at `path` and apply PRAGMAs.
    ///
    /// The schema is not touched; call [`ReadingStore::ensure_schema`].
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| TwinError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open and ensure the schema in one step.
    pub fn open_with_schema(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.ensure_schema()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create `sensor_data` and its topic index if missing. Idempotent.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sensor_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id TEXT,
                timestamp DATETIME,
                value REAL
            );
            CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_id
                ON sensor_data (sensor_id);",
        )?;
        Ok(())
    }

    /// Delete every row. Returns the number of rows removed.
    pub fn clear(&self) -> Result<u64> {
        let deleted = self.conn.execute("DELETE FROM sensor_data", [])?;
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }

    /// Insert one reading. Committed before returning.
    pub fn write(&self, reading: &Reading) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO sensor_data (sensor_id, timestamp, value) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![
                reading.topic,
                reading.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                reading.value,
            ])?;
        Ok(())
    }

    /// All rows for `topic`, oldest first. Empty when the topic has none.
    pub fn read_by_topic(&self, topic: &str) -> Result<Vec<StoredReading>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, sensor_id, timestamp, value FROM sensor_data
             WHERE sensor_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![topic], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The `limit` most recent rows for `topic`, oldest first.
    pub fn recent_by_topic(&self, topic: &str, limit: u32) -> Result<Vec<StoredReading>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, sensor_id, timestamp, value FROM (
                 SELECT id, sensor_id, timestamp, value FROM sensor_data
                 WHERE sensor_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![topic, limit], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent row for `topic`.
    pub fn latest(&self, topic: &str) -> Result<Option<StoredReading>> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT id, sensor_id, timestamp, value FROM sensor_data
                 WHERE sensor_id = ?1 ORDER BY id DESC LIMIT 1",
            )?
            .query_row(params![topic], map_row)
            .optional()?;
        Ok(row)
    }

    /// Distinct topics in order of first appearance.
    pub fn distinct_topics(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT sensor_id FROM sensor_data
             WHERE sensor_id IS NOT NULL
             GROUP BY sensor_id ORDER BY MIN(id) ASC",
        )?;
        let topics = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(topics)
    }

    /// Total row count.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sensor_data", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Whether WAL mode is active (diagnostics).
    #[must_use]
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        topic: row.get(1)?,
        timestamp: row.get(2)?,
        value: row.get(3)?,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[SLT-STORE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn temp_store() -> (tempfile::TempDir, ReadingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ReadingStore::open_with_schema(&dir.path().join("sensor_data.sqlite3")).unwrap();
        (dir, store)
    }

    pub(crate) fn reading(topic: &str, second: u32, value: f64) -> Reading {
        let ts = NaiveDate::from_ymd_opt(2024, 11, 5)
            .unwrap()
            .and_hms_opt(14, 0, second)
            .unwrap();
        Reading::new(topic, ts, value)
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let (_dir, store) = temp_store();
        store.write(&reading("T1", 0, 1.0)).unwrap();
        store.ensure_schema().unwrap();
        store.ensure_schema().unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn wal_mode_active() {
        let (_dir, store) = temp_store();
        assert!(store.is_wal_mode());
    }

    #[test]
    fn clear_empties_every_topic() {
        let (_dir, store) = temp_store();
        store.write(&reading("T1", 0, 1.0)).unwrap();
        store.write(&reading("T2", 1, 2.0)).unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.read_by_topic("T1").unwrap().is_empty());
        assert!(store.read_by_topic("T2").unwrap().is_empty());
        assert_eq!(store.clear().unwrap(), 0);
    }

    #[test]
    fn write_then_read_returns_the_reading_last() {
        let (_dir, store) = temp_store();
        store.write(&reading("T1", 0, 20.0)).unwrap();
        let written = reading("T1", 5, 23.5);
        store.write(&written).unwrap();

        let rows = store.read_by_topic("T1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);
        let last = rows.last().unwrap();
        assert_eq!(last.timestamp, "2024-11-05T14:00:05");
        assert_eq!(last.to_reading().unwrap(), written);
    }

    #[test]
    fn duplicate_topic_and_timestamp_are_allowed() {
        let (_dir, store) = temp_store();
        store.write(&reading("T1", 0, 1.0)).unwrap();
        store.write(&reading("T1", 0, 1.0)).unwrap();
        assert_eq!(store.read_by_topic("T1").unwrap().len(), 2);
    }

    #[test]
    fn unknown_topic_reads_empty() {
        let (_dir, store) = temp_store();
        assert!(store.read_by_topic("nothing").unwrap().is_empty());
        assert!(store.latest("nothing").unwrap().is_none());
    }

    #[test]
    fn recent_and_latest_follow_insertion_order() {
        let (_dir, store) = temp_store();
        for second in 0..5 {
            store
                .write(&reading("T1", second, f64::from(second)))
                .unwrap();
        }
        let recent = store.recent_by_topic("T1", 2).unwrap();
        assert_eq!(
            recent.iter().map(|r| r.value).collect::<Vec<_>>(),
            vec![3.0, 4.0]
        );
        assert!((store.latest("T1").unwrap().unwrap().value - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn distinct_topics_in_first_seen_order() {
        let (_dir, store) = temp_store();
        store.write(&reading("B", 0, 1.0)).unwrap();
        store.write(&reading("A", 1, 1.0)).unwrap();
        store.write(&reading("B", 2, 1.0)).unwrap();
        assert_eq!(
            store.distinct_topics().unwrap(),
            vec!["B".to_string(), "A".to_string()]
        );
    }

    #[test]
    fn second_connection_sees_committed_rows() {
        let (dir, store) = temp_store();
        store.write(&reading("T1", 0, 9.5)).unwrap();
        let reader = ReadingStore::open(&dir.path().join("sensor_data.sqlite3")).unwrap();
        assert_eq!(reader.read_by_topic("T1").unwrap().len(), 1);
    }
}
