//! Date-keyed snapshot table on SQLite.

use std::path::{Path, PathBuf};

use bostad_core::Snapshot;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL UNIQUE,
    for_sale INTEGER NOT NULL,
    soon_to_be_sold INTEGER NOT NULL,
    secondary_for_sale INTEGER,
    secondary_coming INTEGER,
    recorded_at TEXT NOT NULL
);
";

const COLUMNS: &str =
    "date, for_sale, soon_to_be_sold, secondary_for_sale, secondary_coming, recorded_at";

/// Durable snapshot table. One live row per date; writes replace the whole row.
#[derive(Debug)]
pub struct SnapshotStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Open (or create) the store file, creating the parent directory and
    /// schema when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "snapshot store opened");
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert, or replace every column of the row with the same date.
    ///
    /// Optional fields absent from `snapshot` are written as NULL even if the
    /// existing row had them.
    pub fn upsert(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO snapshots (date, for_sale, soon_to_be_sold, secondary_for_sale, secondary_coming, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(date) DO UPDATE SET
                for_sale = excluded.for_sale,
                soon_to_be_sold = excluded.soon_to_be_sold,
                secondary_for_sale = excluded.secondary_for_sale,
                secondary_coming = excluded.secondary_coming,
                recorded_at = excluded.recorded_at",
            params![
                snapshot.date,
                snapshot.for_sale,
                snapshot.soon_to_be_sold,
                snapshot.secondary_for_sale,
                snapshot.secondary_coming,
                snapshot.recorded_at,
            ],
        )?;
        Ok(())
    }

    /// Snapshots with `date >= start`, oldest first.
    pub fn since(&self, start: NaiveDate) -> Result<Vec<Snapshot>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM snapshots WHERE date >= ?1 ORDER BY date ASC"
        ))?;
        let rows = stmt.query_map(params![start], map_snapshot_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every snapshot, newest first.
    pub fn all(&self) -> Result<Vec<Snapshot>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM snapshots ORDER BY date DESC"))?;
        let rows = stmt.query_map([], map_snapshot_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM snapshots ORDER BY date DESC LIMIT 1"),
                [],
                map_snapshot_row,
            )
            .optional()?)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    /// Release the connection. Dropping also closes, but this surfaces the error.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_conn, err)| StoreError::Sqlite(err))
    }
}

fn map_snapshot_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        date: row.get(0)?,
        for_sale: row.get(1)?,
        soon_to_be_sold: row.get(2)?,
        secondary_for_sale: row.get(3)?,
        secondary_coming: row.get(4)?,
        recorded_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn snap(date: &str, for_sale: u64, soon: u64) -> Snapshot {
        Snapshot {
            date: day(date),
            for_sale,
            soon_to_be_sold: soon,
            secondary_for_sale: None,
            secondary_coming: None,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).single().expect("ts"),
        }
    }

    #[test]
    fn empty_store_has_no_latest() {
        let store = SnapshotStore::open_in_memory().expect("store");
        assert_eq!(store.latest().expect("latest"), None);
        assert!(store.all().expect("all").is_empty());
        assert!(store.since(day("2024-01-01")).expect("since").is_empty());
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let store = SnapshotStore::open_in_memory().expect("store");
        let s = snap("2024-03-01", 41_000, 5_000);
        store.upsert(&s).expect("first");
        let after_one = store.all().expect("all");
        store.upsert(&s).expect("second");
        let after_two = store.all().expect("all");

        assert_eq!(after_one, after_two);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn later_write_replaces_rather_than_merges() {
        let store = SnapshotStore::open_in_memory().expect("store");
        let mut first = snap("2024-03-01", 5, 9);
        first.secondary_coming = Some(44);
        store.upsert(&first).expect("first");

        let mut second = snap("2024-03-01", 7, 9);
        second.secondary_for_sale = Some(3);
        store.upsert(&second).expect("second");

        let latest = store.latest().expect("latest").expect("row");
        assert_eq!(latest.for_sale, 7);
        assert_eq!(latest.soon_to_be_sold, 9);
        assert_eq!(latest.secondary_for_sale, Some(3));
        assert_eq!(latest.secondary_coming, None);
        assert_eq!(store.since(day("2024-03-01")).expect("since"), vec![second]);
    }

    #[test]
    fn since_filters_and_orders_ascending() {
        let store = SnapshotStore::open_in_memory().expect("store");
        for date in ["2024-01-10", "2024-01-01", "2024-01-03"] {
            store.upsert(&snap(date, 1, 1)).expect("upsert");
        }

        let dates: Vec<_> = store
            .since(day("2024-01-02"))
            .expect("since")
            .into_iter()
            .map(|s| s.date_key())
            .collect();
        assert_eq!(dates, vec!["2024-01-03", "2024-01-10"]);

        let all: Vec<_> = store
            .all()
            .expect("all")
            .into_iter()
            .map(|s| s.date_key())
            .collect();
        assert_eq!(all, vec!["2024-01-10", "2024-01-03", "2024-01-01"]);
        assert_eq!(
            store.latest().expect("latest").map(|s| s.date_key()),
            Some("2024-01-10".to_string())
        );
    }

    #[test]
    fn open_creates_directory_and_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("data").join("snapshots.db");

        let store = SnapshotStore::open(&path).expect("open");
        store.upsert(&snap("2024-05-05", 40_100, 4_900)).expect("upsert");
        store.close().expect("close");
        assert!(path.exists());

        let reopened = SnapshotStore::open(&path).expect("reopen");
        let latest = reopened.latest().expect("latest").expect("row");
        assert_eq!(latest.date_key(), "2024-05-05");
        assert_eq!(latest.for_sale, 40_100);
        assert_eq!(latest.recorded_at, snap("2024-05-05", 0, 0).recorded_at);
    }
}
