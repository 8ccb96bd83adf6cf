//! Persisted sandbox snapshots.

use super::{Database, db_err};
use chrono::{DateTime, Utc};
use hyperlite_shared::{HyperliteError, HyperliteResult};
use rusqlite::{OptionalExtension, Row, params};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub sandbox_id: String,
    pub pid: u32,
    pub snapshot: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, u32, Vec<u8>, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn parse(raw: (String, u32, Vec<u8>, String)) -> HyperliteResult<Self> {
        let (sandbox_id, pid, snapshot, updated_at) = raw;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| {
                HyperliteError::Database(format!(
                    "bad timestamp for sandbox {}: {}",
                    sandbox_id, e
                ))
            })?
            .with_timezone(&Utc);
        Ok(Self {
            sandbox_id,
            pid,
            snapshot,
            updated_at,
        })
    }
}

/// Snapshot table access.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Database,
}

impl SnapshotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the snapshot of a sandbox.
    pub fn save(&self, sandbox_id: &str, pid: u32, snapshot: &[u8]) -> HyperliteResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO sandbox_snapshots (sandbox_id, pid, snapshot, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(sandbox_id) DO UPDATE SET
                pid = excluded.pid,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
            params![sandbox_id, pid, snapshot, now],
        ))?;
        tracing::debug!(sandbox_id, pid, bytes = snapshot.len(), "Saved sandbox snapshot");
        Ok(())
    }

    pub fn load(&self, sandbox_id: &str) -> HyperliteResult<Option<SnapshotRecord>> {
        let conn = self.db.conn();
        let raw = db_err!(
            conn.query_row(
                "SELECT sandbox_id, pid, snapshot, updated_at
                 FROM sandbox_snapshots WHERE sandbox_id = ?1",
                params![sandbox_id],
                SnapshotRecord::from_row,
            )
            .optional()
        )?;
        raw.map(SnapshotRecord::parse).transpose()
    }

    /// Remove a snapshot. Returns whether one existed.
    pub fn delete(&self, sandbox_id: &str) -> HyperliteResult<bool> {
        let conn = self.db.conn();
        let rows = db_err!(conn.execute(
            "DELETE FROM sandbox_snapshots WHERE sandbox_id = ?1",
            params![sandbox_id],
        ))?;
        Ok(rows > 0)
    }

    /// All snapshots, oldest sandbox first.
    pub fn list(&self) -> HyperliteResult<Vec<SnapshotRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT sandbox_id, pid, snapshot, updated_at
             FROM sandbox_snapshots ORDER BY sandbox_id"
        ))?;
        let rows = db_err!(stmt.query_map([], SnapshotRecord::from_row))?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(SnapshotRecord::parse(db_err!(raw)?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SnapshotStore) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(&temp_dir.path().join("test.db")).unwrap();
        (temp_dir, SnapshotStore::new(db))
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = store();
        assert!(store.load("01A").unwrap().is_none());

        store.save("01A", 42, b"{\"v\":1}").unwrap();
        let record = store.load("01A").unwrap().unwrap();
        assert_eq!(record.pid, 42);
        assert_eq!(record.snapshot, b"{\"v\":1}");
    }

    #[test]
    fn test_save_replaces_existing() {
        let (_dir, store) = store();
        store.save("01A", 42, b"old").unwrap();
        store.save("01A", 43, b"new").unwrap();

        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 43);
        assert_eq!(records[0].snapshot, b"new");
    }

    #[test]
    fn test_delete_and_list_order() {
        let (_dir, store) = store();
        store.save("01B", 2, b"b").unwrap();
        store.save("01A", 1, b"a").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.sandbox_id).collect();
        assert_eq!(ids, vec!["01A", "01B"]);

        assert!(store.delete("01A").unwrap());
        assert!(!store.delete("01A").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
