//! SQLite store for sandbox snapshots.
//!
//! A restarted control plane reads this to find VMs that kept running.
//! The schema version lives in `PRAGMA user_version`; a database written by
//! a newer release is refused rather than guessed at.

mod schema;
mod snapshots;

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use hyperlite_shared::{HyperliteError, HyperliteResult};

pub use snapshots::{SnapshotRecord, SnapshotStore};

/// Map a rusqlite result into `HyperliteError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| HyperliteError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

// Snapshots are rewritten on every pod start, so every write is synced.
const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;
    PRAGMA busy_timeout=10000;
";

/// Shared SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> HyperliteResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        db_err!(conn.execute_batch(PRAGMAS))?;
        migrate(&conn)?;

        tracing::debug!(path = %db_path.display(), "Opened snapshot database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn migrate(conn: &Connection) -> HyperliteResult<()> {
    let version: i32 = db_err!(conn.query_row("PRAGMA user_version", [], |row| row.get(0)))?;

    if version > schema::SCHEMA_VERSION {
        return Err(HyperliteError::Database(format!(
            "database schema version {} is newer than supported {}",
            version,
            schema::SCHEMA_VERSION
        )));
    }
    if version == schema::SCHEMA_VERSION {
        return Ok(());
    }

    db_err!(conn.execute_batch(schema::SCHEMA))?;
    db_err!(conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION))?;
    tracing::info!(from = version, to = schema::SCHEMA_VERSION, "Migrated database schema");
    Ok(())
}
