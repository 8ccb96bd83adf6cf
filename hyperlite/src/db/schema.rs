pub const SCHEMA_VERSION: i32 = 1;

/// One row per sandbox whose pod reached `Running`.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sandbox_snapshots (
    sandbox_id TEXT PRIMARY KEY NOT NULL,
    pid INTEGER NOT NULL,
    snapshot BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";
