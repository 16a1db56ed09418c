//! Database schema initialization

use sqlx::SqlitePool;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions (one row per file_id)
CREATE TABLE IF NOT EXISTS upload_sessions (
    file_id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    expected_total_chunks INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'initiated',
    expected_filename TEXT NOT NULL,
    category TEXT NOT NULL,
    expected_checksum TEXT,
    final_checksum TEXT,
    final_key TEXT,
    final_size INTEGER,
    chunks_released INTEGER NOT NULL DEFAULT 0,
    -- RFC 3339 with fixed microsecond precision, so text order is time order
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_activity ON upload_sessions(last_activity_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner ON upload_sessions(owner_id);

-- Accepted chunks
CREATE TABLE IF NOT EXISTS upload_chunks (
    file_id TEXT NOT NULL REFERENCES upload_sessions(file_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    received_at TEXT NOT NULL,

    PRIMARY KEY (file_id, chunk_index)
);
"#;
