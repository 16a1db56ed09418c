//! SQLite-backed session registry
//!
//! Mutations are serialized through an in-process lock and each one runs in
//! a single transaction, so a session row and its chunk rows always change
//! together.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;

use super::registry::{apply_chunk, apply_merge, apply_transition, SessionRegistry};
use super::types::{
    ChunkOutcome, ChunkPolicy, ChunkRecord, FinalArtifact, NewSession, SessionStatus,
    UploadError, UploadSession,
};

/// Repository for upload session persistence
pub struct SqliteRegistry {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteRegistry {
    /// Wrap a pool whose schema has already been initialized
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load(
        conn: &mut SqliteConnection,
        file_id: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT file_id, owner_id, expected_total_chunks, status,
                   expected_filename, category, expected_checksum,
                   final_checksum, final_key, final_size, chunks_released,
                   created_at, last_activity_at
            FROM upload_sessions
            WHERE file_id = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let chunks = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT chunk_index, size, checksum, received_at
            FROM upload_chunks
            WHERE file_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(file_id)
        .fetch_all(&mut *conn)
        .await?;

        row.into_session(chunks).map(Some)
    }

    async fn load_required(
        conn: &mut SqliteConnection,
        file_id: &str,
    ) -> Result<UploadSession, UploadError> {
        Self::load(conn, file_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))
    }

    async fn update_session(
        conn: &mut SqliteConnection,
        session: &UploadSession,
    ) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            UPDATE upload_sessions SET
                status = ?,
                final_checksum = ?,
                final_key = ?,
                final_size = ?,
                chunks_released = ?,
                last_activity_at = ?
            WHERE file_id = ?
            "#,
        )
        .bind(session.status.as_str())
        .bind(&session.final_checksum)
        .bind(&session.final_key)
        .bind(session.final_size.map(|s| s as i64))
        .bind(session.chunks_released)
        .bind(format_timestamp(session.last_activity_at))
        .bind(&session.file_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionRegistry for SqliteRegistry {
    async fn create_or_get(&self, request: &NewSession) -> Result<(UploadSession, bool), UploadError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;

        let session = UploadSession::new(request, Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                file_id, owner_id, expected_total_chunks, status,
                expected_filename, category, expected_checksum,
                chunks_released, created_at, last_activity_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(file_id) DO NOTHING
            "#,
        )
        .bind(&session.file_id)
        .bind(&session.owner_id)
        .bind(session.expected_total_chunks as i64)
        .bind(session.status.as_str())
        .bind(&session.expected_filename)
        .bind(&session.category)
        .bind(&session.expected_checksum)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.last_activity_at))
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        let stored = Self::load_required(&mut conn, &request.file_id).await?;
        Ok((stored, inserted))
    }

    async fn record_chunk(
        &self,
        file_id: &str,
        index: u32,
        size: u64,
        checksum: &str,
        policy: ChunkPolicy,
    ) -> Result<(ChunkOutcome, UploadSession), UploadError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut session = Self::load_required(&mut tx, file_id).await?;
        let now = Utc::now();
        let outcome = apply_chunk(&mut session, index, size, checksum, policy, now)?;

        if outcome == ChunkOutcome::Accepted {
            sqlx::query(
                r#"
                INSERT INTO upload_chunks (file_id, chunk_index, size, checksum, received_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(file_id, chunk_index) DO UPDATE SET
                    size = excluded.size,
                    checksum = excluded.checksum,
                    received_at = excluded.received_at
                "#,
            )
            .bind(file_id)
            .bind(index as i64)
            .bind(size as i64)
            .bind(checksum)
            .bind(format_timestamp(now))
            .execute(&mut *tx)
            .await?;

            Self::update_session(&mut tx, &session).await?;
            tx.commit().await?;
        }

        Ok((outcome, session))
    }

    async fn get(&self, file_id: &str) -> Result<Option<UploadSession>, UploadError> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, file_id).await
    }

    async fn transition(&self, file_id: &str, next: SessionStatus) -> Result<UploadSession, UploadError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut session = Self::load_required(&mut tx, file_id).await?;
        apply_transition(&mut session, next)?;
        Self::update_session(&mut tx, &session).await?;
        tx.commit().await?;

        Ok(session)
    }

    async fn complete_merge(
        &self,
        file_id: &str,
        artifact: &FinalArtifact,
        chunks_released: bool,
    ) -> Result<UploadSession, UploadError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut session = Self::load_required(&mut tx, file_id).await?;
        apply_merge(&mut session, artifact, chunks_released)?;
        Self::update_session(&mut tx, &session).await?;
        tx.commit().await?;

        Ok(session)
    }

    async fn mark_chunks_released(&self, file_id: &str) -> Result<(), UploadError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE upload_sessions SET chunks_released = 1 WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, UploadError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT file_id FROM upload_sessions
            WHERE status = 'failed'
               OR (status = 'merged' AND chunks_released = 0)
               OR (status IN ('initiated', 'in_progress', 'complete_pending_merge')
                   AND last_activity_at < ?)
            ORDER BY last_activity_at ASC
            "#,
        )
        .bind(format_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for (file_id,) in ids {
            if let Some(session) = Self::load(&mut conn, &file_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn remove(&self, file_id: &str) -> Result<bool, UploadError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM upload_chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM upload_sessions WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(removed > 0)
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    file_id: String,
    owner_id: String,
    expected_total_chunks: i64,
    status: String,
    expected_filename: String,
    category: String,
    expected_checksum: Option<String>,
    final_checksum: Option<String>,
    final_key: Option<String>,
    final_size: Option<i64>,
    chunks_released: bool,
    created_at: String,
    last_activity_at: String,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    chunk_index: i64,
    size: i64,
    checksum: String,
    received_at: String,
}

impl SessionRow {
    fn into_session(self, chunks: Vec<ChunkRow>) -> Result<UploadSession, UploadError> {
        let received = chunks
            .into_iter()
            .map(|c| {
                Ok((
                    c.chunk_index as u32,
                    ChunkRecord {
                        size: c.size as u64,
                        checksum: c.checksum,
                        received_at: parse_timestamp(&c.received_at)?,
                    },
                ))
            })
            .collect::<Result<_, UploadError>>()?;

        Ok(UploadSession {
            file_id: self.file_id,
            owner_id: self.owner_id,
            expected_total_chunks: self.expected_total_chunks as u32,
            received,
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            last_activity_at: parse_timestamp(&self.last_activity_at)?,
            expected_filename: self.expected_filename,
            category: self.category,
            expected_checksum: self.expected_checksum,
            final_checksum: self.final_checksum,
            final_key: self.final_key,
            final_size: self.final_size.map(|s| s as u64),
            chunks_released: self.chunks_released,
        })
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| UploadError::Database(format!("invalid timestamp {:?}: {}", value, e)))
}

// ============================================================================
// Tests
// ============================================================================
