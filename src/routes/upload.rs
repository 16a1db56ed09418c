//! Upload Routes
//!
//! HTTP endpoints for chunked, resumable uploads.
//!
//! Endpoints:
//! - POST /upload/init - Register an upload
//! - POST /upload/chunked - Upload one chunk (multipart)
//! - GET /upload/status/:file_id - Which chunks the server holds
//! - POST /upload/merge/:file_id - Assemble the final file
//! - DELETE /upload/:file_id - Abort an upload
//! - POST /upload/cleanup - Reclaim stale sessions

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::{
    ChunkOutcome, ChunkReceipt, ChunkUpload, FinalArtifact, NewSession, SweepReport,
    UploadError, UploadStatus,
};

/// Header carrying the authenticated caller
pub const OWNER_HEADER: &str = "x-owner-id";

/// Room for the non-chunk multipart fields
const FORM_OVERHEAD: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Owner Extraction
// ============================================================================

/// Caller identity set by the authentication layer in front of this service
pub struct OwnerId(pub String);

pub struct MissingOwner;

impl IntoResponse for MissingOwner {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: format!("Missing {} header", OWNER_HEADER),
            code: "UNAUTHENTICATED".to_string(),
        });
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = MissingOwner;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| OwnerId(value.to_string()))
            .ok_or(MissingOwner)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_size: usize) -> Router<AppState> {
    Router::new()
        .route("/init", post(register_upload))
        .route("/chunked", post(upload_chunk))
        .route("/status/:file_id", get(upload_status))
        .route("/merge/:file_id", post(merge_upload))
        .route("/cleanup", post(cleanup))
        .route("/:file_id", delete(abort_upload))
        .layer(DefaultBodyLimit::max(max_chunk_size.saturating_add(FORM_OVERHEAD)))
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub file_id: String,
    pub total_chunks: u32,
    pub filename: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub file_checksum: Option<String>,
}

/// Status reply; `received_chunks` mirrors `received_indices` for older clients
#[derive(Serialize)]
struct StatusResponse {
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    received_chunks: Option<Vec<u32>>,
    #[serde(flatten)]
    status: Option<UploadStatus>,
}

#[derive(Serialize)]
struct MergeResponse {
    message: String,
    #[serde(flatten)]
    artifact: FinalArtifact,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    pub ttl_secs: Option<u64>,
}

/// Multipart fields of a chunk upload
#[derive(Default)]
struct ChunkForm {
    fields: HashMap<String, String>,
    data: Option<Bytes>,
}

impl ChunkForm {
    fn required(&mut self, name: &str) -> Result<String, UploadError> {
        self.fields
            .remove(name)
            .ok_or_else(|| UploadError::Validation(format!("missing field: {}", name)))
    }

    fn number(&mut self, name: &str) -> Result<u32, UploadError> {
        let value = self.required(name)?;
        value
            .trim()
            .parse()
            .map_err(|_| UploadError::Validation(format!("{} must be a non-negative integer", name)))
    }

    fn into_upload(mut self, owner_id: String) -> Result<(ChunkUpload, Bytes), UploadError> {
        let data = self
            .data
            .take()
            .ok_or_else(|| UploadError::Validation("missing field: chunk".to_string()))?;

        let upload = ChunkUpload {
            file_id: self.required("file_id")?,
            owner_id,
            index: self.number("chunk_index")?,
            total_chunks: self.number("total_chunks")?,
            filename: self.required("filename")?,
            category: self.fields.remove("category"),
            checksum: self.required("checksum")?,
            file_checksum: self.fields.remove("file_checksum"),
        };

        Ok((upload, data))
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> UploadError {
    tracing::warn!(error = %e, "Failed to read multipart field");
    UploadError::Validation(format!("malformed multipart body: {}", e))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/init
async fn register_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Json(request): Json<InitRequest>,
) -> Result<(StatusCode, Json<UploadStatus>), UploadError> {
    let status = state
        .uploads()
        .register_upload(NewSession {
            file_id: request.file_id,
            owner_id,
            total_chunks: request.total_chunks,
            filename: request.filename,
            category: request.category.unwrap_or_default(),
            expected_checksum: request.file_checksum,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(status)))
}

/// POST /upload/chunked
///
/// Fields: `file_id`, `chunk_index`, `total_chunks`, `filename`, `checksum`,
/// optional `category` and `file_checksum`, and the `chunk` bytes.
async fn upload_chunk(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ChunkReceipt>), UploadError> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        if name == "chunk" {
            form.data = Some(field.bytes().await.map_err(multipart_error)?);
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            form.fields.insert(name, value);
        }
    }

    let (upload, data) = form.into_upload(owner_id)?;
    let receipt = state.uploads().receive_chunk(upload, &data).await?;

    let status = match receipt.outcome {
        ChunkOutcome::Accepted => StatusCode::CREATED,
        ChunkOutcome::DuplicateIgnored => StatusCode::OK,
        ChunkOutcome::ChecksumConflict | ChunkOutcome::SessionClosed => StatusCode::CONFLICT,
    };

    Ok((status, Json(receipt)))
}

/// GET /upload/status/:file_id
async fn upload_status(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    match state.uploads().get_upload_status(&file_id, &owner_id).await {
        Ok(status) => Ok(Json(StatusResponse {
            exists: true,
            received_chunks: Some(status.received_indices.clone()),
            status: Some(status),
        })),
        Err(UploadError::SessionNotFound(_)) => Ok(Json(StatusResponse {
            exists: false,
            received_chunks: None,
            status: None,
        })),
        Err(e) => Err(e),
    }
}

/// POST /upload/merge/:file_id
async fn merge_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<String>,
) -> Result<Json<MergeResponse>, UploadError> {
    let artifact = state.uploads().merge_upload(&file_id, &owner_id).await?;

    Ok(Json(MergeResponse {
        message: format!("File {} merged successfully", artifact.filename),
        artifact,
    }))
}

/// DELETE /upload/:file_id
async fn abort_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<String>,
) -> Result<Json<UploadStatus>, UploadError> {
    let status = state.uploads().abort_upload(&file_id, &owner_id).await?;
    Ok(Json(status))
}

/// POST /upload/cleanup
async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<SweepReport>, UploadError> {
    let ttl = params
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(state.uploads().settings().session_ttl);

    let report = state.uploads().sweeper().sweep(Utc::now(), ttl).await?;
    Ok(Json(report))
}

// ============================================================================
// Tests
// ============================================================================
