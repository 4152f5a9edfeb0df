//! HTTP handlers for the upload protocol. Each handler extracts the verified
//! principal and delegates to `UploadService`.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;

use crate::{
    auth::Principal,
    errors::AppError,
    models::api::{ChunkAck, CreateFolderRequest, FinalizedFile, InitUploadRequest, UploadStatus},
    services::upload_service::UploadService,
};

/// `POST /uploads`: open a session.
pub async fn init_upload(
    State(service): State<UploadService>,
    principal: Principal,
    Json(req): Json<InitUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let created = service.init(&principal, &req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PUT /uploads/{id}/chunks/{index}`: record one chunk; the body is the raw chunk bytes.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    principal: Principal,
    Path((session_id, chunk_index)): Path<(String, u64)>,
    body: Bytes,
) -> Result<Json<ChunkAck>, AppError> {
    let ack = service
        .record_chunk(&principal, &session_id, chunk_index, body)
        .await?;
    Ok(Json(ack))
}

/// `GET /uploads/{id}`: progress recomputed from the ledger.
pub async fn upload_status(
    State(service): State<UploadService>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(service.status(&principal, &session_id).await?))
}

/// `POST /uploads/{id}/finalize`
pub async fn finalize_upload(
    State(service): State<UploadService>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<Json<FinalizedFile>, AppError> {
    Ok(Json(service.finalize(&principal, &session_id).await?))
}

/// `GET /uploads/{id}/file`: the file a finalized session produced.
pub async fn finalized_file(
    State(service): State<UploadService>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<Json<FinalizedFile>, AppError> {
    Ok(Json(service.lookup_file(&principal, &session_id).await?))
}

/// `POST /folders`
pub async fn create_folder(
    State(service): State<UploadService>,
    principal: Principal,
    Json(req): Json<CreateFolderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let folder = service.create_folder(&principal, &req.name).await?;
    Ok((StatusCode::CREATED, Json(folder)))
}
