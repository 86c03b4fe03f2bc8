//! Upload endpoints: single-shot multipart and the chunked-upload state
//! machine.

use axum::{
    extract::{
        Multipart,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use axum_extra::{
    headers::ContentLength,
    TypedHeader,
};
use common::{
    http::{
        extract::{
            Json,
            Path,
        },
        HttpResponseError,
    },
    UploadId,
};
use errors::ErrorMetadata;
use file_engine::IncompleteUpload;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::LocalAppState;

fn parse_upload_id(raw: &str) -> anyhow::Result<UploadId> {
    raw.parse().map_err(|_| {
        anyhow::Error::from(ErrorMetadata::not_found(
            "UploadSessionNotFound",
            format!("upload session {raw:?} does not exist or has expired"),
        ))
    })
}

pub async fn single_shot(
    State(st): State<LocalAppState>,
    content_length: Option<TypedHeader<ContentLength>>,
    mut multipart: Multipart,
) -> Result<Response, HttpResponseError> {
    let _permit = st.admission.acquire_upload().await?;

    // Content-Length covers the whole multipart body, so this refuses
    // obviously-oversized uploads before reading a byte of them.
    if let Some(TypedHeader(ContentLength(length))) = content_length {
        if length > st.config.chunk_threshold {
            return Ok(too_large_use_chunked(st.config.chunk_threshold));
        }
    }

    let mut filename = None;
    let mut bytes = None;
    let mut download_password = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        anyhow::Error::from(ErrorMetadata::bad_request(
            "BadMultipart",
            format!("malformed multipart body: {e}"),
        ))
    })? {
        match field.name() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                bytes = Some(field.bytes().await.map_err(|e| {
                    anyhow::Error::from(ErrorMetadata::bad_request(
                        "BadMultipart",
                        format!("reading file field: {e}"),
                    ))
                })?);
            },
            Some("download_password") => {
                download_password = Some(field.text().await.map_err(|e| {
                    anyhow::Error::from(ErrorMetadata::bad_request(
                        "BadMultipart",
                        format!("reading download_password field: {e}"),
                    ))
                })?);
            },
            _ => {},
        }
    }
    let bytes = bytes.ok_or_else(|| {
        anyhow::Error::from(ErrorMetadata::bad_request(
            "MissingFile",
            "multipart body has no `file` field",
        ))
    })?;
    if bytes.len() as u64 > st.config.chunk_threshold {
        return Ok(too_large_use_chunked(st.config.chunk_threshold));
    }
    let filename = filename.unwrap_or_else(|| "upload.bin".to_string());
    let download_password = download_password.filter(|p| !p.is_empty());

    let descriptor = st
        .engine
        .store_buffer(filename, bytes, download_password)
        .await?;
    tracing::info!(
        "single-shot upload stored {} as {}",
        descriptor.filename,
        descriptor.id
    );
    Ok(Json(json!({
        "file_id": descriptor.id,
        "filename": descriptor.filename,
        "mime_type": descriptor.mime_type,
        "size": descriptor.original_size,
        "delete_password": descriptor.delete_token,
        "download_url": format!("/api/file/{}", descriptor.id),
        "expires_at": descriptor.expires_at,
    }))
    .into_response())
}

fn too_large_use_chunked(threshold: u64) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({
            "code": "FileTooLarge",
            "message": format!("single-shot uploads are capped at {threshold} bytes"),
            "use_chunked": true,
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct InitiateRequest {
    filename: String,
    total_size: u64,
    chunk_size: u64,
    #[serde(default)]
    file_hash: Option<String>,
    #[serde(default)]
    download_password: Option<String>,
}

pub async fn chunk_initiate(
    State(st): State<LocalAppState>,
    Json(req): Json<InitiateRequest>,
) -> Result<Response, HttpResponseError> {
    let session = st
        .engine
        .initiate_upload(
            req.filename,
            req.total_size,
            req.chunk_size,
            req.download_password.filter(|p| !p.is_empty()),
            req.file_hash,
        )
        .await?;
    Ok(Json(json!({
        "upload_id": session.upload_id,
        "total_chunks": session.total_chunks,
        "chunk_size": session.chunk_size,
        "expires_at": session.expires_at,
    }))
    .into_response())
}

pub async fn put_chunk(
    State(st): State<LocalAppState>,
    Path((upload_id, chunk_index)): Path<(String, u32)>,
    mut multipart: Multipart,
) -> Result<Response, HttpResponseError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let _permit = st.admission.acquire_upload().await?;

    let mut bytes = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        anyhow::Error::from(ErrorMetadata::bad_request(
            "BadMultipart",
            format!("malformed multipart body: {e}"),
        ))
    })? {
        if field.name() == Some("chunk") {
            bytes = Some(field.bytes().await.map_err(|e| {
                anyhow::Error::from(ErrorMetadata::bad_request(
                    "BadMultipart",
                    format!("reading chunk field: {e}"),
                ))
            })?);
        }
    }
    let bytes = bytes.ok_or_else(|| {
        anyhow::Error::from(ErrorMetadata::bad_request(
            "MissingChunk",
            "multipart body has no `chunk` field",
        ))
    })?;

    let receipt = st.engine.put_chunk(upload_id, chunk_index, bytes).await?;
    Ok(Json(receipt).into_response())
}

pub async fn chunk_complete(
    State(st): State<LocalAppState>,
    Path(upload_id): Path<String>,
) -> Result<Response, HttpResponseError> {
    let upload_id = parse_upload_id(&upload_id)?;
    match st.engine.complete_upload(upload_id).await {
        Ok((job_id, file_id)) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job_id,
                "file_id": file_id,
                "status": "pending",
            })),
        )
            .into_response()),
        Err(e) => {
            if let Some(incomplete) = e.downcast_ref::<IncompleteUpload>() {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "code": "IncompleteUpload",
                        "message": e.to_string(),
                        "missing_chunk": incomplete.missing_chunk,
                    })),
                )
                    .into_response());
            }
            Err(e.into())
        },
    }
}

pub async fn chunk_status(
    State(st): State<LocalAppState>,
    Path(upload_id): Path<String>,
) -> Result<Response, HttpResponseError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let status = st.engine.session_status(upload_id)?;
    Ok(Json(status).into_response())
}
