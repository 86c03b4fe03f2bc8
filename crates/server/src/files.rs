//! Full-file download, readiness polling, deletion and the token-free
//! metadata view.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use axum_extra::{
    headers::UserAgent,
    TypedHeader,
};
use common::{
    http::{
        extract::{
            Json,
            Path,
            Query,
        },
        HttpResponseError,
    },
    time::unix_timestamp,
    FileId,
};
use errors::ErrorMetadata;
use file_engine::StatusKind;
use futures::StreamExt;
use http::{
    header::{
        CONTENT_DISPOSITION,
        CONTENT_LENGTH,
        CONTENT_TYPE,
    },
    StatusCode,
};
use metadata::AccessKind;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::LocalAppState;

pub(crate) fn parse_file_id(raw: &str) -> anyhow::Result<FileId> {
    raw.parse().map_err(|_| {
        anyhow::Error::from(ErrorMetadata::not_found(
            "FileNotFound",
            format!("file {raw:?} does not exist or has expired"),
        ))
    })
}

#[derive(Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub admin_token: Option<String>,
}

pub async fn get_file(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let permit = st.admission.acquire_download().await?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    let descriptor = st.engine.authorize_file(id, q.password.as_deref(), is_admin)?;
    let reader = st.engine.open_full(&descriptor).await?;
    st.engine.log_access(
        id,
        AccessKind::Download,
        Some(addr.ip().to_string()),
        user_agent.map(|ua| ua.0.as_str().to_string()),
    );

    // The permit rides inside the stream so it is held until the last byte
    // is out, not just until headers are sent. A read error here can only be
    // logged; the status line is long gone.
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _ = &permit;
        if let Err(e) = &chunk {
            tracing::warn!("read failed mid-download of {id}: {e}");
        }
        chunk
    });
    let response = Response::builder()
        .header(CONTENT_TYPE, &descriptor.mime_type)
        .header(CONTENT_LENGTH, descriptor.original_size)
        .header(
            CONTENT_DISPOSITION,
            content_disposition("attachment", &descriptor.filename),
        )
        .body(Body::from_stream(stream))
        .map_err(anyhow::Error::from)?;
    Ok(response)
}

pub async fn file_status(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    if let Some(meta) = st.engine.metadata().get_metadata(id, unix_timestamp())? {
        return Ok(Json(json!({
            "status": "ready",
            "metadata": meta,
            "download_url": format!("/api/file/{id}"),
        }))
        .into_response());
    }
    match st.engine.processing_status(id)? {
        Some(record) => match record.status {
            StatusKind::Processing => Ok((
                StatusCode::ACCEPTED,
                Json(json!({"status": "processing", "filename": record.filename})),
            )
                .into_response()),
            StatusKind::Failed => Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "failed",
                    "filename": record.filename,
                    "error": record.error,
                })),
            )
                .into_response()),
            // Completed status with no descriptor row means the artifact
            // already expired again; report it gone.
            StatusKind::Completed => Err(anyhow::Error::from(ErrorMetadata::not_found(
                "FileNotFound",
                format!("file {id} does not exist or has expired"),
            ))
            .into()),
        },
        None => Err(anyhow::Error::from(ErrorMetadata::not_found(
            "FileNotFound",
            format!("file {id} does not exist or has expired"),
        ))
        .into()),
    }
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub delete_password: Option<String>,
    #[serde(default)]
    pub admin_token: Option<String>,
}

pub async fn delete_file(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<DeleteQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let descriptor = st
        .engine
        .metadata()
        .get(id, unix_timestamp())?
        .ok_or_else(|| {
            anyhow::Error::from(ErrorMetadata::not_found(
                "FileNotFound",
                format!("file {id} does not exist or has expired"),
            ))
        })?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    if !is_admin && q.delete_password.as_deref() != Some(descriptor.delete_token.as_str()) {
        return Err(anyhow::Error::from(ErrorMetadata::unauthenticated(
            "InvalidDeletePassword",
            "delete password is missing or does not match",
        ))
        .into());
    }
    st.engine.log_access(
        id,
        AccessKind::Delete,
        Some(addr.ip().to_string()),
        None,
    );
    st.engine.delete_file(id).await?;
    tracing::info!("deleted {} ({})", id, descriptor.filename);
    Ok(Json(json!({"message": "file deleted", "file_id": id})).into_response())
}

pub async fn get_metadata(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let meta = st
        .engine
        .metadata()
        .get_metadata(id, unix_timestamp())?
        .ok_or_else(|| {
            anyhow::Error::from(ErrorMetadata::not_found(
                "FileNotFound",
                format!("file {id} does not exist or has expired"),
            ))
        })?;
    Ok(Json(meta).into_response())
}

/// RFC 6266 disposition. ASCII names go in `filename`; anything else is
/// percent-encoded into `filename*`.
pub(crate) fn content_disposition(kind: &str, filename: &str) -> String {
    let simple = filename.is_ascii()
        && !filename
            .chars()
            .any(|c| c == '"' || c == '\\' || c.is_ascii_control());
    if simple {
        format!("{kind}; filename=\"{filename}\"")
    } else {
        format!("{kind}; filename*=UTF-8''{}", percent_encode(filename))
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for byte in s.as_bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*byte as char);
            },
            _ => {
                out.push_str(&format!("%{byte:02X}"));
            },
        }
    }
    out
}
