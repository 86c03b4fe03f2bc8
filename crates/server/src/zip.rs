//! ZIP browsing endpoints: list an archive's entries, preview one entry.

use axum::{
    body::Body,
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
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
    mime_types::mime_from_filename,
};
use errors::ErrorMetadata;
use file_engine::is_previewable;
use http::header::{
    CONTENT_LENGTH,
    CONTENT_TYPE,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    files::parse_file_id,
    LocalAppState,
};

pub async fn list_zip(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<crate::files::FileQuery>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    let descriptor = st.engine.authorize_file(id, q.password.as_deref(), is_admin)?;
    let entries = st.engine.list_zip_entries(&descriptor).await?;
    Ok(Json(json!({
        "file_id": id,
        "filename": descriptor.filename,
        "count": entries.len(),
        "entries": entries,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct ExtractQuery {
    pub filename: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub admin_token: Option<String>,
}

pub async fn extract_entry(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<ExtractQuery>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    let descriptor = st.engine.authorize_file(id, q.password.as_deref(), is_admin)?;
    let entry_mime = mime_from_filename(&q.filename);
    if !is_previewable(&entry_mime) {
        return Err(anyhow::Error::from(ErrorMetadata::unsupported_media(
            "UnsupportedMediaType",
            format!("{entry_mime} cannot be previewed inline"),
        ))
        .into());
    }
    let (info, bytes) = st.engine.read_zip_entry(&descriptor, &q.filename).await?;
    let response = Response::builder()
        .header(CONTENT_TYPE, entry_mime)
        .header(CONTENT_LENGTH, info.size)
        .body(Body::from(bytes))
        .map_err(anyhow::Error::from)?;
    Ok(response)
}
