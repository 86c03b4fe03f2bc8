//! The admin surface: token exchange, expiry extension, force delete and the
//! live-file listing. Enabled only when an admin password is configured.

use axum::{
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
};
use axum_extra::{
    headers::{
        authorization::Bearer,
        Authorization,
    },
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
};
use errors::ErrorMetadata;
use serde::Deserialize;
use serde_json::json;

use crate::{
    files::parse_file_id,
    LocalAppState,
};

fn require_admin(
    st: &LocalAppState,
    bearer: Option<&str>,
    query_token: Option<&str>,
    body_password: Option<&str>,
) -> anyhow::Result<()> {
    let authorized = bearer.is_some_and(|t| st.broker.verify_admin_token(t))
        || query_token.is_some_and(|t| st.broker.verify_admin_token(t))
        || body_password.is_some_and(|p| st.broker.verify_admin_password(p));
    anyhow::ensure!(
        authorized,
        ErrorMetadata::unauthenticated(
            "AdminAuthRequired",
            "a valid admin token or admin password is required",
        )
    );
    Ok(())
}

#[derive(Deserialize)]
pub struct AuthRequest {
    pub password: String,
}

pub async fn auth(
    State(st): State<LocalAppState>,
    Json(req): Json<AuthRequest>,
) -> Result<Response, HttpResponseError> {
    let token = st
        .broker
        .issue_admin_token(&req.password, unix_timestamp() as u64)?;
    Ok(Json(json!({
        "token": token,
        "expires_in": keybroker::ADMIN_TOKEN_TTL.as_secs(),
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct UpdateExpiryRequest {
    #[serde(default)]
    pub admin_password: Option<String>,
    pub expires_at: i64,
}

pub async fn update_expiry(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<UpdateExpiryRequest>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    require_admin(
        &st,
        bearer.as_ref().map(|b| b.token()),
        None,
        req.admin_password.as_deref(),
    )?;
    st.engine.extend_expiry(id, req.expires_at)?;
    tracing::info!("admin extended expiry of {id} to {}", req.expires_at);
    Ok(Json(json!({"file_id": id, "expires_at": req.expires_at})).into_response())
}

#[derive(Deserialize)]
pub struct AdminTokenQuery {
    #[serde(default)]
    pub admin_token: Option<String>,
}

pub async fn force_delete(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<AdminTokenQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    require_admin(
        &st,
        bearer.as_ref().map(|b| b.token()),
        q.admin_token.as_deref(),
        None,
    )?;
    if !st.engine.delete_file(id).await? {
        return Err(anyhow::Error::from(ErrorMetadata::not_found(
            "FileNotFound",
            format!("file {id} does not exist or has expired"),
        ))
        .into());
    }
    tracing::info!("admin force-deleted {id}");
    Ok(Json(json!({"message": "file deleted", "file_id": id})).into_response())
}

#[derive(Deserialize)]
pub struct ListFilesRequest {
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Optional filename prefix filter.
    #[serde(default)]
    pub search: Option<String>,
}

pub async fn list_files(
    State(st): State<LocalAppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<ListFilesRequest>,
) -> Result<Response, HttpResponseError> {
    require_admin(
        &st,
        bearer.as_ref().map(|b| b.token()),
        None,
        req.admin_password.as_deref(),
    )?;
    let now = unix_timestamp();
    let files = match req.search.as_deref() {
        Some(prefix) if !prefix.is_empty() => {
            st.engine.metadata().search_by_filename_prefix(prefix, now)?
        },
        _ => st.engine.metadata().list_active(now)?,
    };
    Ok(Json(json!({"count": files.len(), "files": files})).into_response())
}
