use axum::{
    extract::{
        FromRequest,
        FromRequestParts,
        Request,
    },
    http::request::Parts,
    response::{
        IntoResponse,
        Response,
    },
};
use errors::ErrorMetadata;
use serde::{
    de::DeserializeOwned,
    Serialize,
};

use crate::http::HttpResponseError;

pub struct Path<T>(pub T);

/// Wrapper around axum::extract::Path that rejects with HttpResponseError so
/// bad path arguments flow through the same error body as everything else.
impl<S, T> FromRequestParts<S> for Path<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::extract::Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::bad_request("BadPathArgs", e.to_string()))
            })?;
        Ok(Self(t.0))
    }
}

pub struct Query<T>(pub T);

/// Wrapper around axum::extract::Query, same reason as `Path`.
impl<S, T> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::bad_request("BadQueryArgs", e.to_string()))
            })?;
        Ok(Self(t.0))
    }
}

pub struct Json<T>(pub T);

/// Wrapper around axum::Json, same reason as `Path`.
impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::bad_request("BadJsonBody", e.body_text()))
            })?;
        Ok(Self(t.0))
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}
