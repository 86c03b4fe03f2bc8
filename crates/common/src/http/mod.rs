use std::borrow::Cow;

use axum::response::{
    IntoResponse,
    Response,
};
use errors::{
    report_error,
    ErrorMetadataAnyhowExt,
};
use http::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};

pub mod extract;

/// `HttpError` is the client-facing rendering of a failure: a status code and
/// a `{code, message}` JSON body. Errors tagged with ErrorMetadata build
/// these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    status_code: StatusCode,
    error_code: Cow<'static, str>,
    msg: Cow<'static, str>,
}

impl HttpError {
    pub fn new<S, T>(status_code: StatusCode, error_code: S, msg: T) -> Self
    where
        S: Into<Cow<'static, str>>,
        T: Into<Cow<'static, str>>,
    {
        Self {
            status_code,
            error_code: error_code.into(),
            msg: msg.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn into_response(self) -> Response {
        (
            self.status_code,
            extract::Json(ResponseErrorMessage {
                code: self.error_code,
                message: self.msg,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseErrorMessage {
    code: Cow<'static, str>,
    message: Cow<'static, str>,
}

/// All HTTP handlers return `HttpResponseError`. It converts `anyhow::Error`
/// (reading the `ErrorMetadata` tag if present) into the response the
/// middleware sends, keeping the full trace for the log.
#[derive(Debug)]
pub struct HttpResponseError {
    trace: anyhow::Error,
    http_error: HttpError,
}

impl IntoResponse for HttpResponseError {
    fn into_response(mut self) -> Response {
        // This is the exit point of the HTTP layer; server faults get logged
        // here, client faults are only visible at debug level.
        if self.http_error.status_code.is_server_error() {
            report_error(&mut self.trace);
        } else {
            tracing::debug!("client error: {:#}", self.trace);
        }
        self.http_error.into_response()
    }
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> HttpResponseError {
        let http_error = HttpError {
            status_code: err.http_status(),
            error_code: err.short_msg().to_string().into(),
            msg: err.msg().to_string().into(),
        };
        Self {
            trace: err,
            http_error,
        }
    }
}

impl From<HttpResponseError> for anyhow::Error {
    fn from(value: HttpResponseError) -> Self {
        value.trace
    }
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use errors::ErrorMetadata;
    use http::StatusCode;

    use crate::http::HttpResponseError;

    #[tokio::test]
    async fn test_tagged_error_maps_to_status() {
        let err: HttpResponseError = anyhow::Error::from(ErrorMetadata::unauthenticated(
            "InvalidPassword",
            "download password does not match",
        ))
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_untagged_error_is_500() {
        let err: HttpResponseError = anyhow::anyhow!("sqlite exploded").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
