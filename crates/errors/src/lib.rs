use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags errors with the information the
/// HTTP layer needs to classify them.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// client.
///
/// The short_msg is used as a tag - available for tests and for log matching -
/// that is resilient to changes in copy. The HTTP layer sends it as the
/// `code` field of the error body.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg ChunkIndexOutOfRange
    pub short_msg: Cow<'static, str>,
    /// human readable - client facing. Should be longer and descriptive.
    /// Eg "chunk index 7 is outside the session's 0..4 range"
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    NotFound,
    PayloadTooLarge,
    UnsupportedMediaType,
    RangeNotSatisfiable,

    Overloaded,
    InsufficientSpace,

    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    ///
    /// The short_msg should be CapitalCamelCased, describing the error.
    /// The msg should be a descriptive message targeted toward the client.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found or expired. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Missing or wrong download/delete password or admin token. Maps to 401.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Artifact or chunk exceeds a configured size cap. Maps to 413.
    pub fn too_large(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::PayloadTooLarge,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// MIME type outside the preview set. Maps to 415.
    pub fn unsupported_media(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::UnsupportedMediaType,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Unparseable, multi-part or unsatisfiable Range header. Maps to 416.
    pub fn range_not_satisfiable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RangeNotSatisfiable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Admission control refused the request. Maps to 503.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The scratch filesystem cannot hold the bytes, even after aggressive
    /// cleanup. Maps to 503.
    pub fn insufficient_space(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InsufficientSpace,
            short_msg: INSUFFICIENT_SPACE.into(),
            msg: msg.into(),
        }
    }

    /// Internal Server Error (maps to 500 in HTTP) with a custom tag. Used
    /// where an internal inconsistency is detectable and worth naming, eg a
    /// descriptor whose external blob file is missing.
    pub fn internal_storage_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_STORAGE_ERROR.into(),
            msg: msg.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded || self.code == ErrorCode::InsufficientSpace
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            // HTTP has the unfortunate naming of 401 as unauthorized when it's
            // really about authentication.
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorCode::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::Overloaded | ErrorCode::InsufficientSpace => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_STORAGE_ERROR: &str = "InternalStorageError";
pub const INSUFFICIENT_SPACE: &str = "InsufficientSpace";

/// Log an error that terminates nothing: a failed sweeper iteration, an
/// access-log write, a mid-stream read failure after headers were sent.
pub fn report_error(e: &mut anyhow::Error) {
    tracing::error!("Caught error: {e:#}");
}

pub trait ErrorMetadataAnyhowExt {
    fn is_not_found(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as Unauthenticated
    fn is_unauthenticated(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_unauthenticated();
        }
        false
    }

    /// Returns true if error is tagged as Overloaded or InsufficientSpace
    fn is_overloaded(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_overloaded();
        }
        false
    }

    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.to_string();
        }
        INTERNAL_SERVER_ERROR_MSG.to_string()
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    fn http_status(&self) -> StatusCode {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code.http_status_code();
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use crate::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_SERVER_ERROR,
    };

    #[test]
    fn test_tagged_error_surfaces_through_chain() {
        let e: anyhow::Error = anyhow::anyhow!("db is sideways")
            .context(ErrorMetadata::not_found("FileNotFound", "file abc not found"));
        assert!(e.is_not_found());
        assert_eq!(e.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(e.short_msg(), "FileNotFound");
        assert_eq!(e.msg(), "file abc not found");
    }

    #[test]
    fn test_untagged_error_is_internal() {
        let e = anyhow::anyhow!("some random error");
        assert_eq!(e.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.short_msg(), INTERNAL_SERVER_ERROR);
        assert!(!e.is_not_found());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ErrorMetadata::too_large("FileTooLarge", "")
                .code
                .http_status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ErrorMetadata::range_not_satisfiable("MultiRange", "")
                .code
                .http_status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ErrorMetadata::insufficient_space("scratch volume full")
                .code
                .http_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
