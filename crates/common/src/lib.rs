pub mod backoff;
pub mod http;
pub mod identifiers;
pub mod mime_types;
pub mod secrets;
pub mod time;

pub use crate::identifiers::{
    FileId,
    JobId,
    UploadId,
};
