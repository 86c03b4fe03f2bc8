//! Inline preview and the media streaming path. Both honor single-part
//! Range headers and strong ETags; the streaming path takes no admission
//! permit so long-lived playback cannot starve short requests.

use std::{
    net::SocketAddr,
    ops::Bound,
};

use axum::{
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    response::Response,
};
use axum_extra::{
    headers::{
        ETag,
        IfNoneMatch,
        Range,
        UserAgent,
    },
    TypedHeader,
};
use common::http::{
    extract::{
        Path,
        Query,
    },
    HttpResponseError,
};
use errors::ErrorMetadata;
use file_engine::is_previewable;
use futures::StreamExt;
use http::{
    header::{
        ACCEPT_RANGES,
        CACHE_CONTROL,
        CONTENT_DISPOSITION,
        CONTENT_LENGTH,
        CONTENT_RANGE,
        CONTENT_TYPE,
        ETAG,
    },
    StatusCode,
};
use metadata::{
    AccessKind,
    FileDescriptor,
};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::io::ReaderStream;

use crate::{
    files::{
        content_disposition,
        parse_file_id,
    },
    LocalAppState,
};

/// Media larger than this gets a public cache header.
const CACHEABLE_MEDIA_SIZE: u64 = 5 << 20;
/// Images larger than this get a public cache header.
const CACHEABLE_IMAGE_SIZE: u64 = 1 << 20;

pub async fn preview(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<crate::files::FileQuery>,
    range: Option<TypedHeader<Range>>,
    if_none_match: Option<TypedHeader<IfNoneMatch>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let permit = st.admission.acquire_download().await?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    let descriptor = st.engine.authorize_file(id, q.password.as_deref(), is_admin)?;
    if !is_previewable(&descriptor.mime_type) {
        return Err(anyhow::Error::from(ErrorMetadata::unsupported_media(
            "UnsupportedMediaType",
            format!("{} cannot be previewed inline", descriptor.mime_type),
        ))
        .into());
    }
    st.engine.log_access(
        id,
        AccessKind::Preview,
        Some(addr.ip().to_string()),
        user_agent.map(|ua| ua.0.as_str().to_string()),
    );
    respond(&st, descriptor, range, if_none_match, Some(permit)).await
}

pub async fn stream(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Query(q): Query<crate::files::FileQuery>,
    range: Option<TypedHeader<Range>>,
    if_none_match: Option<TypedHeader<IfNoneMatch>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> Result<Response, HttpResponseError> {
    let id = parse_file_id(&id)?;
    let is_admin = st.broker.identity(q.admin_token.as_deref()).is_admin();
    let descriptor = st.engine.authorize_file(id, q.password.as_deref(), is_admin)?;
    st.engine.log_access(
        id,
        AccessKind::Stream,
        Some(addr.ip().to_string()),
        user_agent.map(|ua| ua.0.as_str().to_string()),
    );
    // The streaming path takes no admission permit.
    respond(&st, descriptor, range, if_none_match, None).await
}

async fn respond(
    st: &LocalAppState,
    descriptor: FileDescriptor,
    range: Option<TypedHeader<Range>>,
    if_none_match: Option<TypedHeader<IfNoneMatch>>,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<Response, HttpResponseError> {
    let etag_value = format!("\"{}\"", descriptor.id);
    if let Some(TypedHeader(if_none_match)) = if_none_match {
        let etag: ETag = etag_value
            .parse()
            .map_err(|_| anyhow::anyhow!("unparseable etag {etag_value:?}"))?;
        if !if_none_match.precondition_passes(&etag) {
            let response = Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(ETAG, &etag_value)
                .body(Body::empty())
                .map_err(anyhow::Error::from)?;
            return Ok(response);
        }
    }

    let total = descriptor.original_size;
    let mut builder = Response::builder()
        .header(CONTENT_TYPE, &descriptor.mime_type)
        .header(ETAG, &etag_value)
        .header(ACCEPT_RANGES, "bytes")
        .header(
            CONTENT_DISPOSITION,
            content_disposition("inline", &descriptor.filename),
        );
    if cacheable(&descriptor) {
        builder = builder.header(CACHE_CONTROL, "public, max-age=3600");
    }

    let response = match range {
        Some(TypedHeader(range)) => {
            let (start, end) = resolve_single_range(&range, total)?;
            let reader = st.engine.open_range(&descriptor, start, end).await?;
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {start}-{}/{total}", end - 1))
                .header(CONTENT_LENGTH, end - start)
                .body(body_with_permit(descriptor.id, reader, permit))
                .map_err(anyhow::Error::from)?
        },
        None => {
            let reader = st.engine.open_full(&descriptor).await?;
            builder
                .header(CONTENT_LENGTH, total)
                .body(body_with_permit(descriptor.id, reader, permit))
                .map_err(anyhow::Error::from)?
        },
    };
    Ok(response)
}

fn cacheable(descriptor: &FileDescriptor) -> bool {
    let mime = &descriptor.mime_type;
    let size = descriptor.original_size;
    ((mime.starts_with("video/") || mime.starts_with("audio/")) && size > CACHEABLE_MEDIA_SIZE)
        || (mime.starts_with("image/") && size > CACHEABLE_IMAGE_SIZE)
}

/// The permit, if any, rides inside the stream so it is released when the
/// transfer finishes rather than when headers go out. Read errors after the
/// status line can only be logged; the connection just drops.
fn body_with_permit(
    id: common::FileId,
    reader: file_engine::BodyReader,
    permit: Option<OwnedSemaphorePermit>,
) -> Body {
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _ = &permit;
        if let Err(e) = &chunk {
            tracing::warn!("read failed mid-stream of {id}: {e}");
        }
        chunk
    });
    Body::from_stream(stream)
}

/// Accepts exactly one satisfiable range; multi-part ranges are refused.
/// Returns a half-open `start..end` interval.
pub(crate) fn resolve_single_range(range: &Range, total: u64) -> anyhow::Result<(u64, u64)> {
    let mut ranges = range.satisfiable_ranges(total);
    let Some((start_bound, end_bound)) = ranges.next() else {
        anyhow::bail!(ErrorMetadata::range_not_satisfiable(
            "RangeNotSatisfiable",
            format!("no satisfiable range within {total} bytes"),
        ));
    };
    if ranges.next().is_some() {
        anyhow::bail!(ErrorMetadata::range_not_satisfiable(
            "MultiRangeUnsupported",
            "multi-part ranges are not supported",
        ));
    }
    let start = match start_bound {
        Bound::Included(s) => s,
        Bound::Excluded(s) => s + 1,
        Bound::Unbounded => 0,
    };
    let end = match end_bound {
        Bound::Included(e) => e.saturating_add(1),
        Bound::Excluded(e) => e,
        Bound::Unbounded => total,
    }
    .min(total);
    anyhow::ensure!(
        start < end,
        ErrorMetadata::range_not_satisfiable(
            "RangeNotSatisfiable",
            format!("empty range within {total} bytes"),
        )
    );
    Ok((start, end))
}

#[cfg(test)]
mod range_tests {
    use axum_extra::headers::{
        Header,
        Range,
    };
    use errors::ErrorMetadataAnyhowExt;
    use http::HeaderValue;

    use super::resolve_single_range;

    fn parse_range(value: &str) -> Range {
        let value = HeaderValue::from_str(value).unwrap();
        Range::decode(&mut [value].iter()).unwrap()
    }

    #[test]
    fn test_bounded_range() {
        let range = parse_range("bytes=0-1048575");
        assert_eq!(
            resolve_single_range(&range, 314_572_800).unwrap(),
            (0, 1_048_576)
        );
    }

    #[test]
    fn test_open_ended_range() {
        let range = parse_range("bytes=100-");
        assert_eq!(resolve_single_range(&range, 200).unwrap(), (100, 200));
    }

    #[test]
    fn test_suffix_range() {
        let range = parse_range("bytes=-50");
        assert_eq!(resolve_single_range(&range, 200).unwrap(), (150, 200));
    }

    #[test]
    fn test_end_is_clamped_to_total() {
        let range = parse_range("bytes=100-999999");
        assert_eq!(resolve_single_range(&range, 200).unwrap(), (100, 200));
    }

    #[test]
    fn test_multi_range_is_refused() {
        let range = parse_range("bytes=0-10,20-30");
        let err = resolve_single_range(&range, 200).unwrap_err();
        assert_eq!(err.http_status(), http::StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn test_unsatisfiable_range() {
        let range = parse_range("bytes=500-600");
        let err = resolve_single_range(&range, 200).unwrap_err();
        assert_eq!(err.short_msg(), "RangeNotSatisfiable");
    }
}
