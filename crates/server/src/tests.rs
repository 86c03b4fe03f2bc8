use std::{
    net::SocketAddr,
    time::Duration,
};

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    Router,
};
use http::{
    header::{
        CONTENT_LENGTH,
        CONTENT_RANGE,
        CONTENT_TYPE,
        ETAG,
        IF_NONE_MATCH,
        RANGE,
    },
    Request,
    StatusCode,
};
use http_body_util::BodyExt;
use serde_json::{
    json,
    Value,
};
use tower::ServiceExt;

use crate::{
    config::ServerConfig,
    router,
    LocalAppState,
};

const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

fn test_app() -> anyhow::Result<(tempfile::TempDir, Router)> {
    let dir = tempfile::tempdir()?;
    let config = ServerConfig::new_for_test(dir.path())?;
    let st = LocalAppState::new(config)?;
    let app = router(st).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
    Ok((dir, app))
}

fn multipart_upload(
    field: &str,
    filename: &str,
    data: &[u8],
    extra_fields: &[(&str, &str)],
) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
    for (name, value) in extra_fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (
        format!("multipart/form-data; boundary={BOUNDARY}"),
        body,
    )
}

async fn send(app: &Router, request: Request<Body>) -> anyhow::Result<(StatusCode, http::HeaderMap, Vec<u8>)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await?.to_bytes().to_vec();
    Ok((status, headers, body))
}

async fn upload_file(
    app: &Router,
    filename: &str,
    data: &[u8],
    extra_fields: &[(&str, &str)],
) -> anyhow::Result<Value> {
    let (content_type, body) = multipart_upload("file", filename, data, extra_fields);
    let request = Request::post("/api/upload")
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))?;
    let (status, _, body) = send(app, request).await?;
    anyhow::ensure!(status == StatusCode::OK, "upload failed: {status}");
    Ok(serde_json::from_slice(&body)?)
}

async fn wait_until_ready(app: &Router, file_id: &str) -> anyhow::Result<Value> {
    for _ in 0..500 {
        let request = Request::get(format!("/api/file/{file_id}/status")).body(Body::empty())?;
        let (status, _, body) = send(app, request).await?;
        match status {
            StatusCode::OK => return Ok(serde_json::from_slice(&body)?),
            StatusCode::ACCEPTED => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            other => anyhow::bail!(
                "unexpected status {other}: {}",
                String::from_utf8_lossy(&body)
            ),
        }
    }
    anyhow::bail!("file {file_id} never became ready")
}

#[tokio::test]
async fn test_health() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let (status, _, body) = send(&app, Request::get("/api/health").body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body)?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn test_upload_download_delete_cycle() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let uploaded = upload_file(&app, "hello.txt", b"Hello, world!", &[]).await?;
    let file_id = uploaded["file_id"].as_str().unwrap().to_string();
    let delete_password = uploaded["delete_password"].as_str().unwrap().to_string();
    assert_eq!(delete_password.len(), 12);
    assert_eq!(uploaded["size"], 13);
    assert_eq!(uploaded["mime_type"], "text/plain");

    let (status, headers, body) =
        send(&app, Request::get(format!("/api/file/{file_id}")).body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/plain");
    assert_eq!(headers[CONTENT_LENGTH], "13");
    assert_eq!(body, b"Hello, world!");

    // Wrong password, then the right one.
    let (status, _, _) = send(
        &app,
        Request::delete(format!("/api/file/{file_id}?delete_password=wrongwrong12"))
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(
        &app,
        Request::delete(format!(
            "/api/file/{file_id}?delete_password={delete_password}"
        ))
        .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) =
        send(&app, Request::get(format!("/api/file/{file_id}")).body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_chunked_upload_flow() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 239) as u8).collect();
    let chunk_size = 65536u64;

    let request = Request::post("/api/chunk/initiate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "filename": "big.bin",
                "total_size": payload.len(),
                "chunk_size": chunk_size,
            })
            .to_string(),
        ))?;
    let (status, _, body) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);
    let initiated: Value = serde_json::from_slice(&body)?;
    let upload_id = initiated["upload_id"].as_str().unwrap().to_string();
    assert_eq!(initiated["total_chunks"], 3);

    // Chunks arrive out of order; receipts count up.
    for index in [1u32, 2, 0] {
        let start = index as usize * chunk_size as usize;
        let end = (start + chunk_size as usize).min(payload.len());
        let (content_type, body) =
            multipart_upload("chunk", "blob", &payload[start..end], &[]);
        let request = Request::post(format!("/api/chunk/{upload_id}/{index}"))
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))?;
        let (status, _, body) = send(&app, request).await?;
        assert_eq!(status, StatusCode::OK);
        let receipt: Value = serde_json::from_slice(&body)?;
        assert_eq!(receipt["total_chunks"], 3);
    }

    let request =
        Request::post(format!("/api/chunk/{upload_id}/complete")).body(Body::empty())?;
    let (status, _, body) = send(&app, request).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let completed: Value = serde_json::from_slice(&body)?;
    assert_eq!(completed["status"], "pending");
    let file_id = completed["file_id"].as_str().unwrap().to_string();

    let ready = wait_until_ready(&app, &file_id).await?;
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["metadata"]["original_size"], 150_000);

    let (status, _, body) =
        send(&app, Request::get(format!("/api/file/{file_id}")).body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, payload);

    // The session is consumed: further chunks and completes 404.
    let (content_type, chunk_body) = multipart_upload("chunk", "blob", &payload[..100], &[]);
    let request = Request::post(format!("/api/chunk/{upload_id}/0"))
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(chunk_body))?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_chunk_complete_reports_missing_chunk() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let request = Request::post("/api/chunk/initiate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"filename": "x.bin", "total_size": 200, "chunk_size": 100}).to_string(),
        ))?;
    let (_, _, body) = send(&app, request).await?;
    let initiated: Value = serde_json::from_slice(&body)?;
    let upload_id = initiated["upload_id"].as_str().unwrap();

    let (content_type, chunk_body) = multipart_upload("chunk", "blob", &[7u8; 100], &[]);
    let request = Request::post(format!("/api/chunk/{upload_id}/1"))
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(chunk_body))?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);

    let request =
        Request::post(format!("/api/chunk/{upload_id}/complete")).body(Body::empty())?;
    let (status, _, body) = send(&app, request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body)?;
    assert_eq!(error["missing_chunk"], 0);
    Ok(())
}

#[tokio::test]
async fn test_preview_password_range_and_etag() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    // .mp4 lands in the already-compressed set, so bytes are stored verbatim.
    let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    let uploaded = upload_file(
        &app,
        "movie.mp4",
        &payload,
        &[("download_password", "s3cret")],
    )
    .await?;
    let file_id = uploaded["file_id"].as_str().unwrap().to_string();

    // No password: 401.
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Ranged preview.
    let (status, headers, body) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}?password=s3cret"))
            .header(RANGE, "bytes=0-1048575")
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        headers[CONTENT_RANGE],
        format!("bytes 0-1048575/{}", payload.len())
    );
    assert_eq!(headers[CONTENT_LENGTH], "1048576");
    assert_eq!(body, payload[..1_048_576]);
    // Media over 5 MiB would be publicly cacheable; this one is 2 MB, so no
    // cache header.
    assert!(headers.get(http::header::CACHE_CONTROL).is_none());

    // Conditional request: matching ETag yields 304.
    let etag = headers[ETAG].to_str()?.to_string();
    assert_eq!(etag, format!("\"{file_id}\""));
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}?password=s3cret"))
            .header(IF_NONE_MATCH, etag)
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    // Multi-range is refused.
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}?password=s3cret"))
            .header(RANGE, "bytes=0-10,20-30")
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);

    // The streaming path serves the same bytes without a password... no,
    // streaming still enforces the token.
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/stream/{file_id}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, headers, _) = send(
        &app,
        Request::get(format!("/api/stream/{file_id}?password=s3cret"))
            .header(RANGE, "bytes=-1000")
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[CONTENT_LENGTH], "1000");
    Ok(())
}

#[tokio::test]
async fn test_range_on_compressed_blob() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let payload: Vec<u8> = "all work and no play makes jack a dull boy\n"
        .bytes()
        .cycle()
        .take(20_000)
        .collect();
    let uploaded = upload_file(&app, "data.log", &payload, &[]).await?;
    let file_id = uploaded["file_id"].as_str().unwrap().to_string();

    let meta = send(
        &app,
        Request::get(format!("/api/metadata/{file_id}")).body(Body::empty())?,
    )
    .await?;
    let meta: Value = serde_json::from_slice(&meta.2)?;
    assert_eq!(meta["compression"], "zstd");
    assert!(meta["stored_size"].as_u64().unwrap() < 20_000);

    let (status, _, body) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}"))
            .header(RANGE, "bytes=1000-1999")
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body.len(), 1000);
    assert_eq!(body, payload[1000..2000]);
    Ok(())
}

#[tokio::test]
async fn test_preview_rejects_unpreviewable_type() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let uploaded = upload_file(&app, "blob.bin", &[0u8; 64], &[]).await?;
    let file_id = uploaded["file_id"].as_str().unwrap();
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/preview/{file_id}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    Ok(())
}

#[tokio::test]
async fn test_admin_override_and_expiry_extension() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    let uploaded = upload_file(
        &app,
        "secret.txt",
        b"classified",
        &[("download_password", "hunter2")],
    )
    .await?;
    let file_id = uploaded["file_id"].as_str().unwrap().to_string();
    let old_expiry = uploaded["expires_at"].as_i64().unwrap();

    // Exchange the admin password for a token.
    let request = Request::post("/api/admin/auth")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"password": "admin-test-password"}).to_string(),
        ))?;
    let (status, _, body) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);
    let auth: Value = serde_json::from_slice(&body)?;
    let token = auth["token"].as_str().unwrap().to_string();
    assert_eq!(auth["expires_in"], 7200);

    // Wrong admin password: 401.
    let request = Request::post("/api/admin/auth")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"password": "nope"}).to_string()))?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Admin token overrides the download password.
    let (status, _, body) = send(
        &app,
        Request::get(format!("/api/file/{file_id}?admin_token={token}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"classified");

    // Extend expiry a week out.
    let new_expiry = old_expiry + 7 * 24 * 3600;
    let request = Request::put(format!("/api/admin/file/{file_id}/expires"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"admin_password": "admin-test-password", "expires_at": new_expiry})
                .to_string(),
        ))?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = send(
        &app,
        Request::get(format!("/api/metadata/{file_id}")).body(Body::empty())?,
    )
    .await?;
    let meta: Value = serde_json::from_slice(&body)?;
    assert_eq!(meta["expires_at"], new_expiry);

    // Moving expiry backwards is refused.
    let request = Request::put(format!("/api/admin/file/{file_id}/expires"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"admin_password": "admin-test-password", "expires_at": old_expiry})
                .to_string(),
        ))?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Admin listing sees the file.
    let request = Request::post("/api/admin/files")
        .header("authorization", format!("Bearer {token}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({}).to_string()))?;
    let (status, _, body) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&body)?;
    assert_eq!(listing["count"], 1);

    // Force delete.
    let request = Request::delete(format!("/api/admin/file/{file_id}?admin_token={token}"))
        .body(Body::empty())?;
    let (status, _, _) = send(&app, request).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/file/{file_id}?admin_token={token}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_zip_browsing() -> anyhow::Result<()> {
    use async_zip::{
        base::write::ZipFileWriter,
        Compression,
        ZipEntryBuilder,
    };

    let mut zip_bytes = Vec::new();
    let mut writer = ZipFileWriter::new(&mut zip_bytes);
    writer
        .write_entry_whole(
            ZipEntryBuilder::new("readme.txt".to_string().into(), Compression::Deflate),
            b"hello from inside the archive",
        )
        .await?;
    writer.close().await?;

    let (_dir, app) = test_app()?;
    let uploaded = upload_file(&app, "bundle.zip", &zip_bytes, &[]).await?;
    let file_id = uploaded["file_id"].as_str().unwrap().to_string();

    let (status, _, body) = send(
        &app,
        Request::get(format!("/api/zip/{file_id}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&body)?;
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["entries"][0]["name"], "readme.txt");

    let (status, headers, body) = send(
        &app,
        Request::get(format!("/api/zip/{file_id}/extract?filename=readme.txt"))
            .body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/plain");
    assert_eq!(body, b"hello from inside the archive");

    // A text file is not an archive.
    let uploaded = upload_file(&app, "plain.txt", b"not a zip", &[]).await?;
    let text_id = uploaded["file_id"].as_str().unwrap();
    let (status, _, _) = send(
        &app,
        Request::get(format!("/api/zip/{text_id}")).body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() -> anyhow::Result<()> {
    let (_dir, app) = test_app()?;
    for uri in [
        "/api/file/not-a-real-id",
        "/api/file/0123456789abcdef0123456789abcdef",
        "/api/metadata/0123456789abcdef0123456789abcdef",
        "/api/chunk/0123456789abcdef0123456789abcdef/status",
    ] {
        let (status, _, _) = send(&app, Request::get(uri).body(Body::empty())?).await?;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
    let (status, _, _) = send(
        &app,
        Request::get("/api/file/0123456789abcdef0123456789abcdef/status").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
