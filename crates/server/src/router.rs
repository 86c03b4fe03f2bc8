use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    routing::{
        delete,
        get,
        post,
        put,
    },
    BoxError,
    Router,
};
use common::http::extract::Json;
use http::StatusCode;
use serde_json::json;
use tower::{
    timeout::TimeoutLayer,
    ServiceBuilder,
};
use tower_http::trace::TraceLayer;

use crate::{
    admin,
    files,
    preview,
    upload,
    zip,
    LocalAppState,
};

pub fn router(st: LocalAppState) -> Router {
    // Multipart framing adds a little on top of the payload itself.
    let upload_body_limit = (st.config.chunk_threshold + (1 << 20)) as usize;
    let chunk_body_limit = (st.config.max_chunk_size + (1 << 20)) as usize;

    // Short, JSON-shaped endpoints run under the request deadline.
    let timed = Router::new()
        .route("/chunk/initiate", post(upload::chunk_initiate))
        .route("/chunk/{upload_id}/complete", post(upload::chunk_complete))
        .route("/chunk/{upload_id}/status", get(upload::chunk_status))
        .route("/file/{id}/status", get(files::file_status))
        .route("/metadata/{id}", get(files::get_metadata))
        .route("/zip/{id}", get(zip::list_zip))
        .route("/zip/{id}/extract", get(zip::extract_entry))
        .route("/admin/auth", post(admin::auth))
        .route("/admin/file/{id}/expires", put(admin::update_expiry))
        .route("/admin/file/{id}", delete(admin::force_delete))
        .route("/admin/files", post(admin::list_files))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(TimeoutLayer::new(st.config.request_timeout())),
        );

    // Large transfers honor client cancellation but get no server deadline.
    let streaming = Router::new()
        .route(
            "/upload",
            post(upload::single_shot).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route(
            "/chunk/{upload_id}/{chunk_index}",
            post(upload::put_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route("/file/{id}", get(files::get_file).delete(files::delete_file))
        .route("/preview/{id}", get(preview::preview))
        .route("/stream/{id}", get(preview::stream));

    Router::new()
        .nest("/api", timed.merge(streaming))
        .layer(TraceLayer::new_for_http())
        .with_state(st)
}

async fn handle_middleware_error(err: BoxError) -> (StatusCode, Json<serde_json::Value>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({"code": "RequestTimeout", "message": "request took too long"})),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": "InternalServerError", "message": err.to_string()})),
        )
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
