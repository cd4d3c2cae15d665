//! Defines routes for the upload protocol and operational probes.
//!
//! ## Structure
//! - **Protocol endpoints** (under `/api/upload`)
//!   - `POST  /create` — register a session, returns token + chunk size
//!   - `PATCH /verify` — existence query for a chunk or whole-file digest
//!   - `POST  /chunk` — receive one chunk (multipart form)
//!   - `POST  /merge` — finalize the session
//!   - `GET   /file/{upload_id}/{file_name}` — stream the assembled artifact
//!   - `GET   /progress/{upload_id}` — session record
//!
//! - **Operational endpoints** (mounted at root)
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            create_upload, download_file, merge_upload, upload_chunk, upload_progress,
            verify_upload,
        },
    },
    models::chunk::MAX_CHUNK_SIZE,
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Room for multipart framing and the text fields around a maximal chunk.
const CHUNK_BODY_OVERHEAD: usize = 64 * 1024;

/// Build and return the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    let upload = Router::new()
        .route("/create", post(create_upload))
        .route("/verify", patch(verify_upload))
        .route("/chunk", post(upload_chunk))
        .route("/merge", post(merge_upload))
        .route("/file/{upload_id}/{file_name}", get(download_file))
        .route("/progress/{upload_id}", get(upload_progress));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/upload", upload)
        .layer(DefaultBodyLimit::max(
            MAX_CHUNK_SIZE as usize + CHUNK_BODY_OVERHEAD,
        ))
}
