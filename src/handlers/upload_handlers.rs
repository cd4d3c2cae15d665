//! HTTP handlers for the upload protocol.
//! Streams artifact bodies to avoid buffering in memory and delegates
//! protocol concerns to `UploadService`.

use crate::{
    errors::AppError,
    models::protocol::{
        ApiResponse, CreateUploadRequest, CreateUploadResponse, HashKind, MergeRequest,
        MergeResponse, VerifyResponse, HEADER_UPLOAD_CHUNK_INDEX, HEADER_UPLOAD_HASH,
        HEADER_UPLOAD_HASH_TYPE, HEADER_UPLOAD_TOKEN,
    },
    models::session::UploadSession,
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// `POST /api/upload/create` — register a session, hand out token + chunk size.
pub async fn create_upload(
    State(service): State<UploadService>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<Json<ApiResponse<CreateUploadResponse>>, AppError> {
    let created = service.initiate(req).await?;
    Ok(Json(ApiResponse::ok(created)))
}

/// `PATCH /api/upload/verify` — existence query for a chunk or file digest.
///
/// All inputs travel in headers so the request carries no body.
pub async fn verify_upload(
    State(service): State<UploadService>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<VerifyResponse>>, AppError> {
    let token = required_header(&headers, HEADER_UPLOAD_TOKEN)?;
    let hash = required_header(&headers, HEADER_UPLOAD_HASH)?;
    let kind: HashKind = required_header(&headers, HEADER_UPLOAD_HASH_TYPE)?
        .parse()
        .map_err(AppError::bad_request)?;
    let chunk_index = match headers.get(HEADER_UPLOAD_CHUNK_INDEX) {
        None => None,
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| {
                    AppError::bad_request(format!("invalid {} header", HEADER_UPLOAD_CHUNK_INDEX))
                })?,
        ),
    };

    let verdict = service.verify(token, hash, kind, chunk_index).await?;
    Ok(Json(ApiResponse::ok(verdict)))
}

/// `POST /api/upload/chunk` — receive one chunk as multipart form data.
///
/// Fields: `chunk` (bytes), `chunkIndex`, `chunkHash`, `chunkStart`,
/// `chunkEnd`. Field order is not guaranteed, so everything is collected
/// before validation.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let token = required_header(&headers, HEADER_UPLOAD_TOKEN)?.to_string();

    let mut data: Option<Bytes> = None;
    let mut chunk_index: Option<usize> = None;
    let mut chunk_hash: Option<String> = None;
    let mut chunk_start: Option<u64> = None;
    let mut chunk_end: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("chunk") => {
                data = Some(field.bytes().await.map_err(|err| {
                    AppError::bad_request(format!("failed reading chunk bytes: {}", err))
                })?);
            }
            Some("chunkIndex") => chunk_index = Some(text_field(field, "chunkIndex").await?),
            Some("chunkHash") => {
                chunk_hash = Some(field.text().await.map_err(|err| {
                    AppError::bad_request(format!("failed reading chunkHash: {}", err))
                })?);
            }
            Some("chunkStart") => chunk_start = Some(text_field(field, "chunkStart").await?),
            Some("chunkEnd") => chunk_end = Some(text_field(field, "chunkEnd").await?),
            _ => {}
        }
    }

    let data = data.ok_or_else(|| AppError::bad_request("missing `chunk` field"))?;
    let index = chunk_index.ok_or_else(|| AppError::bad_request("missing `chunkIndex` field"))?;
    let hash = chunk_hash.ok_or_else(|| AppError::bad_request("missing `chunkHash` field"))?;
    let start = chunk_start.ok_or_else(|| AppError::bad_request("missing `chunkStart` field"))?;
    let end = chunk_end.ok_or_else(|| AppError::bad_request("missing `chunkEnd` field"))?;

    service
        .store_chunk(&token, index, &hash, start, end, &data)
        .await?;
    Ok(Json(ApiResponse::ok(serde_json::json!({}))))
}

/// `POST /api/upload/merge` — finalize the session.
pub async fn merge_upload(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(req): Json<MergeRequest>,
) -> Result<Json<ApiResponse<MergeResponse>>, AppError> {
    let token = required_header(&headers, HEADER_UPLOAD_TOKEN)?;
    let merged = service.merge(token, &req.file_hash, req.chunks).await?;
    Ok(Json(ApiResponse::ok(merged)))
}

/// `GET /api/upload/file/{upload_id}/{file_name}` — stream the artifact.
///
/// Lookup is by `upload_id`; the trailing file name only makes the URL
/// save-as friendly.
pub async fn download_file(
    State(service): State<UploadService>,
    Path((upload_id, _file_name)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    let (session, file) = service.open_artifact(upload_id).await?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();

    let content_type = if session.file_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        session.file_type.clone()
    };
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&session.file_size.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    let disposition = format!("attachment; filename=\"{}\"", session.file_name);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// `GET /api/upload/progress/{upload_id}` — the session record.
pub async fn upload_progress(
    State(service): State<UploadService>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<ApiResponse<UploadSession>>, AppError> {
    let session = service.session_info(upload_id).await?;
    Ok(Json(ApiResponse::ok(session)))
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request(format!("missing {} header", name)))
}

async fn text_field<T: std::str::FromStr>(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<T, AppError> {
    field
        .text()
        .await
        .map_err(|err| AppError::bad_request(format!("failed reading {}: {}", name, err)))?
        .parse::<T>()
        .map_err(|_| AppError::bad_request(format!("invalid {} value", name)))
}
