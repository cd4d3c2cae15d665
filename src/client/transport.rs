//! Pluggable request strategy for the upload engine.
//!
//! The controller drives the protocol through [`UploadTransport`] and never
//! sees credentials or URLs; [`HttpTransport`] is the production adapter and
//! tests substitute their own. Errors are typed so the controller can tell
//! what deserves a retry.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::models::chunk::ChunkDescriptor;
use crate::models::protocol::{
    ApiResponse, CreateUploadRequest, CreateUploadResponse, HashKind, MergeRequest, MergeResponse,
    VerifyResponse, HEADER_UPLOAD_CHUNK_INDEX, HEADER_UPLOAD_HASH, HEADER_UPLOAD_HASH_TYPE,
    HEADER_UPLOAD_TOKEN,
};

/// Requests stay open long enough for a full chunk on a slow link.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(150);

/// Slice size for body streaming and progress reporting.
const STREAM_SLICE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("failed to read source file: {0}")]
    Source(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the controller's backoff-retry policy applies.
    ///
    /// Network trouble is transient. Integrity failures mean the bytes went
    /// bad in flight, so a re-transfer is worth attempting too.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Integrity(_)
        )
    }
}

/// File metadata sent at initiate time.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub last_modified: i64,
}

/// What the server hands back at initiate time. The client must adopt the
/// returned chunk size.
#[derive(Debug, Clone)]
pub struct Initiated {
    pub upload_token: String,
    pub chunk_size: u64,
}

/// Per-chunk byte progress: called with cumulative bytes handed to the wire.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// The four protocol operations. The adapter attaches credentials; the
/// controller treats the token as an opaque string.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn initiate(&self, meta: &FileMeta) -> Result<Initiated, TransportError>;

    async fn verify(
        &self,
        token: &str,
        hash: &str,
        kind: HashKind,
        chunk_index: Option<usize>,
    ) -> Result<VerifyResponse, TransportError>;

    /// Stream one chunk's bytes (read from `source` at the descriptor's
    /// range) together with its index, digest and offsets.
    async fn transfer_chunk(
        &self,
        token: &str,
        source: &Path,
        chunk: &ChunkDescriptor,
        on_progress: ProgressFn,
    ) -> Result<(), TransportError>;

    /// Finalize the session; returns the artifact URL.
    async fn merge(
        &self,
        token: &str,
        file_hash: &str,
        chunks: &[String],
    ) -> Result<String, TransportError>;
}

/// HTTP adapter speaking the server's wire protocol.
///
/// `base_url` points at the mounted protocol root, e.g.
/// `http://localhost:3000/api/upload`.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Unwrap the `{success, data, message}` envelope, classifying failures.
    async fn unwrap<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Network(format!("server error: {}", status)));
        }

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|err| TransportError::Network(format!("unreadable response: {}", err)))?;

        if envelope.success {
            if let Some(data) = envelope.data {
                return Ok(data);
            }
        }
        let message = envelope
            .message
            .unwrap_or_else(|| "request failed".to_string());
        Err(match status.as_u16() {
            400 => TransportError::Validation(message),
            401 | 403 => TransportError::Unauthorized(message),
            422 => TransportError::Integrity(message),
            _ => TransportError::Rejected(message),
        })
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn initiate(&self, meta: &FileMeta) -> Result<Initiated, TransportError> {
        let body = CreateUploadRequest {
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            file_type: meta.file_type.clone(),
            last_modified: meta.last_modified,
        };
        let response = self
            .http
            .post(self.url("/create"))
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let created: CreateUploadResponse = Self::unwrap(response).await?;
        Ok(Initiated {
            upload_token: created.upload_token,
            chunk_size: created.chunk_size,
        })
    }

    async fn verify(
        &self,
        token: &str,
        hash: &str,
        kind: HashKind,
        chunk_index: Option<usize>,
    ) -> Result<VerifyResponse, TransportError> {
        let mut request = self
            .http
            .patch(self.url("/verify"))
            .header(HEADER_UPLOAD_TOKEN, token)
            .header(HEADER_UPLOAD_HASH, hash)
            .header(HEADER_UPLOAD_HASH_TYPE, kind.as_str());
        if let Some(index) = chunk_index {
            request = request.header(HEADER_UPLOAD_CHUNK_INDEX, index.to_string());
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Self::unwrap(response).await
    }

    async fn transfer_chunk(
        &self,
        token: &str,
        source: &Path,
        chunk: &ChunkDescriptor,
        on_progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let data = read_range(source, chunk.start, chunk.len() as usize).await?;

        // Stream the body in slices so progress arrives as bytes leave, not
        // only when the request completes.
        let total = data.len();
        let payload = Bytes::from(data);
        let mut offset = 0usize;
        let mut slices = Vec::with_capacity(total.div_ceil(STREAM_SLICE));
        while offset < total {
            let end = (offset + STREAM_SLICE).min(total);
            slices.push(payload.slice(offset..end));
            offset = end;
        }

        let mut sent = 0u64;
        let stream = futures::stream::iter(slices.into_iter().map(move |slice: Bytes| {
            sent += slice.len() as u64;
            on_progress(sent);
            Ok::<_, std::io::Error>(slice)
        }));
        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            total as u64,
        )
        .file_name(chunk.index.to_string())
        .mime_str("application/octet-stream")
        .map_err(|err| TransportError::Validation(err.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .text("chunkIndex", chunk.index.to_string())
            .text("chunkHash", chunk.digest.clone())
            .text("chunkStart", chunk.start.to_string())
            .text("chunkEnd", chunk.end.to_string())
            .part("chunk", part);

        let response = self
            .http
            .post(self.url("/chunk"))
            .header(HEADER_UPLOAD_TOKEN, token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let _: serde_json::Value = Self::unwrap(response).await?;
        Ok(())
    }

    async fn merge(
        &self,
        token: &str,
        file_hash: &str,
        chunks: &[String],
    ) -> Result<String, TransportError> {
        let body = MergeRequest {
            file_hash: file_hash.to_string(),
            chunks: chunks.to_vec(),
        };
        let response = self
            .http
            .post(self.url("/merge"))
            .header(HEADER_UPLOAD_TOKEN, token)
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let merged: MergeResponse = Self::unwrap(response).await?;
        Ok(merged.url)
    }
}

/// Read exactly one chunk's byte range from the source file.
async fn read_range(source: &Path, start: u64, len: usize) -> Result<Vec<u8>, std::io::Error> {
    let mut file = tokio::fs::File::open(source).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn read_range_extracts_the_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        let bytes = read_range(&path, 3, 4).await.unwrap();
        assert_eq!(&bytes, b"3456");
    }

    #[tokio::test]
    async fn read_range_past_eof_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"short").unwrap();

        assert!(read_range(&path, 0, 64).await.is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Network("down".into()).is_retryable());
        assert!(TransportError::Integrity("bad digest".into()).is_retryable());
        assert!(!TransportError::Unauthorized("expired".into()).is_retryable());
        assert!(!TransportError::Validation("missing".into()).is_retryable());
        assert!(!TransportError::Rejected("nope".into()).is_retryable());
    }
}
