//! Wire types shared by the HTTP handlers and the client transport.
//!
//! Every JSON response is wrapped in [`ApiResponse`]: HTTP status conveys
//! transport-level failure, `success: false` conveys semantic failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Request headers used by the verify/chunk/merge operations.
pub const HEADER_UPLOAD_TOKEN: &str = "upload-token";
pub const HEADER_UPLOAD_HASH: &str = "upload-hash";
pub const HEADER_UPLOAD_HASH_TYPE: &str = "upload-hash-type";
pub const HEADER_UPLOAD_CHUNK_INDEX: &str = "upload-chunk-index";

/// The response envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// `POST /create` body.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub last_modified: i64,
}

/// `POST /create` response data.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    pub upload_token: String,
    pub chunk_size: u64,
}

/// What kind of digest a `PATCH /verify` asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Chunk,
    File,
}

impl HashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashKind::Chunk => "chunk",
            HashKind::File => "file",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(HashKind::Chunk),
            "file" => Ok(HashKind::File),
            other => Err(format!("unknown hash type `{}`", other)),
        }
    }
}

/// `PATCH /verify` response data.
///
/// For `chunk` queries only `has_file` is meaningful. For `file` queries a
/// hit carries the artifact `url`; a miss on a known session may carry
/// `rest`, the chunk digests still absent from the store.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub has_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `POST /merge` body.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
    /// Chunk digests in chunk-index order.
    pub chunks: Vec<String>,
}

/// `POST /merge` response data.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MergeResponse {
    pub url: String,
}
