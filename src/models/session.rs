//! The server-side record of one upload, from initiate to merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a session record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Completed,
    Failed,
}

/// Persisted per-upload metadata.
///
/// Created at initiate with an empty chunk list; rewritten once, atomically,
/// at merge. `completed` implies `chunks` is non-empty and both `file_hash`
/// and `artifact_url` are set.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub status: SessionStatus,

    /// Ordered chunk digests, populated at merge.
    #[serde(default)]
    pub chunks: Vec<String>,

    /// Whole-file digest (hash of chunk hashes), set at merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,

    /// Download path of the finished artifact, set at merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Fresh record in `uploading` state.
    pub fn new(upload_id: Uuid, file_name: String, file_size: u64, file_type: String) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            file_name,
            file_size,
            file_type,
            status: SessionStatus::Uploading,
            chunks: Vec::new(),
            file_hash: None,
            artifact_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}
