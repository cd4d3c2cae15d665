//! Session registry: one JSON record per upload under `metadata/`.
//!
//! Records are written whole with a temp-file + rename so readers never see a
//! partial document. A `fileHash → uploadId` index over completed sessions is
//! rebuilt from disk at startup and kept current at merge; it is what makes
//! whole-file dedup lookups O(1) instead of a directory scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::RwLock,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ServiceError, ServiceResult};
use crate::models::session::UploadSession;

pub struct SessionRegistry {
    dir: PathBuf,
    file_index: RwLock<HashMap<String, Uuid>>,
}

impl SessionRegistry {
    /// Open (and create) the registry directory, rebuilding the whole-file
    /// digest index from the records already on disk.
    pub async fn open(dir: impl Into<PathBuf>) -> ServiceResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_session(&path).await {
                Ok(session) => {
                    if session.is_completed() {
                        if let Some(hash) = &session.file_hash {
                            index.insert(hash.clone(), session.upload_id);
                        }
                    }
                }
                Err(err) => {
                    warn!("skipping unreadable session record {:?}: {}", path, err);
                }
            }
        }
        debug!("session index rebuilt with {} completed uploads", index.len());

        Ok(Self {
            dir,
            file_index: RwLock::new(index),
        })
    }

    fn session_path(&self, upload_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", upload_id))
    }

    /// Persist a freshly-initiated session.
    pub async fn create(&self, session: &UploadSession) -> ServiceResult<()> {
        self.write_atomic(session).await
    }

    pub async fn get(&self, upload_id: Uuid) -> ServiceResult<UploadSession> {
        let path = self.session_path(&upload_id);
        match read_session(&path).await {
            Ok(session) => Ok(session),
            Err(ServiceError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::SessionNotFound(upload_id))
            }
            Err(err) => Err(err),
        }
    }

    /// Atomically record a successful merge: ordered chunk list, whole-file
    /// digest, artifact URL, `completed` status.
    pub async fn finalize(
        &self,
        upload_id: Uuid,
        chunks: Vec<String>,
        file_hash: String,
        artifact_url: String,
    ) -> ServiceResult<UploadSession> {
        let mut session = self.get(upload_id).await?;
        session.status = crate::models::session::SessionStatus::Completed;
        session.chunks = chunks;
        session.file_hash = Some(file_hash.clone());
        session.artifact_url = Some(artifact_url);
        session.updated_at = chrono::Utc::now();

        self.write_atomic(&session).await?;
        self.file_index
            .write()
            .await
            .insert(file_hash, session.upload_id);

        Ok(session)
    }

    /// Look up a completed session by its whole-file digest.
    pub async fn find_completed_by_hash(
        &self,
        file_hash: &str,
    ) -> ServiceResult<Option<UploadSession>> {
        let upload_id = { self.file_index.read().await.get(file_hash).copied() };
        let Some(upload_id) = upload_id else {
            return Ok(None);
        };

        match self.get(upload_id).await {
            Ok(session) if session.is_completed() => Ok(Some(session)),
            // The record vanished out from under the index; heal the index.
            Ok(_) | Err(ServiceError::SessionNotFound(_)) => {
                self.file_index.write().await.remove(file_hash);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn write_atomic(&self, session: &UploadSession) -> ServiceResult<()> {
        let path = self.session_path(&session.upload_id);
        let tmp_path = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let body = serde_json::to_vec_pretty(session)?;
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(&body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

async fn read_session(path: &Path) -> ServiceResult<UploadSession> {
    let raw = fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}
