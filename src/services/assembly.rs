//! Artifact assembly: materializing a completed upload from its chunks.
//!
//! The first download of a session streams every chunk, in the merge-time
//! order, into `files/<uploadId>.dat` and renames it into place; later
//! downloads serve the materialized file directly. `tokio::io::copy` keeps
//! memory bounded regardless of artifact size.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::{ServiceError, ServiceResult};
use crate::models::session::UploadSession;

#[derive(Clone)]
pub struct Assembler {
    store: Arc<ChunkStore>,
    files_dir: PathBuf,
}

impl Assembler {
    pub fn new(store: Arc<ChunkStore>, files_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            files_dir: files_dir.into(),
        }
    }

    pub fn artifact_path(&self, upload_id: &Uuid) -> PathBuf {
        self.files_dir.join(format!("{}.dat", upload_id))
    }

    /// Ensure the session's artifact exists on disk, building it on first
    /// request, and open it for streaming.
    pub async fn open_artifact(&self, session: &UploadSession) -> ServiceResult<File> {
        if !session.is_completed() {
            return Err(ServiceError::NotCompleted(session.upload_id));
        }

        let path = self.artifact_path(&session.upload_id);
        if !fs::try_exists(&path).await? {
            self.materialize(session, &path).await?;
        }
        Ok(File::open(&path).await?)
    }

    /// Concatenate the session's chunks into one file.
    ///
    /// The sink stays open across pieces; it is flushed and synced before the
    /// rename exposes the artifact under its final name.
    async fn materialize(&self, session: &UploadSession, path: &Path) -> ServiceResult<()> {
        fs::create_dir_all(&self.files_dir).await?;
        let tmp_path = self.files_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut sink = File::create(&tmp_path).await?;

        let result = async {
            for digest in &session.chunks {
                let mut reader = self.store.open(digest).await?;
                tokio::io::copy(&mut reader, &mut sink).await?;
            }
            sink.flush().await?;
            sink.sync_all().await?;
            Ok::<_, ServiceError>(())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        fs::rename(&tmp_path, path).await?;
        debug!(
            "materialized artifact for upload {} ({} chunks)",
            session.upload_id,
            session.chunks.len()
        );
        Ok(())
    }
}
