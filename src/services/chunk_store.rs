//! Content-addressed chunk store.
//!
//! Each chunk lives at `<base>/<digest[0..2]>/<digest>.chunk`; the two-hex
//! shard keeps per-directory file counts down. Because the key is the
//! content's digest, writes are idempotent and chunks deduplicate across
//! sessions for free.

use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{ServiceError, ServiceResult};
use crate::fingerprint::{digest_bytes, is_valid_digest};

#[derive(Clone)]
pub struct ChunkStore {
    base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Physical path for a digest. The digest must already be validated:
    /// it becomes a file name component.
    fn chunk_path(&self, digest: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(&digest[0..2]);
        path.push(format!("{}.chunk", digest));
        path
    }

    fn ensure_digest(digest: &str) -> ServiceResult<()> {
        if is_valid_digest(digest) {
            Ok(())
        } else {
            Err(ServiceError::Validation(format!(
                "`{}` is not a valid chunk digest",
                digest
            )))
        }
    }

    /// Is a chunk with this digest already stored?
    pub async fn contains(&self, digest: &str) -> ServiceResult<bool> {
        Self::ensure_digest(digest)?;
        Ok(fs::try_exists(self.chunk_path(digest)).await?)
    }

    /// Store chunk bytes under their digest.
    ///
    /// The digest of `data` is recomputed and must equal `claimed`; a
    /// mismatch fails the write with an integrity error. If the chunk is
    /// already present the write is skipped. Returns whether bytes were
    /// actually written.
    pub async fn put(&self, claimed: &str, data: &[u8]) -> ServiceResult<bool> {
        Self::ensure_digest(claimed)?;

        let computed = digest_bytes(data);
        if computed != claimed {
            return Err(ServiceError::DigestMismatch {
                claimed: claimed.to_string(),
                computed,
            });
        }

        let path = self.chunk_path(claimed);
        if fs::try_exists(&path).await? {
            debug!("chunk {} already stored, skipping write", claimed);
            return Ok(false);
        }

        let parent = path
            .parent()
            .ok_or_else(|| ServiceError::Validation("chunk path has no parent".into()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        // Write to a temp name then rename, so a crashed write never leaves
        // a truncated chunk under its final name.
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        fs::rename(&tmp_path, &path).await?;

        Ok(true)
    }

    /// Open a stored chunk for streaming.
    pub async fn open(&self, digest: &str) -> ServiceResult<File> {
        Self::ensure_digest(digest)?;
        File::open(self.chunk_path(digest)).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ServiceError::MissingChunk(digest.to_string())
            } else {
                ServiceError::Io(err)
            }
        })
    }
}
