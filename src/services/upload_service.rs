//! UploadService: the upload protocol behind the HTTP handlers.
//!
//! Composes the token signer, session registry, chunk store and assembler
//! into the four protocol operations (initiate, verify, chunk, merge) plus
//! the download/progress lookups. This struct is the router state; handlers
//! stay thin and delegate here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tracing::{debug, info};
use uuid::Uuid;

use super::assembly::Assembler;
use super::chunk_store::ChunkStore;
use super::registry::SessionRegistry;
use super::token::{TokenClaims, TokenSigner};
use super::{ServiceError, ServiceResult};
use crate::fingerprint::is_valid_digest;
use crate::models::chunk::{MAX_CHUNK_SIZE, MAX_FILE_SIZE};
use crate::models::protocol::{
    CreateUploadRequest, CreateUploadResponse, HashKind, MergeResponse, VerifyResponse,
};
use crate::models::session::UploadSession;

const MAX_FILE_NAME_LEN: usize = 255;

struct Inner {
    registry: SessionRegistry,
    store: Arc<ChunkStore>,
    assembler: Assembler,
    signer: TokenSigner,
    chunk_size: u64,
    storage_root: PathBuf,
}

#[derive(Clone)]
pub struct UploadService {
    inner: Arc<Inner>,
}

impl UploadService {
    /// Open the service over `storage_root`, creating the `chunks/`,
    /// `files/` and `metadata/` subdirectories as needed.
    pub async fn open(
        storage_root: impl Into<PathBuf>,
        token_secret: Option<&str>,
        chunk_size: u64,
    ) -> ServiceResult<Self> {
        let storage_root = storage_root.into();
        tokio::fs::create_dir_all(&storage_root).await?;

        let store = Arc::new(ChunkStore::new(storage_root.join("chunks")));
        tokio::fs::create_dir_all(store.base_path()).await?;
        let files_dir = storage_root.join("files");
        tokio::fs::create_dir_all(&files_dir).await?;
        let registry = SessionRegistry::open(storage_root.join("metadata")).await?;

        let signer = match token_secret {
            Some(secret) => TokenSigner::new(secret.as_bytes().to_vec()),
            None => TokenSigner::random(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                assembler: Assembler::new(Arc::clone(&store), files_dir),
                store,
                signer,
                chunk_size,
                storage_root,
            }),
        })
    }

    /// Root directory of all persisted state; used by the readiness probe.
    pub fn storage_root(&self) -> &Path {
        &self.inner.storage_root
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    /// Register a new session and hand back its token and the piece size
    /// the client must use.
    pub async fn initiate(&self, req: CreateUploadRequest) -> ServiceResult<CreateUploadResponse> {
        ensure_file_name_safe(&req.file_name)?;
        if req.file_size == 0 {
            return Err(ServiceError::Validation("fileSize must be positive".into()));
        }
        if req.file_size > MAX_FILE_SIZE {
            return Err(ServiceError::Validation(format!(
                "fileSize {} exceeds the {} byte limit",
                req.file_size, MAX_FILE_SIZE
            )));
        }

        let session = UploadSession::new(
            Uuid::new_v4(),
            req.file_name,
            req.file_size,
            req.file_type,
        );
        self.inner.registry.create(&session).await?;

        let upload_token = self.inner.signer.issue(&TokenClaims {
            upload_id: session.upload_id,
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            file_type: session.file_type.clone(),
            created_at: session.created_at,
        })?;

        info!(
            "initiated upload {} for `{}` ({} bytes)",
            session.upload_id, session.file_name, session.file_size
        );
        Ok(CreateUploadResponse {
            upload_token,
            chunk_size: self.inner.chunk_size,
        })
    }

    /// Answer an existence query for a chunk digest or a whole-file digest.
    pub async fn verify(
        &self,
        token: &str,
        hash: &str,
        kind: HashKind,
        chunk_index: Option<usize>,
    ) -> ServiceResult<VerifyResponse> {
        let claims = self.inner.signer.decode(token)?;
        if !is_valid_digest(hash) {
            return Err(ServiceError::Validation(format!(
                "`{}` is not a valid digest",
                hash
            )));
        }

        match kind {
            HashKind::Chunk => {
                let has_file = self.inner.store.contains(hash).await?;
                debug!(
                    "verify chunk {:?} of upload {}: {}",
                    chunk_index, claims.upload_id, has_file
                );
                Ok(VerifyResponse {
                    has_file,
                    rest: None,
                    url: None,
                })
            }
            HashKind::File => {
                if let Some(existing) = self.inner.registry.find_completed_by_hash(hash).await? {
                    info!(
                        "instant upload: {} matches completed upload {}",
                        claims.upload_id, existing.upload_id
                    );
                    return Ok(VerifyResponse {
                        has_file: true,
                        rest: None,
                        url: existing.artifact_url,
                    });
                }

                // No completed match. Report which of the session's recorded
                // chunks are still absent from the store. The chunk list is
                // only populated at merge, so before that this is empty and
                // the field is omitted entirely.
                let session = self.inner.registry.get(claims.upload_id).await?;
                let rest = if session.chunks.is_empty() {
                    None
                } else {
                    let mut missing = Vec::new();
                    for digest in &session.chunks {
                        if !self.inner.store.contains(digest).await? {
                            missing.push(digest.clone());
                        }
                    }
                    Some(missing)
                };
                Ok(VerifyResponse {
                    has_file: false,
                    rest,
                    url: None,
                })
            }
        }
    }

    /// Accept one chunk's bytes, verifying the claimed digest before the
    /// store write. Re-arrivals of known chunks are no-ops.
    pub async fn store_chunk(
        &self,
        token: &str,
        index: usize,
        digest: &str,
        start: u64,
        end: u64,
        data: &[u8],
    ) -> ServiceResult<()> {
        let claims = self.inner.signer.decode(token)?;

        if end <= start {
            return Err(ServiceError::Validation(format!(
                "chunk {} has an empty range [{start}, {end})",
                index
            )));
        }
        let span = end - start;
        if span > MAX_CHUNK_SIZE {
            return Err(ServiceError::Validation(format!(
                "chunk {} is {} bytes, over the {} byte limit",
                index, span, MAX_CHUNK_SIZE
            )));
        }
        if end > claims.file_size {
            return Err(ServiceError::Validation(format!(
                "chunk {} ends at {} beyond the declared file size {}",
                index, end, claims.file_size
            )));
        }
        if data.len() as u64 != span {
            return Err(ServiceError::Validation(format!(
                "chunk {} carries {} bytes but declares [{start}, {end})",
                index,
                data.len()
            )));
        }

        let written = self.inner.store.put(digest, data).await?;
        debug!(
            "chunk {} of upload {} ({} bytes): {}",
            index,
            claims.upload_id,
            span,
            if written { "stored" } else { "deduplicated" }
        );
        Ok(())
    }

    /// Finalize a session: all chunks must be present; the record is written
    /// atomically with the ordered digest list, whole-file digest and
    /// artifact URL.
    pub async fn merge(
        &self,
        token: &str,
        file_hash: &str,
        chunks: Vec<String>,
    ) -> ServiceResult<MergeResponse> {
        let claims = self.inner.signer.decode(token)?;
        let session = self.inner.registry.get(claims.upload_id).await?;

        if chunks.is_empty() {
            return Err(ServiceError::Validation(
                "merge requires a non-empty chunk list".into(),
            ));
        }
        if !is_valid_digest(file_hash) {
            return Err(ServiceError::Validation(format!(
                "`{}` is not a valid file hash",
                file_hash
            )));
        }
        for digest in &chunks {
            if !self.inner.store.contains(digest).await? {
                return Err(ServiceError::MissingChunk(digest.clone()));
            }
        }

        let artifact_url = format!(
            "/api/upload/file/{}/{}",
            session.upload_id, session.file_name
        );
        let merged = self
            .inner
            .registry
            .finalize(session.upload_id, chunks, file_hash.to_string(), artifact_url)
            .await?;

        info!(
            "merged upload {} into `{}` ({} chunks)",
            merged.upload_id,
            merged.file_name,
            merged.chunks.len()
        );
        Ok(MergeResponse {
            url: merged
                .artifact_url
                .ok_or_else(|| ServiceError::Validation("merge produced no url".into()))?,
        })
    }

    /// Session record for the progress endpoint.
    pub async fn session_info(&self, upload_id: Uuid) -> ServiceResult<UploadSession> {
        self.inner.registry.get(upload_id).await
    }

    /// Open a completed session's artifact for download, materializing it on
    /// first request.
    pub async fn open_artifact(&self, upload_id: Uuid) -> ServiceResult<(UploadSession, File)> {
        let session = self.inner.registry.get(upload_id).await?;
        let file = self.inner.assembler.open_artifact(&session).await?;
        Ok((session, file))
    }
}

/// Basic file-name validation to keep names printable and path-safe.
///
/// Rejects empty/oversized names, path separators, `..`, and control bytes.
fn ensure_file_name_safe(name: &str) -> ServiceResult<()> {
    if name.is_empty() {
        return Err(ServiceError::Validation("fileName is required".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(ServiceError::Validation("fileName is too long".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ServiceError::Validation(
            "fileName must not contain path separators".into(),
        ));
    }
    if name.bytes().any(|b| b.is_ascii_control()) {
        return Err(ServiceError::Validation(
            "fileName must not contain control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{digest_bytes, fold_digests};
    use crate::models::chunk::DEFAULT_CHUNK_SIZE;

    async fn service() -> (tempfile::TempDir, UploadService) {
        let dir = tempfile::tempdir().unwrap();
        let svc = UploadService::open(dir.path().join("uploads"), Some("test-secret"), DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        (dir, svc)
    }

    fn create_req(name: &str, size: u64) -> CreateUploadRequest {
        CreateUploadRequest {
            file_name: name.into(),
            file_size: size,
            file_type: "application/octet-stream".into(),
            last_modified: 0,
        }
    }

    #[tokio::test]
    async fn initiate_validates_metadata() {
        let (_dir, svc) = service().await;

        assert!(matches!(
            svc.initiate(create_req("", 10)).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.initiate(create_req("a.bin", 0)).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.initiate(create_req("../../evil", 10)).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.initiate(create_req("big.bin", MAX_FILE_SIZE + 1)).await,
            Err(ServiceError::Validation(_))
        ));

        let resp = svc.initiate(create_req("ok.bin", 10)).await.unwrap();
        assert_eq!(resp.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!resp.upload_token.is_empty());
    }

    #[tokio::test]
    async fn verify_requires_a_valid_token() {
        let (_dir, svc) = service().await;
        let err = svc
            .verify("bogus.token", &"0".repeat(32), HashKind::Chunk, Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn chunk_roundtrip_with_dedup() {
        let (_dir, svc) = service().await;
        let token = svc
            .initiate(create_req("data.bin", 11))
            .await
            .unwrap()
            .upload_token;

        let data = b"hello chunk";
        let digest = digest_bytes(data);

        let miss = svc
            .verify(&token, &digest, HashKind::Chunk, Some(0))
            .await
            .unwrap();
        assert!(!miss.has_file);

        svc.store_chunk(&token, 0, &digest, 0, data.len() as u64, data)
            .await
            .unwrap();

        let hit = svc
            .verify(&token, &digest, HashKind::Chunk, Some(0))
            .await
            .unwrap();
        assert!(hit.has_file);
    }

    #[tokio::test]
    async fn store_chunk_rejects_corrupt_and_oversized() {
        let (_dir, svc) = service().await;
        let token = svc
            .initiate(create_req("data.bin", MAX_CHUNK_SIZE * 4))
            .await
            .unwrap()
            .upload_token;

        // Wrong digest for the bytes.
        let err = svc
            .store_chunk(&token, 0, &digest_bytes(b"other"), 0, 4, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DigestMismatch { .. }));

        // Declared range disagrees with the body length.
        let err = svc
            .store_chunk(&token, 0, &digest_bytes(b"data"), 0, 5, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // Over the single-chunk limit.
        let err = svc
            .store_chunk(
                &token,
                0,
                &digest_bytes(b"x"),
                0,
                MAX_CHUNK_SIZE + 1,
                b"x",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn merge_then_instant_upload() {
        let (_dir, svc) = service().await;
        let data = b"the whole file";
        let token = svc
            .initiate(create_req("whole.bin", data.len() as u64))
            .await
            .unwrap()
            .upload_token;

        let digest = digest_bytes(data);
        svc.store_chunk(&token, 0, &digest, 0, data.len() as u64, data)
            .await
            .unwrap();

        let file_hash = fold_digests([&digest]);
        let merged = svc
            .merge(&token, &file_hash, vec![digest.clone()])
            .await
            .unwrap();
        assert!(merged.url.starts_with("/api/upload/file/"));
        assert!(merged.url.ends_with("/whole.bin"));

        // A second session for the same content short-circuits at verify.
        let token2 = svc
            .initiate(create_req("copy.bin", data.len() as u64))
            .await
            .unwrap()
            .upload_token;
        let hit = svc
            .verify(&token2, &file_hash, HashKind::File, None)
            .await
            .unwrap();
        assert!(hit.has_file);
        assert_eq!(hit.url.as_deref(), Some(merged.url.as_str()));
    }

    #[tokio::test]
    async fn verify_file_before_merge_has_no_rest() {
        let (_dir, svc) = service().await;
        let token = svc
            .initiate(create_req("fresh.bin", 100))
            .await
            .unwrap()
            .upload_token;

        let miss = svc
            .verify(&token, &"a".repeat(32), HashKind::File, None)
            .await
            .unwrap();
        assert!(!miss.has_file);
        assert!(miss.rest.is_none());
        assert!(miss.url.is_none());
    }

    #[tokio::test]
    async fn merge_refuses_missing_or_empty_chunks() {
        let (_dir, svc) = service().await;
        let token = svc
            .initiate(create_req("gap.bin", 10))
            .await
            .unwrap()
            .upload_token;

        let err = svc.merge(&token, &"a".repeat(32), vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .merge(&token, &"a".repeat(32), vec![digest_bytes(b"absent")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MissingChunk(_)));
    }

    #[tokio::test]
    async fn artifact_download_roundtrip() {
        use tokio::io::AsyncReadExt;

        let (_dir, svc) = service().await;
        let part_a = b"first half / ".to_vec();
        let part_b = b"second half".to_vec();
        let total = (part_a.len() + part_b.len()) as u64;

        let created = svc.initiate(create_req("joined.bin", total)).await.unwrap();
        let token = created.upload_token;

        let da = digest_bytes(&part_a);
        let db = digest_bytes(&part_b);
        // Arrival order scrambled on purpose; merge order is what counts.
        svc.store_chunk(&token, 1, &db, part_a.len() as u64, total, &part_b)
            .await
            .unwrap();
        svc.store_chunk(&token, 0, &da, 0, part_a.len() as u64, &part_a)
            .await
            .unwrap();

        let file_hash = fold_digests([&da, &db]);
        svc.merge(&token, &file_hash, vec![da.clone(), db.clone()])
            .await
            .unwrap();

        let claims_upload_id = {
            // The url path carries the upload id.
            let session = svc
                .inner
                .registry
                .find_completed_by_hash(&file_hash)
                .await
                .unwrap()
                .unwrap();
            session.upload_id
        };

        let (session, mut file) = svc.open_artifact(claims_upload_id).await.unwrap();
        assert_eq!(session.file_size, total);
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, [part_a, part_b].concat());
    }
}
