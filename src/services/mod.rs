//! Server-side services: token signing, the session registry, the
//! content-addressed chunk store, artifact assembly, and the upload service
//! that composes them behind the HTTP handlers.

pub mod assembly;
pub mod chunk_store;
pub mod registry;
pub mod token;
pub mod upload_service;

use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("upload `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("chunk digest mismatch: claimed {claimed}, computed {computed}")]
    DigestMismatch { claimed: String, computed: String },
    #[error("chunk `{0}` is missing from the store")]
    MissingChunk(String),
    #[error("upload `{0}` is not completed")]
    NotCompleted(Uuid),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
