//! What the upload engine reports to its caller.

use thiserror::Error;

use super::transport::TransportError;

/// Controller states. `Completed` and `Error` are terminal; `cancel()` puts
/// the controller back in `Idle` and ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Idle,
    Splitting,
    Uploading,
    Paused,
    Merging,
    Completed,
    Error,
}

/// A progress snapshot, emitted after every newly confirmed chunk.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Bytes confirmed uploaded (transferred or deduplicated).
    pub loaded: u64,
    /// Total file size.
    pub total: u64,
    /// `loaded / total`, in percent.
    pub percentage: f64,
    /// Bytes per second over the window since the previous emission.
    pub speed: f64,
    /// Estimated seconds to completion; `None` while speed is zero.
    pub remaining_time: Option<f64>,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
}

/// Events delivered to the caller. Exactly one of `Complete` or `Error`
/// arrives per session; a cancelled session emits neither, only the final
/// `StatusChange`.
#[derive(Debug)]
pub enum UploadEvent {
    StatusChange(UploadStatus),
    Progress(Progress),
    Complete { url: String },
    Error(UploadError),
}

#[derive(Debug, Error)]
pub enum UploadError {
    /// A chunk exhausted its retry budget.
    #[error("chunk {index} upload failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        source: TransportError,
    },
    /// A protocol call outside the per-chunk path failed fatally.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The source file could not be read.
    #[error("failed to read source file: {0}")]
    Read(#[from] std::io::Error),
    /// Engine-internal inconsistency.
    #[error("upload aborted: {0}")]
    Internal(String),
}
