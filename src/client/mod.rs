//! The upload engine.
//!
//! [`UploadController`] orchestrates a session: it initiates with the server,
//! fingerprints the file through the [`splitter`], schedules per-chunk
//! verify+transfer tasks on the bounded [`scheduler`], retries transient
//! failures with backoff, and merges when everything is confirmed. All
//! traffic goes through an [`transport::UploadTransport`], so the engine
//! itself never touches HTTP.

pub mod controller;
pub mod events;
pub mod scheduler;
pub mod splitter;
pub mod transport;

pub use controller::{ControllerHandle, UploadController, UploadOptions};
pub use events::{Progress, UploadError, UploadEvent, UploadStatus};
pub use transport::{HttpTransport, TransportError, UploadTransport};
