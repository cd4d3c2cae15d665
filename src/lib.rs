//! Resumable, deduplicating large-file uploads.
//!
//! The crate has two halves sharing one protocol:
//!
//! - [`client`] — the upload engine: chunk splitting, fingerprinting,
//!   a bounded concurrent scheduler, and an upload controller with
//!   pause/resume/retry, talking to any [`client::transport::UploadTransport`].
//! - [`services`] + [`handlers`] + [`routes`] — the server: session registry,
//!   content-addressed chunk store, and on-demand streaming assembly, exposed
//!   over HTTP by the `chunkstream` binary.

pub mod client;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
