//! HTTP handlers. Thin: parse the request, delegate to `UploadService`,
//! wrap the result in the response envelope.

pub mod health_handlers;
pub mod upload_handlers;
