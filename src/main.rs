use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chunkstream::{config::AppConfig, routes, services::upload_service::UploadService};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!(
        "Starting chunkstream (storage: {}, chunk size: {} bytes)",
        cfg.storage_dir,
        cfg.chunk_size
    );

    // --- Initialize core service (bootstraps chunks/, files/, metadata/) ---
    let service = UploadService::open(
        &cfg.storage_dir,
        cfg.token_secret.as_deref(),
        cfg.chunk_size,
    )
    .await?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    tracing::info!("Server listening on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
