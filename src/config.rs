use anyhow::{Context, Result};
use clap::Parser;
use std::env;

use crate::models::chunk::DEFAULT_CHUNK_SIZE;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Secret for signing upload tokens. When unset, a random per-process
    /// secret is generated (tokens do not survive a restart).
    pub token_secret: Option<String>,
    /// Piece size handed to clients at initiate time.
    pub chunk_size: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked-upload service")]
pub struct Args {
    /// Host to bind to (overrides CHUNKSTREAM_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKSTREAM_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for chunks, artifacts and session records
    /// (overrides CHUNKSTREAM_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Token signing secret (overrides CHUNKSTREAM_TOKEN_SECRET)
    #[arg(long)]
    pub token_secret: Option<String>,

    /// Chunk size in bytes handed to clients (overrides CHUNKSTREAM_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNKSTREAM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("CHUNKSTREAM_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing CHUNKSTREAM_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading CHUNKSTREAM_PORT"),
        };
        let env_storage = env::var("CHUNKSTREAM_STORAGE_DIR").unwrap_or_else(|_| "./uploads".into());
        let env_secret = env::var("CHUNKSTREAM_TOKEN_SECRET").ok();
        let env_chunk_size = match env::var("CHUNKSTREAM_CHUNK_SIZE") {
            Ok(value) => Some(
                value
                    .parse::<u64>()
                    .with_context(|| format!("parsing CHUNKSTREAM_CHUNK_SIZE value `{}`", value))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading CHUNKSTREAM_CHUNK_SIZE"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            token_secret: args.token_secret.or(env_secret),
            chunk_size: args
                .chunk_size
                .or(env_chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
