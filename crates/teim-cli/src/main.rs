use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use teim_core::ImportPhase;
use teim_storage::{Backend, MemoryBackend, PgBackend};
use teim_sync::{repair::ensure_main_affiliations, ImportConfig, ImportEngine};

#[derive(Debug, Parser)]
#[command(name = "teim-cli")]
#[command(about = "TEIM command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one import phase over a local CSV file.
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        phase: ImportPhase,
    },
    /// Re-establish the one-main-affiliation-per-user invariant.
    RepairMain,
    /// Serve the HTTP import API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import { file, phase } => {
            let backend = backend_from_env().await?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let engine = ImportEngine::new(backend.as_ref(), ImportConfig::from_env());
            let report = engine.run(&bytes, phase).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::RepairMain => {
            let backend = backend_from_env().await?;
            let repaired = ensure_main_affiliations(backend.as_ref()).await?;
            println!("repaired main affiliation for {repaired} user(s)");
        }
        Commands::Serve => {
            teim_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn backend_from_env() -> Result<Arc<dyn Backend>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let backend = PgBackend::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            backend.ensure_schema().await.context("applying schema")?;
            Ok(Arc::new(backend))
        }
        Err(_) => {
            warn!("DATABASE_URL unset, using a process-local memory store");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
