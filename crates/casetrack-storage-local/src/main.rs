use std::sync::Arc;

use anyhow::Context;
use casetrack_storage_core::{InMemoryDocument, WriteOptions};
use casetrack_storage_local::{
    Cli, Command, EngineConfig, FileHandleStore, FsCapabilityProvider, StorageEngine,
};
use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, watch as tokio_watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting casetrack storage inspector");
    info!("  Folder: {}", cli.dir.display());
    info!("  Document: {}", cli.document_name);

    let config = EngineConfig {
        document_name: cli.document_name.clone(),
        ..Default::default()
    };
    let provider = Arc::new(FsCapabilityProvider::new(&cli.dir));
    let handle_store = Arc::new(FileHandleStore::new(cli.effective_handle_dir()));
    let document = Arc::new(InMemoryDocument::default());

    let engine = StorageEngine::new(config, provider, handle_store, document);
    engine
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", cli.dir.display()))?;

    match &cli.command {
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
        }
        Command::List => {
            for name in engine.list_files().await? {
                println!("{name}");
            }
        }
        Command::Export => match engine.read().await? {
            Some(bytes) => {
                let text = String::from_utf8(bytes).context("document is not UTF-8")?;
                println!("{text}");
            }
            None => info!("no document in {}", cli.dir.display()),
        },
        Command::Import { file } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            engine
                .write(bytes, WriteOptions { destructive: true })
                .await?;
            info!("imported {} into {}", file.display(), cli.document_name);
        }
        Command::Watch => {
            watch_changes(&engine).await?;
        }
    }

    engine.shutdown().await?;
    Ok(())
}

/// Stream engine events to stdout until the process is asked to stop.
async fn watch_changes(engine: &StorageEngine) -> anyhow::Result<()> {
    let mut changes = engine.subscribe_external_changes();
    let mut failures = engine.subscribe_failures();
    let mut shutdown_rx = create_shutdown_signal();

    info!("Watching for external changes (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|&v| v) => break,
            change = changes.recv() => match change {
                Ok(change) => println!("{}", serde_json::to_string(&change)?),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    info!("dropped {n} change events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            failure = failures.recv() => match failure {
                Ok(notice) => println!("{}", serde_json::to_string(&notice)?),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    info!("dropped {n} failure notices");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, shutting down");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, shutting down");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
