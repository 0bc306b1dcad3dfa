//! Entrypoint: load configuration, open the store, fan out one worker per
//! source set, and wait for shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use catmirror::config::MirrorSettings;
use catmirror::notify::Notifier;
use catmirror::store::MetadataStore;
use catmirror::worker::{EngineContext, MirrorWorker};

/// Stability-aware, verified directory mirror.
#[derive(Parser)]
#[command(
    name = "catmirror",
    about = "Mirrors completed files from source directories to destinations, verifying every copy"
)]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, env = "CATMIRROR_CONFIG")]
    config: PathBuf,

    /// Path to the SQLite metadata store.
    #[arg(long, env = "CATMIRROR_DB", default_value = "catmirror.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catmirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if !cli.config.exists() {
        MirrorSettings::write_template(&cli.config)
            .context("failed to write template configuration")?;
        info!(
            path = %cli.config.display(),
            "template configuration written; fill it in and start again"
        );
        return Ok(());
    }

    let settings = MirrorSettings::load(&cli.config).context("failed to load configuration")?;
    let store =
        Arc::new(MetadataStore::open(&cli.db).context("failed to open metadata store")?);

    let notifier = Notifier::from_settings(&settings);
    if notifier.is_enabled() && !notifier.auth_test().await {
        warn!("slack credentials rejected; notifications will likely fail");
    }

    let cancel = CancellationToken::new();
    let ctx = EngineContext {
        store,
        notifier,
        cancel: cancel.clone(),
    };

    let mut workers = Vec::new();
    for config in settings.configs {
        let name = config.name.clone();
        let worker = MirrorWorker::new(config, ctx.clone())
            .with_context(|| format!("invalid source set configuration {name:?}"))?;
        workers.push(tokio::spawn(worker.run()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    for handle in workers {
        if let Err(err) = handle.await {
            error!(error = %err, "worker task panicked");
        }
    }

    info!("shut down cleanly");
    Ok(())
}
