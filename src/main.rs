use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bounty_relay::artifact::{ArtifactError, FsArtifactStore};
use bounty_relay::bus::{Wakeup, spawn_workers};
use bounty_relay::config::{Config, ConfigError};
use bounty_relay::credentials::TokenCipher;
use bounty_relay::github::OctocrabSource;
use bounty_relay::payout::{ChainError, HttpRelayerAdapter, PayoutHandler};
use bounty_relay::server::{AppState, build_router};
use bounty_relay::store::{Store, StoreError};
use bounty_relay::sync::{SyncHandler, run_scheduler};
use bounty_relay::verify::{ClassifyHandler, VerifyHandler};
use bounty_relay::webhooks::Gateway;

#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("artifact store: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("chain adapter: {0}")]
    Chain(#[from] ChainError),

    #[error("server: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bounty_relay=debug,axum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;

    let store = Store::open(&config.database_path)?.with_max_attempts(config.workers.max_attempts);
    let artifacts = Arc::new(FsArtifactStore::open(&config.artifact_dir)?);
    let source = Arc::new(OctocrabSource::new(config.github_api_base.clone()));
    let chain = Arc::new(HttpRelayerAdapter::new(config.chain_relayers.clone())?);
    let cipher = TokenCipher::new(&config.token_key);
    let wakeup = Wakeup::new();
    let shutdown = CancellationToken::new();

    let mut tasks = Vec::new();
    tasks.extend(spawn_workers(
        &store,
        Arc::new(ClassifyHandler::new(store.clone(), wakeup.clone())),
        &config.workers,
        &wakeup,
        &shutdown,
    ));
    tasks.extend(spawn_workers(
        &store,
        Arc::new(VerifyHandler::new(
            store.clone(),
            Arc::clone(&source),
            artifacts,
            cipher.clone(),
            config.proof_signing_key.clone(),
            wakeup.clone(),
        )),
        &config.workers,
        &wakeup,
        &shutdown,
    ));
    tasks.extend(spawn_workers(
        &store,
        Arc::new(PayoutHandler::new(store.clone(), chain, config.confirm)),
        &config.workers,
        &wakeup,
        &shutdown,
    ));
    tasks.extend(spawn_workers(
        &store,
        Arc::new(SyncHandler::new(
            store.clone(),
            source,
            cipher,
            config.sync.max_pages,
        )),
        &config.workers,
        &wakeup,
        &shutdown,
    ));
    if let Some(interval) = config.sync.interval {
        info!(?interval, "Scheduled sync enabled");
        tasks.push(tokio::spawn(run_scheduler(
            store.clone(),
            interval,
            wakeup.clone(),
            shutdown.clone(),
        )));
    }

    let gateway = Gateway::new(store.clone(), config.webhook_secrets.clone(), wakeup.clone());
    let app = build_router(AppState::new(store, gateway, wakeup));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }
    Ok(())
}
