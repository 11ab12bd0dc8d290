use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aether_billing::{PresetApplyMode, apply_presets};
use aether_core::{
    DispatchEngine, InProcessLockStore, PassthroughCipher, UpstreamClientConfig, VideoPoller,
    VideoService, WreqUpstreamClient,
};
use aether_storage::{SeaOrmStorage, Storage};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = cli::Cli::parse().into_patch().into_config();

    let storage = Arc::new(SeaOrmStorage::connect(&config.dsn).await?);
    storage.sync().await?;

    let presets = apply_presets(storage.as_ref(), PresetApplyMode::Merge).await;
    tracing::info!(
        created = presets.created,
        skipped = presets.skipped,
        "collector presets applied"
    );

    let upstream: Arc<dyn aether_core::UpstreamClient> = Arc::new(WreqUpstreamClient::new(
        UpstreamClientConfig::default(),
    )?);
    let cipher: Arc<dyn aether_core::SecretCipher> = Arc::new(PassthroughCipher);
    let storage_dyn: Arc<dyn Storage> = storage.clone();

    let engine = Arc::new(DispatchEngine::new(
        storage_dyn.clone(),
        upstream.clone(),
        cipher.clone(),
        config.clone(),
    ));
    let video = Arc::new(VideoService::new(
        storage_dyn.clone(),
        upstream.clone(),
        cipher.clone(),
        config.clone(),
    ));

    let poller = VideoPoller::new(
        storage_dyn,
        upstream,
        cipher,
        Arc::new(InProcessLockStore::new()),
        config.clone(),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poller.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            poller.tick().await;
        }
    });

    let app = aether_router::proxy_router(engine, video);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
