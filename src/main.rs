//! cloudenv binary: prepares a cloud environment and runs its purger

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cloudenv::config::{AppConfig, LogFormat};
use cloudenv::env::{CloudEnv, DirectoryLiveFiles, LiveFileTable, StaticLiveFiles};
use cloudenv::provider::create_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    let provider_options = config
        .provider_options()
        .context("invalid provider configuration")?;
    let provider = create_provider(&config.provider.name, provider_options)
        .with_context(|| format!("failed to create provider '{}'", config.provider.name))?;

    let env_options = config
        .env_options(provider)
        .context("invalid environment configuration")?;

    let live_files = build_live_files(&config)?;
    let mut env = CloudEnv::new(env_options, live_files);
    env.prepare()
        .await
        .context("failed to prepare cloud environment")?;

    tracing::info!(
        purger = env.has_purger(),
        "Cloud environment ready; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested");
    env.shutdown().await?;

    Ok(())
}

fn build_live_files(config: &AppConfig) -> anyhow::Result<Arc<dyn LiveFileTable>> {
    match &config.purger.local_dir {
        Some(dir) => {
            tracing::info!(%dir, "Using local directory as live file table");
            Ok(Arc::new(DirectoryLiveFiles::new(dir)))
        }
        None if config.purger.enabled => {
            anyhow::bail!("purger.local_dir must be specified when the purger is enabled")
        }
        None => Ok(Arc::new(StaticLiveFiles::default())),
    }
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("cloudenv=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}
