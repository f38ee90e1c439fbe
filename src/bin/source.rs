//! Source device daemon
//!
//! Presents the speakers and mics of remote sink devices as local ports.
//!
//! Usage: `daudio-source [<sink-dev-id> <dh-id>...]`. Each listed port is
//! enabled on start; the sink's address comes from `transport.peers`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distributed_audio::{
    codec::CodecRegistry,
    config::AppConfig,
    driver::SimulatedDriver,
    source::{SourceContext, SourceManager},
    transport::TcpProvider,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("loading configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting distributed audio source {}", config.transport.local_dev_id);

    let codecs = Arc::new(CodecRegistry::default());
    let provider = TcpProvider::bind(&config.transport, tokio::runtime::Handle::current())
        .context("binding engine provider")?;

    let driver = Arc::new(SimulatedDriver::new());
    let manager = SourceManager::new(SourceContext {
        config: config.clone(),
        codecs: codecs.clone(),
        provider: provider.clone(),
        driver,
    })?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some((peer, ports)) = args.split_first() {
        let capability = codecs.capability_json();
        for dh_id in ports {
            manager
                .enable_daudio(peer, dh_id, &capability)
                .with_context(|| format!("enabling port {} of {}", dh_id, peer))?;
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    manager.shutdown();
    provider.shutdown();
    Ok(())
}
