//! Sink device daemon
//!
//! Owns the local speaker and mic. Sources connect to it, open ports and
//! stream audio; the matching orchestrator is created on the first channel.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distributed_audio::{
    audio::device::LocalAudioBackend,
    codec::CodecRegistry,
    config::AppConfig,
    sink::{SinkContext, SinkManager},
    transport::TcpProvider,
};

#[cfg(feature = "cpal")]
fn local_backend() -> Arc<dyn LocalAudioBackend> {
    Arc::new(distributed_audio::audio::device::CpalBackend::new())
}

#[cfg(not(feature = "cpal"))]
fn local_backend() -> Arc<dyn LocalAudioBackend> {
    tracing::warn!("Built without cpal, audio is discarded and capture is silent");
    Arc::new(distributed_audio::audio::device::NullBackend::new())
}

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

    tracing::info!("Starting distributed audio sink {}", config.transport.local_dev_id);

    let provider = TcpProvider::bind(&config.transport, tokio::runtime::Handle::current())
        .context("binding engine provider")?;

    let manager = SinkManager::new(SinkContext {
        config: config.clone(),
        codecs: Arc::new(CodecRegistry::default()),
        provider: provider.clone(),
        backend: local_backend(),
    })?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    manager.shutdown();
    provider.shutdown();
    Ok(())
}
