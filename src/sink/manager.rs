//! Sink manager: one orchestrator per source device talking to us
//!
//! Nothing here is enabled up front. A source opening a channel is what
//! brings its [`SinkDev`] into existence.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::audio::param::DhId;
use crate::error::Result;
use crate::sink::dev::{SinkDev, SinkDevListener};
use crate::sink::SinkContext;
use crate::transport::ProviderListener;
use crate::watchdog::Watchdog;

pub struct SinkManager {
    ctx: SinkContext,
    weak_self: Weak<SinkManager>,
    devices: DashMap<String, Arc<SinkDev>>,
    watchdog: Option<Watchdog>,
}

impl SinkManager {
    pub fn new(ctx: SinkContext) -> Result<Arc<Self>> {
        let watchdog = if ctx.config.watchdog.enabled {
            Some(Watchdog::start(ctx.config.watchdog.interval())?)
        } else {
            None
        };
        Ok(Self::with_watchdog(ctx, watchdog))
    }

    /// Build the manager and register it for incoming channel requests
    pub fn with_watchdog(ctx: SinkContext, watchdog: Option<Watchdog>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            ctx,
            weak_self: weak.clone(),
            devices: DashMap::new(),
            watchdog,
        });
        let listener: Weak<dyn ProviderListener> = manager.weak_self.clone();
        manager.ctx.provider.set_listener(listener);
        tracing::info!(
            "Sink manager for {} started",
            manager.ctx.provider.local_dev_id()
        );
        manager
    }

    pub fn device(&self, dev_id: &str) -> Option<Arc<SinkDev>> {
        self.devices.get(dev_id).map(|dev| dev.clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn get_or_create(&self, dev_id: &str) -> Result<Arc<SinkDev>> {
        if let Some(dev) = self.device(dev_id) {
            return Ok(dev);
        }
        let listener: Weak<dyn SinkDevListener> = self.weak_self.clone();
        let dev = SinkDev::new(dev_id, self.ctx.clone(), listener)?;
        if let (Some(watchdog), Some(runner)) = (&self.watchdog, dev.runner()) {
            watchdog.watch(runner);
        }
        Ok(self
            .devices
            .entry(dev_id.to_string())
            .or_insert(dev)
            .clone())
    }

    pub fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        self.devices.clear();
        tracing::info!("Sink manager stopped");
    }
}

impl ProviderListener for SinkManager {
    fn on_channel_request(&self, peer_dev_id: &str, dh_id: DhId) -> Result<()> {
        tracing::info!("Channel request from {} for port {}", peer_dev_id, dh_id);
        self.get_or_create(peer_dev_id)?.on_channel_request(dh_id)
    }
}

impl SinkDevListener for SinkManager {
    fn on_device_idle(&self, dev_id: &str) {
        let removed = self.devices.remove_if(dev_id, |_, dev| dev.is_idle());
        if removed.is_some() {
            tracing::info!("Sink device for {} removed", dev_id);
        }
    }
}
