//! Source manager: one orchestrator per remote device

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::audio::param::DhId;
use crate::error::{Error, Result, DH_SUCCESS};
use crate::source::dev::{RegisterObserver, SourceDev};
use crate::source::SourceContext;
use crate::watchdog::Watchdog;

pub struct SourceManager {
    ctx: SourceContext,
    weak_self: Weak<SourceManager>,
    devices: DashMap<String, Arc<SourceDev>>,
    watchdog: Option<Watchdog>,
}

impl SourceManager {
    /// Start the manager and, when configured, its watchdog
    pub fn new(ctx: SourceContext) -> Result<Arc<Self>> {
        let watchdog = if ctx.config.watchdog.enabled {
            Some(Watchdog::start(ctx.config.watchdog.interval())?)
        } else {
            None
        };
        Ok(Self::with_watchdog(ctx, watchdog))
    }

    pub fn with_watchdog(ctx: SourceContext, watchdog: Option<Watchdog>) -> Arc<Self> {
        tracing::info!(
            "Source manager for {} started",
            ctx.provider.local_dev_id()
        );
        Arc::new_cyclic(|weak| Self {
            ctx,
            weak_self: weak.clone(),
            devices: DashMap::new(),
            watchdog,
        })
    }

    /// Enable one port of `dev_id`, creating the orchestrator on first use
    pub fn enable_daudio(&self, dev_id: &str, dh_id: &str, attrs: &str) -> Result<()> {
        if dev_id.is_empty() {
            return Err(Error::ParamInvalid("empty device id".into()));
        }
        let dev = match self.devices.get(dev_id) {
            Some(dev) => dev.clone(),
            None => {
                let observer: Weak<dyn RegisterObserver> = self.weak_self.clone();
                let dev = SourceDev::new(dev_id, self.ctx.clone(), observer)?;
                if let (Some(watchdog), Some(runner)) = (&self.watchdog, dev.runner()) {
                    watchdog.watch(runner);
                }
                self.devices
                    .entry(dev_id.to_string())
                    .or_insert(dev)
                    .clone()
            }
        };
        tracing::info!("Enable port {} of {}", dh_id, dev_id);
        dev.enable_daudio(dh_id, attrs)
    }

    pub fn disable_daudio(&self, dev_id: &str, dh_id: &str) -> Result<()> {
        let dev = self
            .device(dev_id)
            .ok_or_else(|| Error::NotFound(format!("source device {}", dev_id)))?;
        tracing::info!("Disable port {} of {}", dh_id, dev_id);
        dev.disable_daudio(dh_id)
    }

    pub fn device(&self, dev_id: &str) -> Option<Arc<SourceDev>> {
        self.devices.get(dev_id).map(|dev| dev.clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drop every orchestrator and stop the watchdog
    pub fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        self.devices.clear();
        tracing::info!("Source manager stopped");
    }
}

impl RegisterObserver for SourceManager {
    fn on_enable_result(&self, dev_id: &str, dh_id: DhId, code: i32) {
        if code == DH_SUCCESS {
            tracing::info!("Port {} of {} enabled", dh_id, dev_id);
        } else {
            tracing::error!("Enable port {} of {} failed: {}", dh_id, dev_id, code);
        }
    }

    fn on_disable_result(&self, dev_id: &str, dh_id: DhId, code: i32) {
        if code != DH_SUCCESS {
            tracing::error!("Disable port {} of {} failed: {}", dh_id, dev_id, code);
        }
        let removed = self
            .devices
            .remove_if(dev_id, |_, dev| dev.is_idle());
        if removed.is_some() {
            tracing::info!("Source device {} has no ports left, removed", dev_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::config::AppConfig;
    use crate::driver::SimulatedDriver;
    use crate::transport::MemoryNetwork;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_device_removed_when_last_port_disabled() {
        let network = MemoryNetwork::new();
        let driver = Arc::new(SimulatedDriver::new());
        let manager = SourceManager::with_watchdog(
            SourceContext {
                config: AppConfig::default(),
                codecs: Arc::new(CodecRegistry::default()),
                provider: network.provider("local"),
                driver: driver.clone(),
            },
            None,
        );

        assert!(manager.enable_daudio("", "1", "").is_err());
        manager.enable_daudio("remote", "1", "").unwrap();
        assert!(wait_until(|| driver.is_registered("remote", DhId(1))));
        assert_eq!(manager.device_count(), 1);

        manager.disable_daudio("remote", "1").unwrap();
        assert!(wait_until(|| manager.device_count() == 0));
        assert!(matches!(
            manager.disable_daudio("remote", "1"),
            Err(Error::NotFound(_))
        ));
    }
}
