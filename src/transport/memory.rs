//! In-process engine provider
//!
//! A [`MemoryNetwork`] connects providers of several simulated devices inside
//! one process. Every engine owns a delivery thread, so traffic behaves like
//! a real channel: sends return at once and the peer's listener runs on the
//! peer engine's thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::engine::{
    Delivery, DeliveryQueue, EngineEvent, EngineListener, EngineProvider, EngineRole,
    ProviderListener, TransEngine,
};
use crate::audio::data::AudioData;
use crate::audio::param::DhId;
use crate::error::{Error, Result, TransportError};
use crate::protocol::AudioEvent;

/// (local device, peer device, port)
type EndpointKey = (String, String, DhId);

#[derive(Default)]
pub struct MemoryNetwork {
    providers: DashMap<String, Weak<MemoryProvider>>,
    endpoints: DashMap<EndpointKey, Weak<MemoryEngine>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider for the simulated device `dev_id`
    pub fn provider(self: &Arc<Self>, dev_id: &str) -> Arc<MemoryProvider> {
        let provider = Arc::new(MemoryProvider {
            dev_id: dev_id.to_string(),
            network: Arc::downgrade(self),
            listener: Mutex::new(None),
        });
        self.providers
            .insert(dev_id.to_string(), Arc::downgrade(&provider));
        provider
    }

    fn endpoint(&self, key: &EndpointKey) -> Option<Arc<MemoryEngine>> {
        self.endpoints.get(key).and_then(|e| e.upgrade())
    }

    fn provider_listener(&self, dev_id: &str) -> Option<Arc<dyn ProviderListener>> {
        let provider = self.providers.get(dev_id).and_then(|p| p.upgrade())?;
        let listener = provider.listener.lock().clone()?;
        listener.upgrade()
    }
}

pub struct MemoryProvider {
    dev_id: String,
    network: Weak<MemoryNetwork>,
    listener: Mutex<Option<Weak<dyn ProviderListener>>>,
}

impl EngineProvider for MemoryProvider {
    fn local_dev_id(&self) -> &str {
        &self.dev_id
    }

    fn create_engine(
        &self,
        peer_dev_id: &str,
        dh_id: DhId,
        role: EngineRole,
    ) -> Result<Arc<dyn TransEngine>> {
        let network = self
            .network
            .upgrade()
            .ok_or(Error::NotInit("memory network"))?;
        let key = (self.dev_id.clone(), peer_dev_id.to_string(), dh_id);
        let engine = Arc::new(MemoryEngine {
            delivery: DeliveryQueue::spawn(format!("mem-engine-{}", dh_id))?,
            key: key.clone(),
            role,
            network: self.network.clone(),
            peer: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        network.endpoints.insert(key, Arc::downgrade(&engine));
        tracing::debug!(
            "Memory engine {} -> {} port {} ({:?})",
            self.dev_id,
            peer_dev_id,
            dh_id,
            role
        );
        Ok(engine)
    }

    fn set_listener(&self, listener: Weak<dyn ProviderListener>) {
        *self.listener.lock() = Some(listener);
    }
}

pub struct MemoryEngine {
    key: EndpointKey,
    role: EngineRole,
    network: Weak<MemoryNetwork>,
    peer: Mutex<Option<Weak<MemoryEngine>>>,
    started: AtomicBool,
    delivery: DeliveryQueue,
}

impl MemoryEngine {
    fn peer_key(&self) -> EndpointKey {
        (self.key.1.clone(), self.key.0.clone(), self.key.2)
    }

    fn connected_peer(&self) -> Result<Arc<MemoryEngine>> {
        self.peer
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::ChannelClosed.into())
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl TransEngine for MemoryEngine {
    fn initialize(&self, listener: Arc<dyn EngineListener>) -> Result<()> {
        self.delivery.set_listener(listener);
        Ok(())
    }

    fn create_control_channel(&self) -> Result<()> {
        if !self.delivery.has_listener() {
            return Err(TransportError::EngineNotInit.into());
        }
        let network = self
            .network
            .upgrade()
            .ok_or(Error::NotInit("memory network"))?;
        let peer_key = self.peer_key();

        if network.endpoint(&peer_key).is_none() {
            let listener = network
                .provider_listener(&peer_key.0)
                .ok_or_else(|| TransportError::UnknownPeer(peer_key.0.clone()))?;
            listener.on_channel_request(&self.key.0, self.key.2)?;
        }
        let peer = network.endpoint(&peer_key).ok_or_else(|| {
            Error::ChannelCreateFailed(format!("{} did not create port {}", peer_key.0, self.key.2))
        })?;
        let me = network
            .endpoint(&self.key)
            .ok_or(Error::NotInit("memory engine"))?;

        *peer.peer.lock() = Some(Arc::downgrade(&me));
        *self.peer.lock() = Some(Arc::downgrade(&peer));
        peer.delivery.deliver(Delivery::Event(EngineEvent::ChannelOpened));
        self.delivery.deliver(Delivery::Event(EngineEvent::ChannelOpened));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        self.delivery.deliver(Delivery::Event(EngineEvent::Started));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::AcqRel) {
            self.delivery.deliver(Delivery::Event(EngineEvent::Stopped));
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        if let Some(network) = self.network.upgrade() {
            network.endpoints.remove(&self.key);
        }
        if let Some(peer) = self.peer.lock().take().and_then(|p| p.upgrade()) {
            peer.peer.lock().take();
            peer.delivery.deliver(Delivery::Event(EngineEvent::ChannelClosed));
        }
        self.delivery.close();
        Ok(())
    }

    fn send_message(&self, event: &AudioEvent) -> Result<()> {
        let peer = self.connected_peer()?;
        peer.delivery.deliver(Delivery::Message(event.clone()));
        Ok(())
    }

    fn push_audio_data(&self, data: &AudioData) -> Result<()> {
        let peer = self.connected_peer()?;
        peer.delivery.deliver(Delivery::Data(data.clone()));
        Ok(())
    }
}
