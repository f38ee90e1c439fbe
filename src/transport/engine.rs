//! Channel engine abstraction
//!
//! An engine is one bidirectional channel between a local port and the same
//! port on a peer device. It carries control messages and audio frames.
//! Engines come from an [`EngineProvider`]; when a peer opens a channel
//! toward this device the provider asks its [`ProviderListener`] to create
//! the matching local engine first.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio::data::AudioData;
use crate::audio::param::DhId;
use crate::error::Result;
use crate::protocol::AudioEvent;

/// Which way audio flows through an engine from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineRole {
    Sender,
    Receiver,
}

/// Channel lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ChannelOpened,
    ChannelClosed,
    Started,
    Stopped,
    TransError(String),
}

pub trait EngineListener: Send + Sync {
    fn on_engine_event(&self, event: EngineEvent);
    fn on_engine_message(&self, event: AudioEvent);
    fn on_engine_data(&self, data: AudioData);
}

pub trait TransEngine: Send + Sync {
    fn initialize(&self, listener: Arc<dyn EngineListener>) -> Result<()>;

    /// Open the channel to the peer. Completion is reported asynchronously
    /// as [`EngineEvent::ChannelOpened`] or [`EngineEvent::TransError`].
    fn create_control_channel(&self) -> Result<()>;

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
    fn send_message(&self, event: &AudioEvent) -> Result<()>;
    fn push_audio_data(&self, data: &AudioData) -> Result<()>;
}

/// Receives channel requests initiated by peers
pub trait ProviderListener: Send + Sync {
    /// Create the local engine for `dh_id` before the provider attaches the
    /// incoming channel to it
    fn on_channel_request(&self, peer_dev_id: &str, dh_id: DhId) -> Result<()>;
}

pub trait EngineProvider: Send + Sync {
    fn local_dev_id(&self) -> &str;

    fn create_engine(
        &self,
        peer_dev_id: &str,
        dh_id: DhId,
        role: EngineRole,
    ) -> Result<Arc<dyn TransEngine>>;

    fn set_listener(&self, listener: Weak<dyn ProviderListener>);
}

pub(crate) enum Delivery {
    Event(EngineEvent),
    Message(AudioEvent),
    Data(AudioData),
    Shutdown,
}

/// Hands engine output to the listener on a thread of its own, so a peer's
/// send never runs listener code on the sender's thread
pub(crate) struct DeliveryQueue {
    tx: Sender<Delivery>,
    listener: Arc<Mutex<Option<Arc<dyn EngineListener>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl DeliveryQueue {
    pub(crate) fn spawn(name: String) -> Result<Self> {
        let (tx, rx) = unbounded::<Delivery>();
        let listener: Arc<Mutex<Option<Arc<dyn EngineListener>>>> = Arc::new(Mutex::new(None));
        let target = listener.clone();

        let handle = thread::Builder::new().name(name).spawn(move || {
            while let Ok(delivery) = rx.recv() {
                if let Delivery::Shutdown = delivery {
                    break;
                }
                let Some(listener) = target.lock().clone() else {
                    tracing::debug!("Engine output dropped, no listener");
                    continue;
                };
                match delivery {
                    Delivery::Event(event) => listener.on_engine_event(event),
                    Delivery::Message(event) => listener.on_engine_message(event),
                    Delivery::Data(data) => listener.on_engine_data(data),
                    Delivery::Shutdown => {}
                }
            }
        })?;

        Ok(Self {
            tx,
            listener,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn EngineListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        let _ = self.tx.send(delivery);
    }

    /// Deliver what is queued, then stop
    pub(crate) fn close(&self) {
        let _ = self.tx.send(Delivery::Shutdown);
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.listener.lock().take();
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.close();
    }
}
