//! Control and data transport
//!
//! An IO device talks to its peer port through an [`AudioTransport`]. The
//! transport wraps one engine channel, runs audio through the negotiated
//! codec and routes engine output back to the device through
//! [`AudioTransportCallback`].

pub mod av_trans;
pub mod engine;
pub mod memory;
pub mod tcp;

use std::sync::Arc;

use crate::audio::data::AudioData;
use crate::audio::param::AudioParam;
use crate::error::Result;
use crate::protocol::AudioEvent;

pub use av_trans::AvTransport;
pub use engine::{
    EngineEvent, EngineListener, EngineProvider, EngineRole, ProviderListener, TransEngine,
};
pub use memory::{MemoryNetwork, MemoryProvider};
pub use tcp::TcpProvider;

pub trait AudioTransport: Send + Sync {
    /// Create the engine for this port from `provider`
    fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()>;
    /// Open the channel; completion arrives as a transport event
    fn create_ctrl(&self) -> Result<()>;
    fn setup(&self, local: &AudioParam, remote: &AudioParam) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn restart(&self, local: &AudioParam, remote: &AudioParam) -> Result<()>;
    fn feed_audio_data(&self, data: AudioData) -> Result<()>;
    fn send_message(&self, event: &AudioEvent) -> Result<()>;
}

/// What a transport reports back to its owner
pub trait AudioTransportCallback: Send + Sync {
    fn on_engine_trans_event(&self, event: EngineEvent);
    fn on_engine_trans_message(&self, event: AudioEvent);
    fn on_engine_trans_data_available(&self, data: AudioData);
}
