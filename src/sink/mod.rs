//! Sink side: the device that owns the physical speaker and mic
//!
//! A source opening a channel toward this device makes [`SinkManager`]
//! create the matching [`SinkDev`] and a client for the port. The source then
//! drives the client's lifecycle with control messages.

pub mod dev;
pub mod manager;
pub mod mic_client;
pub mod speaker_client;

use std::sync::Arc;

use crate::audio::device::LocalAudioBackend;
use crate::codec::CodecRegistry;
use crate::config::AppConfig;
use crate::transport::EngineProvider;

pub use dev::{SinkDev, SinkDevListener};
pub use manager::SinkManager;
pub use mic_client::MicClient;
pub use speaker_client::SpeakerClient;

/// Process-wide collaborators handed to every sink orchestrator
#[derive(Clone)]
pub struct SinkContext {
    pub config: AppConfig,
    pub codecs: Arc<CodecRegistry>,
    pub provider: Arc<dyn EngineProvider>,
    pub backend: Arc<dyn LocalAudioBackend>,
}
