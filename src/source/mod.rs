//! Source side: the device whose applications use remote audio hardware
//!
//! [`SourceManager`] keeps one [`SourceDev`] per remote device. Each remote
//! speaker or mic port becomes a [`SpeakerDev`] or [`MicDev`] registered
//! with the local [`AudioDriver`](crate::driver::AudioDriver).

pub mod dev;
pub mod io_dev;
pub mod manager;
pub mod mic;
pub mod speaker;

use std::sync::Arc;

use crate::codec::CodecRegistry;
use crate::config::AppConfig;
use crate::driver::AudioDriver;
use crate::transport::EngineProvider;

pub use dev::{RegisterObserver, SourceDev};
pub use io_dev::{AudioEventListener, IoDev, IoDevState};
pub use manager::SourceManager;
pub use mic::{EchoCanceller, MicDev};
pub use speaker::SpeakerDev;

/// Process-wide collaborators handed to every source orchestrator
#[derive(Clone)]
pub struct SourceContext {
    pub config: AppConfig,
    pub codecs: Arc<CodecRegistry>,
    pub provider: Arc<dyn EngineProvider>,
    pub driver: Arc<dyn AudioDriver>,
}
