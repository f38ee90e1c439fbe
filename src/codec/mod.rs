//! Pluggable encode/decode processors
//!
//! Transports run every outgoing frame through an encoder and every incoming
//! frame through a decoder. Processors are created from factories registered
//! per [`AudioCodecType`], so new codecs are added by registration rather
//! than by changing the transport.

#[cfg(feature = "opus")]
pub mod opus;

use std::collections::{HashMap, HashSet};

use crate::audio::data::AudioData;
use crate::audio::param::{AudioCodecType, AudioParam};
use crate::error::{CodecError, Result};

#[cfg(feature = "opus")]
pub use self::opus::OpusProcessor;

/// Which way a processor converts audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorDirection {
    /// PCM in, codec payload out
    Encode,
    /// Codec payload in, PCM out
    Decode,
}

/// A single encode or decode stage
pub trait AudioProcessor: Send {
    /// Bind the processor to the negotiated local and remote formats
    fn configure(&mut self, local: &AudioParam, remote: &AudioParam) -> Result<()>;

    /// Convert one frame. Metadata tags carry over to the output.
    fn process(&mut self, input: AudioData) -> Result<AudioData>;

    fn release(&mut self) -> Result<()>;

    fn codec_type(&self) -> AudioCodecType;
}

type ProcessorFactory =
    Box<dyn Fn(ProcessorDirection) -> Result<Box<dyn AudioProcessor>> + Send + Sync>;

/// Factories for every codec this process can run
pub struct CodecRegistry {
    factories: HashMap<AudioCodecType, ProcessorFactory>,
}

impl CodecRegistry {
    /// Registry without any codec, not even PCM
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, codec: AudioCodecType, factory: F)
    where
        F: Fn(ProcessorDirection) -> Result<Box<dyn AudioProcessor>> + Send + Sync + 'static,
    {
        self.factories.insert(codec, Box::new(factory));
    }

    pub fn create(
        &self,
        codec: AudioCodecType,
        direction: ProcessorDirection,
    ) -> Result<Box<dyn AudioProcessor>> {
        let factory = self
            .factories
            .get(&codec)
            .ok_or_else(|| CodecError::Unsupported(format!("{:?}", codec)))?;
        factory(direction)
    }

    pub fn supported(&self) -> HashSet<AudioCodecType> {
        self.factories.keys().copied().collect()
    }

    /// Capability string advertised to peers, e.g. `{"CODEC":["PCM","OPUS"]}`
    pub fn capability_json(&self) -> String {
        let mut names: Vec<&str> = self
            .factories
            .keys()
            .map(|codec| codec.name())
            .collect();
        names.sort_unstable();
        serde_json::json!({ "CODEC": names }).to_string()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(AudioCodecType::Pcm, |direction| {
            Ok(Box::new(PcmProcessor::new(direction)) as Box<dyn AudioProcessor>)
        });
        #[cfg(feature = "opus")]
        registry.register(AudioCodecType::Opus, |direction| {
            Ok(Box::new(OpusProcessor::new(direction)) as Box<dyn AudioProcessor>)
        });
        registry
    }
}

/// Raw PCM passthrough
pub struct PcmProcessor {
    direction: ProcessorDirection,
    configured: bool,
    frames: u64,
}

impl PcmProcessor {
    pub fn new(direction: ProcessorDirection) -> Self {
        Self {
            direction,
            configured: false,
            frames: 0,
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }
}

impl AudioProcessor for PcmProcessor {
    fn configure(&mut self, local: &AudioParam, remote: &AudioParam) -> Result<()> {
        if local.com_param.frame_size != remote.com_param.frame_size {
            tracing::warn!(
                "PCM {:?} frame size differs: local {} remote {}",
                self.direction,
                local.com_param.frame_size,
                remote.com_param.frame_size
            );
        }
        self.configured = true;
        Ok(())
    }

    fn process(&mut self, input: AudioData) -> Result<AudioData> {
        if !self.configured {
            return Err(CodecError::NotConfigured.into());
        }
        self.frames += 1;
        Ok(input)
    }

    fn release(&mut self) -> Result<()> {
        self.configured = false;
        Ok(())
    }

    fn codec_type(&self) -> AudioCodecType {
        AudioCodecType::Pcm
    }
}
