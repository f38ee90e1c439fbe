//! Audio data model, buffering and pacing

pub mod buffer;
pub mod data;
pub mod device;
pub mod pacer;
pub mod param;
pub mod shared_memory;

pub use buffer::{JitterQueue, JitterQueueStats, RingBuffer, SharedJitterQueue};
pub use data::AudioData;
pub use device::{LocalAudioBackend, LocalCapturer, LocalRenderer, NullBackend};
pub use pacer::TimestampPacer;
pub use param::{
    AudioCodecType, AudioCommonParam, AudioParam, AudioParamHdf, AudioSampleFormat, DeviceKind,
    DhId, PortOperationMode, StreamUsage,
};
pub use shared_memory::{AshmemInfo, SharedMemory};
