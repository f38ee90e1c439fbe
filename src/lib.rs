//! # Distributed Audio
//!
//! Presents a remote device's speaker and microphone as if they were local
//! hardware, streaming audio between the two devices over a pluggable
//! channel provider.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────┐        ┌───────────────────────────────────────┐
//! │              SOURCE DEVICE             │        │               SINK DEVICE              │
//! │   (owns the virtual endpoints)         │        │   (owns the physical hardware)         │
//! │                                        │        │                                        │
//! │  driver ──► SpeakerDev / MicDev        │        │        SpeakerClient / MicClient       │
//! │   ▲  (stream create/write/read/mmap)   │        │   jitter queue ─► renderer            │
//! │   │            │                       │        │   capturer ─► pacer thread            │
//! │   │            ▼                       │        │            ▲                           │
//! │  SourceDev (event loop, RPC wait) ◄────┼─ ctrl ─┼──► SinkDev (event loop)                │
//! │                │                       │        │            │                           │
//! │  sender / receiver transport ══════════╪═ data ═╪══ receiver / sender transport          │
//! └───────────────────────────────────────┘        └───────────────────────────────────────┘
//! ```
//!
//! One orchestrator exists per remote device on each side. All state changes
//! for that device are serialized through its [`runner::EventRunner`]; audio
//! data flows on separate threads through ring buffers, jitter queues and
//! paced mmap threads.

pub mod audio;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod transport;
pub mod watchdog;

#[cfg(feature = "sink")]
pub mod sink;
#[cfg(feature = "source")]
pub mod source;

pub use error::{Error, Result, DH_SUCCESS};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Maximum accepted length of a JSON control payload
    pub const DAUDIO_MAX_JSON_LEN: usize = 1024;

    /// How long the source blocks for a sink acknowledgement
    pub const RPC_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

    /// How long an IO device waits for its transport to report channel open
    pub const CHANNEL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Result events are request events shifted by this offset
    pub const RESULT_EVENT_OFFSET: i32 = 4;

    /// Allowed mmap periods in milliseconds
    pub const MMAP_NORMAL_PERIOD_MS: u32 = 5;
    pub const MMAP_VOIP_PERIOD_MS: u32 = 20;

    /// Upper bound for a driver-provided shared memory region
    pub const MAX_SHARED_MEMORY_LEN: usize = 8 * 1024 * 1024;

    /// Pacer drift is measured every this many frames
    pub const OFFSET_RESYNC_FRAMES: i64 = 10;

    pub const NS_PER_SECOND: i64 = 1_000_000_000;
    pub const NS_PER_MS: i64 = 1_000_000;
    pub const MS_PER_SECOND: u32 = 1000;

    /// Mic FIFO watermarks (frames)
    pub const DATA_QUEUE_MAX_SIZE: usize = 10;
    pub const DATA_QUEUE_HALF_SIZE: usize = DATA_QUEUE_MAX_SIZE >> 1;
    pub const DATA_QUEUE_EXT_SIZE: usize = 20;

    /// Low-latency (mmap) jitter budgets in milliseconds
    pub const LOW_LATENCY_JITTER_TIME_MS: u32 = 50;
    pub const LOW_LATENCY_JITTER_MAX_TIME_MS: u32 = 150;

    /// Speaker-side jitter queue size and pre-roll (frames)
    pub const SPEAKER_QUEUE_MAX_SIZE: usize = 10;
    pub const SPEAKER_PRE_ROLL: usize = 3;

    /// Capture ring buffer holds this many frames
    pub const RING_BUFFER_FRAMES: usize = 10;

    /// Poll interval of fill/flush/drain loops
    pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(2);

    /// Upper bound on how long a flush may hold up a stop
    pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

    /// Default frame: 20 ms of 48 kHz stereo S16LE
    pub const DEFAULT_FRAME_SIZE: usize = 3840;
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
    pub const DEFAULT_FRAME_PERIOD_MS: u32 = 20;

    /// Default TCP port of the engine provider
    pub const DEFAULT_ENGINE_PORT: u16 = 7600;

    /// Maximum size of a single engine frame on the wire
    pub const MAX_ENGINE_FRAME: usize = 1024 * 1024;

    /// Frames buffered per TCP channel writer, about a second of audio
    pub const ENGINE_WRITE_QUEUE_FRAMES: usize = 50;

    /// Watchdog check interval
    pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(20);
}
