//! Error types for the distributed audio stack
//!
//! Every failure crosses component boundaries as a value. Each variant maps to
//! a stable integer result code so that failures can be reported to the peer
//! device inside the `RESULT` field of a control payload.

use thiserror::Error;

use crate::protocol::AudioEventType;

/// Result code reported for a successful operation.
pub const DH_SUCCESS: i32 = 0;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Missing collaborator: {0}")]
    Nullptr(&'static str),

    #[error("Not initialized: {0}")]
    NotInit(&'static str),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("Timed out waiting for {0}")]
    WaitTimeout(&'static str),

    #[error("Timed out waiting for rpc result {0:?}")]
    RpcWaitTimeout(AudioEventType),

    #[error("Wrong lifecycle state: {0}")]
    StatusErr(String),

    #[error("Channel creation failed: {0}")]
    ChannelCreateFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{len} bytes exceed capacity of {capacity} bytes")]
    CapacityExceeded { len: usize, capacity: usize },

    #[error("Peer reported result code {0}")]
    Remote(i32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Integer result code carried across devices.
    pub fn code(&self) -> i32 {
        match self {
            Error::Failed(_) => -40001,
            Error::Nullptr(_) => -40002,
            Error::NotInit(_) => -40003,
            Error::BadValue(_) | Error::Json(_) => -40004,
            Error::ParamInvalid(_) => -40005,
            Error::WaitTimeout(_) => -40006,
            Error::RpcWaitTimeout(_) => -40007,
            Error::StatusErr(_) => -40008,
            Error::ChannelCreateFailed(_) => -40009,
            Error::Transport(_) => -40010,
            Error::Codec(_) => -40011,
            Error::NotSupported(_) => -40012,
            Error::NotFound(_) => -40013,
            Error::CapacityExceeded { .. } => -40014,
            Error::Config(_) => -40015,
            Error::Io(_) => -40016,
            Error::Remote(code) => *code,
        }
    }
}

/// Converts a result into the code placed on the wire.
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => DH_SUCCESS,
        Err(e) => e.code(),
    }
}

/// Transport / engine errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Engine not initialized")]
    EngineNotInit,

    #[error("Channel not open")]
    ChannelClosed,

    #[error("Peer unknown: {0}")]
    UnknownPeer(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("No processor registered for {0}")]
    Unsupported(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Processor not configured")]
    NotConfigured,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(result_code(&Ok::<(), Error>(())), DH_SUCCESS);
        assert_eq!(Error::Remote(-7).code(), -7);
        assert_ne!(Error::WaitTimeout("channel").code(), DH_SUCCESS);
        assert_eq!(
            Error::RpcWaitTimeout(AudioEventType::NotifyOpenSpeakerResult).code(),
            -40007
        );
    }
}
