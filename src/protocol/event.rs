//! Event types exchanged between devices and posted to device event loops

use serde::{Deserialize, Serialize};

use crate::audio::param::int_enum;
use crate::constants::RESULT_EVENT_OFFSET;

int_enum! {
    /// Control event types. Values are stable: they travel in `EVENT_TYPE`.
    pub enum AudioEventType {
        EventUnknown = 0,
        OpenCtrl = 1,
        CtrlOpened = 2,
        CloseCtrl = 3,
        CtrlClosed = 4,
        NotifyOpenCtrlResult = 5,
        NotifyCloseCtrlResult = 6,
        DataOpened = 7,
        DataClosed = 8,

        OpenSpeaker = 11,
        CloseSpeaker = 12,
        SpeakerOpened = 13,
        SpeakerClosed = 14,
        NotifyOpenSpeakerResult = 15,
        NotifyCloseSpeakerResult = 16,

        OpenMic = 21,
        CloseMic = 22,
        MicOpened = 23,
        MicClosed = 24,
        NotifyOpenMicResult = 25,
        NotifyCloseMicResult = 26,

        VolumeSet = 31,
        VolumeGet = 32,
        VolumeChange = 33,
        VolumeMinGet = 34,
        VolumeMaxGet = 35,
        VolumeMuteSet = 36,

        AudioFocusChange = 41,
        AudioRenderStateChange = 42,

        SetParam = 51,
        SendParam = 52,

        AudioEncoderErr = 61,
        AudioDecoderErr = 62,

        ChangePlayStatus = 71,

        MmapSpkStart = 81,
        MmapSpkStop = 82,
        MmapMicStart = 83,
        MmapMicStop = 84,

        /// Local only: enable one hardware port
        DaudioEnable = 88,
        /// Local only: disable one hardware port
        DaudioDisable = 89,
    }
}

impl AudioEventType {
    /// The `NOTIFY_*_RESULT` event answering a request, if it has one
    pub fn result_event(self) -> Option<AudioEventType> {
        match self {
            AudioEventType::OpenSpeaker
            | AudioEventType::CloseSpeaker
            | AudioEventType::OpenMic
            | AudioEventType::CloseMic => {
                AudioEventType::try_from(i32::from(self) + RESULT_EVENT_OFFSET).ok()
            }
            _ => None,
        }
    }

    /// Whether the source blocks its event loop for the result of this request
    pub fn waits_for_rpc(self) -> bool {
        matches!(self, AudioEventType::OpenSpeaker | AudioEventType::OpenMic)
    }

    pub fn is_rpc_result(self) -> bool {
        matches!(
            self,
            AudioEventType::NotifyOpenSpeakerResult
                | AudioEventType::NotifyCloseSpeakerResult
                | AudioEventType::NotifyOpenMicResult
                | AudioEventType::NotifyCloseMicResult
                | AudioEventType::NotifyOpenCtrlResult
                | AudioEventType::NotifyCloseCtrlResult
        )
    }
}

/// An event with its JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    #[serde(rename = "EVENT_TYPE")]
    pub event_type: AudioEventType,
    #[serde(rename = "CONTENT", default)]
    pub content: String,
}

impl AudioEvent {
    pub fn new(event_type: AudioEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
        }
    }
}

/// Receives events a component raises toward its orchestrator
pub trait AudioEventListener: Send + Sync {
    fn notify_event(&self, event: AudioEvent);
}
