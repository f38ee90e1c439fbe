//! Typed JSON payloads carried in [`AudioEvent::content`](super::AudioEvent)
//!
//! Every payload is an object with upper-case keys. Parsing rejects empty and
//! oversized input before it reaches serde.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::event::AudioEventType;
use crate::audio::param::{AudioParam, DhId};
use crate::constants::DAUDIO_MAX_JSON_LEN;
use crate::error::{Error, Result};

/// Parse a control payload, rejecting empty or oversized input
pub fn parse_payload<T: DeserializeOwned>(content: &str) -> Result<T> {
    if content.is_empty() {
        return Err(Error::ParamInvalid("empty payload".into()));
    }
    if content.len() > DAUDIO_MAX_JSON_LEN {
        return Err(Error::ParamInvalid(format!(
            "payload of {} bytes exceeds {}",
            content.len(),
            DAUDIO_MAX_JSON_LEN
        )));
    }
    serde_json::from_str(content).map_err(|e| Error::BadValue(format!("malformed payload: {}", e)))
}

/// Stamp `DH_ID` into a driver-supplied payload, which may be empty
pub fn with_dh_id(content: &str, dh_id: DhId) -> Result<String> {
    let mut value = if content.trim().is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        parse_payload::<serde_json::Value>(content)?
    };
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::BadValue("payload is not a JSON object".into()))?;
    object.insert("DH_ID".into(), serde_json::Value::String(dh_id.to_string()));
    Ok(value.to_string())
}

/// Decorrelation tag attached to requests and results
pub fn random_task_code() -> String {
    rand::random::<u32>().to_string()
}

/// Open/close requests and their results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    #[serde(rename = "DH_ID")]
    pub dh_id: String,
    #[serde(rename = "EVENT_TYPE", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<AudioEventType>,
    #[serde(rename = "AUDIO_PARAM", default, skip_serializing_if = "Option::is_none")]
    pub audio_param: Option<AudioParam>,
    #[serde(rename = "RANDOM_TASK_CODE", default, skip_serializing_if = "Option::is_none")]
    pub random_task_code: Option<String>,
    #[serde(rename = "RESULT", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<i32>,
}

impl ControlPayload {
    pub fn new(dh_id: DhId) -> Self {
        Self {
            dh_id: dh_id.to_string(),
            ..Default::default()
        }
    }

    /// Request sent to the sink for an open/close operation
    pub fn request(dh_id: DhId, event_type: AudioEventType, param: Option<AudioParam>) -> Self {
        Self {
            dh_id: dh_id.to_string(),
            event_type: Some(event_type),
            audio_param: param,
            random_task_code: Some(random_task_code()),
            result: None,
        }
    }

    /// Result sent back to the source
    pub fn result(dh_id: DhId, event_type: AudioEventType, result: i32) -> Self {
        Self {
            dh_id: dh_id.to_string(),
            event_type: Some(event_type),
            audio_param: None,
            random_task_code: Some(random_task_code()),
            result: Some(result),
        }
    }

    pub fn dh_id(&self) -> Result<DhId> {
        DhId::parse(&self.dh_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of an RPC result event; only the code is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(rename = "RESULT")]
    pub result: i32,
}

/// Local enable request for one hardware port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableRequest {
    #[serde(rename = "DH_ID")]
    pub dh_id: String,
    /// Codec capability of the peer port
    #[serde(rename = "ATTRS", default)]
    pub attrs: String,
}

/// Volume, mute and focus forwarding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeEvent {
    #[serde(rename = "DH_ID")]
    pub dh_id: String,
    #[serde(rename = "VOLUME_LEVEL", default, skip_serializing_if = "Option::is_none")]
    pub volume_level: Option<i32>,
    #[serde(rename = "IS_MUTE", default, skip_serializing_if = "Option::is_none")]
    pub is_mute: Option<bool>,
}

impl VolumeEvent {
    pub fn dh_id(&self) -> Result<DhId> {
        DhId::parse(&self.dh_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayStatus {
    Pause,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayStatusEvent {
    #[serde(rename = "DH_ID")]
    pub dh_id: String,
    #[serde(rename = "CHANGE_TYPE")]
    pub change_type: PlayStatus,
}

impl PlayStatusEvent {
    pub fn dh_id(&self) -> Result<DhId> {
        DhId::parse(&self.dh_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::param::{AudioCodecType, PortOperationMode, StreamUsage};

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(matches!(
            parse_payload::<RpcResult>(""),
            Err(Error::ParamInvalid(_))
        ));
        let big = format!(r#"{{"RESULT":0,"PAD":"{}"}}"#, "x".repeat(DAUDIO_MAX_JSON_LEN));
        assert!(matches!(
            parse_payload::<RpcResult>(&big),
            Err(Error::ParamInvalid(_))
        ));
        assert!(matches!(
            parse_payload::<RpcResult>("{not json"),
            Err(Error::BadValue(_))
        ));
    }

    #[test]
    fn test_request_keys() {
        let mut param = AudioParam::default();
        param.render_opts.render_flags = PortOperationMode::Mmap;
        param.render_opts.stream_usage = StreamUsage::VoiceCommunication;
        let request = ControlPayload::request(DhId(1), AudioEventType::OpenSpeaker, Some(param.clone()));
        let json = request.to_json().unwrap();
        for key in ["DH_ID", "EVENT_TYPE", "AUDIO_PARAM", "RANDOM_TASK_CODE", "SAMPLING_RATE", "RENDER_FLAGS"] {
            assert!(json.contains(key), "{} missing from {}", key, json);
        }
        assert!(!json.contains("\"RESULT\""));

        let parsed: ControlPayload = parse_payload(&json).unwrap();
        assert_eq!(parsed.dh_id().unwrap(), DhId(1));
        assert_eq!(parsed.audio_param, Some(param));
    }

    #[test]
    fn test_parse_foreign_param() {
        let json = r#"{"DH_ID":"134217729","AUDIO_PARAM":{"SAMPLING_RATE":16000,"CHANNELS":1,
            "FORMAT":1,"CODEC_TYPE":2,"FRAMESIZE":640,"CONTENT_TYPE":1,"STREAM_USAGE":2,
            "RENDER_FLAGS":0,"SOURCE_TYPE":7,"CAPTURE_FLAGS":1}}"#;
        let payload: ControlPayload = parse_payload(json).unwrap();
        let param = payload.audio_param.as_ref().unwrap();
        assert_eq!(param.com_param.sample_rate, 16000);
        assert_eq!(param.com_param.codec_type, AudioCodecType::Opus);
        assert!(param.is_capture_mmap());
        assert_eq!(payload.dh_id().unwrap().0, 134217729);
    }

    #[test]
    fn test_with_dh_id() {
        let stamped = with_dh_id(r#"{"VOLUME_LEVEL":4}"#, DhId(1)).unwrap();
        let volume: VolumeEvent = parse_payload(&stamped).unwrap();
        assert_eq!(volume.dh_id().unwrap(), DhId(1));
        assert_eq!(volume.volume_level, Some(4));
        assert!(with_dh_id("", DhId(2)).unwrap().contains("\"2\""));
        assert!(with_dh_id("[1]", DhId(2)).is_err());
    }

    #[test]
    fn test_play_status() {
        let event: PlayStatusEvent =
            parse_payload(r#"{"DH_ID":"1","CHANGE_TYPE":"restart"}"#).unwrap();
        assert_eq!(event.change_type, PlayStatus::Restart);
    }
}
