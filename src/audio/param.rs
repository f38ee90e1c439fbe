//! Negotiated audio format and hardware ids
//!
//! [`AudioParam`] is fixed for a session once `SetParameters` has run. It is
//! serialized flat into the `AUDIO_PARAM` object of control payloads.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{MMAP_NORMAL_PERIOD_MS, MMAP_VOIP_PERIOD_MS, MS_PER_SECOND};
use crate::error::{Error, Result};

/// Declares a `#[repr(i32)]` enum that travels as a plain integer in JSON.
macro_rules! int_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<i32> for $name {
            type Error = $crate::error::Error;

            fn try_from(value: i32) -> ::std::result::Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err($crate::error::Error::BadValue(format!(
                        "{} is not a valid {}", other, stringify!($name)
                    ))),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value as i32
            }
        }
    };
}

pub(crate) use int_enum;

int_enum! {
    pub enum AudioChannel {
        Mono = 1,
        Stereo = 2,
    }
}

int_enum! {
    pub enum AudioSampleFormat {
        U8 = 0,
        S16Le = 1,
        S24Le = 2,
        S32Le = 3,
        F32Le = 4,
    }
}

impl AudioSampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioSampleFormat::U8 => 1,
            AudioSampleFormat::S16Le => 2,
            AudioSampleFormat::S24Le => 3,
            AudioSampleFormat::S32Le | AudioSampleFormat::F32Le => 4,
        }
    }
}

int_enum! {
    pub enum AudioCodecType {
        Pcm = 0,
        Aac = 1,
        Opus = 2,
    }
}

impl AudioCodecType {
    /// Parse a capability name such as `"OPUS"`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PCM" => Some(AudioCodecType::Pcm),
            "AAC" => Some(AudioCodecType::Aac),
            "OPUS" => Some(AudioCodecType::Opus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AudioCodecType::Pcm => "PCM",
            AudioCodecType::Aac => "AAC",
            AudioCodecType::Opus => "OPUS",
        }
    }
}

int_enum! {
    pub enum StreamUsage {
        Unknown = 0,
        Media = 1,
        VoiceCommunication = 2,
        VoiceAssistant = 3,
        Alarm = 4,
        Notification = 5,
    }
}

int_enum! {
    pub enum ContentType {
        Unknown = 0,
        Speech = 1,
        Music = 2,
        Movie = 3,
    }
}

int_enum! {
    pub enum SourceType {
        Invalid = -1,
        Mic = 0,
        VoiceCommunication = 7,
    }
}

int_enum! {
    /// Whether a stream uses per-call IO or the shared-memory ring
    pub enum PortOperationMode {
        Normal = 0,
        Mmap = 1,
    }
}

/// Format fields shared by both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCommonParam {
    #[serde(rename = "SAMPLING_RATE")]
    pub sample_rate: u32,
    #[serde(rename = "CHANNELS")]
    pub channel_mask: AudioChannel,
    #[serde(rename = "FORMAT")]
    pub bit_format: AudioSampleFormat,
    #[serde(rename = "CODEC_TYPE")]
    pub codec_type: AudioCodecType,
    /// Bytes per transferred frame
    #[serde(rename = "FRAMESIZE")]
    pub frame_size: usize,
}

impl Default for AudioCommonParam {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channel_mask: AudioChannel::Stereo,
            bit_format: AudioSampleFormat::S16Le,
            codec_type: AudioCodecType::Pcm,
            frame_size: crate::constants::DEFAULT_FRAME_SIZE,
        }
    }
}

impl AudioCommonParam {
    pub fn channels(&self) -> u16 {
        i32::from(self.channel_mask) as u16
    }

    pub fn bytes_per_sample_frame(&self) -> usize {
        self.bit_format.bytes_per_sample() * self.channels() as usize
    }

    /// Duration of one `frame_size` chunk in nanoseconds
    pub fn frame_period_ns(&self) -> i64 {
        let per_second = self.sample_rate as usize * self.bytes_per_sample_frame();
        if per_second == 0 {
            return 0;
        }
        (self.frame_size as i64 * crate::constants::NS_PER_SECOND) / per_second as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRenderOptions {
    #[serde(rename = "CONTENT_TYPE")]
    pub content_type: ContentType,
    #[serde(rename = "STREAM_USAGE")]
    pub stream_usage: StreamUsage,
    #[serde(rename = "RENDER_FLAGS")]
    pub render_flags: PortOperationMode,
}

impl Default for AudioRenderOptions {
    fn default() -> Self {
        Self {
            content_type: ContentType::Music,
            stream_usage: StreamUsage::Media,
            render_flags: PortOperationMode::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCaptureOptions {
    #[serde(rename = "SOURCE_TYPE")]
    pub source_type: SourceType,
    #[serde(rename = "CAPTURE_FLAGS")]
    pub capturer_flags: PortOperationMode,
}

impl Default for AudioCaptureOptions {
    fn default() -> Self {
        Self {
            source_type: SourceType::Mic,
            capturer_flags: PortOperationMode::Normal,
        }
    }
}

/// Negotiated per-session format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioParam {
    #[serde(flatten)]
    pub com_param: AudioCommonParam,
    #[serde(flatten)]
    pub render_opts: AudioRenderOptions,
    #[serde(flatten)]
    pub capture_opts: AudioCaptureOptions,
}

impl AudioParam {
    pub fn is_render_mmap(&self) -> bool {
        self.render_opts.render_flags == PortOperationMode::Mmap
    }

    pub fn is_capture_mmap(&self) -> bool {
        self.capture_opts.capturer_flags == PortOperationMode::Mmap
    }
}

/// Stream parameters as handed over by the driver layer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioParamHdf {
    pub sample_rate: u32,
    pub channel_mask: AudioChannel,
    pub bit_format: AudioSampleFormat,
    pub stream_usage: StreamUsage,
    pub frame_size: usize,
    /// Hardware period in milliseconds
    pub period: u32,
    pub render_flags: PortOperationMode,
    pub capturer_flags: PortOperationMode,
    pub ext: String,
}

impl Default for AudioParamHdf {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channel_mask: AudioChannel::Stereo,
            bit_format: AudioSampleFormat::S16Le,
            stream_usage: StreamUsage::Media,
            frame_size: crate::constants::DEFAULT_FRAME_SIZE,
            period: crate::constants::DEFAULT_FRAME_PERIOD_MS,
            render_flags: PortOperationMode::Normal,
            capturer_flags: PortOperationMode::Normal,
            ext: String::new(),
        }
    }
}

impl AudioParamHdf {
    /// mmap streams only run at the two supported periods
    pub fn check_mmap_period(&self, mode: PortOperationMode) -> Result<()> {
        if mode == PortOperationMode::Mmap
            && self.period != MMAP_NORMAL_PERIOD_MS
            && self.period != MMAP_VOIP_PERIOD_MS
        {
            return Err(Error::ParamInvalid(format!(
                "mmap period {} ms is not one of {} or {}",
                self.period, MMAP_NORMAL_PERIOD_MS, MMAP_VOIP_PERIOD_MS
            )));
        }
        Ok(())
    }

    /// Derive the render-side session format
    pub fn to_render_param(&self, peer_codecs: &HashSet<AudioCodecType>) -> AudioParam {
        AudioParam {
            com_param: self.common_param(peer_codecs),
            render_opts: AudioRenderOptions {
                content_type: ContentType::Music,
                stream_usage: self.stream_usage,
                render_flags: self.render_flags,
            },
            capture_opts: AudioCaptureOptions::default(),
        }
    }

    /// Derive the capture-side session format
    pub fn to_capture_param(&self, peer_codecs: &HashSet<AudioCodecType>) -> AudioParam {
        let source_type = if self.stream_usage == StreamUsage::VoiceCommunication {
            SourceType::VoiceCommunication
        } else {
            SourceType::Mic
        };
        AudioParam {
            com_param: self.common_param(peer_codecs),
            render_opts: AudioRenderOptions::default(),
            capture_opts: AudioCaptureOptions {
                source_type,
                capturer_flags: self.capturer_flags,
            },
        }
    }

    fn common_param(&self, peer_codecs: &HashSet<AudioCodecType>) -> AudioCommonParam {
        AudioCommonParam {
            sample_rate: self.sample_rate,
            channel_mask: self.channel_mask,
            bit_format: self.bit_format,
            codec_type: select_codec(self.stream_usage, peer_codecs),
            frame_size: self.frame_size,
        }
    }
}

/// Voice calls use the low-latency codec when the peer supports it.
pub fn select_codec(usage: StreamUsage, peer_codecs: &HashSet<AudioCodecType>) -> AudioCodecType {
    if usage == StreamUsage::VoiceCommunication && peer_codecs.contains(&AudioCodecType::Opus) {
        AudioCodecType::Opus
    } else {
        AudioCodecType::Pcm
    }
}

/// Number of samples per channel in one hardware period
pub fn calculate_sample_num(sample_rate: u32, period_ms: u32) -> u64 {
    sample_rate as u64 * period_ms as u64 / MS_PER_SECOND as u64
}

/// Bit marking a hardware id as a capture port
pub const DH_ID_MIC_BIT: i32 = 1 << 27;

/// Which kind of endpoint a hardware id names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Speaker,
    Mic,
}

/// Distributed hardware port id; device type is encoded in the bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DhId(pub i32);

pub const DEFAULT_RENDER_ID: DhId = DhId(1);
pub const DEFAULT_CAPTURE_ID: DhId = DhId(DH_ID_MIC_BIT | 1);

impl DhId {
    pub fn kind(self) -> DeviceKind {
        if self.0 & DH_ID_MIC_BIT != 0 {
            DeviceKind::Mic
        } else {
            DeviceKind::Speaker
        }
    }

    /// Parse the decimal string form used in control payloads
    pub fn parse(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i32>()
            .map(DhId)
            .map_err(|_| Error::BadValue(format!("invalid dhId {:?}", s)))
    }
}

impl fmt::Display for DhId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a peer capability string into the set of codecs it supports.
///
/// The capability is a JSON object whose optional `CODEC` array lists codec
/// names or numeric codec ids. PCM is always supported.
pub fn parse_codec_capability(capability: &str) -> Result<HashSet<AudioCodecType>> {
    let mut codecs = HashSet::from([AudioCodecType::Pcm]);
    if capability.trim().is_empty() {
        return Ok(codecs);
    }
    let value: serde_json::Value = serde_json::from_str(capability)?;
    let Some(list) = value.get("CODEC") else {
        return Ok(codecs);
    };
    let list = list
        .as_array()
        .ok_or_else(|| Error::BadValue("CODEC must be an array".into()))?;
    for item in list {
        let codec = match item {
            serde_json::Value::String(name) => AudioCodecType::from_name(name),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|v| AudioCodecType::try_from(v as i32).ok()),
            _ => None,
        };
        match codec {
            Some(codec) => {
                codecs.insert(codec);
            }
            None => tracing::warn!("Ignoring unknown codec capability {}", item),
        }
    }
    Ok(codecs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_id_kind() {
        assert_eq!(DEFAULT_RENDER_ID.kind(), DeviceKind::Speaker);
        assert_eq!(DEFAULT_CAPTURE_ID.kind(), DeviceKind::Mic);
        assert_eq!(DhId::parse("134217729").unwrap(), DEFAULT_CAPTURE_ID);
        assert!(DhId::parse("mic").is_err());
    }

    #[test]
    fn test_param_json_keys() {
        let param = AudioParam::default();
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["SAMPLING_RATE"], 48000);
        assert_eq!(json["CHANNELS"], 2);
        assert_eq!(json["FORMAT"], 1);
        assert_eq!(json["RENDER_FLAGS"], 0);
        assert_eq!(json["CAPTURE_FLAGS"], 0);

        let back: AudioParam = serde_json::from_value(json).unwrap();
        assert_eq!(back, param);
    }

    #[test]
    fn test_param_rejects_bad_enum() {
        let mut json = serde_json::to_value(AudioParam::default()).unwrap();
        json["CHANNELS"] = serde_json::json!(7);
        assert!(serde_json::from_value::<AudioParam>(json).is_err());
    }

    #[test]
    fn test_mmap_period_check() {
        let mut hdf = AudioParamHdf::default();
        hdf.period = 10;
        assert!(hdf.check_mmap_period(PortOperationMode::Normal).is_ok());
        assert!(matches!(
            hdf.check_mmap_period(PortOperationMode::Mmap),
            Err(Error::ParamInvalid(_))
        ));
        hdf.period = 5;
        assert!(hdf.check_mmap_period(PortOperationMode::Mmap).is_ok());
        hdf.period = 20;
        assert!(hdf.check_mmap_period(PortOperationMode::Mmap).is_ok());
    }

    #[test]
    fn test_codec_selection() {
        let caps = parse_codec_capability(r#"{"CODEC":["PCM","OPUS"]}"#).unwrap();
        assert_eq!(select_codec(StreamUsage::VoiceCommunication, &caps), AudioCodecType::Opus);
        assert_eq!(select_codec(StreamUsage::Media, &caps), AudioCodecType::Pcm);

        let pcm_only = parse_codec_capability("").unwrap();
        assert_eq!(
            select_codec(StreamUsage::VoiceCommunication, &pcm_only),
            AudioCodecType::Pcm
        );
        assert!(parse_codec_capability("{not json").is_err());
    }

    #[test]
    fn test_frame_period() {
        let param = AudioCommonParam::default();
        // 3840 bytes of 48 kHz stereo S16LE is 20 ms
        assert_eq!(param.frame_period_ns(), 20_000_000);
        assert_eq!(calculate_sample_num(48000, 5), 240);
    }
}
