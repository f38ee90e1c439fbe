//! Opus processor
//!
//! Frames are interleaved S16LE PCM of one negotiated `frame_size`. The
//! frame must cover a duration Opus accepts (2.5 to 60 ms); the default
//! 3840-byte stereo frame at 48 kHz is 20 ms.

use opus::{Application, Bitrate, Channels, Decoder, Encoder};

use super::{AudioProcessor, ProcessorDirection};
use crate::audio::data::AudioData;
use crate::audio::param::{AudioCodecType, AudioParam, AudioSampleFormat, StreamUsage};
use crate::error::{CodecError, Error, Result};

/// Largest Opus packet we expect back from the encoder
const MAX_PACKET_SIZE: usize = 4000;
/// 120 ms at 48 kHz stereo, the largest frame Opus will decode
const MAX_DECODED_SAMPLES: usize = 48000 * 2 * 120 / 1000;

const VOICE_BITRATE: i32 = 32_000;
const MUSIC_BITRATE: i32 = 128_000;

enum State {
    Idle,
    Encoding {
        encoder: Encoder,
        samples: Vec<i16>,
        packet: Vec<u8>,
    },
    Decoding {
        decoder: Decoder,
        channels: usize,
        pcm: Vec<i16>,
    },
}

pub struct OpusProcessor {
    direction: ProcessorDirection,
    state: State,
    frames: u64,
    bytes_produced: u64,
}

impl OpusProcessor {
    pub fn new(direction: ProcessorDirection) -> Self {
        Self {
            direction,
            state: State::Idle,
            frames: 0,
            bytes_produced: 0,
        }
    }

    /// Average encoded packet size so far, zero before the first frame
    pub fn average_packet_size(&self) -> f32 {
        if self.frames == 0 {
            0.0
        } else {
            self.bytes_produced as f32 / self.frames as f32
        }
    }

    fn channels(param: &AudioParam) -> Result<Channels> {
        match param.com_param.channels() {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            n => Err(Error::NotSupported(format!("opus with {} channels", n))),
        }
    }

    fn open_encoder(param: &AudioParam) -> Result<Encoder> {
        let voice = param.render_opts.stream_usage == StreamUsage::VoiceCommunication;
        let application = if voice {
            Application::Voip
        } else {
            Application::Audio
        };
        let mut encoder = Encoder::new(param.com_param.sample_rate, Self::channels(param)?, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        let bitrate = if voice { VOICE_BITRATE } else { MUSIC_BITRATE };
        encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_inband_fec(voice)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        Ok(encoder)
    }
}

impl AudioProcessor for OpusProcessor {
    fn configure(&mut self, local: &AudioParam, _remote: &AudioParam) -> Result<()> {
        if local.com_param.bit_format != AudioSampleFormat::S16Le {
            return Err(Error::NotSupported(format!(
                "opus with {:?} samples",
                local.com_param.bit_format
            )));
        }
        self.state = match self.direction {
            ProcessorDirection::Encode => State::Encoding {
                encoder: Self::open_encoder(local)?,
                samples: Vec::with_capacity(local.com_param.frame_size / 2),
                packet: vec![0u8; MAX_PACKET_SIZE],
            },
            ProcessorDirection::Decode => State::Decoding {
                decoder: Decoder::new(local.com_param.sample_rate, Self::channels(local)?)
                    .map_err(|e| CodecError::DecoderInit(e.to_string()))?,
                channels: local.com_param.channels() as usize,
                pcm: vec![0i16; MAX_DECODED_SAMPLES],
            },
        };
        Ok(())
    }

    fn process(&mut self, input: AudioData) -> Result<AudioData> {
        let mut output = match &mut self.state {
            State::Idle => return Err(CodecError::NotConfigured.into()),
            State::Encoding {
                encoder,
                samples,
                packet,
            } => {
                samples.clear();
                samples.extend(
                    input
                        .data()
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]])),
                );
                let size = encoder
                    .encode(samples, packet)
                    .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
                AudioData::from_slice(&packet[..size])
            }
            State::Decoding {
                decoder,
                channels,
                pcm,
            } => {
                // an empty payload asks for loss concealment
                let per_channel = decoder
                    .decode(input.data(), pcm, false)
                    .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
                let total = per_channel * *channels;
                let mut bytes = Vec::with_capacity(total * 2);
                for sample in &pcm[..total] {
                    bytes.extend_from_slice(&sample.to_le_bytes());
                }
                AudioData::from_vec(bytes)
            }
        };
        self.frames += 1;
        self.bytes_produced += output.size() as u64;
        output.copy_meta_from(&input);
        Ok(output)
    }

    fn release(&mut self) -> Result<()> {
        self.state = State::Idle;
        Ok(())
    }

    fn codec_type(&self) -> AudioCodecType {
        AudioCodecType::Opus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame() {
        let param = AudioParam::default();
        let mut encoder = OpusProcessor::new(ProcessorDirection::Encode);
        let mut decoder = OpusProcessor::new(ProcessorDirection::Decode);
        encoder.configure(&param, &param).unwrap();
        decoder.configure(&param, &param).unwrap();

        let frame_size = param.com_param.frame_size;
        let mut pcm = Vec::with_capacity(frame_size);
        for i in 0..frame_size / 4 {
            let t = i as f32 / 48000.0;
            let v = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            pcm.extend_from_slice(&v.to_le_bytes());
            pcm.extend_from_slice(&v.to_le_bytes());
        }

        let encoded = encoder.process(AudioData::from_vec(pcm)).unwrap();
        assert!(encoded.size() < frame_size);

        let decoded = decoder.process(encoded).unwrap();
        assert_eq!(decoded.size(), frame_size);
    }

    #[test]
    fn test_rejects_unsupported_format() {
        let mut param = AudioParam::default();
        param.com_param.bit_format = AudioSampleFormat::F32Le;
        let mut encoder = OpusProcessor::new(ProcessorDirection::Encode);
        assert!(encoder.configure(&param, &param).is_err());
    }
}
