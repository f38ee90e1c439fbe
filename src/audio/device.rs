//! Local audio hardware on the sink device
//!
//! Sink clients render received audio and capture microphone audio through
//! a [`LocalAudioBackend`]. [`NullBackend`] discards output and captures
//! silence; with the `cpal` feature [`CpalBackend`] drives real hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::data::AudioData;
use crate::audio::param::AudioParam;
use crate::error::Result;

/// Plays PCM frames on a local output
pub trait LocalRenderer: Send {
    fn start(&mut self) -> Result<()>;
    fn write(&mut self, data: &AudioData) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Linear gain in `[0.0, 1.0]`
    fn set_volume(&mut self, volume: f32);
    fn set_mute(&mut self, mute: bool);
}

/// Captures PCM frames from a local input
pub trait LocalCapturer: Send {
    fn start(&mut self) -> Result<()>;
    /// Fill `buf` with the next captured bytes; missing samples read as
    /// silence. Returns how many bytes were real capture data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn stop(&mut self) -> Result<()>;
}

/// Factory for local renderers and capturers
pub trait LocalAudioBackend: Send + Sync {
    fn create_renderer(&self, param: &AudioParam) -> Result<Box<dyn LocalRenderer>>;
    fn create_capturer(&self, param: &AudioParam) -> Result<Box<dyn LocalCapturer>>;
}

/// Backend without hardware: output is counted and discarded, input is silent
#[derive(Default, Clone)]
pub struct NullBackend {
    rendered_bytes: Arc<AtomicU64>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written to renderers created by this backend
    pub fn rendered_bytes(&self) -> u64 {
        self.rendered_bytes.load(Ordering::Relaxed)
    }
}

impl LocalAudioBackend for NullBackend {
    fn create_renderer(&self, _param: &AudioParam) -> Result<Box<dyn LocalRenderer>> {
        Ok(Box::new(NullRenderer {
            rendered_bytes: self.rendered_bytes.clone(),
        }))
    }

    fn create_capturer(&self, _param: &AudioParam) -> Result<Box<dyn LocalCapturer>> {
        Ok(Box::new(NullCapturer))
    }
}

struct NullRenderer {
    rendered_bytes: Arc<AtomicU64>,
}

impl LocalRenderer for NullRenderer {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, data: &AudioData) -> Result<()> {
        self.rendered_bytes
            .fetch_add(data.size() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_volume(&mut self, _volume: f32) {}

    fn set_mute(&mut self, _mute: bool) {}
}

struct NullCapturer;

impl LocalCapturer for NullCapturer {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "cpal")]
pub use self::hardware::CpalBackend;

#[cfg(feature = "cpal")]
mod hardware {
    //! cpal-backed renderer and capturer
    //!
    //! `cpal::Stream` is not `Send`, so each stream lives on its own thread
    //! for as long as the device runs. Samples cross over through a
    //! lock-free queue.

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam::queue::ArrayQueue;

    use super::{LocalAudioBackend, LocalCapturer, LocalRenderer};
    use crate::audio::data::AudioData;
    use crate::audio::param::{AudioParam, AudioSampleFormat};
    use crate::error::{Error, Result};

    /// Samples buffered between the stream callback and the client thread
    const SAMPLE_QUEUE_SECONDS: usize = 1;

    #[derive(Default)]
    pub struct CpalBackend;

    impl CpalBackend {
        pub fn new() -> Self {
            Self
        }
    }

    fn stream_config(param: &AudioParam) -> Result<cpal::StreamConfig> {
        if param.com_param.bit_format != AudioSampleFormat::S16Le {
            return Err(Error::NotSupported(format!(
                "local device format {:?}",
                param.com_param.bit_format
            )));
        }
        Ok(cpal::StreamConfig {
            channels: param.com_param.channels(),
            sample_rate: cpal::SampleRate(param.com_param.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        })
    }

    fn queue_for(config: &cpal::StreamConfig) -> Arc<ArrayQueue<f32>> {
        let len = config.sample_rate.0 as usize * config.channels as usize * SAMPLE_QUEUE_SECONDS;
        Arc::new(ArrayQueue::new(len.max(1)))
    }

    impl LocalAudioBackend for CpalBackend {
        fn create_renderer(&self, param: &AudioParam) -> Result<Box<dyn LocalRenderer>> {
            let config = stream_config(param)?;
            Ok(Box::new(CpalRenderer {
                samples: queue_for(&config),
                config,
                running: Arc::new(AtomicBool::new(false)),
                volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
                muted: Arc::new(AtomicBool::new(false)),
                thread: None,
            }))
        }

        fn create_capturer(&self, param: &AudioParam) -> Result<Box<dyn LocalCapturer>> {
            let config = stream_config(param)?;
            Ok(Box::new(CpalCapturer {
                samples: queue_for(&config),
                config,
                running: Arc::new(AtomicBool::new(false)),
                thread: None,
            }))
        }
    }

    struct CpalRenderer {
        samples: Arc<ArrayQueue<f32>>,
        config: cpal::StreamConfig,
        running: Arc<AtomicBool>,
        volume: Arc<AtomicU32>,
        muted: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl LocalRenderer for CpalRenderer {
        fn start(&mut self) -> Result<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let samples = self.samples.clone();
            let running = self.running.clone();
            let volume = self.volume.clone();
            let muted = self.muted.clone();
            let config = self.config.clone();

            let handle = thread::Builder::new()
                .name("daudio-render".into())
                .spawn(move || {
                    let Some(device) = cpal::default_host().default_output_device() else {
                        tracing::error!("No default output device");
                        return;
                    };
                    let stream = device.build_output_stream(
                        &config,
                        move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let gain = if muted.load(Ordering::Relaxed) {
                                0.0
                            } else {
                                f32::from_bits(volume.load(Ordering::Relaxed))
                            };
                            for sample in out.iter_mut() {
                                *sample = samples.pop().unwrap_or(0.0) * gain;
                            }
                        },
                        |err| tracing::warn!("Output stream error: {}", err),
                        None,
                    );
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = stream.play() {
                                tracing::error!("Failed to start output stream: {}", e);
                                return;
                            }
                            while running.load(Ordering::Relaxed) {
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                        Err(e) => tracing::error!("Failed to build output stream: {}", e),
                    }
                })?;
            self.thread = Some(handle);
            Ok(())
        }

        fn write(&mut self, data: &AudioData) -> Result<()> {
            for chunk in data.data().chunks_exact(2) {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
                // drop-newest when the device is behind
                if self.samples.push(sample).is_err() {
                    break;
                }
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            while self.samples.pop().is_some() {}
            Ok(())
        }

        fn set_volume(&mut self, volume: f32) {
            self.volume
                .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        }

        fn set_mute(&mut self, mute: bool) {
            self.muted.store(mute, Ordering::Relaxed);
        }
    }

    impl Drop for CpalRenderer {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }

    struct CpalCapturer {
        samples: Arc<ArrayQueue<f32>>,
        config: cpal::StreamConfig,
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl LocalCapturer for CpalCapturer {
        fn start(&mut self) -> Result<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let samples = self.samples.clone();
            let running = self.running.clone();
            let config = self.config.clone();

            let handle = thread::Builder::new()
                .name("daudio-capture".into())
                .spawn(move || {
                    let Some(device) = cpal::default_host().default_input_device() else {
                        tracing::error!("No default input device");
                        return;
                    };
                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            for &sample in data {
                                let _ = samples.force_push(sample);
                            }
                        },
                        |err| tracing::warn!("Input stream error: {}", err),
                        None,
                    );
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = stream.play() {
                                tracing::error!("Failed to start input stream: {}", e);
                                return;
                            }
                            while running.load(Ordering::Relaxed) {
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                        Err(e) => tracing::error!("Failed to build input stream: {}", e),
                    }
                })?;
            self.thread = Some(handle);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut captured = 0;
            for chunk in buf.chunks_exact_mut(2) {
                let sample = match self.samples.pop() {
                    Some(s) => {
                        captured += 2;
                        (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                    }
                    None => 0,
                };
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
            Ok(captured)
        }

        fn stop(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            Ok(())
        }
    }

    impl Drop for CpalCapturer {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }
}
