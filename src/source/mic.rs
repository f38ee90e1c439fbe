//! Remote mic port on the source device
//!
//! Decoded frames from the sink pass an optional echo canceller and land in
//! a byte ring. A drain thread cuts the ring into frames and queues them for
//! the driver, which pulls with `ReadStreamData` or, in mmap mode, gets one
//! slice per period written into the shared region.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio::buffer::{JitterQueue, RingBuffer};
use crate::audio::data::AudioData;
use crate::audio::pacer::period_ms_to_ns;
use crate::audio::param::{calculate_sample_num, AudioParam, AudioParamHdf, DhId};
use crate::audio::shared_memory::AshmemInfo;
use crate::constants::{LOW_LATENCY_JITTER_MAX_TIME_MS, LOW_LATENCY_JITTER_TIME_MS};
use crate::driver::{DAudioIoCallback, MmapPosition};
use crate::error::{Error, Result};
use crate::protocol::{with_dh_id, AudioEvent, AudioEventType};
use crate::source::io_dev::{AudioEventListener, IoDev, IoDevCore, IoDevState, MmapState};
use crate::source::SourceContext;
use crate::transport::{
    AudioTransport, AudioTransportCallback, AvTransport, EngineEvent, EngineProvider,
};

/// Echo-cancellation stage applied to received mic audio
pub trait EchoCanceller: Send {
    fn process(&mut self, data: AudioData) -> Result<AudioData>;
}

/// Flags shared between the mic and its drain thread
#[derive(Default)]
struct CaptureFlags {
    started: AtomicBool,
    /// A driver read found the queue empty since the last refill
    existed_empty: AtomicBool,
}

pub struct MicDev {
    core: IoDevCore,
    weak_self: Weak<MicDev>,
    trans_handler: Arc<dyn AudioTransportCallback>,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    queue: Arc<JitterQueue>,
    flags: Arc<CaptureFlags>,
    frame_len: Arc<AtomicUsize>,
    drain_running: Arc<AtomicBool>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
    echo: Mutex<Option<Box<dyn EchoCanceller>>>,
    mmap: MmapState,
}

impl MicDev {
    pub fn new(
        dev_id: &str,
        dh_id: DhId,
        ctx: &SourceContext,
        listener: Weak<dyn AudioEventListener>,
    ) -> Arc<Self> {
        let config = ctx.config.device.clone();
        Arc::new_cyclic(|weak| Self {
            queue: Arc::new(JitterQueue::new(config.queue_ext_size)),
            core: IoDevCore::new(
                dev_id,
                dh_id,
                ctx.driver.clone(),
                ctx.codecs.clone(),
                config,
                listener,
            ),
            weak_self: weak.clone(),
            trans_handler: Arc::new(MicTransHandler { dev: weak.clone() }),
            ring: Mutex::new(None),
            flags: Arc::new(CaptureFlags::default()),
            frame_len: Arc::new(AtomicUsize::new(0)),
            drain_running: Arc::new(AtomicBool::new(false)),
            drain_thread: Mutex::new(None),
            echo: Mutex::new(None),
            mmap: MmapState::default(),
        })
    }

    /// Route received audio through `canceller` before it is queued
    pub fn set_echo_canceller(&self, canceller: Box<dyn EchoCanceller>) {
        *self.echo.lock() = Some(canceller);
    }

    /// Frames waiting for the driver
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Decoded audio from the sink
    fn on_data(&self, data: AudioData) {
        let data = match self.echo.lock().as_mut() {
            Some(echo) => match echo.process(data) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Echo cancellation on mic {} failed: {}", self.core.dh_id, e);
                    return;
                }
            },
            None => data,
        };
        let Some(ring) = self.ring.lock().clone() else {
            tracing::debug!("Mic {} audio before setup, dropped", self.core.dh_id);
            return;
        };
        if let Err(e) = ring.insert(data.data()) {
            tracing::warn!("Mic {} ring insert failed: {}", self.core.dh_id, e);
        }
    }

    fn start_drain_thread(&self, ring: Arc<RingBuffer>) -> Result<()> {
        if self.drain_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let param = self.core.audio_param();
        let hdf = self.core.param_hdf();
        let config = &self.core.config;
        let limits = QueueLimits {
            mmap: param
                .is_capture_mmap()
                .then(|| (LOW_LATENCY_JITTER_MAX_TIME_MS / hdf.period.max(1)) as usize),
            idle: config.queue_half_size(),
            underrun: config.queue_ext_size,
            running: config.queue_max_size,
        };
        let queue = self.queue.clone();
        let flags = self.flags.clone();
        let frame_len = self.frame_len.clone();
        let running = self.drain_running.clone();
        let poll = config.poll_interval();
        let dh_id = self.core.dh_id;

        let spawned = thread::Builder::new()
            .name(format!("daudio-mic-drain-{}", dh_id))
            .spawn(move || {
                tracing::debug!("Mic {} drain thread started", dh_id);
                while running.load(Ordering::Acquire) {
                    let len = frame_len.load(Ordering::Acquire);
                    while len > 0 && ring.can_read(len) {
                        let mut frame = AudioData::new(len);
                        if let Err(e) = ring.get_data(frame.data_mut()) {
                            tracing::warn!("Mic {} ring read failed: {}", dh_id, e);
                            break;
                        }
                        let limit = limits.select(&flags);
                        let dropped = queue.push_with_limit(frame, limit);
                        if dropped > 0 {
                            tracing::debug!("Mic {} queue full, dropped {}", dh_id, dropped);
                        }
                        if queue.len() >= limits.idle {
                            flags.existed_empty.store(false, Ordering::Release);
                        }
                    }
                    thread::sleep(poll);
                }
                tracing::debug!("Mic {} drain thread stopped", dh_id);
            });
        match spawned {
            Ok(handle) => {
                *self.drain_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.drain_running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Replace the ring and restart the drain thread on it. A drain thread
    /// left on the old ring would starve the queue.
    fn install_ring(&self, frame_size: usize) -> Result<()> {
        self.stop_drain_thread();
        if self.frame_len.load(Ordering::Acquire) == 0 {
            self.frame_len.store(frame_size, Ordering::Release);
        }
        // room for the larger of a codec frame and an mmap slice
        let unit = frame_size.max(self.frame_len.load(Ordering::Acquire));
        let ring = Arc::new(RingBuffer::new(unit * self.core.config.ring_buffer_frames.max(1)));
        *self.ring.lock() = Some(ring.clone());
        self.queue.clear();
        self.start_drain_thread(ring)
    }

    fn stop_drain_thread(&self) {
        self.drain_running.store(false, Ordering::Release);
        if let Some(handle) = self.drain_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Mic {} drain thread panicked", self.core.dh_id);
            }
        }
    }
}

/// Queue bound applied on each push
struct QueueLimits {
    mmap: Option<usize>,
    idle: usize,
    underrun: usize,
    running: usize,
}

impl QueueLimits {
    fn select(&self, flags: &CaptureFlags) -> usize {
        if let Some(mmap) = self.mmap {
            mmap
        } else if !flags.started.load(Ordering::Acquire) {
            self.idle
        } else if flags.existed_empty.load(Ordering::Acquire) {
            self.underrun
        } else {
            self.running
        }
    }
}

impl IoDev for MicDev {
    fn dh_id(&self) -> DhId {
        self.core.dh_id
    }

    fn enable_device(&self, capability: &str) -> Result<()> {
        let callback: Arc<dyn DAudioIoCallback> =
            self.weak_self.upgrade().ok_or(Error::Nullptr("mic"))?;
        self.core.enable(capability, callback)
    }

    fn disable_device(&self) -> Result<()> {
        self.core.disable()
    }

    fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()> {
        let transport = Arc::new(AvTransport::receiver(
            &self.core.dev_id,
            self.core.dh_id,
            self.core.codecs.clone(),
            Arc::downgrade(&self.trans_handler),
        ));
        self.core.open_transport(transport, provider)
    }

    fn setup(&self) -> Result<()> {
        let param = self.core.audio_param();
        let frame_size = param.com_param.frame_size;
        if frame_size == 0 {
            return Err(Error::ParamInvalid("mic frame size is 0".into()));
        }
        self.core.transport()?.setup(&param, &param)?;
        self.install_ring(frame_size)?;
        self.core.set_state(IoDevState::Ready);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.core.expect_state(IoDevState::Ready, "start")?;
        self.core.transport()?.start()?;
        self.core.wait_trans_ready()?;
        self.flags.existed_empty.store(false, Ordering::Release);
        self.flags.started.store(true, Ordering::Release);
        self.core.set_opened(true);
        self.core.set_state(IoDevState::Started);
        tracing::info!("Mic {} started", self.core.dh_id);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let state = self.core.state();
        if !matches!(state, IoDevState::Started | IoDevState::Paused) {
            return Err(Error::StatusErr(format!("stop mic in state {:?}", state)));
        }
        self.flags.started.store(false, Ordering::Release);
        self.core.set_opened(false);
        self.mmap.stop();
        self.core.set_state(IoDevState::Stopped);
        self.core.transport()?.stop()?;
        tracing::info!("Mic {} stopped", self.core.dh_id);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut ok = true;
        self.flags.started.store(false, Ordering::Release);
        self.core.set_opened(false);
        self.mmap.unmap();
        self.stop_drain_thread();
        if let Some(transport) = self.core.take_transport() {
            if let Err(e) = transport.release() {
                tracing::warn!("Release mic {} transport failed: {}", self.core.dh_id, e);
                ok = false;
            }
        }
        self.ring.lock().take();
        self.queue.clear();
        self.frame_len.store(0, Ordering::Release);
        self.core.set_state(IoDevState::Idle);
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("release mic {}", self.core.dh_id)))
        }
    }

    fn pause(&self) -> Result<()> {
        self.core.expect_state(IoDevState::Started, "pause")?;
        self.core.transport()?.pause()?;
        self.core.set_state(IoDevState::Paused);
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        self.core.expect_state(IoDevState::Paused, "restart")?;
        let param = self.core.audio_param();
        self.core.transport()?.restart(&param, &param)?;
        self.core.set_state(IoDevState::Started);
        Ok(())
    }

    fn mmap_start(&self) -> Result<()> {
        self.core.expect_state(IoDevState::Started, "mmap start")?;
        let hdf = self.core.param_hdf();
        let period = hdf.period.max(1);
        let fill_threshold = (LOW_LATENCY_JITTER_TIME_MS / period) as usize;
        let poll = self.core.config.poll_interval();
        let fill_timeout = self.core.config.channel_timeout();
        let fill_queue = self.queue.clone();
        let queue = self.queue.clone();
        let dh_id = self.core.dh_id;

        self.mmap.spawn(
            format!("daudio-mic-mmap-{}", dh_id),
            period_ms_to_ns(hdf.period),
            calculate_sample_num(hdf.sample_rate, hdf.period),
            move |running| {
                if !fill_queue.wait_fill(fill_threshold, running, poll, fill_timeout) {
                    tracing::warn!("Mic {} mmap pre-roll incomplete, starting anyway", dh_id);
                }
            },
            move |memory, offset, slice| {
                let frame = queue.pop_or_silence(slice);
                let bytes = frame.data();
                if bytes.len() >= slice {
                    memory.write_at(&bytes[..slice], offset)
                } else {
                    let mut padded = vec![0u8; slice];
                    padded[..bytes.len()].copy_from_slice(bytes);
                    memory.write_at(&padded, offset)
                }
            },
        )?;
        tracing::info!("Mic {} mmap started", dh_id);
        Ok(())
    }

    fn mmap_stop(&self) -> Result<()> {
        self.mmap.stop();
        tracing::info!("Mic {} mmap stopped", self.core.dh_id);
        Ok(())
    }

    fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.core.send_message(event)
    }

    fn is_opened(&self) -> bool {
        self.core.is_opened()
    }

    fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    fn state(&self) -> IoDevState {
        self.core.state()
    }

    fn audio_param(&self) -> AudioParam {
        self.core.audio_param()
    }
}

impl DAudioIoCallback for MicDev {
    fn create_stream(&self, stream_id: i32) -> Result<()> {
        tracing::info!("Mic {} stream {} created", self.core.dh_id, stream_id);
        self.core.notify_listener(AudioEventType::OpenMic);
        Ok(())
    }

    fn destroy_stream(&self, stream_id: i32) -> Result<()> {
        tracing::info!("Mic {} stream {} destroyed", self.core.dh_id, stream_id);
        self.core.notify_listener(AudioEventType::CloseMic);
        Ok(())
    }

    fn set_parameters(&self, _stream_id: i32, param: &AudioParamHdf) -> Result<()> {
        self.core.set_parameters(param)
    }

    fn notify_event(&self, _stream_id: i32, event: &AudioEvent) -> Result<()> {
        let content = with_dh_id(&event.content, self.core.dh_id)?;
        self.core
            .forward_to_listener(AudioEvent::new(event.event_type, content));
        Ok(())
    }

    fn write_stream_data(&self, _stream_id: i32, _data: AudioData) -> Result<()> {
        Err(Error::NotSupported("writing to a mic".into()))
    }

    fn read_stream_data(&self, _stream_id: i32) -> Result<AudioData> {
        let state = self.core.state();
        if !matches!(state, IoDevState::Started | IoDevState::Paused) {
            return Err(Error::StatusErr(format!("read from mic in state {:?}", state)));
        }
        match self.queue.pop() {
            Some(frame) => Ok(frame),
            None => {
                self.flags.existed_empty.store(true, Ordering::Release);
                Ok(AudioData::new(self.frame_len.load(Ordering::Acquire)))
            }
        }
    }

    fn read_mmap_position(&self, _stream_id: i32) -> Result<MmapPosition> {
        Ok(self.mmap.position())
    }

    fn refresh_ashmem_info(&self, _stream_id: i32, info: AshmemInfo) -> Result<()> {
        let slice = info.length_per_trans;
        if let Some(ring) = self.ring.lock().as_ref() {
            if slice > ring.capacity() {
                return Err(Error::ParamInvalid(format!(
                    "mmap slice {} exceeds mic ring of {}",
                    slice,
                    ring.capacity()
                )));
            }
        }
        self.mmap.refresh(info)?;
        self.frame_len.store(slice, Ordering::Release);
        Ok(())
    }
}

/// Routes transport output for one mic
struct MicTransHandler {
    dev: Weak<MicDev>,
}

impl AudioTransportCallback for MicTransHandler {
    fn on_engine_trans_event(&self, event: EngineEvent) {
        if let Some(dev) = self.dev.upgrade() {
            dev.core.on_trans_event(event);
        }
    }

    fn on_engine_trans_message(&self, event: AudioEvent) {
        if let Some(dev) = self.dev.upgrade() {
            dev.core.forward_to_listener(event);
        }
    }

    fn on_engine_trans_data_available(&self, data: AudioData) {
        if let Some(dev) = self.dev.upgrade() {
            dev.on_data(data);
        }
    }
}
