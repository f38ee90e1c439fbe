//! State shared by source-side speaker and mic ports
//!
//! A port moves `Idle -> Ready -> Started <-> Paused -> Stopped -> Idle`.
//! [`IoDevCore`] holds what both kinds of port need: driver registration,
//! negotiated parameters, the transport, and the channel-open wait.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

use crate::audio::pacer::{now_ns, TimestampPacer};
use crate::audio::param::{
    parse_codec_capability, AudioCodecType, AudioParam, AudioParamHdf, DeviceKind, DhId,
    PortOperationMode,
};
use crate::audio::shared_memory::{AshmemInfo, SharedMemory};
use crate::codec::CodecRegistry;
use crate::config::DeviceConfig;
use crate::driver::{AudioDriver, DAudioIoCallback, MmapPosition};
use crate::error::{Error, Result};
pub use crate::protocol::AudioEventListener;
use crate::protocol::{AudioEvent, AudioEventType, ControlPayload};
use crate::transport::{AudioTransport, EngineEvent, EngineProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDevState {
    Idle,
    Ready,
    Started,
    Paused,
    Stopped,
}

/// Operations the orchestrator runs on a port
pub trait IoDev: Send + Sync {
    fn dh_id(&self) -> DhId;
    fn enable_device(&self, capability: &str) -> Result<()>;
    fn disable_device(&self) -> Result<()>;
    /// Create the transport and open its channel
    fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()>;
    fn setup(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn mmap_start(&self) -> Result<()>;
    fn mmap_stop(&self) -> Result<()>;
    fn send_message(&self, event: &AudioEvent) -> Result<()>;
    fn is_opened(&self) -> bool;
    fn is_enabled(&self) -> bool;
    fn state(&self) -> IoDevState;
    fn audio_param(&self) -> AudioParam;
}

pub struct IoDevCore {
    pub dev_id: String,
    pub dh_id: DhId,
    pub driver: Arc<dyn AudioDriver>,
    pub codecs: Arc<CodecRegistry>,
    pub config: DeviceConfig,
    listener: Weak<dyn AudioEventListener>,
    state: Mutex<IoDevState>,
    enabled: AtomicBool,
    opened: AtomicBool,
    peer_codecs: Mutex<HashSet<AudioCodecType>>,
    param: Mutex<AudioParam>,
    param_hdf: Mutex<AudioParamHdf>,
    transport: Mutex<Option<Arc<dyn AudioTransport>>>,
    trans_ready: Mutex<bool>,
    trans_cv: Condvar,
}

impl IoDevCore {
    pub fn new(
        dev_id: &str,
        dh_id: DhId,
        driver: Arc<dyn AudioDriver>,
        codecs: Arc<CodecRegistry>,
        config: DeviceConfig,
        listener: Weak<dyn AudioEventListener>,
    ) -> Self {
        Self {
            dev_id: dev_id.to_string(),
            dh_id,
            driver,
            codecs,
            config,
            listener,
            state: Mutex::new(IoDevState::Idle),
            enabled: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            peer_codecs: Mutex::new(HashSet::from([AudioCodecType::Pcm])),
            param: Mutex::new(AudioParam::default()),
            param_hdf: Mutex::new(AudioParamHdf::default()),
            transport: Mutex::new(None),
            trans_ready: Mutex::new(false),
            trans_cv: Condvar::new(),
        }
    }

    /// Register the port with the driver. Enabling twice is an error.
    pub fn enable(&self, capability: &str, callback: Arc<dyn DAudioIoCallback>) -> Result<()> {
        if self.enabled.load(Ordering::Acquire) {
            return Err(Error::StatusErr(format!("port {} already enabled", self.dh_id)));
        }
        // only codecs both ends can run are candidates
        let local = self.codecs.supported();
        *self.peer_codecs.lock() = parse_codec_capability(capability)?
            .intersection(&local)
            .copied()
            .collect();
        self.driver
            .register_audio_device(&self.dev_id, self.dh_id, capability, callback)?;
        self.enabled.store(true, Ordering::Release);
        tracing::info!("Port {} of {} enabled", self.dh_id, self.dev_id);
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            tracing::debug!("Port {} already disabled", self.dh_id);
            return Ok(());
        }
        self.driver.unregister_audio_device(&self.dev_id, self.dh_id)?;
        tracing::info!("Port {} of {} disabled", self.dh_id, self.dev_id);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }

    pub fn state(&self) -> IoDevState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: IoDevState) {
        let mut current = self.state.lock();
        tracing::debug!("Port {} {:?} -> {:?}", self.dh_id, *current, state);
        *current = state;
    }

    /// Fail unless the port is in `expected`
    pub fn expect_state(&self, expected: IoDevState, op: &str) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(Error::StatusErr(format!(
                "{} on port {} in state {:?}",
                op, self.dh_id, state
            )));
        }
        Ok(())
    }

    pub fn audio_param(&self) -> AudioParam {
        self.param.lock().clone()
    }

    pub fn param_hdf(&self) -> AudioParamHdf {
        self.param_hdf.lock().clone()
    }

    /// Validate driver parameters and derive the session format
    pub fn set_parameters(&self, hdf: &AudioParamHdf) -> Result<()> {
        let codecs = self.peer_codecs.lock().clone();
        let param = match self.dh_id.kind() {
            DeviceKind::Speaker => {
                hdf.check_mmap_period(hdf.render_flags)?;
                hdf.to_render_param(&codecs)
            }
            DeviceKind::Mic => {
                hdf.check_mmap_period(hdf.capturer_flags)?;
                hdf.to_capture_param(&codecs)
            }
        };
        tracing::info!(
            "Port {} parameters: {} Hz, {:?}, frame {} bytes, {:?}",
            self.dh_id,
            param.com_param.sample_rate,
            param.com_param.codec_type,
            param.com_param.frame_size,
            if param.is_render_mmap() || param.is_capture_mmap() {
                PortOperationMode::Mmap
            } else {
                PortOperationMode::Normal
            }
        );
        *self.param_hdf.lock() = hdf.clone();
        *self.param.lock() = param;
        Ok(())
    }

    pub fn transport(&self) -> Result<Arc<dyn AudioTransport>> {
        self.transport
            .lock()
            .clone()
            .ok_or(Error::Nullptr("transport"))
    }

    pub fn has_transport(&self) -> bool {
        self.transport.lock().is_some()
    }

    /// Install a new transport, initialize its engine and open the channel
    pub fn open_transport(
        &self,
        transport: Arc<dyn AudioTransport>,
        provider: &Arc<dyn EngineProvider>,
    ) -> Result<()> {
        *self.trans_ready.lock() = false;
        transport.init_engine(provider)?;
        *self.transport.lock() = Some(transport.clone());
        transport.create_ctrl()
    }

    pub fn take_transport(&self) -> Option<Arc<dyn AudioTransport>> {
        *self.trans_ready.lock() = false;
        self.transport.lock().take()
    }

    /// Block until the channel reports open, up to the configured timeout
    pub fn wait_trans_ready(&self) -> Result<()> {
        self.wait_trans_ready_for(self.config.channel_timeout())
    }

    pub fn wait_trans_ready_for(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.trans_ready.lock();
        self.trans_cv.wait_while_for(&mut ready, |ready| !*ready, timeout);
        if !*ready {
            tracing::error!("Port {} channel not open after {:?}", self.dh_id, timeout);
            return Err(Error::WaitTimeout("channel open"));
        }
        Ok(())
    }

    /// Channel lifecycle from the transport
    pub fn on_trans_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::ChannelOpened => {
                *self.trans_ready.lock() = true;
                self.trans_cv.notify_all();
            }
            EngineEvent::ChannelClosed | EngineEvent::TransError(_) => {
                let was_ready = std::mem::replace(&mut *self.trans_ready.lock(), false);
                if let EngineEvent::TransError(reason) = &event {
                    tracing::error!("Port {} transport error: {}", self.dh_id, reason);
                }
                if was_ready && self.is_opened() {
                    let closed = match self.dh_id.kind() {
                        DeviceKind::Speaker => AudioEventType::SpeakerClosed,
                        DeviceKind::Mic => AudioEventType::MicClosed,
                    };
                    self.notify_listener(closed);
                }
            }
            EngineEvent::Started | EngineEvent::Stopped => {
                tracing::debug!("Port {} engine {:?}", self.dh_id, event);
            }
        }
    }

    /// Raise an event for this port to the orchestrator
    pub fn notify_listener(&self, event_type: AudioEventType) {
        let content = match ControlPayload::new(self.dh_id).to_json() {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("Encode {:?} payload failed: {}", event_type, e);
                return;
            }
        };
        self.forward_to_listener(AudioEvent::new(event_type, content));
    }

    pub fn forward_to_listener(&self, event: AudioEvent) {
        match self.listener.upgrade() {
            Some(listener) => listener.notify_event(event),
            None => tracing::warn!(
                "Port {} event {:?} dropped, orchestrator gone",
                self.dh_id,
                event.event_type
            ),
        }
    }

    pub fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.transport()?.send_message(event)
    }
}

/// Shared-memory region and the paced thread that services it
#[derive(Default)]
pub struct MmapState {
    memory: Mutex<Option<Arc<SharedMemory>>>,
    length_per_trans: AtomicUsize,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    position: Arc<AtomicCell<MmapPosition>>,
}

impl MmapState {
    /// Map the region the driver handed over
    pub fn refresh(&self, info: AshmemInfo) -> Result<()> {
        if self.is_running() {
            return Err(Error::StatusErr("shared memory refreshed while mmap runs".into()));
        }
        info.validate()?;
        let memory = SharedMemory::map_file(&info.file, info.len)?;
        tracing::info!(
            "Shared memory mapped: {} bytes, {} per period",
            info.len,
            info.length_per_trans
        );
        self.length_per_trans
            .store(info.length_per_trans, Ordering::Release);
        *self.memory.lock() = Some(Arc::new(memory));
        Ok(())
    }

    pub fn length_per_trans(&self) -> usize {
        self.length_per_trans.load(Ordering::Acquire)
    }

    pub fn is_mapped(&self) -> bool {
        self.memory.lock().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn position(&self) -> MmapPosition {
        self.position.load()
    }

    /// Start the paced thread. `prepare` runs once before the first period;
    /// `step` runs once per period with the region and the slice offset.
    pub fn spawn<P, S>(
        &self,
        name: String,
        period_ns: i64,
        frames_per_period: u64,
        prepare: P,
        mut step: S,
    ) -> Result<()>
    where
        P: FnOnce(&AtomicBool) + Send + 'static,
        S: FnMut(&SharedMemory, usize, usize) -> Result<()> + Send + 'static,
    {
        if period_ns <= 0 {
            return Err(Error::ParamInvalid(format!("mmap period {} ns", period_ns)));
        }
        let memory = self
            .memory
            .lock()
            .clone()
            .ok_or(Error::NotInit("shared memory"))?;
        let slice = self.length_per_trans();
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::StatusErr("mmap thread already running".into()));
        }
        self.position.store(MmapPosition::default());

        let running = self.running.clone();
        let position = self.position.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            prepare(&running);
            let mut pacer = TimestampPacer::new(period_ns);
            let mut index = 0usize;
            while running.load(Ordering::Acquire) {
                let offset = pacer.begin_frame();
                if offset != 0 {
                    tracing::debug!("mmap drift {} ns at frame {}", offset, pacer.frame_index());
                }
                if let Err(e) = step(&memory, index, slice) {
                    tracing::warn!("mmap period at offset {} failed: {}", index, e);
                }
                index = (index + slice) % memory.len();
                let last = position.load();
                position.store(MmapPosition {
                    frames: last.frames + frames_per_period,
                    time_ns: now_ns(),
                });
                if let Err(e) = pacer.end_frame(offset) {
                    tracing::error!("mmap pacing failed: {}", e);
                    break;
                }
            }
        });
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Clear the running flag, then join the thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("mmap thread panicked");
            }
        }
    }

    pub fn unmap(&self) {
        self.stop();
        self.memory.lock().take();
        self.length_per_trans.store(0, Ordering::Release);
    }
}
