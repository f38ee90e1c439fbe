//! Source orchestrator for one remote device
//!
//! All state changes for the device run as tasks on a single
//! [`EventRunner`]. Opening a port notifies the sink and then blocks the
//! runner until the sink's result arrives. That result never goes through
//! the runner's queue: [`SourceDev::notify_event`] hands it straight to
//! [`SourceDev::handle_notify_rpc`], which wakes the waiting task.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};

use crate::audio::param::{AudioParam, DeviceKind, DhId};
use crate::error::{result_code, Error, Result, DH_SUCCESS};
use crate::protocol::{
    parse_payload, AudioEvent, AudioEventType, ControlPayload, EnableRequest, PlayStatus,
    PlayStatusEvent, RpcResult, VolumeEvent,
};
use crate::runner::EventRunner;
use crate::source::io_dev::{AudioEventListener, IoDev};
use crate::source::mic::MicDev;
use crate::source::speaker::SpeakerDev;
use crate::source::SourceContext;

/// Told about the outcome of enable and disable tasks
pub trait RegisterObserver: Send + Sync {
    fn on_enable_result(&self, dev_id: &str, dh_id: DhId, code: i32);
    fn on_disable_result(&self, dev_id: &str, dh_id: DhId, code: i32);
}

type Task = fn(&SourceDev, &AudioEvent) -> Result<()>;

fn task_table() -> &'static HashMap<AudioEventType, Task> {
    static TASKS: OnceLock<HashMap<AudioEventType, Task>> = OnceLock::new();
    TASKS.get_or_init(|| {
        let mut tasks: HashMap<AudioEventType, Task> = HashMap::new();
        tasks.insert(AudioEventType::DaudioEnable, SourceDev::task_enable);
        tasks.insert(AudioEventType::DaudioDisable, SourceDev::task_disable);
        tasks.insert(AudioEventType::OpenSpeaker, SourceDev::task_open_speaker);
        tasks.insert(AudioEventType::CloseSpeaker, SourceDev::task_close_speaker);
        tasks.insert(AudioEventType::SpeakerClosed, SourceDev::task_port_closed);
        tasks.insert(AudioEventType::OpenMic, SourceDev::task_open_mic);
        tasks.insert(AudioEventType::CloseMic, SourceDev::task_close_mic);
        tasks.insert(AudioEventType::MicClosed, SourceDev::task_port_closed);
        tasks.insert(AudioEventType::VolumeSet, SourceDev::task_forward_to_sink);
        tasks.insert(AudioEventType::VolumeMuteSet, SourceDev::task_forward_to_sink);
        tasks.insert(AudioEventType::VolumeChange, SourceDev::task_forward_to_hdf);
        tasks.insert(AudioEventType::AudioFocusChange, SourceDev::task_forward_to_hdf);
        tasks.insert(AudioEventType::AudioRenderStateChange, SourceDev::task_forward_to_hdf);
        tasks.insert(AudioEventType::ChangePlayStatus, SourceDev::task_play_status);
        tasks.insert(AudioEventType::MmapSpkStart, SourceDev::task_mmap_start);
        tasks.insert(AudioEventType::MmapSpkStop, SourceDev::task_mmap_stop);
        tasks.insert(AudioEventType::MmapMicStart, SourceDev::task_mmap_start);
        tasks.insert(AudioEventType::MmapMicStop, SourceDev::task_mmap_stop);
        tasks
    })
}

/// Result slot of the pending RPC
#[derive(Debug, Default)]
struct RpcState {
    notify: Option<AudioEventType>,
    result: i32,
}

pub struct SourceDev {
    dev_id: String,
    ctx: SourceContext,
    weak_self: Weak<SourceDev>,
    observer: Weak<dyn RegisterObserver>,
    runner: OnceLock<Arc<EventRunner>>,
    speakers: Mutex<HashMap<DhId, Arc<SpeakerDev>>>,
    mics: Mutex<HashMap<DhId, Arc<MicDev>>>,
    rpc: Mutex<RpcState>,
    rpc_cv: Condvar,
}

impl SourceDev {
    pub fn new(
        dev_id: &str,
        ctx: SourceContext,
        observer: Weak<dyn RegisterObserver>,
    ) -> Result<Arc<Self>> {
        let dev = Arc::new_cyclic(|weak| Self {
            dev_id: dev_id.to_string(),
            ctx,
            weak_self: weak.clone(),
            observer,
            runner: OnceLock::new(),
            speakers: Mutex::new(HashMap::new()),
            mics: Mutex::new(HashMap::new()),
            rpc: Mutex::new(RpcState::default()),
            rpc_cv: Condvar::new(),
        });

        let weak = Arc::downgrade(&dev);
        let runner = EventRunner::spawn(format!("daudio-src-{}", dev_id), move |event| {
            if let Some(dev) = weak.upgrade() {
                dev.run_task(event);
            }
        })?;
        let _ = dev.runner.set(Arc::new(runner));
        tracing::info!("Source device {} created", dev_id);
        Ok(dev)
    }

    pub fn dev_id(&self) -> &str {
        &self.dev_id
    }

    pub fn runner(&self) -> Option<&Arc<EventRunner>> {
        self.runner.get()
    }

    pub fn speaker(&self, dh_id: DhId) -> Option<Arc<SpeakerDev>> {
        self.speakers.lock().get(&dh_id).cloned()
    }

    pub fn mic(&self, dh_id: DhId) -> Option<Arc<MicDev>> {
        self.mics.lock().get(&dh_id).cloned()
    }

    /// No port is enabled any more
    pub fn is_idle(&self) -> bool {
        self.speakers.lock().is_empty() && self.mics.lock().is_empty()
    }

    pub fn enable_daudio(&self, dh_id: &str, attrs: &str) -> Result<()> {
        let request = EnableRequest {
            dh_id: dh_id.to_string(),
            attrs: attrs.to_string(),
        };
        self.post(AudioEvent::new(
            AudioEventType::DaudioEnable,
            serde_json::to_string(&request)?,
        ))
    }

    pub fn disable_daudio(&self, dh_id: &str) -> Result<()> {
        let payload = ControlPayload::new(DhId::parse(dh_id)?);
        self.post(AudioEvent::new(AudioEventType::DaudioDisable, payload.to_json()?))
    }

    fn post(&self, event: AudioEvent) -> Result<()> {
        self.runner
            .get()
            .ok_or(Error::NotInit("source event runner"))?
            .post(event)
    }

    /// Block until the sink's result for `expected` arrives or the RPC
    /// timeout passes. A different result type keeps waiting.
    pub fn wait_for_rpc(&self, expected: AudioEventType) -> Result<()> {
        let timeout = self.ctx.config.device.rpc_timeout();
        let mut rpc = self.rpc.lock();
        self.rpc_cv
            .wait_while_for(&mut rpc, |rpc| rpc.notify != Some(expected), timeout);
        if rpc.notify != Some(expected) {
            tracing::error!("No {:?} from {} within {:?}", expected, self.dev_id, timeout);
            return Err(Error::RpcWaitTimeout(expected));
        }
        rpc.notify = None;
        match rpc.result {
            DH_SUCCESS => Ok(()),
            code => {
                tracing::error!("{:?} from {} reported {}", expected, self.dev_id, code);
                Err(Error::Remote(code))
            }
        }
    }

    /// Record an RPC result and wake the waiting task
    pub fn handle_notify_rpc(&self, event: &AudioEvent) -> Result<()> {
        let result: RpcResult = parse_payload(&event.content)?;
        let mut rpc = self.rpc.lock();
        rpc.notify = Some(event.event_type);
        rpc.result = result.result;
        self.rpc_cv.notify_all();
        tracing::debug!("RPC result {:?} = {}", event.event_type, result.result);
        Ok(())
    }

    fn run_task(&self, event: AudioEvent) {
        let Some(task) = task_table().get(&event.event_type) else {
            tracing::warn!("No task for event {:?}, ignored", event.event_type);
            return;
        };
        tracing::debug!("Source task {:?} for {}", event.event_type, self.dev_id);
        if let Err(e) = task(self, &event) {
            tracing::error!(
                "Source task {:?} for {} failed: {} ({})",
                event.event_type,
                self.dev_id,
                e,
                e.code()
            );
        }
    }

    fn io_dev(&self, dh_id: DhId) -> Result<Arc<dyn IoDev>> {
        let dev: Option<Arc<dyn IoDev>> = match dh_id.kind() {
            DeviceKind::Speaker => self.speaker(dh_id).map(|s| s as Arc<dyn IoDev>),
            DeviceKind::Mic => self.mic(dh_id).map(|m| m as Arc<dyn IoDev>),
        };
        dev.ok_or(Error::Nullptr(match dh_id.kind() {
            DeviceKind::Speaker => "speaker",
            DeviceKind::Mic => "mic",
        }))
    }

    /// Send a request to the sink over the port's channel. Opens wait for
    /// the matching result.
    fn notify_sink_dev(
        &self,
        event_type: AudioEventType,
        dh_id: DhId,
        param: Option<AudioParam>,
    ) -> Result<()> {
        let payload = ControlPayload::request(dh_id, event_type, param);
        let event = AudioEvent::new(event_type, payload.to_json()?);
        let expected = event_type.result_event().filter(|_| event_type.waits_for_rpc());
        if expected.is_some() {
            let mut rpc = self.rpc.lock();
            rpc.notify = None;
            rpc.result = DH_SUCCESS;
        }
        self.io_dev(dh_id)?.send_message(&event)?;
        match expected {
            Some(expected) => self.wait_for_rpc(expected),
            None => Ok(()),
        }
    }

    fn notify_hdf(&self, event_type: AudioEventType, dh_id: DhId, content: String) -> Result<()> {
        self.ctx
            .driver
            .notify_event(&self.dev_id, dh_id, &AudioEvent::new(event_type, content))
    }

    fn notify_hdf_result(&self, event_type: AudioEventType, dh_id: DhId, code: i32) -> Result<()> {
        self.notify_hdf(
            event_type,
            dh_id,
            ControlPayload::result(dh_id, event_type, code).to_json()?,
        )
    }

    fn task_enable(&self, event: &AudioEvent) -> Result<()> {
        let request: EnableRequest = parse_payload(&event.content)?;
        let dh_id = DhId::parse(&request.dh_id)?;
        let result = self.enable_port(dh_id, &request.attrs);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_enable_result(&self.dev_id, dh_id, result_code(&result));
        }
        result
    }

    fn enable_port(&self, dh_id: DhId, attrs: &str) -> Result<()> {
        let listener: Weak<dyn AudioEventListener> = self.weak_self.clone();
        match dh_id.kind() {
            DeviceKind::Speaker => {
                let speaker = self
                    .speaker(dh_id)
                    .unwrap_or_else(|| SpeakerDev::new(&self.dev_id, dh_id, &self.ctx, listener));
                speaker.enable_device(attrs)?;
                self.speakers.lock().insert(dh_id, speaker);
            }
            DeviceKind::Mic => {
                let mic = self
                    .mic(dh_id)
                    .unwrap_or_else(|| MicDev::new(&self.dev_id, dh_id, &self.ctx, listener));
                mic.enable_device(attrs)?;
                self.mics.lock().insert(dh_id, mic);
            }
        }
        tracing::info!("Enabled port {} of {}", dh_id, self.dev_id);
        Ok(())
    }

    fn task_disable(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let result = self.disable_port(dh_id);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_disable_result(&self.dev_id, dh_id, result_code(&result));
        }
        result
    }

    fn disable_port(&self, dh_id: DhId) -> Result<()> {
        let dev = self.io_dev(dh_id)?;
        if dev.is_opened() {
            tracing::info!("Port {} still open, closing before disable", dh_id);
            self.close_port(dh_id, &dev);
        }
        let result = dev.disable_device();
        match dh_id.kind() {
            DeviceKind::Speaker => {
                self.speakers.lock().remove(&dh_id);
            }
            DeviceKind::Mic => {
                self.mics.lock().remove(&dh_id);
            }
        }
        tracing::info!("Disabled port {} of {}", dh_id, self.dev_id);
        result
    }

    fn task_open_speaker(&self, event: &AudioEvent) -> Result<()> {
        self.open_port(event, AudioEventType::NotifyOpenSpeakerResult)
    }

    fn task_open_mic(&self, event: &AudioEvent) -> Result<()> {
        self.open_port(event, AudioEventType::NotifyOpenMicResult)
    }

    fn open_port(&self, event: &AudioEvent, result_type: AudioEventType) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let result = self.open_io_dev(event.event_type, dh_id);
        self.notify_hdf_result(result_type, dh_id, result_code(&result))?;
        result
    }

    fn open_io_dev(&self, request: AudioEventType, dh_id: DhId) -> Result<()> {
        let dev = self.io_dev(dh_id)?;
        if dev.is_opened() {
            return Err(Error::StatusErr(format!("port {} already open", dh_id)));
        }
        let started = dev
            .init_engine(&self.ctx.provider)
            .and_then(|_| dev.setup())
            .and_then(|_| dev.start());
        if let Err(e) = started {
            if let Err(release) = dev.release() {
                tracing::warn!("Release port {} after failed start: {}", dh_id, release);
            }
            return Err(e);
        }
        if let Err(e) = self.notify_sink_dev(request, dh_id, Some(dev.audio_param())) {
            if let Err(stop) = dev.stop() {
                tracing::warn!("Stop port {} after failed open: {}", dh_id, stop);
            }
            if let Err(release) = dev.release() {
                tracing::warn!("Release port {} after failed open: {}", dh_id, release);
            }
            return Err(e);
        }
        tracing::info!("Port {} of {} opened", dh_id, self.dev_id);
        Ok(())
    }

    fn task_close_speaker(&self, event: &AudioEvent) -> Result<()> {
        self.close_from_event(event, AudioEventType::NotifyCloseSpeakerResult)
    }

    fn task_close_mic(&self, event: &AudioEvent) -> Result<()> {
        self.close_from_event(event, AudioEventType::NotifyCloseMicResult)
    }

    fn close_from_event(&self, event: &AudioEvent, result_type: AudioEventType) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let result = self.io_dev(dh_id).and_then(|dev| {
            if dev.is_opened() {
                if let Err(e) = self.notify_sink_dev(event.event_type, dh_id, None) {
                    tracing::warn!("Notify sink of closing {} failed: {}", dh_id, e);
                }
            }
            if self.close_port(dh_id, &dev) {
                Ok(())
            } else {
                Err(Error::Failed(format!("close port {}", dh_id)))
            }
        });
        self.notify_hdf_result(result_type, dh_id, result_code(&result))?;
        result
    }

    /// Stop and release every resource of the port. Returns false if any
    /// step failed; all steps are attempted.
    fn close_port(&self, dh_id: DhId, dev: &Arc<dyn IoDev>) -> bool {
        let mut ok = true;
        if let Err(e) = dev.stop() {
            tracing::warn!("Stop port {} failed: {}", dh_id, e);
            ok = false;
        }
        if let Err(e) = dev.release() {
            tracing::warn!("Release port {} failed: {}", dh_id, e);
            ok = false;
        }
        ok
    }

    /// The channel under an open port went away
    fn task_port_closed(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let dev = self.io_dev(dh_id)?;
        if !dev.is_opened() {
            tracing::debug!("Port {} already closed locally", dh_id);
            return Ok(());
        }
        tracing::warn!("Channel of port {} closed by {}", dh_id, self.dev_id);
        self.close_port(dh_id, &dev);
        self.notify_hdf(event.event_type, dh_id, event.content.clone())
    }

    fn task_forward_to_sink(&self, event: &AudioEvent) -> Result<()> {
        let volume: VolumeEvent = parse_payload(&event.content)?;
        self.io_dev(volume.dh_id()?)?.send_message(event)
    }

    fn task_forward_to_hdf(&self, event: &AudioEvent) -> Result<()> {
        let volume: VolumeEvent = parse_payload(&event.content)?;
        self.notify_hdf(event.event_type, volume.dh_id()?, event.content.clone())
    }

    fn task_play_status(&self, event: &AudioEvent) -> Result<()> {
        let status: PlayStatusEvent = parse_payload(&event.content)?;
        let dev = self.io_dev(status.dh_id()?)?;
        dev.send_message(event)?;
        match status.change_type {
            PlayStatus::Pause => dev.pause(),
            PlayStatus::Restart => dev.restart(),
        }
    }

    fn task_mmap_start(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        self.io_dev(payload.dh_id()?)?.mmap_start()
    }

    fn task_mmap_stop(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        self.io_dev(payload.dh_id()?)?.mmap_stop()
    }
}

impl AudioEventListener for SourceDev {
    /// Entry point for events from ports, the driver and the sink. RPC
    /// results bypass the queue; everything else becomes a task.
    fn notify_event(&self, event: AudioEvent) {
        if event.event_type.is_rpc_result() {
            if let Err(e) = self.handle_notify_rpc(&event) {
                tracing::warn!("Bad RPC result {:?}: {}", event.event_type, e);
            }
            return;
        }
        if !task_table().contains_key(&event.event_type) {
            tracing::warn!("Event {:?} from {} ignored", event.event_type, self.dev_id);
            return;
        }
        if let Err(e) = self.post(event) {
            tracing::error!("Post event for {} failed: {}", self.dev_id, e);
        }
    }
}

impl Drop for SourceDev {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get() {
            runner.shutdown();
        }
        tracing::info!("Source device {} destroyed", self.dev_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::data::AudioData;
    use crate::audio::param::{AudioParamHdf, PortOperationMode, DEFAULT_CAPTURE_ID};
    use crate::audio::shared_memory::{AshmemInfo, SharedMemory};
    use crate::codec::CodecRegistry;
    use crate::config::AppConfig;
    use crate::driver::{DAudioIoCallback, SimulatedDriver};
    use crate::source::io_dev::IoDevState;
    use crate::transport::{
        EngineEvent, EngineListener, EngineProvider, EngineRole, MemoryNetwork, MemoryProvider,
        ProviderListener, TransEngine,
    };
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct NoObserver;

    impl RegisterObserver for NoObserver {
        fn on_enable_result(&self, _: &str, _: DhId, _: i32) {}
        fn on_disable_result(&self, _: &str, _: DhId, _: i32) {}
    }

    fn source_dev(rpc_timeout_ms: u64) -> (Arc<SourceDev>, Arc<SimulatedDriver>, Arc<dyn RegisterObserver>) {
        let mut config = AppConfig::default();
        config.device.rpc_timeout_ms = rpc_timeout_ms;
        let driver = Arc::new(SimulatedDriver::new());
        let ctx = SourceContext {
            config,
            codecs: Arc::new(CodecRegistry::default()),
            provider: MemoryNetwork::new().provider("local"),
            driver: driver.clone(),
        };
        let observer: Arc<dyn RegisterObserver> = Arc::new(NoObserver);
        let dev = SourceDev::new("remote", ctx, Arc::downgrade(&observer)).unwrap();
        (dev, driver, observer)
    }

    fn result_event(event_type: AudioEventType, code: i32) -> AudioEvent {
        AudioEvent::new(event_type, format!(r#"{{"RESULT":{}}}"#, code))
    }

    #[test]
    fn test_wait_for_rpc_times_out() {
        let (dev, _driver, _observer) = source_dev(200);
        let started = Instant::now();
        let result = dev.wait_for_rpc(AudioEventType::NotifyOpenSpeakerResult);
        assert!(matches!(
            result,
            Err(Error::RpcWaitTimeout(AudioEventType::NotifyOpenSpeakerResult))
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_wait_for_rpc_success() {
        let (dev, _driver, _observer) = source_dev(2000);
        let notifier = dev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            notifier
                .handle_notify_rpc(&result_event(AudioEventType::NotifyOpenSpeakerResult, 0))
                .unwrap();
        });
        dev.wait_for_rpc(AudioEventType::NotifyOpenSpeakerResult)
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_mismatched_or_failed_rpc() {
        let (dev, _driver, _observer) = source_dev(200);
        dev.notify_event(result_event(AudioEventType::NotifyOpenMicResult, 0));
        assert!(matches!(
            dev.wait_for_rpc(AudioEventType::NotifyOpenSpeakerResult),
            Err(Error::RpcWaitTimeout(_))
        ));

        dev.notify_event(result_event(AudioEventType::NotifyOpenSpeakerResult, -40006));
        assert!(matches!(
            dev.wait_for_rpc(AudioEventType::NotifyOpenSpeakerResult),
            Err(Error::Remote(-40006))
        ));
        assert!(dev
            .handle_notify_rpc(&AudioEvent::new(AudioEventType::NotifyOpenSpeakerResult, ""))
            .is_err());
    }

    #[test]
    fn test_enable_and_disable_port() {
        let (dev, driver, _observer) = source_dev(200);
        dev.enable_daudio("1", r#"{"CODEC":["PCM"]}"#).unwrap();
        dev.enable_daudio(&crate::audio::param::DEFAULT_CAPTURE_ID.to_string(), "")
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while (dev.speaker(DhId(1)).is_none() || dev.mic(crate::audio::param::DEFAULT_CAPTURE_ID).is_none())
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(driver.is_registered("remote", DhId(1)));
        assert!(!dev.is_idle());

        dev.disable_daudio("1").unwrap();
        dev.disable_daudio(&crate::audio::param::DEFAULT_CAPTURE_ID.to_string())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !dev.is_idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(dev.is_idle());
        assert!(!driver.is_registered("remote", DhId(1)));
    }

    #[test]
    fn test_open_unknown_port_reports_failure() {
        let (dev, driver, _observer) = source_dev(200);
        dev.notify_event(AudioEvent::new(AudioEventType::OpenSpeaker, r#"{"DH_ID":"1"}"#));
        let reported = driver
            .wait_for_event(Duration::from_secs(2), |e| {
                e.event.event_type == AudioEventType::NotifyOpenSpeakerResult
            })
            .unwrap();
        let payload: ControlPayload = parse_payload(&reported.event.content).unwrap();
        assert_eq!(payload.result, Some(Error::Nullptr("speaker").code()));
    }

    /// Plays the sink device on the other end of every channel the source
    /// opens. Answers opens and closes unless `silent` is set.
    struct ScriptedSink {
        provider: Arc<MemoryProvider>,
        weak_self: Weak<ScriptedSink>,
        silent: AtomicBool,
        engines: Mutex<HashMap<DhId, Arc<dyn TransEngine>>>,
        messages: Sender<AudioEvent>,
        data: Sender<AudioData>,
    }

    impl ScriptedSink {
        fn engine(&self, dh_id: DhId) -> Option<Arc<dyn TransEngine>> {
            self.engines.lock().get(&dh_id).cloned()
        }

        fn on_message(&self, dh_id: DhId, event: AudioEvent) {
            let reply = event
                .event_type
                .result_event()
                .filter(|_| !self.silent.load(Ordering::SeqCst));
            let _ = self.messages.send(event);
            if let (Some(reply), Some(engine)) = (reply, self.engine(dh_id)) {
                let content = ControlPayload::result(dh_id, reply, DH_SUCCESS).to_json().unwrap();
                engine.send_message(&AudioEvent::new(reply, content)).unwrap();
            }
        }
    }

    impl ProviderListener for ScriptedSink {
        fn on_channel_request(&self, peer_dev_id: &str, dh_id: DhId) -> Result<()> {
            let role = match dh_id.kind() {
                DeviceKind::Speaker => EngineRole::Receiver,
                DeviceKind::Mic => EngineRole::Sender,
            };
            let engine = self.provider.create_engine(peer_dev_id, dh_id, role)?;
            engine.initialize(Arc::new(ScriptedPort {
                sink: self.weak_self.clone(),
                dh_id,
            }))?;
            self.engines.lock().insert(dh_id, engine);
            Ok(())
        }
    }

    struct ScriptedPort {
        sink: Weak<ScriptedSink>,
        dh_id: DhId,
    }

    impl EngineListener for ScriptedPort {
        fn on_engine_event(&self, _event: EngineEvent) {}

        fn on_engine_message(&self, event: AudioEvent) {
            if let Some(sink) = self.sink.upgrade() {
                sink.on_message(self.dh_id, event);
            }
        }

        fn on_engine_data(&self, data: AudioData) {
            if let Some(sink) = self.sink.upgrade() {
                let _ = sink.data.send(data);
            }
        }
    }

    struct Linked {
        dev: Arc<SourceDev>,
        driver: Arc<SimulatedDriver>,
        sink: Arc<ScriptedSink>,
        messages: Receiver<AudioEvent>,
        data: Receiver<AudioData>,
        _observer: Arc<dyn RegisterObserver>,
        _sink_listener: Arc<dyn ProviderListener>,
        _network: Arc<MemoryNetwork>,
    }

    fn linked(silent: bool, rpc_timeout_ms: u64) -> Linked {
        let network = MemoryNetwork::new();
        let (msg_tx, messages) = unbounded();
        let (data_tx, data) = unbounded();
        let sink = Arc::new_cyclic(|weak| ScriptedSink {
            provider: network.provider("remote"),
            weak_self: weak.clone(),
            silent: AtomicBool::new(silent),
            engines: Mutex::new(HashMap::new()),
            messages: msg_tx,
            data: data_tx,
        });
        let sink_listener: Arc<dyn ProviderListener> = sink.clone();
        sink.provider.set_listener(Arc::downgrade(&sink_listener));

        let mut config = AppConfig::default();
        config.device.rpc_timeout_ms = rpc_timeout_ms;
        let driver = Arc::new(SimulatedDriver::new());
        let ctx = SourceContext {
            config,
            codecs: Arc::new(CodecRegistry::default()),
            provider: network.provider("local"),
            driver: driver.clone(),
        };
        let observer: Arc<dyn RegisterObserver> = Arc::new(NoObserver);
        let dev = SourceDev::new("remote", ctx, Arc::downgrade(&observer)).unwrap();
        Linked {
            dev,
            driver,
            sink,
            messages,
            data,
            _observer: observer,
            _sink_listener: sink_listener,
            _network: network,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn next_message(rx: &Receiver<AudioEvent>, event_type: AudioEventType) -> AudioEvent {
        loop {
            let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
            if event.event_type == event_type {
                return event;
            }
        }
    }

    /// Enable the port, hand it `hdf` and create its stream. Returns the
    /// driver callback and the open result reported to the driver.
    fn open_port(
        linked: &Linked,
        dh_id: DhId,
        hdf: &AudioParamHdf,
    ) -> (Arc<dyn DAudioIoCallback>, i32) {
        linked
            .dev
            .enable_daudio(&dh_id.to_string(), r#"{"CODEC":["PCM"]}"#)
            .unwrap();
        assert!(wait_until(|| linked.driver.is_registered("remote", dh_id)));
        let port = linked.driver.port("remote", dh_id).unwrap();
        port.set_parameters(0, hdf).unwrap();
        port.create_stream(0).unwrap();

        let result_type = match dh_id.kind() {
            DeviceKind::Speaker => AudioEventType::NotifyOpenSpeakerResult,
            DeviceKind::Mic => AudioEventType::NotifyOpenMicResult,
        };
        let reported = linked
            .driver
            .wait_for_event(Duration::from_secs(5), |e| {
                e.dh_id == dh_id && e.event.event_type == result_type
            })
            .unwrap();
        let payload: ControlPayload = parse_payload(&reported.event.content).unwrap();
        (port, payload.result.unwrap())
    }

    fn mmap_hdf(frame_size: usize) -> AudioParamHdf {
        AudioParamHdf {
            frame_size,
            period: 5,
            render_flags: PortOperationMode::Mmap,
            capturer_flags: PortOperationMode::Mmap,
            ..Default::default()
        }
    }

    /// A file-backed region of `slices` periods plus a second view of it
    fn region(slice: usize, slices: usize) -> (AshmemInfo, SharedMemory) {
        let file = tempfile::tempfile().unwrap();
        file.set_len((slice * slices) as u64).unwrap();
        let view = SharedMemory::map_file(&file, slice * slices).unwrap();
        let info = AshmemInfo {
            file,
            len: slice * slices,
            length_per_trans: slice,
        };
        (info, view)
    }

    #[test]
    fn test_open_times_out_when_sink_is_silent() {
        let linked = linked(true, 200);
        let (_port, code) = open_port(&linked, DhId(1), &AudioParamHdf::default());
        assert_eq!(
            code,
            Error::RpcWaitTimeout(AudioEventType::NotifyOpenSpeakerResult).code()
        );
        next_message(&linked.messages, AudioEventType::OpenSpeaker);

        let speaker = linked.dev.speaker(DhId(1)).unwrap();
        assert!(!speaker.is_opened());
        assert_eq!(speaker.state(), IoDevState::Idle);

        // a later open with an answering sink succeeds
        linked.sink.silent.store(false, Ordering::SeqCst);
        linked
            .dev
            .notify_event(AudioEvent::new(AudioEventType::OpenSpeaker, r#"{"DH_ID":"1"}"#));
        assert!(wait_until(|| speaker.is_opened()));
    }

    #[test]
    fn test_play_status_pauses_and_restarts_speaker() {
        let linked = linked(false, 2000);
        let (port, code) = open_port(&linked, DhId(1), &AudioParamHdf::default());
        assert_eq!(code, DH_SUCCESS);
        let speaker = linked.dev.speaker(DhId(1)).unwrap();
        assert_eq!(speaker.state(), IoDevState::Started);

        port.notify_event(
            0,
            &AudioEvent::new(AudioEventType::ChangePlayStatus, r#"{"CHANGE_TYPE":"pause"}"#),
        )
        .unwrap();
        let forwarded = next_message(&linked.messages, AudioEventType::ChangePlayStatus);
        let status: PlayStatusEvent = parse_payload(&forwarded.content).unwrap();
        assert_eq!(status.dh_id().unwrap(), DhId(1));
        assert_eq!(status.change_type, PlayStatus::Pause);
        assert!(wait_until(|| speaker.state() == IoDevState::Paused));
        assert!(matches!(
            port.write_stream_data(0, AudioData::new(64)),
            Err(Error::StatusErr(_))
        ));

        port.notify_event(
            0,
            &AudioEvent::new(AudioEventType::ChangePlayStatus, r#"{"CHANGE_TYPE":"restart"}"#),
        )
        .unwrap();
        next_message(&linked.messages, AudioEventType::ChangePlayStatus);
        assert!(wait_until(|| speaker.state() == IoDevState::Started));
        port.write_stream_data(0, AudioData::new(64)).unwrap();
        assert_eq!(linked.data.recv_timeout(Duration::from_secs(3)).unwrap().size(), 64);
    }

    #[test]
    fn test_speaker_mmap_start_and_stop() {
        const SLICE: usize = 960;
        let linked = linked(false, 2000);
        let (port, code) = open_port(&linked, DhId(1), &mmap_hdf(SLICE));
        assert_eq!(code, DH_SUCCESS);

        let (info, view) = region(SLICE, 4);
        view.write_at(&[5u8; SLICE * 4], 0).unwrap();
        port.refresh_ashmem_info(0, info).unwrap();

        port.notify_event(0, &AudioEvent::new(AudioEventType::MmapSpkStart, ""))
            .unwrap();
        let frame = linked.data.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(frame.size(), SLICE);
        assert!(frame.data().iter().all(|&b| b == 5));
        assert!(wait_until(|| port.read_mmap_position(0).unwrap().frames > 0));

        port.notify_event(0, &AudioEvent::new(AudioEventType::MmapSpkStop, ""))
            .unwrap();
        assert!(wait_until(|| {
            let before = port.read_mmap_position(0).unwrap().frames;
            thread::sleep(Duration::from_millis(30));
            port.read_mmap_position(0).unwrap().frames == before
        }));
    }

    #[test]
    fn test_mic_mmap_start_and_stop() {
        const SLICE: usize = 960;
        let linked = linked(false, 2000);
        let (port, code) = open_port(&linked, DEFAULT_CAPTURE_ID, &mmap_hdf(SLICE));
        assert_eq!(code, DH_SUCCESS);

        let (info, view) = region(SLICE, 4);
        port.refresh_ashmem_info(0, info).unwrap();
        let engine = linked.sink.engine(DEFAULT_CAPTURE_ID).unwrap();
        for _ in 0..24 {
            engine
                .push_audio_data(&AudioData::from_vec(vec![9; SLICE]))
                .unwrap();
        }

        port.notify_event(0, &AudioEvent::new(AudioEventType::MmapMicStart, ""))
            .unwrap();
        assert!(wait_until(|| {
            let mut slice = vec![0u8; SLICE];
            view.read_at(&mut slice, 0).unwrap();
            slice.iter().all(|&b| b == 9)
        }));
        assert!(port.read_mmap_position(0).unwrap().frames > 0);

        port.notify_event(0, &AudioEvent::new(AudioEventType::MmapMicStop, ""))
            .unwrap();
        assert!(wait_until(|| {
            let before = port.read_mmap_position(0).unwrap().frames;
            thread::sleep(Duration::from_millis(30));
            port.read_mmap_position(0).unwrap().frames == before
        }));
    }
}
