//! Plays a source's speaker stream on local hardware
//!
//! Decoded frames go into a drop-oldest jitter queue. Once the queue holds
//! the pre-roll, a paced thread hands one frame per period to the renderer,
//! substituting silence on underrun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio::buffer::{JitterQueue, JitterQueueStats};
use crate::audio::data::AudioData;
use crate::audio::device::{LocalAudioBackend, LocalRenderer};
use crate::audio::pacer::{period_ms_to_ns, TimestampPacer};
use crate::audio::param::{AudioParam, DhId};
use crate::config::DeviceConfig;
use crate::constants::DEFAULT_FRAME_PERIOD_MS;
use crate::error::{Error, Result};
use crate::protocol::{AudioEvent, AudioEventListener, AudioEventType, ControlPayload};
use crate::sink::SinkContext;
use crate::transport::{
    AudioTransport, AudioTransportCallback, AvTransport, EngineEvent, EngineProvider,
};

/// Highest `VOLUME_LEVEL` a source sends
pub const MAX_VOLUME_LEVEL: i32 = 15;

type SharedRenderer = Arc<Mutex<Option<Box<dyn LocalRenderer>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Ready,
    Started,
    Paused,
}

pub struct SpeakerClient {
    /// Source device this stream comes from
    peer_dev_id: String,

    dh_id: DhId,

    config: DeviceConfig,

    backend: Arc<dyn LocalAudioBackend>,

    transport: Arc<dyn AudioTransport>,

    /// Kept alive here; the transport only holds a weak reference
    _trans_handler: Arc<dyn AudioTransportCallback>,

    listener: Weak<dyn AudioEventListener>,

    queue: Arc<JitterQueue>,

    renderer: SharedRenderer,

    param: Mutex<AudioParam>,

    state: Mutex<ClientState>,

    /// Whether the render thread runs
    running: Arc<AtomicBool>,

    render_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerClient {
    pub fn new(
        peer_dev_id: &str,
        dh_id: DhId,
        ctx: &SinkContext,
        listener: Weak<dyn AudioEventListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SpeakerClient>| {
            let handler: Arc<dyn AudioTransportCallback> =
                Arc::new(SpeakerClientHandler { client: weak.clone() });
            let transport = Arc::new(AvTransport::receiver(
                peer_dev_id,
                dh_id,
                ctx.codecs.clone(),
                Arc::downgrade(&handler),
            ));
            Self {
                peer_dev_id: peer_dev_id.to_string(),
                dh_id,
                config: ctx.config.device.clone(),
                backend: ctx.backend.clone(),
                transport,
                _trans_handler: handler,
                listener,
                queue: Arc::new(JitterQueue::new(ctx.config.device.speaker_queue_size)),
                renderer: Arc::new(Mutex::new(None)),
                param: Mutex::new(AudioParam::default()),
                state: Mutex::new(ClientState::Idle),
                running: Arc::new(AtomicBool::new(false)),
                render_thread: Mutex::new(None),
            }
        })
    }

    pub fn dh_id(&self) -> DhId {
        self.dh_id
    }

    /// Create the local end of the channel the source is opening
    pub fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()> {
        self.transport.init_engine(provider)
    }

    pub fn setup(&self, param: &AudioParam) -> Result<()> {
        let state = *self.state.lock();
        if matches!(state, ClientState::Started | ClientState::Paused) {
            return Err(Error::StatusErr(format!("setup speaker client while {:?}", state)));
        }
        self.transport.setup(param, param)?;
        let renderer = self.backend.create_renderer(param)?;
        *self.renderer.lock() = Some(renderer);
        *self.param.lock() = param.clone();
        *self.state.lock() = ClientState::Ready;
        tracing::info!(
            "Speaker client {} set up: {} Hz, {:?}",
            self.dh_id,
            param.com_param.sample_rate,
            param.com_param.codec_type
        );
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let state = *self.state.lock();
        if state != ClientState::Ready {
            return Err(Error::StatusErr(format!("start speaker client while {:?}", state)));
        }
        self.renderer
            .lock()
            .as_mut()
            .ok_or(Error::NotInit("renderer"))?
            .start()?;
        self.transport.start()?;
        self.queue.clear();
        self.start_render_thread()?;
        *self.state.lock() = ClientState::Started;
        tracing::info!("Speaker client {} started", self.dh_id);
        Ok(())
    }

    fn start_render_thread(&self) -> Result<()> {
        let param = self.param.lock().clone();
        let mut period_ns = param.com_param.frame_period_ns();
        if period_ns <= 0 {
            period_ns = period_ms_to_ns(DEFAULT_FRAME_PERIOD_MS);
        }
        let frame_size = param.com_param.frame_size;
        let pre_roll = self.config.speaker_pre_roll;
        let poll = self.config.poll_interval();
        let fill_timeout = self.config.channel_timeout();
        let queue = self.queue.clone();
        let renderer = self.renderer.clone();
        let running = self.running.clone();
        let dh_id = self.dh_id;

        running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("daudio-render-{}", dh_id))
            .spawn(move || {
                if !queue.wait_fill(pre_roll, &running, poll, fill_timeout) {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::warn!("Speaker client {} pre-roll incomplete", dh_id);
                }
                let mut pacer = TimestampPacer::new(period_ns);
                while running.load(Ordering::SeqCst) {
                    let offset = pacer.begin_frame();
                    let frame = queue.pop_or_silence(frame_size);
                    if let Some(renderer) = renderer.lock().as_mut() {
                        if let Err(e) = renderer.write(&frame) {
                            tracing::warn!("Render on {} failed: {}", dh_id, e);
                        }
                    }
                    if let Err(e) = pacer.end_frame(offset) {
                        tracing::error!("Render pacing on {} failed: {}", dh_id, e);
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *self.render_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Let the render thread drain what is queued, then stop it
    pub fn stop(&self) -> Result<()> {
        let state = *self.state.lock();
        if !matches!(state, ClientState::Started | ClientState::Paused) {
            return Err(Error::StatusErr(format!("stop speaker client while {:?}", state)));
        }
        if state == ClientState::Started
            && !self
                .queue
                .wait_flush(&self.running, self.config.poll_interval(), self.config.flush_timeout())
        {
            tracing::debug!("Speaker client {} stopped with {} frames queued", self.dh_id, self.queue.len());
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.render_thread.lock().take() {
            let _ = handle.join();
        }

        let mut ok = true;
        if let Some(renderer) = self.renderer.lock().as_mut() {
            if let Err(e) = renderer.stop() {
                tracing::warn!("Stop renderer {} failed: {}", self.dh_id, e);
                ok = false;
            }
        }
        if let Err(e) = self.transport.stop() {
            tracing::warn!("Stop speaker client {} transport failed: {}", self.dh_id, e);
            ok = false;
        }
        *self.state.lock() = ClientState::Ready;
        tracing::info!("Speaker client {} stopped", self.dh_id);
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("stop speaker client {}", self.dh_id)))
        }
    }

    pub fn release(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.render_thread.lock().take() {
            let _ = handle.join();
        }
        self.renderer.lock().take();
        self.queue.clear();
        *self.state.lock() = ClientState::Idle;
        self.transport.release()
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ClientState::Started {
            return Err(Error::StatusErr(format!("pause speaker client while {:?}", *state)));
        }
        self.transport.pause()?;
        self.queue.clear();
        *state = ClientState::Paused;
        tracing::info!("Speaker client {} paused", self.dh_id);
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ClientState::Paused {
            return Err(Error::StatusErr(format!("restart speaker client while {:?}", *state)));
        }
        let param = self.param.lock().clone();
        self.transport.restart(&param, &param)?;
        *state = ClientState::Started;
        tracing::info!("Speaker client {} restarted", self.dh_id);
        Ok(())
    }

    /// Apply a `VOLUME_LEVEL` in `0..=MAX_VOLUME_LEVEL`
    pub fn set_volume(&self, level: i32) -> Result<()> {
        if !(0..=MAX_VOLUME_LEVEL).contains(&level) {
            return Err(Error::ParamInvalid(format!("volume level {}", level)));
        }
        let mut renderer = self.renderer.lock();
        let renderer = renderer.as_mut().ok_or(Error::NotInit("renderer"))?;
        renderer.set_volume(level as f32 / MAX_VOLUME_LEVEL as f32);
        Ok(())
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        let mut renderer = self.renderer.lock();
        renderer
            .as_mut()
            .ok_or(Error::NotInit("renderer"))?
            .set_mute(mute);
        Ok(())
    }

    pub fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.transport.send_message(event)
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.state.lock(), ClientState::Started | ClientState::Paused)
    }

    pub fn is_paused(&self) -> bool {
        *self.state.lock() == ClientState::Paused
    }

    pub fn queue_stats(&self) -> JitterQueueStats {
        self.queue.stats()
    }

    fn on_data(&self, data: AudioData) {
        if *self.state.lock() != ClientState::Started {
            return;
        }
        let dropped = self.queue.push(data);
        if dropped > 0 {
            tracing::debug!("Speaker client {} queue full, dropped {}", self.dh_id, dropped);
        }
    }

    fn on_channel_closed(&self) {
        tracing::warn!("Channel of speaker client {} from {} closed", self.dh_id, self.peer_dev_id);
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        match ControlPayload::new(self.dh_id).to_json() {
            Ok(content) => listener.notify_event(AudioEvent::new(AudioEventType::SpeakerClosed, content)),
            Err(e) => tracing::error!("Encode speaker close payload failed: {}", e),
        }
    }
}

/// Routes transport output for one speaker client
struct SpeakerClientHandler {
    client: Weak<SpeakerClient>,
}

impl AudioTransportCallback for SpeakerClientHandler {
    fn on_engine_trans_event(&self, event: EngineEvent) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        match event {
            EngineEvent::ChannelClosed => client.on_channel_closed(),
            EngineEvent::TransError(reason) => {
                tracing::error!("Speaker client {} transport error: {}", client.dh_id, reason);
                client.on_channel_closed();
            }
            other => tracing::debug!("Speaker client {} engine {:?}", client.dh_id, other),
        }
    }

    fn on_engine_trans_message(&self, event: AudioEvent) {
        if let Some(listener) = self.client.upgrade().and_then(|c| c.listener.upgrade()) {
            listener.notify_event(event);
        }
    }

    fn on_engine_trans_data_available(&self, data: AudioData) {
        if let Some(client) = self.client.upgrade() {
            client.on_data(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::NullBackend;
    use crate::codec::CodecRegistry;
    use crate::config::AppConfig;
    use crate::transport::MemoryNetwork;
    use std::time::{Duration, Instant};

    struct Quiet;

    impl AudioEventListener for Quiet {
        fn notify_event(&self, _event: AudioEvent) {}
    }

    fn client(backend: &NullBackend) -> (Arc<SpeakerClient>, Arc<dyn AudioEventListener>) {
        let ctx = SinkContext {
            config: AppConfig::default(),
            codecs: Arc::new(CodecRegistry::default()),
            provider: MemoryNetwork::new().provider("sink"),
            backend: Arc::new(backend.clone()),
        };
        let listener: Arc<dyn AudioEventListener> = Arc::new(Quiet);
        (SpeakerClient::new("source", DhId(1), &ctx, Arc::downgrade(&listener)), listener)
    }

    fn small_param() -> AudioParam {
        let mut param = AudioParam::default();
        // 5 ms of 48 kHz stereo s16
        param.com_param.frame_size = 960;
        param
    }

    #[test]
    fn test_render_thread_plays_queued_and_silence() {
        let backend = NullBackend::new();
        let (client, _listener) = client(&backend);
        assert!(matches!(client.start(), Err(Error::StatusErr(_))));

        client.setup(&small_param()).unwrap();
        // no engine: transport start fails before the thread spawns
        assert!(client.start().is_err());

        *client.state.lock() = ClientState::Started;
        for _ in 0..4 {
            client.on_data(AudioData::new(960));
        }
        client.start_render_thread().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.rendered_bytes() < 6 * 960 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(backend.rendered_bytes() >= 6 * 960);
        assert!(client.queue_stats().underruns > 0);
        client.release().ok();
    }

    #[test]
    fn test_pause_drops_audio_until_restart() {
        let backend = NullBackend::new();
        let (client, _listener) = client(&backend);
        assert!(matches!(client.pause(), Err(Error::StatusErr(_))));
        client.setup(&small_param()).unwrap();

        *client.state.lock() = ClientState::Started;
        client.on_data(AudioData::new(960));
        assert_eq!(client.queue.len(), 1);

        client.pause().unwrap();
        assert!(client.is_paused());
        assert!(client.is_started());
        assert_eq!(client.queue.len(), 0);
        client.on_data(AudioData::new(960));
        assert_eq!(client.queue.len(), 0);
        assert!(matches!(client.pause(), Err(Error::StatusErr(_))));

        client.restart().unwrap();
        assert!(!client.is_paused());
        client.on_data(AudioData::new(960));
        assert_eq!(client.queue.len(), 1);
        assert!(matches!(client.restart(), Err(Error::StatusErr(_))));
        client.release().ok();
    }

    #[test]
    fn test_volume_bounds() {
        let backend = NullBackend::new();
        let (client, _listener) = client(&backend);
        assert!(matches!(client.set_volume(5), Err(Error::NotInit(_))));
        client.setup(&small_param()).unwrap();
        client.set_volume(MAX_VOLUME_LEVEL).unwrap();
        client.set_mute(true).unwrap();
        assert!(matches!(client.set_volume(16), Err(Error::ParamInvalid(_))));
    }
}
