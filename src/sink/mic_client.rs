//! Captures from local hardware and streams to the source's virtual mic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio::data::AudioData;
use crate::audio::device::{LocalAudioBackend, LocalCapturer};
use crate::audio::pacer::{now_ns, period_ms_to_ns, TimestampPacer};
use crate::audio::param::{AudioParam, DhId};
use crate::constants::DEFAULT_FRAME_PERIOD_MS;
use crate::error::{Error, Result};
use crate::protocol::{AudioEvent, AudioEventListener, AudioEventType, ControlPayload};
use crate::sink::SinkContext;
use crate::transport::{
    AudioTransport, AudioTransportCallback, AvTransport, EngineEvent, EngineProvider,
};

type SharedCapturer = Arc<Mutex<Option<Box<dyn LocalCapturer>>>>;

pub struct MicClient {
    peer_dev_id: String,
    dh_id: DhId,
    backend: Arc<dyn LocalAudioBackend>,
    transport: Arc<dyn AudioTransport>,
    _trans_handler: Arc<dyn AudioTransportCallback>,
    listener: Weak<dyn AudioEventListener>,
    capturer: SharedCapturer,
    param: Mutex<AudioParam>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MicClient {
    pub fn new(
        peer_dev_id: &str,
        dh_id: DhId,
        ctx: &SinkContext,
        listener: Weak<dyn AudioEventListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MicClient>| {
            let handler: Arc<dyn AudioTransportCallback> =
                Arc::new(MicClientHandler { client: weak.clone() });
            let transport = Arc::new(AvTransport::sender(
                peer_dev_id,
                dh_id,
                ctx.codecs.clone(),
                Arc::downgrade(&handler),
            ));
            Self {
                peer_dev_id: peer_dev_id.to_string(),
                dh_id,
                backend: ctx.backend.clone(),
                transport,
                _trans_handler: handler,
                listener,
                capturer: Arc::new(Mutex::new(None)),
                param: Mutex::new(AudioParam::default()),
                started: AtomicBool::new(false),
                running: Arc::new(AtomicBool::new(false)),
                capture_thread: Mutex::new(None),
            }
        })
    }

    pub fn dh_id(&self) -> DhId {
        self.dh_id
    }

    pub fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()> {
        self.transport.init_engine(provider)
    }

    pub fn setup(&self, param: &AudioParam) -> Result<()> {
        if self.is_started() {
            return Err(Error::StatusErr("setup mic client while started".into()));
        }
        self.transport.setup(param, param)?;
        *self.capturer.lock() = Some(self.backend.create_capturer(param)?);
        *self.param.lock() = param.clone();
        tracing::info!(
            "Mic client {} set up: {} Hz, frame {} bytes",
            self.dh_id,
            param.com_param.sample_rate,
            param.com_param.frame_size
        );
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::StatusErr("mic client already started".into()));
        }
        self.capturer
            .lock()
            .as_mut()
            .ok_or(Error::NotInit("capturer"))?
            .start()?;
        self.transport.start()?;
        self.start_capture_thread()?;
        self.started.store(true, Ordering::SeqCst);
        tracing::info!("Mic client {} started", self.dh_id);
        Ok(())
    }

    /// One frame per period: read it, stamp it, hand it to the transport
    fn start_capture_thread(&self) -> Result<()> {
        let param = self.param.lock().clone();
        let mut period_ns = param.com_param.frame_period_ns();
        if period_ns <= 0 {
            period_ns = period_ms_to_ns(DEFAULT_FRAME_PERIOD_MS);
        }
        let frame_size = param.com_param.frame_size;
        let capturer = self.capturer.clone();
        let transport = self.transport.clone();
        let running = self.running.clone();
        let dh_id = self.dh_id;

        running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("daudio-capture-{}", dh_id))
            .spawn(move || {
                let mut pacer = TimestampPacer::new(period_ns);
                while running.load(Ordering::SeqCst) {
                    let offset = pacer.begin_frame();
                    let mut frame = AudioData::new(frame_size);
                    let read = match capturer.lock().as_mut() {
                        Some(capturer) => capturer.read(frame.data_mut()),
                        None => Err(Error::NotInit("capturer")),
                    };
                    match read {
                        Ok(n) if n > 0 => {
                            if n < frame_size {
                                frame.data_mut()[n..].fill(0);
                            }
                            frame.set_pts(now_ns());
                            if let Err(e) = transport.feed_audio_data(frame) {
                                tracing::debug!("Mic client {} feed failed: {}", dh_id, e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Capture on {} failed: {}", dh_id, e);
                        }
                    }
                    if let Err(e) = pacer.end_frame(offset) {
                        tracing::error!("Capture pacing on {} failed: {}", dh_id, e);
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *self.capture_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn join_capture_thread(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(Error::StatusErr("mic client not started".into()));
        }
        self.join_capture_thread();

        let mut ok = true;
        if let Some(capturer) = self.capturer.lock().as_mut() {
            if let Err(e) = capturer.stop() {
                tracing::warn!("Stop capturer {} failed: {}", self.dh_id, e);
                ok = false;
            }
        }
        if let Err(e) = self.transport.stop() {
            tracing::warn!("Stop mic client {} transport failed: {}", self.dh_id, e);
            ok = false;
        }
        tracing::info!("Mic client {} stopped", self.dh_id);
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("stop mic client {}", self.dh_id)))
        }
    }

    pub fn release(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.join_capture_thread();
        self.capturer.lock().take();
        self.transport.release()
    }

    pub fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.transport.send_message(event)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn on_channel_closed(&self) {
        tracing::warn!("Channel of mic client {} to {} closed", self.dh_id, self.peer_dev_id);
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        match ControlPayload::new(self.dh_id).to_json() {
            Ok(content) => listener.notify_event(AudioEvent::new(AudioEventType::MicClosed, content)),
            Err(e) => tracing::error!("Encode mic close payload failed: {}", e),
        }
    }
}

struct MicClientHandler {
    client: Weak<MicClient>,
}

impl AudioTransportCallback for MicClientHandler {
    fn on_engine_trans_event(&self, event: EngineEvent) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        match event {
            EngineEvent::ChannelClosed => client.on_channel_closed(),
            EngineEvent::TransError(reason) => {
                tracing::error!("Mic client {} transport error: {}", client.dh_id, reason);
                client.on_channel_closed();
            }
            other => tracing::debug!("Mic client {} engine {:?}", client.dh_id, other),
        }
    }

    fn on_engine_trans_message(&self, event: AudioEvent) {
        if let Some(listener) = self.client.upgrade().and_then(|c| c.listener.upgrade()) {
            listener.notify_event(event);
        }
    }

    fn on_engine_trans_data_available(&self, _data: AudioData) {
        tracing::debug!("Mic client received audio on its sending side, ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::NullBackend;
    use crate::audio::param::DEFAULT_CAPTURE_ID;
    use crate::codec::CodecRegistry;
    use crate::config::AppConfig;
    use crate::protocol::parse_payload;
    use crate::transport::MemoryNetwork;
    use crossbeam_channel::{unbounded, Sender};
    use std::time::Duration;

    struct Forward(Sender<AudioEvent>);

    impl AudioEventListener for Forward {
        fn notify_event(&self, event: AudioEvent) {
            let _ = self.0.send(event);
        }
    }

    #[test]
    fn test_lifecycle_guards() {
        let (tx, _rx) = unbounded();
        let listener: Arc<dyn AudioEventListener> = Arc::new(Forward(tx));
        let ctx = SinkContext {
            config: AppConfig::default(),
            codecs: Arc::new(CodecRegistry::default()),
            provider: MemoryNetwork::new().provider("sink"),
            backend: Arc::new(NullBackend::new()),
        };
        let client = MicClient::new("source", DEFAULT_CAPTURE_ID, &ctx, Arc::downgrade(&listener));

        assert!(matches!(client.start(), Err(Error::NotInit(_))));
        assert!(matches!(client.stop(), Err(Error::StatusErr(_))));
        client.setup(&AudioParam::default()).unwrap();
        // transport has no engine yet
        assert!(client.start().is_err());
        assert!(!client.is_started());
        client.release().ok();
    }

    #[test]
    fn test_channel_close_notifies_listener() {
        let (tx, rx) = unbounded();
        let listener: Arc<dyn AudioEventListener> = Arc::new(Forward(tx));
        let ctx = SinkContext {
            config: AppConfig::default(),
            codecs: Arc::new(CodecRegistry::default()),
            provider: MemoryNetwork::new().provider("sink"),
            backend: Arc::new(NullBackend::new()),
        };
        let client = MicClient::new("source", DEFAULT_CAPTURE_ID, &ctx, Arc::downgrade(&listener));

        client._trans_handler.on_engine_trans_event(EngineEvent::ChannelClosed);
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.event_type, AudioEventType::MicClosed);
        let payload: ControlPayload = parse_payload(&event.content).unwrap();
        assert_eq!(payload.dh_id().unwrap(), DEFAULT_CAPTURE_ID);
    }
}
