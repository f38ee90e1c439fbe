//! Engine-backed transport adapters
//!
//! A sender encodes fed frames and pushes them into the engine. A receiver
//! decodes frames arriving from the engine and hands them to its callback.
//! Both directions carry control messages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::engine::{EngineEvent, EngineListener, EngineProvider, EngineRole, TransEngine};
use super::{AudioTransport, AudioTransportCallback};
use crate::audio::data::AudioData;
use crate::audio::param::{AudioParam, DhId};
use crate::codec::{AudioProcessor, CodecRegistry, ProcessorDirection};
use crate::error::{Error, Result};
use crate::protocol::AudioEvent;

type SharedProcessor = Arc<Mutex<Option<Box<dyn AudioProcessor>>>>;

/// Transport statistics
#[derive(Debug, Default)]
pub struct TransportStats {
    pub frames_sent: AtomicUsize,
    pub frames_received: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub codec_errors: AtomicUsize,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub frames_sent: usize,
    pub frames_received: usize,
    pub frames_dropped: usize,
    pub codec_errors: usize,
}

pub struct AvTransport {
    peer_dev_id: String,
    dh_id: DhId,
    role: EngineRole,
    codecs: Arc<CodecRegistry>,
    callback: Weak<dyn AudioTransportCallback>,
    engine: Mutex<Option<Arc<dyn TransEngine>>>,
    processor: SharedProcessor,
    paused: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl AvTransport {
    /// Transport that sends audio to the peer port
    pub fn sender(
        peer_dev_id: &str,
        dh_id: DhId,
        codecs: Arc<CodecRegistry>,
        callback: Weak<dyn AudioTransportCallback>,
    ) -> Self {
        Self::new(peer_dev_id, dh_id, EngineRole::Sender, codecs, callback)
    }

    /// Transport that receives audio from the peer port
    pub fn receiver(
        peer_dev_id: &str,
        dh_id: DhId,
        codecs: Arc<CodecRegistry>,
        callback: Weak<dyn AudioTransportCallback>,
    ) -> Self {
        Self::new(peer_dev_id, dh_id, EngineRole::Receiver, codecs, callback)
    }

    fn new(
        peer_dev_id: &str,
        dh_id: DhId,
        role: EngineRole,
        codecs: Arc<CodecRegistry>,
        callback: Weak<dyn AudioTransportCallback>,
    ) -> Self {
        Self {
            peer_dev_id: peer_dev_id.to_string(),
            dh_id,
            role,
            codecs,
            callback,
            engine: Mutex::new(None),
            processor: Arc::new(Mutex::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn engine(&self) -> Result<Arc<dyn TransEngine>> {
        self.engine
            .lock()
            .clone()
            .ok_or(Error::NotInit("transport engine"))
    }

    fn direction(&self) -> ProcessorDirection {
        match self.role {
            EngineRole::Sender => ProcessorDirection::Encode,
            EngineRole::Receiver => ProcessorDirection::Decode,
        }
    }
}

impl AudioTransport for AvTransport {
    fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()> {
        let engine = provider.create_engine(&self.peer_dev_id, self.dh_id, self.role)?;
        engine.initialize(Arc::new(EngineBridge {
            role: self.role,
            callback: self.callback.clone(),
            processor: self.processor.clone(),
            paused: self.paused.clone(),
            stats: self.stats.clone(),
        }))?;
        *self.engine.lock() = Some(engine);
        Ok(())
    }

    fn create_ctrl(&self) -> Result<()> {
        self.engine()?.create_control_channel()
    }

    fn setup(&self, local: &AudioParam, remote: &AudioParam) -> Result<()> {
        let mut processor = self
            .codecs
            .create(local.com_param.codec_type, self.direction())?;
        processor.configure(local, remote)?;
        tracing::info!(
            "Transport for port {} set up: {:?} {:?}",
            self.dh_id,
            self.role,
            local.com_param.codec_type
        );
        if let Some(mut old) = self.processor.lock().replace(processor) {
            let _ = old.release();
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.paused.store(false, Ordering::Release);
        self.engine()?.start()
    }

    fn stop(&self) -> Result<()> {
        self.engine()?.stop()
    }

    fn release(&self) -> Result<()> {
        let mut ok = true;
        if let Some(mut processor) = self.processor.lock().take() {
            if let Err(e) = processor.release() {
                tracing::warn!("Release processor for port {} failed: {}", self.dh_id, e);
                ok = false;
            }
        }
        if let Some(engine) = self.engine.lock().take() {
            if let Err(e) = engine.release() {
                tracing::warn!("Release engine for port {} failed: {}", self.dh_id, e);
                ok = false;
            }
        }
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("release transport for port {}", self.dh_id)))
        }
    }

    fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::Release);
        tracing::info!("Transport for port {} paused", self.dh_id);
        Ok(())
    }

    fn restart(&self, local: &AudioParam, remote: &AudioParam) -> Result<()> {
        if self.processor.lock().is_none() {
            self.setup(local, remote)?;
        }
        self.paused.store(false, Ordering::Release);
        tracing::info!("Transport for port {} restarted", self.dh_id);
        Ok(())
    }

    fn feed_audio_data(&self, data: AudioData) -> Result<()> {
        if self.role != EngineRole::Sender {
            return Err(Error::NotSupported("feeding a receiving transport".into()));
        }
        if self.paused.load(Ordering::Acquire) {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let engine = self.engine()?;
        let encoded = {
            let mut processor = self.processor.lock();
            let processor = processor
                .as_mut()
                .ok_or(Error::NotInit("transport encoder"))?;
            processor.process(data).inspect_err(|_| {
                self.stats.codec_errors.fetch_add(1, Ordering::Relaxed);
            })?
        };
        engine.push_audio_data(&encoded)?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.engine()?.send_message(event)
    }
}

/// Engine listener owned by the engine; routes into the transport's callback
struct EngineBridge {
    role: EngineRole,
    callback: Weak<dyn AudioTransportCallback>,
    processor: SharedProcessor,
    paused: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl EngineListener for EngineBridge {
    fn on_engine_event(&self, event: EngineEvent) {
        if let Some(callback) = self.callback.upgrade() {
            callback.on_engine_trans_event(event);
        }
    }

    fn on_engine_message(&self, event: AudioEvent) {
        if let Some(callback) = self.callback.upgrade() {
            callback.on_engine_trans_message(event);
        }
    }

    fn on_engine_data(&self, data: AudioData) {
        if self.role != EngineRole::Receiver || self.paused.load(Ordering::Acquire) {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let decoded = {
            let mut processor = self.processor.lock();
            let Some(processor) = processor.as_mut() else {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Frame arrived before decoder setup");
                return;
            };
            match processor.process(data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.stats.codec_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Decode failed: {}", e);
                    return;
                }
            }
        };
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = self.callback.upgrade() {
            callback.on_engine_trans_data_available(decoded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::engine::ProviderListener;
    use crate::transport::memory::{MemoryNetwork, MemoryProvider};
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::time::Duration;

    struct Owner {
        events: Sender<EngineEvent>,
        data: Sender<AudioData>,
    }

    impl AudioTransportCallback for Owner {
        fn on_engine_trans_event(&self, event: EngineEvent) {
            let _ = self.events.send(event);
        }
        fn on_engine_trans_message(&self, _event: AudioEvent) {}
        fn on_engine_trans_data_available(&self, data: AudioData) {
            let _ = self.data.send(data);
        }
    }

    struct SinkSide {
        provider: Arc<dyn EngineProvider>,
        owner: Arc<dyn AudioTransportCallback>,
        transport: Mutex<Option<Arc<AvTransport>>>,
    }

    impl ProviderListener for SinkSide {
        fn on_channel_request(&self, peer_dev_id: &str, dh_id: DhId) -> Result<()> {
            let transport = Arc::new(AvTransport::receiver(
                peer_dev_id,
                dh_id,
                Arc::new(CodecRegistry::default()),
                Arc::downgrade(&self.owner),
            ));
            transport.init_engine(&self.provider)?;
            let param = AudioParam::default();
            transport.setup(&param, &param)?;
            *self.transport.lock() = Some(transport);
            Ok(())
        }
    }

    fn owner() -> (Arc<dyn AudioTransportCallback>, Receiver<EngineEvent>, Receiver<AudioData>) {
        let (events, events_rx) = unbounded();
        let (data, data_rx) = unbounded();
        (Arc::new(Owner { events, data }), events_rx, data_rx)
    }

    #[test]
    fn test_sender_to_receiver() {
        let network = MemoryNetwork::new();
        let source: Arc<MemoryProvider> = network.provider("source");
        let sink: Arc<MemoryProvider> = network.provider("sink");

        let (sink_owner, _sink_events, sink_data) = owner();
        let sink_side: Arc<dyn ProviderListener> = Arc::new(SinkSide {
            provider: sink.clone(),
            owner: sink_owner,
            transport: Mutex::new(None),
        });
        sink.set_listener(Arc::downgrade(&sink_side));

        let (src_owner, src_events, _src_data) = owner();
        let provider: Arc<dyn EngineProvider> = source;
        let sender = AvTransport::sender("sink", DhId(1), Arc::new(CodecRegistry::default()), Arc::downgrade(&src_owner));
        let param = AudioParam::default();

        assert!(matches!(sender.create_ctrl(), Err(Error::NotInit(_))));
        sender.init_engine(&provider).unwrap();
        sender.setup(&param, &param).unwrap();
        sender.create_ctrl().unwrap();
        sender.start().unwrap();
        assert_eq!(
            src_events.recv_timeout(Duration::from_secs(2)).unwrap(),
            EngineEvent::ChannelOpened
        );

        sender.feed_audio_data(AudioData::from_slice(&[5; 16])).unwrap();
        let got = sink_data.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.data(), &[5; 16]);

        sender.pause().unwrap();
        sender.feed_audio_data(AudioData::new(16)).unwrap();
        assert!(sink_data.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(sender.stats().frames_dropped, 1);

        sender.restart(&param, &param).unwrap();
        sender.feed_audio_data(AudioData::new(16)).unwrap();
        assert!(sink_data.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(sender.stats().frames_sent, 2);

        sender.release().unwrap();
    }
}
