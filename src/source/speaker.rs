//! Remote speaker port on the source device
//!
//! Audio written by the local framework is encoded and sent to the sink. In
//! mmap mode a paced thread pulls one slice per period from the shared
//! region instead.

use std::sync::{Arc, Weak};

use crate::audio::data::AudioData;
use crate::audio::pacer::period_ms_to_ns;
use crate::audio::param::{calculate_sample_num, AudioParam, AudioParamHdf, DhId};
use crate::audio::shared_memory::AshmemInfo;
use crate::driver::{DAudioIoCallback, MmapPosition};
use crate::error::{Error, Result};
use crate::protocol::{with_dh_id, AudioEvent, AudioEventType};
use crate::source::io_dev::{AudioEventListener, IoDev, IoDevCore, IoDevState, MmapState};
use crate::source::SourceContext;
use crate::transport::{
    AudioTransport, AudioTransportCallback, AvTransport, EngineEvent, EngineProvider,
};

pub struct SpeakerDev {
    core: IoDevCore,
    weak_self: Weak<SpeakerDev>,
    trans_handler: Arc<dyn AudioTransportCallback>,
    mmap: MmapState,
}

impl SpeakerDev {
    pub fn new(
        dev_id: &str,
        dh_id: DhId,
        ctx: &SourceContext,
        listener: Weak<dyn AudioEventListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: IoDevCore::new(
                dev_id,
                dh_id,
                ctx.driver.clone(),
                ctx.codecs.clone(),
                ctx.config.device.clone(),
                listener,
            ),
            weak_self: weak.clone(),
            trans_handler: Arc::new(SpeakerTransHandler { dev: weak.clone() }),
            mmap: MmapState::default(),
        })
    }

    fn mmap_thread_name(&self) -> String {
        format!("daudio-spk-mmap-{}", self.core.dh_id)
    }
}

impl IoDev for SpeakerDev {
    fn dh_id(&self) -> DhId {
        self.core.dh_id
    }

    fn enable_device(&self, capability: &str) -> Result<()> {
        let callback: Arc<dyn DAudioIoCallback> = self
            .weak_self
            .upgrade()
            .ok_or(Error::Nullptr("speaker"))?;
        self.core.enable(capability, callback)
    }

    fn disable_device(&self) -> Result<()> {
        self.core.disable()
    }

    fn init_engine(&self, provider: &Arc<dyn EngineProvider>) -> Result<()> {
        let transport = Arc::new(AvTransport::sender(
            &self.core.dev_id,
            self.core.dh_id,
            self.core.codecs.clone(),
            Arc::downgrade(&self.trans_handler),
        ));
        self.core.open_transport(transport, provider)
    }

    fn setup(&self) -> Result<()> {
        let param = self.core.audio_param();
        self.core.transport()?.setup(&param, &param)?;
        self.core.set_state(IoDevState::Ready);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.core.expect_state(IoDevState::Ready, "start")?;
        self.core.transport()?.start()?;
        self.core.wait_trans_ready()?;
        self.core.set_opened(true);
        self.core.set_state(IoDevState::Started);
        tracing::info!("Speaker {} started", self.core.dh_id);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let state = self.core.state();
        if !matches!(state, IoDevState::Started | IoDevState::Paused) {
            return Err(Error::StatusErr(format!("stop speaker in state {:?}", state)));
        }
        self.core.set_opened(false);
        self.mmap.stop();
        self.core.set_state(IoDevState::Stopped);
        self.core.transport()?.stop()?;
        tracing::info!("Speaker {} stopped", self.core.dh_id);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut ok = true;
        self.core.set_opened(false);
        self.mmap.unmap();
        if let Some(transport) = self.core.take_transport() {
            if let Err(e) = transport.release() {
                tracing::warn!("Release speaker {} transport failed: {}", self.core.dh_id, e);
                ok = false;
            }
        }
        self.core.set_state(IoDevState::Idle);
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("release speaker {}", self.core.dh_id)))
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
        let transport = self.core.transport()?;
        self.mmap.spawn(
            self.mmap_thread_name(),
            period_ms_to_ns(hdf.period),
            calculate_sample_num(hdf.sample_rate, hdf.period),
            |_| {},
            move |memory, offset, slice| {
                let mut data = AudioData::new(slice);
                memory.read_at(data.data_mut(), offset)?;
                transport.feed_audio_data(data)
            },
        )?;
        tracing::info!("Speaker {} mmap started", self.core.dh_id);
        Ok(())
    }

    fn mmap_stop(&self) -> Result<()> {
        self.mmap.stop();
        tracing::info!("Speaker {} mmap stopped", self.core.dh_id);
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

impl DAudioIoCallback for SpeakerDev {
    fn create_stream(&self, stream_id: i32) -> Result<()> {
        tracing::info!("Speaker {} stream {} created", self.core.dh_id, stream_id);
        self.core.notify_listener(AudioEventType::OpenSpeaker);
        Ok(())
    }

    fn destroy_stream(&self, stream_id: i32) -> Result<()> {
        tracing::info!("Speaker {} stream {} destroyed", self.core.dh_id, stream_id);
        self.core.notify_listener(AudioEventType::CloseSpeaker);
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

    fn write_stream_data(&self, _stream_id: i32, data: AudioData) -> Result<()> {
        let state = self.core.state();
        if state != IoDevState::Started {
            return Err(Error::StatusErr(format!("write to speaker in state {:?}", state)));
        }
        self.core.transport()?.feed_audio_data(data)
    }

    fn read_stream_data(&self, _stream_id: i32) -> Result<AudioData> {
        Err(Error::NotSupported("reading from a speaker".into()))
    }

    fn read_mmap_position(&self, _stream_id: i32) -> Result<MmapPosition> {
        Ok(self.mmap.position())
    }

    fn refresh_ashmem_info(&self, _stream_id: i32, info: AshmemInfo) -> Result<()> {
        self.mmap.refresh(info)
    }
}

/// Routes transport output for one speaker
struct SpeakerTransHandler {
    dev: Weak<SpeakerDev>,
}

impl AudioTransportCallback for SpeakerTransHandler {
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

    fn on_engine_trans_data_available(&self, _data: AudioData) {
        tracing::warn!("Speaker transport delivered audio, dropped");
    }
}
