//! Sink orchestrator for one source device
//!
//! Clients are created when the source opens a channel for a port, then
//! driven by control messages from the source. Every message runs as a task
//! on this device's [`EventRunner`]. Results travel back to the source over
//! the port's own channel, or over any other open one when that port is gone.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::audio::param::{DeviceKind, DhId};
use crate::error::{result_code, Error, Result};
use crate::protocol::{
    parse_payload, with_dh_id, AudioEvent, AudioEventListener, AudioEventType, ControlPayload,
    PlayStatus, PlayStatusEvent, VolumeEvent,
};
use crate::runner::EventRunner;
use crate::sink::mic_client::MicClient;
use crate::sink::speaker_client::SpeakerClient;
use crate::sink::SinkContext;

/// Told when a sink device has no clients left
pub trait SinkDevListener: Send + Sync {
    fn on_device_idle(&self, dev_id: &str);
}

type Task = fn(&SinkDev, &AudioEvent) -> Result<()>;

fn task_table() -> &'static HashMap<AudioEventType, Task> {
    static TASKS: OnceLock<HashMap<AudioEventType, Task>> = OnceLock::new();
    TASKS.get_or_init(|| {
        let mut tasks: HashMap<AudioEventType, Task> = HashMap::new();
        tasks.insert(AudioEventType::OpenSpeaker, SinkDev::task_open_speaker);
        tasks.insert(AudioEventType::CloseSpeaker, SinkDev::task_close_speaker);
        tasks.insert(AudioEventType::SpeakerClosed, SinkDev::task_channel_closed);
        tasks.insert(AudioEventType::OpenMic, SinkDev::task_open_mic);
        tasks.insert(AudioEventType::CloseMic, SinkDev::task_close_mic);
        tasks.insert(AudioEventType::MicClosed, SinkDev::task_channel_closed);
        tasks.insert(AudioEventType::VolumeSet, SinkDev::task_set_volume);
        tasks.insert(AudioEventType::VolumeMuteSet, SinkDev::task_set_mute);
        tasks.insert(AudioEventType::SetParam, SinkDev::task_set_param);
        tasks.insert(AudioEventType::AudioFocusChange, SinkDev::task_forward_to_source);
        tasks.insert(AudioEventType::AudioRenderStateChange, SinkDev::task_forward_to_source);
        tasks.insert(AudioEventType::ChangePlayStatus, SinkDev::task_play_status);
        tasks
    })
}

pub struct SinkDev {
    /// The source device this orchestrator serves
    dev_id: String,
    ctx: SinkContext,
    weak_self: Weak<SinkDev>,
    listener: Weak<dyn SinkDevListener>,
    runner: OnceLock<Arc<EventRunner>>,
    speakers: Mutex<HashMap<DhId, Arc<SpeakerClient>>>,
    mics: Mutex<HashMap<DhId, Arc<MicClient>>>,
}

impl SinkDev {
    pub fn new(
        dev_id: &str,
        ctx: SinkContext,
        listener: Weak<dyn SinkDevListener>,
    ) -> Result<Arc<Self>> {
        let dev = Arc::new_cyclic(|weak| Self {
            dev_id: dev_id.to_string(),
            ctx,
            weak_self: weak.clone(),
            listener,
            runner: OnceLock::new(),
            speakers: Mutex::new(HashMap::new()),
            mics: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&dev);
        let runner = EventRunner::spawn(format!("daudio-sink-{}", dev_id), move |event| {
            if let Some(dev) = weak.upgrade() {
                dev.run_task(event);
            }
        })?;
        let _ = dev.runner.set(Arc::new(runner));
        tracing::info!("Sink device for {} created", dev_id);
        Ok(dev)
    }

    pub fn dev_id(&self) -> &str {
        &self.dev_id
    }

    pub fn runner(&self) -> Option<&Arc<EventRunner>> {
        self.runner.get()
    }

    pub fn speaker(&self, dh_id: DhId) -> Option<Arc<SpeakerClient>> {
        self.speakers.lock().get(&dh_id).cloned()
    }

    pub fn mic(&self, dh_id: DhId) -> Option<Arc<MicClient>> {
        self.mics.lock().get(&dh_id).cloned()
    }

    pub fn is_idle(&self) -> bool {
        self.speakers.lock().is_empty() && self.mics.lock().is_empty()
    }

    /// Create the client for a port the source is opening a channel for.
    /// Runs on the provider's thread, ahead of any message on that channel.
    pub fn on_channel_request(&self, dh_id: DhId) -> Result<()> {
        let listener: Weak<dyn AudioEventListener> = self.weak_self.clone();
        match dh_id.kind() {
            DeviceKind::Speaker => {
                let replaced = self.speakers.lock().remove(&dh_id);
                if let Some(old) = replaced {
                    tracing::warn!("Speaker client {} replaced by a new channel", dh_id);
                    if let Err(e) = old.release() {
                        tracing::warn!("Release replaced speaker client {} failed: {}", dh_id, e);
                    }
                }
                let client = SpeakerClient::new(&self.dev_id, dh_id, &self.ctx, listener);
                client.init_engine(&self.ctx.provider)?;
                self.speakers.lock().insert(dh_id, client);
            }
            DeviceKind::Mic => {
                let replaced = self.mics.lock().remove(&dh_id);
                if let Some(old) = replaced {
                    tracing::warn!("Mic client {} replaced by a new channel", dh_id);
                    if let Err(e) = old.release() {
                        tracing::warn!("Release replaced mic client {} failed: {}", dh_id, e);
                    }
                }
                let client = MicClient::new(&self.dev_id, dh_id, &self.ctx, listener);
                client.init_engine(&self.ctx.provider)?;
                self.mics.lock().insert(dh_id, client);
            }
        }
        tracing::info!("Channel for port {} from {} accepted", dh_id, self.dev_id);
        Ok(())
    }

    /// Report a local focus change to the source
    pub fn report_focus_change(&self, dh_id: DhId, content: &str) -> Result<()> {
        self.post(AudioEvent::new(
            AudioEventType::AudioFocusChange,
            with_dh_id(content, dh_id)?,
        ))
    }

    /// Report a local renderer state change to the source
    pub fn report_render_state(&self, dh_id: DhId, content: &str) -> Result<()> {
        self.post(AudioEvent::new(
            AudioEventType::AudioRenderStateChange,
            with_dh_id(content, dh_id)?,
        ))
    }

    fn post(&self, event: AudioEvent) -> Result<()> {
        self.runner
            .get()
            .ok_or(Error::NotInit("sink event runner"))?
            .post(event)
    }

    fn run_task(&self, event: AudioEvent) {
        let Some(task) = task_table().get(&event.event_type) else {
            tracing::warn!("No sink task for event {:?}, ignored", event.event_type);
            return;
        };
        tracing::debug!("Sink task {:?} for {}", event.event_type, self.dev_id);
        if let Err(e) = task(self, &event) {
            tracing::error!(
                "Sink task {:?} for {} failed: {} ({})",
                event.event_type,
                self.dev_id,
                e,
                e.code()
            );
        }
    }

    fn speaker_client(&self, dh_id: DhId) -> Result<Arc<SpeakerClient>> {
        self.speaker(dh_id).ok_or(Error::Nullptr("speaker client"))
    }

    fn mic_client(&self, dh_id: DhId) -> Result<Arc<MicClient>> {
        self.mic(dh_id).ok_or(Error::Nullptr("mic client"))
    }

    /// Send `event` to the source over the port's channel, falling back to
    /// any other open channel
    fn send_to_source(&self, dh_id: DhId, event: &AudioEvent) -> Result<()> {
        let own = match dh_id.kind() {
            DeviceKind::Speaker => self.speaker(dh_id).map(|c| c.send_message(event)),
            DeviceKind::Mic => self.mic(dh_id).map(|c| c.send_message(event)),
        };
        if let Some(Ok(())) = own {
            return Ok(());
        }
        let speakers: Vec<_> = self.speakers.lock().values().cloned().collect();
        for client in speakers {
            if client.send_message(event).is_ok() {
                return Ok(());
            }
        }
        let mics: Vec<_> = self.mics.lock().values().cloned().collect();
        for client in mics {
            if client.send_message(event).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Nullptr("channel to source"))
    }

    fn notify_source_dev(&self, event_type: AudioEventType, dh_id: DhId, code: i32) -> Result<()> {
        let payload = ControlPayload::result(dh_id, event_type, code);
        let event = AudioEvent::new(event_type, payload.to_json()?);
        self.send_to_source(dh_id, &event).inspect_err(|e| {
            tracing::error!("Notify {:?} for {} to {} failed: {}", event_type, dh_id, self.dev_id, e);
        })
    }

    /// Drop this orchestrator once nothing is left to serve
    fn judge_device_status(&self) {
        if !self.is_idle() {
            return;
        }
        tracing::info!("Sink device for {} has no clients left", self.dev_id);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_device_idle(&self.dev_id);
        }
    }

    fn task_open_speaker(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let result = payload
            .audio_param
            .ok_or_else(|| Error::ParamInvalid("open speaker without AUDIO_PARAM".into()))
            .and_then(|param| {
                let client = self.speaker_client(dh_id)?;
                client.setup(&param)?;
                client.start()
            });
        self.notify_source_dev(AudioEventType::NotifyOpenSpeakerResult, dh_id, result_code(&result))?;
        result
    }

    fn task_open_mic(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let result = payload
            .audio_param
            .ok_or_else(|| Error::ParamInvalid("open mic without AUDIO_PARAM".into()))
            .and_then(|param| {
                let client = self.mic_client(dh_id)?;
                client.setup(&param)?;
                client.start()
            });
        self.notify_source_dev(AudioEventType::NotifyOpenMicResult, dh_id, result_code(&result))?;
        result
    }

    fn task_close_speaker(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let client = self.speaker_client(dh_id)?;
        let stopped = if client.is_started() { client.stop() } else { Ok(()) };
        // the source may already have dropped the channel
        let _ = self.notify_source_dev(AudioEventType::NotifyCloseSpeakerResult, dh_id, result_code(&stopped));
        let released = client.release();
        self.speakers.lock().remove(&dh_id);
        self.judge_device_status();
        stopped.and(released)
    }

    fn task_close_mic(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let client = self.mic_client(dh_id)?;
        let stopped = if client.is_started() { client.stop() } else { Ok(()) };
        // the source may already have dropped the channel
        let _ = self.notify_source_dev(AudioEventType::NotifyCloseMicResult, dh_id, result_code(&stopped));
        let released = client.release();
        self.mics.lock().remove(&dh_id);
        self.judge_device_status();
        stopped.and(released)
    }

    /// The source went away under an open client
    fn task_channel_closed(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let mut ok = true;
        match dh_id.kind() {
            DeviceKind::Speaker => {
                let removed = self.speakers.lock().remove(&dh_id);
                let Some(client) = removed else {
                    return Ok(());
                };
                if client.is_started() {
                    ok &= client.stop().is_ok();
                }
                ok &= client.release().is_ok();
            }
            DeviceKind::Mic => {
                let removed = self.mics.lock().remove(&dh_id);
                let Some(client) = removed else {
                    return Ok(());
                };
                if client.is_started() {
                    ok &= client.stop().is_ok();
                }
                ok &= client.release().is_ok();
            }
        }
        tracing::warn!("Channel of port {} from {} closed, client dropped", dh_id, self.dev_id);
        self.judge_device_status();
        if ok {
            Ok(())
        } else {
            Err(Error::Failed(format!("clean up port {}", dh_id)))
        }
    }

    fn task_set_volume(&self, event: &AudioEvent) -> Result<()> {
        let volume: VolumeEvent = parse_payload(&event.content)?;
        let dh_id = volume.dh_id()?;
        let level = volume
            .volume_level
            .ok_or_else(|| Error::ParamInvalid("VOLUME_LEVEL missing".into()))?;
        self.speaker_client(dh_id)?.set_volume(level)?;

        let changed = VolumeEvent {
            dh_id: volume.dh_id.clone(),
            volume_level: Some(level),
            is_mute: None,
        };
        let event = AudioEvent::new(AudioEventType::VolumeChange, serde_json::to_string(&changed)?);
        self.send_to_source(dh_id, &event)
    }

    fn task_set_mute(&self, event: &AudioEvent) -> Result<()> {
        let volume: VolumeEvent = parse_payload(&event.content)?;
        let mute = volume
            .is_mute
            .ok_or_else(|| Error::ParamInvalid("IS_MUTE missing".into()))?;
        self.speaker_client(volume.dh_id()?)?.set_mute(mute)
    }

    fn task_set_param(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        let dh_id = payload.dh_id()?;
        let param = payload
            .audio_param
            .ok_or_else(|| Error::ParamInvalid("set param without AUDIO_PARAM".into()))?;
        match dh_id.kind() {
            DeviceKind::Speaker => self.speaker_client(dh_id)?.setup(&param),
            DeviceKind::Mic => self.mic_client(dh_id)?.setup(&param),
        }
    }

    fn task_forward_to_source(&self, event: &AudioEvent) -> Result<()> {
        let payload: ControlPayload = parse_payload(&event.content)?;
        self.send_to_source(payload.dh_id()?, event)
    }

    fn task_play_status(&self, event: &AudioEvent) -> Result<()> {
        let status: PlayStatusEvent = parse_payload(&event.content)?;
        let dh_id = status.dh_id()?;
        if dh_id.kind() != DeviceKind::Speaker {
            return Err(Error::NotSupported(format!("play status on mic {}", dh_id)));
        }
        let client = self.speaker_client(dh_id)?;
        match status.change_type {
            PlayStatus::Pause => client.pause(),
            PlayStatus::Restart => client.restart(),
        }
    }
}

impl AudioEventListener for SinkDev {
    /// Messages from the source and closures from client channels
    fn notify_event(&self, event: AudioEvent) {
        if !task_table().contains_key(&event.event_type) {
            tracing::warn!("Event {:?} from {} ignored", event.event_type, self.dev_id);
            return;
        }
        if let Err(e) = self.post(event) {
            tracing::error!("Post event for sink {} failed: {}", self.dev_id, e);
        }
    }
}

impl Drop for SinkDev {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get() {
            runner.shutdown();
        }
        for (dh_id, client) in self.speakers.get_mut().drain() {
            if let Err(e) = client.release() {
                tracing::warn!("Release speaker client {} failed: {}", dh_id, e);
            }
        }
        for (dh_id, client) in self.mics.get_mut().drain() {
            if let Err(e) = client.release() {
                tracing::warn!("Release mic client {} failed: {}", dh_id, e);
            }
        }
        tracing::info!("Sink device for {} destroyed", self.dev_id);
    }
}
