//! Source and sink managers wired through the in-process engine provider

#![cfg(all(feature = "source", feature = "sink"))]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use distributed_audio::audio::data::AudioData;
use distributed_audio::audio::device::NullBackend;
use distributed_audio::audio::param::{
    AudioParamHdf, DhId, PortOperationMode, DEFAULT_CAPTURE_ID, DEFAULT_RENDER_ID,
};
use distributed_audio::audio::shared_memory::{AshmemInfo, SharedMemory};
use distributed_audio::codec::CodecRegistry;
use distributed_audio::config::AppConfig;
use distributed_audio::constants::DEFAULT_FRAME_SIZE;
use distributed_audio::driver::{DAudioIoCallback, SimulatedDriver};
use distributed_audio::error::{Error, Result};
use distributed_audio::protocol::{parse_payload, AudioEvent, AudioEventType, ControlPayload};
use distributed_audio::sink::{SinkContext, SinkManager};
use distributed_audio::source::{IoDev, IoDevState, SourceContext, SourceManager};
use distributed_audio::transport::{
    EngineEvent, EngineListener, EngineProvider, EngineRole, MemoryNetwork, MemoryProvider,
    ProviderListener, TransEngine,
};
use distributed_audio::DH_SUCCESS;

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn reported_result(driver: &SimulatedDriver, event_type: AudioEventType) -> Option<i32> {
    let reported = driver.wait_for_event(Duration::from_secs(5), |e| e.event.event_type == event_type)?;
    parse_payload::<ControlPayload>(&reported.event.content)
        .ok()?
        .result
}

fn open_port(
    driver: &SimulatedDriver,
    manager: &SourceManager,
    dh_id: DhId,
    capability: &str,
) -> Arc<dyn DAudioIoCallback> {
    open_port_with(driver, manager, dh_id, capability, &AudioParamHdf::default())
}

fn open_port_with(
    driver: &SimulatedDriver,
    manager: &SourceManager,
    dh_id: DhId,
    capability: &str,
    hdf: &AudioParamHdf,
) -> Arc<dyn DAudioIoCallback> {
    manager
        .enable_daudio("sink", &dh_id.to_string(), capability)
        .unwrap();
    assert!(wait_until(|| driver.is_registered("sink", dh_id)));
    let port = driver.port("sink", dh_id).unwrap();
    port.set_parameters(0, hdf).unwrap();
    port.create_stream(0).unwrap();
    port
}

struct Pair {
    network: Arc<MemoryNetwork>,
    driver: Arc<SimulatedDriver>,
    source: Arc<SourceManager>,
    sink: Arc<SinkManager>,
    codecs: Arc<CodecRegistry>,
}

/// Source and sink managers on one in-process network
fn pair() -> Pair {
    let network = MemoryNetwork::new();
    let mut config = AppConfig::default();
    config.watchdog.enabled = false;
    let codecs = Arc::new(CodecRegistry::default());
    let sink = SinkManager::new(SinkContext {
        config: config.clone(),
        codecs: codecs.clone(),
        provider: network.provider("sink"),
        backend: Arc::new(NullBackend::new()),
    })
    .unwrap();
    let driver = Arc::new(SimulatedDriver::new());
    let source = SourceManager::new(SourceContext {
        config,
        codecs: codecs.clone(),
        provider: network.provider("source"),
        driver: driver.clone(),
    })
    .unwrap();
    Pair {
        network,
        driver,
        source,
        sink,
        codecs,
    }
}

/// Mmap position has stopped moving
fn position_settled(port: &Arc<dyn DAudioIoCallback>) -> bool {
    wait_until(|| {
        let before = port.read_mmap_position(0).unwrap().frames;
        thread::sleep(Duration::from_millis(30));
        port.read_mmap_position(0).unwrap().frames == before
    })
}

#[test]
fn test_speaker_and_mic_round_trip() {
    let network = MemoryNetwork::new();
    let mut config = AppConfig::default();
    config.watchdog.enabled = false;
    let codecs = Arc::new(CodecRegistry::default());
    let capability = codecs.capability_json();

    let backend = NullBackend::new();
    let sink = SinkManager::new(SinkContext {
        config: config.clone(),
        codecs: codecs.clone(),
        provider: network.provider("sink"),
        backend: Arc::new(backend.clone()),
    })
    .unwrap();

    let driver = Arc::new(SimulatedDriver::new());
    let source = SourceManager::new(SourceContext {
        config,
        codecs,
        provider: network.provider("source"),
        driver: driver.clone(),
    })
    .unwrap();

    // speaker: driver writes, sink renders
    let speaker = open_port(&driver, &source, DEFAULT_RENDER_ID, &capability);
    assert_eq!(
        reported_result(&driver, AudioEventType::NotifyOpenSpeakerResult),
        Some(DH_SUCCESS)
    );
    let sink_dev = sink.device("source").unwrap();
    assert!(sink_dev.speaker(DEFAULT_RENDER_ID).unwrap().is_started());

    for _ in 0..5 {
        speaker
            .write_stream_data(0, AudioData::new(DEFAULT_FRAME_SIZE))
            .unwrap();
    }
    assert!(wait_until(|| backend.rendered_bytes() > 0));

    // mic: sink captures, driver reads
    let mic = open_port(&driver, &source, DEFAULT_CAPTURE_ID, &capability);
    assert_eq!(
        reported_result(&driver, AudioEventType::NotifyOpenMicResult),
        Some(DH_SUCCESS)
    );
    let source_dev = source.device("sink").unwrap();
    let source_mic = source_dev.mic(DEFAULT_CAPTURE_ID).unwrap();
    assert!(wait_until(|| source_mic.queued_frames() > 0));
    let frame = mic.read_stream_data(0).unwrap();
    assert_eq!(frame.size(), DEFAULT_FRAME_SIZE);

    // closing both ports lets the sink drop its orchestrator
    speaker.destroy_stream(0).unwrap();
    assert_eq!(
        reported_result(&driver, AudioEventType::NotifyCloseSpeakerResult),
        Some(DH_SUCCESS)
    );
    mic.destroy_stream(0).unwrap();
    assert_eq!(
        reported_result(&driver, AudioEventType::NotifyCloseMicResult),
        Some(DH_SUCCESS)
    );
    drop(sink_dev);
    assert!(wait_until(|| sink.device_count() == 0));

    source.disable_daudio("sink", &DEFAULT_RENDER_ID.to_string()).unwrap();
    source.disable_daudio("sink", &DEFAULT_CAPTURE_ID.to_string()).unwrap();
    drop(source_mic);
    drop(source_dev);
    assert!(wait_until(|| source.device_count() == 0));
    assert!(!driver.is_registered("sink", DEFAULT_RENDER_ID));
    assert!(!driver.is_registered("sink", DEFAULT_CAPTURE_ID));

    source.shutdown();
    sink.shutdown();
}

#[test]
fn test_open_without_sink_reports_failure() {
    let network = MemoryNetwork::new();
    let mut config = AppConfig::default();
    config.watchdog.enabled = false;
    config.device.channel_timeout_ms = 200;
    let driver = Arc::new(SimulatedDriver::new());
    let source = SourceManager::new(SourceContext {
        config,
        codecs: Arc::new(CodecRegistry::default()),
        provider: network.provider("source"),
        driver: driver.clone(),
    })
    .unwrap();

    // no sink device "sink" exists on the network
    let _speaker = open_port(&driver, &source, DEFAULT_RENDER_ID, "");
    let code = reported_result(&driver, AudioEventType::NotifyOpenSpeakerResult).unwrap();
    assert_ne!(code, DH_SUCCESS);
    assert!(!source
        .device("sink")
        .unwrap()
        .speaker(DEFAULT_RENDER_ID)
        .unwrap()
        .is_opened());
    source.shutdown();
}

/// Accepts channels and reads requests but never answers them
struct SilentSink {
    provider: Arc<MemoryProvider>,
    engines: Mutex<Vec<Arc<dyn TransEngine>>>,
    requests: Arc<Mutex<Vec<AudioEventType>>>,
}

struct SilentPort(Arc<Mutex<Vec<AudioEventType>>>);

impl EngineListener for SilentPort {
    fn on_engine_event(&self, _event: EngineEvent) {}

    fn on_engine_message(&self, event: AudioEvent) {
        self.0.lock().push(event.event_type);
    }

    fn on_engine_data(&self, _data: AudioData) {}
}

impl ProviderListener for SilentSink {
    fn on_channel_request(&self, peer_dev_id: &str, dh_id: DhId) -> Result<()> {
        let engine = self
            .provider
            .create_engine(peer_dev_id, dh_id, EngineRole::Receiver)?;
        engine.initialize(Arc::new(SilentPort(self.requests.clone())))?;
        self.engines.lock().push(engine);
        Ok(())
    }
}

#[test]
fn test_open_times_out_when_sink_never_answers() {
    let network = MemoryNetwork::new();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let silent = Arc::new(SilentSink {
        provider: network.provider("sink"),
        engines: Mutex::new(Vec::new()),
        requests: requests.clone(),
    });
    let listener: Arc<dyn ProviderListener> = silent.clone();
    silent.provider.set_listener(Arc::downgrade(&listener));

    let mut config = AppConfig::default();
    config.watchdog.enabled = false;
    config.device.rpc_timeout_ms = 200;
    let driver = Arc::new(SimulatedDriver::new());
    let source = SourceManager::new(SourceContext {
        config,
        codecs: Arc::new(CodecRegistry::default()),
        provider: network.provider("source"),
        driver: driver.clone(),
    })
    .unwrap();

    let _speaker = open_port(&driver, &source, DEFAULT_RENDER_ID, "");
    assert_eq!(
        reported_result(&driver, AudioEventType::NotifyOpenSpeakerResult),
        Some(Error::RpcWaitTimeout(AudioEventType::NotifyOpenSpeakerResult).code())
    );
    assert_eq!(requests.lock().as_slice(), &[AudioEventType::OpenSpeaker]);

    let speaker = source.device("sink").unwrap().speaker(DEFAULT_RENDER_ID).unwrap();
    assert!(!speaker.is_opened());
    assert_eq!(speaker.state(), IoDevState::Idle);
    source.shutdown();
}

#[test]
fn test_play_status_pauses_both_ends() {
    let pair = pair();
    let capability = pair.codecs.capability_json();
    let speaker = open_port(&pair.driver, &pair.source, DEFAULT_RENDER_ID, &capability);
    assert_eq!(
        reported_result(&pair.driver, AudioEventType::NotifyOpenSpeakerResult),
        Some(DH_SUCCESS)
    );
    let source_speaker = pair
        .source
        .device("sink")
        .unwrap()
        .speaker(DEFAULT_RENDER_ID)
        .unwrap();
    let client = pair
        .sink
        .device("source")
        .unwrap()
        .speaker(DEFAULT_RENDER_ID)
        .unwrap();

    speaker
        .notify_event(
            0,
            &AudioEvent::new(AudioEventType::ChangePlayStatus, r#"{"CHANGE_TYPE":"pause"}"#),
        )
        .unwrap();
    assert!(wait_until(|| source_speaker.state() == IoDevState::Paused));
    assert!(wait_until(|| client.is_paused()));

    speaker
        .notify_event(
            0,
            &AudioEvent::new(AudioEventType::ChangePlayStatus, r#"{"CHANGE_TYPE":"restart"}"#),
        )
        .unwrap();
    assert!(wait_until(|| source_speaker.state() == IoDevState::Started));
    assert!(wait_until(|| !client.is_paused()));
    speaker
        .write_stream_data(0, AudioData::new(DEFAULT_FRAME_SIZE))
        .unwrap();

    drop(client);
    pair.source.shutdown();
    pair.sink.shutdown();
    drop(pair.network);
}

#[test]
fn test_mmap_ports_move_audio_through_shared_memory() {
    const SLICE: usize = 960;
    let pair = pair();
    let capability = pair.codecs.capability_json();
    let hdf = AudioParamHdf {
        frame_size: SLICE,
        period: 5,
        render_flags: PortOperationMode::Mmap,
        capturer_flags: PortOperationMode::Mmap,
        ..Default::default()
    };

    // speaker: the driver fills the region, the sink renders
    let speaker = open_port_with(&pair.driver, &pair.source, DEFAULT_RENDER_ID, &capability, &hdf);
    assert_eq!(
        reported_result(&pair.driver, AudioEventType::NotifyOpenSpeakerResult),
        Some(DH_SUCCESS)
    );
    let file = tempfile::tempfile().unwrap();
    file.set_len((SLICE * 4) as u64).unwrap();
    speaker
        .refresh_ashmem_info(
            0,
            AshmemInfo {
                file,
                len: SLICE * 4,
                length_per_trans: SLICE,
            },
        )
        .unwrap();
    speaker
        .notify_event(0, &AudioEvent::new(AudioEventType::MmapSpkStart, ""))
        .unwrap();
    assert!(wait_until(|| speaker.read_mmap_position(0).unwrap().frames >= 4 * 240));
    speaker
        .notify_event(0, &AudioEvent::new(AudioEventType::MmapSpkStop, ""))
        .unwrap();
    assert!(position_settled(&speaker));

    // mic: the sink captures, the region is overwritten with its silence
    let mic = open_port_with(&pair.driver, &pair.source, DEFAULT_CAPTURE_ID, &capability, &hdf);
    assert_eq!(
        reported_result(&pair.driver, AudioEventType::NotifyOpenMicResult),
        Some(DH_SUCCESS)
    );
    let file = tempfile::tempfile().unwrap();
    file.set_len((SLICE * 4) as u64).unwrap();
    let view = SharedMemory::map_file(&file, SLICE * 4).unwrap();
    view.write_at(&[0xaa; SLICE * 4], 0).unwrap();
    mic.refresh_ashmem_info(
        0,
        AshmemInfo {
            file,
            len: SLICE * 4,
            length_per_trans: SLICE,
        },
    )
    .unwrap();
    mic.notify_event(0, &AudioEvent::new(AudioEventType::MmapMicStart, ""))
        .unwrap();
    assert!(wait_until(|| {
        let mut region = vec![0u8; SLICE * 4];
        view.read_at(&mut region, 0).unwrap();
        region.iter().all(|&b| b == 0)
    }));
    mic.notify_event(0, &AudioEvent::new(AudioEventType::MmapMicStop, ""))
        .unwrap();
    assert!(position_settled(&mic));

    pair.source.shutdown();
    pair.sink.shutdown();
    drop(pair.network);
}
