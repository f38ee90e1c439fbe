//! Boundary to the local audio driver layer
//!
//! The source side registers each remote port with an [`AudioDriver`] so the
//! local audio framework sees it as hardware. The driver then calls back into
//! the port through [`DAudioIoCallback`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::audio::data::AudioData;
use crate::audio::param::{AudioParamHdf, DhId};
use crate::audio::shared_memory::AshmemInfo;
use crate::error::{Error, Result};
use crate::protocol::AudioEvent;

/// Frames moved through the shared region and when the count was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapPosition {
    pub frames: u64,
    pub time_ns: i64,
}

/// Stream surface a registered port exposes to the driver
pub trait DAudioIoCallback: Send + Sync {
    fn create_stream(&self, stream_id: i32) -> Result<()>;
    fn destroy_stream(&self, stream_id: i32) -> Result<()>;
    fn set_parameters(&self, stream_id: i32, param: &AudioParamHdf) -> Result<()>;
    fn notify_event(&self, stream_id: i32, event: &AudioEvent) -> Result<()>;
    /// Speaker: audio the local framework wants played remotely
    fn write_stream_data(&self, stream_id: i32, data: AudioData) -> Result<()>;
    /// Mic: next captured frame, zero-filled when none has arrived
    fn read_stream_data(&self, stream_id: i32) -> Result<AudioData>;
    fn read_mmap_position(&self, stream_id: i32) -> Result<MmapPosition>;
    fn refresh_ashmem_info(&self, stream_id: i32, info: AshmemInfo) -> Result<()>;
}

/// Registration surface of the local driver
pub trait AudioDriver: Send + Sync {
    fn register_audio_device(
        &self,
        dev_id: &str,
        dh_id: DhId,
        capability: &str,
        callback: Arc<dyn DAudioIoCallback>,
    ) -> Result<()>;

    fn unregister_audio_device(&self, dev_id: &str, dh_id: DhId) -> Result<()>;

    /// Events a port reports upward, e.g. open results or volume changes
    fn notify_event(&self, dev_id: &str, dh_id: DhId, event: &AudioEvent) -> Result<()>;
}

/// One event reported through [`AudioDriver::notify_event`]
#[derive(Debug, Clone, PartialEq)]
pub struct DriverEvent {
    pub dev_id: String,
    pub dh_id: DhId,
    pub event: AudioEvent,
}

/// In-process driver that records what ports report
#[derive(Default)]
pub struct SimulatedDriver {
    ports: Mutex<HashMap<(String, DhId), Arc<dyn DAudioIoCallback>>>,
    events: Mutex<Vec<DriverEvent>>,
    event_cv: Condvar,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback of a registered port, as the driver would call it
    pub fn port(&self, dev_id: &str, dh_id: DhId) -> Option<Arc<dyn DAudioIoCallback>> {
        self.ports.lock().get(&(dev_id.to_string(), dh_id)).cloned()
    }

    pub fn is_registered(&self, dev_id: &str, dh_id: DhId) -> bool {
        self.ports.lock().contains_key(&(dev_id.to_string(), dh_id))
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().clone()
    }

    /// Block until an event matching `pred` has been reported
    pub fn wait_for_event<F>(&self, timeout: Duration, mut pred: F) -> Option<DriverEvent>
    where
        F: FnMut(&DriverEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.iter().find(|e| pred(e)) {
                return Some(event.clone());
            }
            if self.event_cv.wait_until(&mut events, deadline).timed_out() {
                return events.iter().find(|e| pred(e)).cloned();
            }
        }
    }
}

impl AudioDriver for SimulatedDriver {
    fn register_audio_device(
        &self,
        dev_id: &str,
        dh_id: DhId,
        capability: &str,
        callback: Arc<dyn DAudioIoCallback>,
    ) -> Result<()> {
        let mut ports = self.ports.lock();
        let key = (dev_id.to_string(), dh_id);
        if ports.contains_key(&key) {
            return Err(Error::StatusErr(format!(
                "port {} of {} already registered",
                dh_id, dev_id
            )));
        }
        tracing::info!(
            "Driver registered port {} of {} ({})",
            dh_id,
            dev_id,
            capability
        );
        ports.insert(key, callback);
        Ok(())
    }

    fn unregister_audio_device(&self, dev_id: &str, dh_id: DhId) -> Result<()> {
        self.ports
            .lock()
            .remove(&(dev_id.to_string(), dh_id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("port {} of {}", dh_id, dev_id)))
    }

    fn notify_event(&self, dev_id: &str, dh_id: DhId, event: &AudioEvent) -> Result<()> {
        tracing::debug!("Driver event {:?} for port {}", event.event_type, dh_id);
        self.events.lock().push(DriverEvent {
            dev_id: dev_id.to_string(),
            dh_id,
            event: event.clone(),
        });
        self.event_cv.notify_all();
        Ok(())
    }
}
