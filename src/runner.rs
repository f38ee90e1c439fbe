//! Single-threaded event loop
//!
//! Each orchestrator owns one [`EventRunner`]. Posted events run strictly in
//! arrival order on the runner's thread, so no two tasks for the same remote
//! device ever overlap. The runner raises a heartbeat flag whenever it gets
//! through a message; the watchdog clears and checks it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::AudioEvent;

enum RunnerMsg {
    Task(AudioEvent),
    Ping,
    Shutdown,
}

pub struct EventRunner {
    name: String,
    tx: Sender<RunnerMsg>,
    heartbeat: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventRunner {
    /// Start a runner thread that hands every posted event to `handler`
    pub fn spawn<F>(name: impl Into<String>, mut handler: F) -> Result<Self>
    where
        F: FnMut(AudioEvent) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = unbounded::<RunnerMsg>();
        let heartbeat = Arc::new(AtomicBool::new(true));
        let beat = heartbeat.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!("Event runner {} started", thread_name);
                while let Ok(msg) = rx.recv() {
                    match msg {
                        RunnerMsg::Task(event) => handler(event),
                        RunnerMsg::Ping => {}
                        RunnerMsg::Shutdown => break,
                    }
                    beat.store(true, Ordering::Release);
                }
                tracing::debug!("Event runner {} stopped", thread_name);
            })?;

        Ok(Self {
            name,
            tx,
            heartbeat,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an event; returns immediately
    pub fn post(&self, event: AudioEvent) -> Result<()> {
        self.tx
            .send(RunnerMsg::Task(event))
            .map_err(|_| Error::StatusErr(format!("event runner {} stopped", self.name)))
    }

    /// Ask the loop to raise its heartbeat once it gets to this message
    pub fn ping(&self) {
        let _ = self.tx.send(RunnerMsg::Ping);
    }

    /// Read and clear the heartbeat flag
    pub fn take_heartbeat(&self) -> bool {
        self.heartbeat.swap(false, Ordering::AcqRel)
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop after already-queued events. Does not join when called from a
    /// task running on this runner.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RunnerMsg::Shutdown);
        if self.is_current_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Event runner {} panicked", self.name);
            }
        }
    }
}

impl Drop for EventRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AudioEventType;
    use std::time::Duration;

    #[test]
    fn test_events_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let runner = EventRunner::spawn("test-runner", move |event: AudioEvent| {
            s.lock().push(event.content);
        })
        .unwrap();

        for i in 0..50 {
            runner
                .post(AudioEvent::new(AudioEventType::VolumeSet, i.to_string()))
                .unwrap();
        }
        runner.shutdown();

        let seen = seen.lock();
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().enumerate().all(|(i, c)| *c == i.to_string()));
        assert!(runner
            .post(AudioEvent::new(AudioEventType::VolumeSet, ""))
            .is_err());
    }

    #[test]
    fn test_heartbeat() {
        let runner = EventRunner::spawn("beat-runner", |_event: AudioEvent| {
            thread::sleep(Duration::from_millis(100));
        })
        .unwrap();
        assert!(runner.take_heartbeat());
        assert!(!runner.take_heartbeat());

        runner.ping();
        thread::sleep(Duration::from_millis(50));
        assert!(runner.take_heartbeat());

        // a busy task holds the ping back
        runner.post(AudioEvent::new(AudioEventType::VolumeSet, "")).unwrap();
        runner.ping();
        thread::sleep(Duration::from_millis(20));
        runner.take_heartbeat();
        thread::sleep(Duration::from_millis(20));
        assert!(!runner.take_heartbeat());
    }
}
