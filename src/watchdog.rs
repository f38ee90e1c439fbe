//! Liveness check for orchestrator event loops
//!
//! Every interval the watchdog reads and clears each runner's heartbeat, then
//! pings it. A runner that did not get through the previous ping within one
//! interval is considered hung. The default reaction terminates the process.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::Result;
use crate::runner::EventRunner;

type HangAction = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Watchdog {
    runners: Arc<Mutex<Vec<Weak<EventRunner>>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Start a watchdog that exits the process on a hung runner
    pub fn start(interval: Duration) -> Result<Self> {
        Self::with_hang_action(interval, |name| {
            tracing::error!("Event runner {} is not responding, exiting", name);
            std::process::exit(1);
        })
    }

    pub fn with_hang_action<F>(interval: Duration, on_hang: F) -> Result<Self>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let runners: Arc<Mutex<Vec<Weak<EventRunner>>>> = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let on_hang: HangAction = Arc::new(on_hang);
        let watched = runners.clone();

        let handle = thread::Builder::new()
            .name("daudio-watchdog".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let live: Vec<Arc<EventRunner>> = {
                    let mut runners = watched.lock();
                    runners.retain(|r| r.strong_count() > 0);
                    runners.iter().filter_map(Weak::upgrade).collect()
                };
                for runner in live {
                    if runner.take_heartbeat() {
                        runner.ping();
                    } else {
                        on_hang(runner.name());
                    }
                }
            })?;

        Ok(Self {
            runners,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Watch a runner until it is dropped
    pub fn watch(&self, runner: &Arc<EventRunner>) {
        tracing::debug!("Watching event runner {}", runner.name());
        self.runners.lock().push(Arc::downgrade(runner));
    }

    pub fn stop(&self) {
        self.stop_tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
