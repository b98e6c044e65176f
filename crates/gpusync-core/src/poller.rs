//! Background thread that advances handles with pending callbacks.
//!
//! Registration hands the poller one internal reference per handle. Each wake polls every
//! registered handle, fires callbacks that became due, and drops handles with nothing left to
//! fire. Between wakes the thread blocks on the registered backend handle with the lowest
//! compute task count, bounded by `max_sleep`; if there is none, or the device hangs, it sleeps on
//! the condvar.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crate::device::DeviceInner;
use crate::memory::lock;
use crate::types::HandleId;
use crate::wait::WaitOutcome;

#[derive(Default)]
struct PollerState {
    register: Vec<HandleId>,
    running: bool,
    started: bool,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

pub(crate) struct Poller {
    state: Mutex<PollerState>,
    wake: Condvar,
    max_sleep: Duration,
}

impl Poller {
    pub(crate) fn new(max_sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PollerState {
                running: true,
                ..PollerState::default()
            }),
            wake: Condvar::new(),
            max_sleep,
        })
    }

    /// Queue `id` for polling, starting the thread on first use.
    pub(crate) fn register(self: &Arc<Self>, device: &Weak<DeviceInner>, id: HandleId) {
        let mut state = lock(&self.state);
        if !state.running {
            return;
        }
        state.register.push(id);
        if !state.started {
            state.started = true;
            let poller = self.clone();
            let device = device.clone();
            let spawned = std::thread::Builder::new()
                .name("gpusync-poller".to_string())
                .spawn(move || poller.run(device));
            match spawned {
                Ok(thread) => {
                    state.thread_id = Some(thread.thread().id());
                    state.thread = Some(thread);
                    tracing::info!("completion poller started");
                }
                Err(err) => {
                    tracing::error!(%err, "failed to start completion poller");
                    state.started = false;
                }
            }
        }
        self.wake.notify_one();
    }

    /// Wake the thread without registering anything.
    pub(crate) fn interrupt(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    /// Stop the thread. Joins unless called from the poller thread itself.
    pub(crate) fn shutdown(&self) {
        let thread = {
            let mut state = lock(&self.state);
            state.running = false;
            state.register.clear();
            let on_poller = state.thread_id == Some(std::thread::current().id());
            if on_poller {
                None
            } else {
                state.thread.take()
            }
        };
        self.wake.notify_all();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("completion poller panicked");
            }
        }
    }

    /// Sleep for up to `max_sleep` unless a registration is already waiting.
    fn nap(&self) {
        let state = lock(&self.state);
        if state.running && state.register.is_empty() {
            let _ = self.wake.wait_timeout(state, self.max_sleep);
        }
    }

    fn run(self: Arc<Self>, device: Weak<DeviceInner>) {
        let mut working: Vec<HandleId> = Vec::new();
        loop {
            {
                let mut state = lock(&self.state);
                while state.running && state.register.is_empty() && working.is_empty() {
                    state = match self.wake.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                if !state.running {
                    break;
                }
                working.append(&mut state.register);
            }

            let Some(inner) = device.upgrade() else {
                break;
            };
            inner.stats.inc_poller_wakes();
            match inner.process_poll_list(&mut working) {
                Some(candidate) => {
                    // A hung device only gets reported to callers that wait on it.
                    if inner.wait_bounded(candidate, self.max_sleep) == WaitOutcome::Hang {
                        drop(inner);
                        self.nap();
                    }
                }
                None if !working.is_empty() => {
                    drop(inner);
                    self.nap();
                }
                None => {}
            }
            std::thread::yield_now();
        }
        tracing::info!("completion poller stopped");
    }
}
