//! Periodic background tasks
//!
//! Each `Sweeper` owns one named thread that runs a closure on a fixed
//! interval until stopped. Stopping is prompt: the thread waits on a condvar,
//! not a sleep.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

pub struct Sweeper {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Run `task` every `interval` on a thread called `name`
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("Sweeper {} started", thread_name);
            let mut stopped = thread_signal.stopped.lock();
            while !*stopped {
                let result = thread_signal.cond.wait_for(&mut stopped, interval);
                if *stopped {
                    break;
                }
                if result.timed_out() {
                    MutexGuard::unlocked(&mut stopped, &mut task);
                }
            }
            debug!("Sweeper {} stopped", thread_name);
        })?;

        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
        }
        self.signal.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sweeper {} panicked", self.name);
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The background tasks of one service instance
#[derive(Default)]
pub struct SweeperSet {
    sweepers: Vec<Sweeper>,
}

impl SweeperSet {
    pub fn push(&mut self, sweeper: Sweeper) {
        self.sweepers.push(sweeper);
    }

    pub fn names(&self) -> Vec<&str> {
        self.sweepers.iter().map(Sweeper::name).collect()
    }

    pub fn len(&self) -> usize {
        self.sweepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweepers.is_empty()
    }

    pub fn stop_all(&mut self) {
        for sweeper in &mut self.sweepers {
            sweeper.stop();
        }
    }
}
