//! One-shot timers
//!
//! Each timer owns a thread that sleeps until the timer is due, then runs
//! the callback. Build timers with [`Timer::builder`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::string::strdup;

type Callback = Box<dyn Fn() + Send + Sync>;

struct State {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    changed: Condvar,
    callback: Callback,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        loop {
            let mut state = self.state();
            loop {
                if state.shutdown {
                    return;
                }
                match state.deadline {
                    None => {
                        state = self
                            .changed
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner)
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            state.deadline = None;
                            break;
                        }
                        state = self
                            .changed
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
            drop(state);
            trace!("Timer {} fired", self.name);
            (self.callback)();
        }
    }
}

/// A named one-shot timer
pub struct Timer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

/// Builds a [`Timer`]
pub struct Builder<'a> {
    name: &'a str,
}

impl Timer {
    /// Start building a timer called `name`
    pub fn builder(name: &str) -> Builder<'_> {
        Builder { name }
    }

    /// Returns the timer's name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Fire the callback `msecs` milliseconds from now
    ///
    /// Rescheduling a pending timer moves its deadline.
    pub fn schedule(&self, msecs: u32) {
        let mut state = self.shared.state();
        state.deadline = Some(Instant::now() + Duration::from_millis(u64::from(msecs)));
        self.shared.changed.notify_all();
    }

    /// Cancel the timer
    ///
    /// Cancelling a timer that isn't pending, or that already fired, does
    /// nothing.
    pub fn cancel(&self) {
        let mut state = self.shared.state();
        state.deadline = None;
        self.shared.changed.notify_all();
    }

    /// Indicates if the timer is scheduled and hasn't fired
    pub fn is_pending(&self) -> bool {
        self.shared.state().deadline.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        // A callback can drop its own timer; it can't wait for itself
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Builder<'_> {
    /// Allocate the timer with `callback`
    ///
    /// Returns `None`, and logs, if any resource can't be acquired.
    /// Resources acquired before the failure are released.
    pub fn build(self, callback: impl Fn() + Send + Sync + 'static) -> Option<Timer> {
        let state = Mutex::new(State {
            deadline: None,
            shutdown: false,
        });
        let name = strdup(self.name)?;
        let shared = Arc::new(Shared {
            name,
            state,
            changed: Condvar::new(),
            callback: Box::new(callback),
        });
        let spawned = thread::Builder::new()
            .name(format!("timer-{}", shared.name))
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.run()
            });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(_err) => {
                error!("Cannot create timer {}: {}", shared.name, _err);
                return None;
            }
        };
        Some(Timer {
            worker_id: worker.thread().id(),
            worker: Some(worker),
            shared,
        })
    }
}
