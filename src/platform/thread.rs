//! Kernel-style threads with cooperative stop
//!
//! A thread body polls [`ThreadControl::should_stop`] and returns when
//! asked. [`Thread::stop`] asks, then waits for the body to return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Error;

/// How long [`Thread::stop`] waits for the body to return
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared between a thread and its owner
pub struct ThreadControl {
    name: String,
    stop: AtomicBool,
}

impl ThreadControl {
    /// Indicates that the owner asked the thread to stop
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Returns the thread's name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A running thread
pub struct Thread {
    control: Arc<ThreadControl>,
    exited: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Run `body` on a new thread called `name`
    ///
    /// Returns `None`, and logs, if the thread can't start.
    pub fn run(name: &str, body: impl FnOnce(&ThreadControl) + Send + 'static) -> Option<Self> {
        let control = Arc::new(ThreadControl {
            name: name.into(),
            stop: AtomicBool::new(false),
        });
        let (exit, exited) = mpsc::channel();
        let spawned = thread::Builder::new().name(name.into()).spawn({
            let control = Arc::clone(&control);
            move || {
                body(&control);
                let _ = exit.send(());
            }
        });
        match spawned {
            Ok(handle) => Some(Thread {
                control,
                exited,
                handle: Some(handle),
            }),
            Err(_err) => {
                error!("Cannot start thread {}: {}", name, _err);
                None
            }
        }
    }

    /// Returns the thread's name
    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// Ask the thread to stop, and wait for it to exit
    ///
    /// Returns [`Error::TimedOut`] if the thread doesn't exit within
    /// [`STOP_TIMEOUT`]; the thread is then left running.
    pub fn stop(self) -> Result<(), Error> {
        self.stop_timeout(STOP_TIMEOUT)
    }

    /// Like [`stop`](Self::stop), with a custom timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Result<(), Error> {
        self.control.stop.store(true, Ordering::Release);
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("Thread {} didn't stop", self.control.name);
                Err(Error::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Thread;
    use crate::error::Error;
    use std::sync::{mpsc, Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn stops_when_asked() {
        let (tx, rx) = mpsc::channel();
        let thread = Thread::run("worker", move |control| {
            let mut spins = 0u64;
            while !control.should_stop() {
                spins += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            tx.send(spins).unwrap();
        })
        .unwrap();
        assert_eq!(thread.name(), "worker");
        assert_eq!(thread.stop(), Ok(()));
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn stop_times_out() {
        let barrier = Arc::new(Barrier::new(2));
        let thread = Thread::run("stubborn", {
            let barrier = Arc::clone(&barrier);
            move |_| {
                barrier.wait();
            }
        })
        .unwrap();
        assert_eq!(
            thread.stop_timeout(Duration::from_millis(20)),
            Err(Error::TimedOut)
        );
        barrier.wait();
    }

    #[test]
    fn already_exited() {
        let thread = Thread::run("short", |_| ()).unwrap();
        assert_eq!(thread.stop(), Ok(()));
    }
}
