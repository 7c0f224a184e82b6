//! Tasklets: deferred callbacks that run in atomic context
//!
//! A [`TaskletQueue`] owns one worker thread and the receiving end of a
//! channel. [`Tasklet`]s hold a sender. Scheduling a tasklet sends it to
//! the worker, which runs queued tasklets one at a time, in order, with
//! the platform in softirq context. The receiver moves into the worker, so
//! the queue has exactly one consumer.
//!
//! Dropping the queue stops the worker after everything already queued.
//! Tasklets that outlive their queue can't be scheduled anymore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    name: String,
    /// Set while the tasklet sits in the queue
    scheduled: AtomicBool,
    callback: Callback,
}

enum Message {
    Run(Arc<Inner>),
    /// Acknowledged once everything sent before it has run
    Drain(mpsc::Sender<()>),
    Stop,
}

/// The worker that runs tasklets
pub struct TaskletQueue {
    sender: mpsc::Sender<Message>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl TaskletQueue {
    /// Start a tasklet worker called `name`
    ///
    /// Returns `None`, and logs, if the worker can't start.
    pub fn new(name: &str) -> Option<Self> {
        let (sender, receiver) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("tasklet-{}", name))
            .spawn(move || run(receiver));
        match spawned {
            Ok(worker) => Some(TaskletQueue {
                sender,
                worker_id: worker.thread().id(),
                worker: Some(worker),
            }),
            Err(_err) => {
                error!("Cannot start tasklet worker {}: {}", name, _err);
                None
            }
        }
    }

    /// Create a tasklet that runs `callback` on this queue
    ///
    /// `callback` runs in atomic context, so it must not sleep.
    pub fn tasklet(&self, name: &str, callback: impl Fn() + Send + Sync + 'static) -> Tasklet {
        Tasklet {
            inner: Arc::new(Inner {
                name: name.into(),
                scheduled: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
            sender: self.sender.clone(),
            worker_id: self.worker_id,
        }
    }
}

impl Drop for TaskletQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Stop);
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(receiver: mpsc::Receiver<Message>) {
    for message in receiver {
        match message {
            Message::Run(tasklet) => {
                tasklet.scheduled.store(false, Ordering::Release);
                trace!("Running tasklet {}", tasklet.name);
                super::softirq(|| (tasklet.callback)());
            }
            Message::Drain(done) => {
                let _ = done.send(());
            }
            Message::Stop => break,
        }
    }
}

/// A deferred callback
///
/// Dropping a tasklet waits for any scheduled or running execution.
pub struct Tasklet {
    inner: Arc<Inner>,
    sender: mpsc::Sender<Message>,
    worker_id: ThreadId,
}

impl Tasklet {
    /// Returns the tasklet's name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule the tasklet to run
    ///
    /// Never sleeps, and is safe to call from any context. Scheduling a
    /// tasklet that's already queued does nothing; it runs once.
    pub fn schedule(&self) {
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .sender
            .send(Message::Run(Arc::clone(&self.inner)))
            .is_err()
        {
            self.inner.scheduled.store(false, Ordering::Release);
            warn!("Tasklet {} scheduled without a worker", self.inner.name);
        }
    }

    /// Indicates if the tasklet is queued and hasn't started
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::Acquire)
    }
}

impl Drop for Tasklet {
    fn drop(&mut self) {
        // From inside a tasklet, the worker can't wait on itself
        if thread::current().id() == self.worker_id {
            return;
        }
        let (done, drained) = mpsc::channel();
        if self.sender.send(Message::Drain(done)).is_ok() {
            let _ = drained.recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskletQueue;
    use crate::platform::{in_atomic, in_softirq};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn runs_in_softirq_context() {
        let queue = TaskletQueue::new("context").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let tasklet = queue.tasklet("probe", move || {
            tx.lock().unwrap().send((in_softirq(), in_atomic())).unwrap();
        });
        assert_eq!(tasklet.name(), "probe");
        tasklet.schedule();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, true));
    }

    #[test]
    fn drop_drains() {
        let queue = TaskletQueue::new("drain").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let tasklet = queue.tasklet("slow", {
            let count = Arc::clone(&count);
            move || {
                std::thread::sleep(Duration::from_millis(20));
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        tasklet.schedule();
        drop(tasklet);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduling_twice_runs_once() {
        let queue = TaskletQueue::new("coalesce").unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let count = Arc::new(AtomicUsize::new(0));

        // Hold the worker so the second tasklet stays queued
        let blocker = queue.tasklet("blocker", move || {
            let _ = gate_rx.lock().unwrap().recv();
        });
        let counted = queue.tasklet("counted", {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        blocker.schedule();
        counted.schedule();
        counted.schedule();
        assert!(counted.is_scheduled());
        gate_tx.send(()).unwrap();
        drop(counted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_order() {
        let queue = TaskletQueue::new("order").unwrap();
        let (tx, rx) = mpsc::channel();
        let tasklets: Vec<_> = (0..4)
            .map(|n| {
                let tx = Mutex::new(tx.clone());
                queue.tasklet("ordered", move || tx.lock().unwrap().send(n).unwrap())
            })
            .collect();
        for tasklet in &tasklets {
            tasklet.schedule();
        }
        let order: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, [0, 1, 2, 3]);
    }
}
