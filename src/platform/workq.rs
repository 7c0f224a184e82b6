//! Work queues: deferred work that may sleep
//!
//! Work runs on the queue's thread, in process context, in the order it
//! was scheduled. The queue counts scheduled work that hasn't finished,
//! and [`WorkQueue::wait_work_done`] blocks until that count reaches zero.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use super::string::strdup;
use super::sync::SpinLock;
use super::waitq::WaitQueue;
use crate::error::Error;

type Work = Box<dyn FnOnce() + Send>;

struct Item {
    id: u64,
    name: String,
    delay: Option<Duration>,
    work: Work,
}

#[derive(Default)]
struct Pending {
    count: usize,
    next_id: u64,
    /// Names of pending work, for diagnostics
    names: Vec<(u64, String)>,
}

struct Shared {
    name: String,
    pending: SpinLock<Pending>,
    waitq: WaitQueue,
}

impl Shared {
    fn count(&self) -> usize {
        self.pending.lock_irqsave().count
    }

    fn finish(&self, id: u64) {
        {
            let mut pending = self.pending.lock_irqsave();
            pending.count -= 1;
            pending.names.retain(|(pending_id, _)| *pending_id != id);
        }
        self.waitq.trigger();
    }
}

/// A named work queue
pub struct WorkQueue {
    shared: Arc<Shared>,
    sender: Option<mpsc::Sender<Item>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl WorkQueue {
    /// Start a work queue called `name`
    ///
    /// Returns `None`, and logs, if the queue can't be allocated or its
    /// thread can't start.
    pub fn new(name: &str) -> Option<Self> {
        let shared = Arc::new(Shared {
            name: strdup(name)?,
            pending: SpinLock::new(Pending::default()),
            waitq: WaitQueue::new(),
        });
        let (sender, receiver) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("workq-{}", name))
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&shared, receiver)
            });
        match spawned {
            Ok(worker) => Some(WorkQueue {
                shared,
                sender: Some(sender),
                worker_id: worker.thread().id(),
                worker: Some(worker),
            }),
            Err(_err) => {
                error!("Cannot start work queue {}: {}", name, _err);
                None
            }
        }
    }

    /// Returns the queue's name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Run `work` on the queue
    ///
    /// `name` identifies the work in diagnostics. The pending count
    /// includes the work from now until `work` returns.
    pub fn schedule(&self, name: &str, work: impl FnOnce() + Send + 'static) {
        self.enqueue(name, None, Box::new(work))
    }

    /// Run `work` on the queue after sleeping `msecs` milliseconds
    ///
    /// The delay is spent on the queue's thread, so it also holds back
    /// work scheduled after this.
    pub fn schedule_delayed(&self, name: &str, msecs: u32, work: impl FnOnce() + Send + 'static) {
        let delay = Duration::from_millis(u64::from(msecs));
        self.enqueue(name, Some(delay), Box::new(work))
    }

    fn enqueue(&self, name: &str, delay: Option<Duration>, work: Work) {
        let id = {
            let mut pending = self.shared.pending.lock_irqsave();
            pending.count += 1;
            pending.next_id = pending.next_id.wrapping_add(1);
            pending.next_id
        };
        self.shared.waitq.trigger();

        let Some(name) = strdup(name) else {
            error!("Cannot allocate memory for work {}", name);
            self.shared.finish(id);
            return;
        };
        self.shared
            .pending
            .lock_irqsave()
            .names
            .push((id, name.clone()));
        debug!("Queueing work: {}", name);

        let item = Item {
            id,
            name,
            delay,
            work,
        };
        let sent = match &self.sender {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        };
        if !sent {
            error!("Work queue {} has no worker", self.shared.name);
            self.shared.finish(id);
        }
    }

    /// Returns the number of scheduled work items that haven't finished
    pub fn pending_count(&self) -> usize {
        self.shared.count()
    }

    /// Wait up to `msecs` milliseconds for all scheduled work to finish
    ///
    /// Returns the milliseconds that remained, or [`Error::TimedOut`].
    /// Returns right away when nothing is pending.
    pub fn wait_work_done(&self, msecs: u32) -> Result<u32, Error> {
        self.shared
            .waitq
            .wait_timeout(|| self.shared.count() == 0, msecs)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let pending = self.shared.pending.lock_irqsave();
            if pending.count != 0 {
                error!("Destroying work queue with pending work");
                for (_, _name) in &pending.names {
                    error!("Work {} still pending", _name);
                }
            }
        }
        // Let the worker finish what's queued, then exit
        self.sender = None;
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(shared: &Shared, receiver: mpsc::Receiver<Item>) {
    for item in receiver {
        if let Some(delay) = item.delay {
            thread::sleep(delay);
        }
        (item.work)();
        debug!("Work done: {}, context: {}", item.name, shared.name);
        shared.finish(item.id);
    }
}
