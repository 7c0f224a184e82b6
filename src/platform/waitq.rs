//! Abortable wait queues
//!
//! A task waits for a condition to become true. Another task re-evaluates
//! the waiters with [`WaitQueue::trigger`], cancels them with
//! [`WaitQueue::abort`], or interrupts them with [`WaitQueue::interrupt`].
//!
//! An abort reaches exactly the waiters that are blocked when it's raised.
//! When nobody is waiting, the abort stays pending and the next wait
//! consumes it. Either way, the abort is then gone: a later wait blocks
//! normally.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Error;

/// A signal delivered to blocked waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The interrupted call should be restarted
    Restart,
    /// The interrupted call should fail
    Interrupt,
}

impl From<Signal> for Error {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Restart => Error::Restarted,
            Signal::Interrupt => Error::Interrupted,
        }
    }
}

#[derive(Default)]
struct State {
    /// Blocked waiters
    waiters: usize,
    /// Bumped by every abort
    aborts: u64,
    /// An abort raised while nobody waited
    abort_pending: bool,
    /// Bumped by every signal
    signals: u64,
    signal: Option<Signal>,
}

/// A wait queue
#[derive(Default)]
pub struct WaitQueue {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// What a blocked waiter saw when it woke up
enum Woken {
    Condition,
    Aborted,
    Signaled(Signal),
    Spurious,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume an abort raised while nobody waited
    fn take_pending_abort(state: &mut State) -> Result<(), Error> {
        if state.abort_pending {
            state.abort_pending = false;
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    fn check(state: &State, aborts: u64, signals: u64, condition: &mut impl FnMut() -> bool) -> Woken {
        if state.aborts != aborts {
            Woken::Aborted
        } else if let (true, Some(signal)) = (state.signals != signals, state.signal) {
            Woken::Signaled(signal)
        } else if condition() {
            Woken::Condition
        } else {
            Woken::Spurious
        }
    }

    /// Block until `condition` returns true
    ///
    /// `condition` is evaluated with the queue's internal lock held, before
    /// blocking and after every trigger. Returns [`Error::Aborted`] if the
    /// queue is aborted, and the signal's error if the waiter is
    /// interrupted. An abort wins over a condition that's already true.
    pub fn wait(&self, mut condition: impl FnMut() -> bool) -> Result<(), Error> {
        super::might_sleep();
        let mut state = self.state();
        Self::take_pending_abort(&mut state)?;
        if condition() {
            return Ok(());
        }

        let (aborts, signals) = (state.aborts, state.signals);
        state.waiters += 1;
        let result = loop {
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            match Self::check(&state, aborts, signals, &mut condition) {
                Woken::Condition => break Ok(()),
                Woken::Aborted => break Err(Error::Aborted),
                Woken::Signaled(signal) => break Err(signal.into()),
                Woken::Spurious => continue,
            }
        };
        state.waiters -= 1;
        result
    }

    /// Block until `condition` returns true, or `msecs` milliseconds pass
    ///
    /// On success, returns the milliseconds that remained before the
    /// deadline. That's never less than one. If `condition` is already
    /// true, this returns right away with the full timeout. Returns
    /// [`Error::TimedOut`] once the deadline passes; never before.
    pub fn wait_timeout(&self, mut condition: impl FnMut() -> bool, msecs: u32) -> Result<u32, Error> {
        super::might_sleep();
        let deadline = Instant::now() + Duration::from_millis(u64::from(msecs));
        let mut state = self.state();
        Self::take_pending_abort(&mut state)?;
        if condition() {
            return Ok(msecs.max(1));
        }

        let (aborts, signals) = (state.aborts, state.signals);
        state.waiters += 1;
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::TimedOut);
            }
            state = self
                .wakeup
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            match Self::check(&state, aborts, signals, &mut condition) {
                Woken::Condition => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    break Ok(u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX).max(1));
                }
                Woken::Aborted => break Err(Error::Aborted),
                Woken::Signaled(signal) => break Err(signal.into()),
                Woken::Spurious => continue,
            }
        };
        state.waiters -= 1;
        result
    }

    /// Wake all waiters so they re-evaluate their conditions
    pub fn trigger(&self) {
        let _state = self.state();
        self.wakeup.notify_all();
    }

    /// Abort all waiters
    ///
    /// If nobody is waiting, the next wait returns [`Error::Aborted`].
    pub fn abort(&self) {
        let mut state = self.state();
        state.aborts = state.aborts.wrapping_add(1);
        if state.waiters == 0 {
            state.abort_pending = true;
        }
        self.wakeup.notify_all();
    }

    /// Interrupt the waiters that are blocked right now
    ///
    /// Unlike an abort, a signal doesn't stay pending.
    pub fn interrupt(&self, signal: Signal) {
        let mut state = self.state();
        state.signals = state.signals.wrapping_add(1);
        state.signal = Some(signal);
        self.wakeup.notify_all();
    }

    /// Returns the number of blocked waiters
    pub fn waiters(&self) -> usize {
        self.state().waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Spin until `count` waiters are blocked on `waitq`
    fn await_waiters(waitq: &WaitQueue, count: usize) {
        while waitq.waiters() != count {
            thread::yield_now();
        }
    }

    #[test]
    fn already_true() {
        let waitq = WaitQueue::new();
        assert_eq!(waitq.wait(|| true), Ok(()));
        let start = Instant::now();
        assert_eq!(waitq.wait_timeout(|| true, 10_000), Ok(10_000));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn already_true_zero_timeout_floors() {
        let waitq = WaitQueue::new();
        assert_eq!(waitq.wait_timeout(|| true, 0), Ok(1));
    }

    #[test]
    fn times_out_at_deadline() {
        let waitq = WaitQueue::new();
        let start = Instant::now();
        assert_eq!(waitq.wait_timeout(|| false, 100), Err(Error::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn trigger_wakes_on_condition() {
        let waitq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (waitq, flag) = (Arc::clone(&waitq), Arc::clone(&flag));
            thread::spawn(move || waitq.wait_timeout(|| flag.load(Ordering::SeqCst), 10_000))
        };
        await_waiters(&waitq, 1);
        // A trigger without the condition keeps the waiter blocked
        waitq.trigger();
        flag.store(true, Ordering::SeqCst);
        waitq.trigger();
        let remaining = waiter.join().unwrap().unwrap();
        assert!((1..=10_000).contains(&remaining));
    }

    #[test]
    fn pending_abort_is_single_shot() {
        let waitq = WaitQueue::new();
        waitq.abort();
        assert_eq!(waitq.wait(|| true), Err(Error::Aborted));
        // Consumed, so the next wait blocks normally
        assert_eq!(waitq.wait_timeout(|| false, 20), Err(Error::TimedOut));
        assert_eq!(waitq.wait(|| true), Ok(()));
    }

    #[test]
    fn abort_reaches_every_present_waiter() {
        let waitq = Arc::new(WaitQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let waitq = Arc::clone(&waitq);
                thread::spawn(move || waitq.wait(|| false))
            })
            .collect();
        await_waiters(&waitq, 3);
        waitq.abort();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(Error::Aborted));
        }
        // Everybody present consumed it
        assert_eq!(waitq.wait(|| true), Ok(()));
    }

    #[test]
    fn signals() {
        let waitq = Arc::new(WaitQueue::new());
        for (signal, expected) in [
            (Signal::Restart, Error::Restarted),
            (Signal::Interrupt, Error::Interrupted),
        ] {
            let waiter = {
                let waitq = Arc::clone(&waitq);
                thread::spawn(move || waitq.wait(|| false))
            };
            await_waiters(&waitq, 1);
            waitq.interrupt(signal);
            assert_eq!(waiter.join().unwrap(), Err(expected));
            await_waiters(&waitq, 0);
        }
        // Signals don't stay pending
        assert_eq!(waitq.wait(|| true), Ok(()));
    }
}
