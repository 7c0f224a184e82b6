//! Spinlocks and mutexes
//!
//! A [`SpinLock`] never sleeps. Holding one puts the caller in atomic
//! context, and [`SpinLock::lock_irqsave`] additionally masks interrupts
//! for the caller until the guard drops. A [`Mutex`] may sleep, and so
//! it's for process context only.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::{local_irq_restore, local_irq_save, mem, AtomicSection, IrqFlags};

/// A spinning lock that tracks atomic context
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Allocate a spinlock on the heap
    ///
    /// Returns `None`, and logs, when memory runs out.
    pub fn alloc(data: T) -> Option<Box<Self>> {
        let lock = mem::try_box(Self::new(data));
        if lock.is_none() {
            error!("Cannot allocate memory for spinlock");
        }
        lock
    }

    /// Acquire the lock
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let atomic = AtomicSection::enter();
        SpinLockGuard {
            guard: self.inner.lock(),
            _irq: None,
            _atomic: atomic,
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock with interrupts masked
    ///
    /// Use this variant for state that's shared with an interrupt
    /// handler. The previous interrupt state is restored when the guard
    /// drops.
    pub fn lock_irqsave(&self) -> SpinLockGuard<'_, T> {
        let irq = IrqRestore(local_irq_save());
        let atomic = AtomicSection::enter();
        SpinLockGuard {
            guard: self.inner.lock(),
            _irq: Some(irq),
            _atomic: atomic,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let atomic = AtomicSection::enter();
        let guard = self.inner.try_lock()?;
        Some(SpinLockGuard {
            guard,
            _irq: None,
            _atomic: atomic,
            _not_send: PhantomData,
        })
    }

    /// Consume the lock, returning the data
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

struct IrqRestore(IrqFlags);

impl Drop for IrqRestore {
    fn drop(&mut self) {
        local_irq_restore(self.0);
    }
}

/// Guard for a held spinlock
///
/// Dropping the guard unlocks, then restores interrupts, then leaves
/// atomic context.
pub struct SpinLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: Option<IrqRestore>,
    _atomic: AtomicSection,
    // Context tracking is per thread
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A sleeping mutex
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

/// Guard for a held [`Mutex`]
pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(data),
        }
    }

    /// Allocate a mutex on the heap
    ///
    /// Returns `None`, and logs, when memory runs out.
    pub fn alloc(data: T) -> Option<Box<Self>> {
        let mutex = mem::try_box(Self::new(data));
        if mutex.is_none() {
            error!("Cannot allocate memory for mutex");
        }
        mutex
    }

    /// Acquire the mutex, sleeping until it's available
    ///
    /// A panic while the mutex was held doesn't poison it for others.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        super::might_sleep();
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Try to acquire the mutex without sleeping
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{in_atomic, irqs_disabled};
    use std::sync::Arc;

    #[test]
    fn spinlock_is_atomic_context() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            assert!(in_atomic());
            assert!(!irqs_disabled());
            *guard += 1;
        }
        assert!(!in_atomic());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn irqsave_restores() {
        let lock = SpinLock::new(());
        {
            let _guard = lock.lock_irqsave();
            assert!(irqs_disabled());
            assert!(in_atomic());
        }
        assert!(!irqs_disabled());
        assert!(!in_atomic());
    }

    #[test]
    fn spinlock_try_lock() {
        let lock = SpinLock::new(0);
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
        assert!(!in_atomic());
    }

    #[test]
    fn nested_irqsave_restores_outer_state() {
        let outer = SpinLock::new(());
        let inner = SpinLock::new(());
        let outer_guard = outer.lock_irqsave();
        {
            let _inner_guard = inner.lock_irqsave();
            assert!(irqs_disabled());
        }
        assert!(irqs_disabled());
        assert!(in_atomic());
        drop(outer_guard);
        assert!(!irqs_disabled());
        assert!(!in_atomic());
    }

    #[test]
    fn failed_try_lock_leaves_atomic_context() {
        let lock = SpinLock::new(3);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!in_atomic());
        assert_eq!(lock.into_inner(), 3);
    }

    #[test]
    fn spinlock_contention() {
        let lock = Arc::new(SpinLock::new(0u32));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock_irqsave() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn allocated() {
        let lock = SpinLock::alloc(7u8).unwrap();
        assert_eq!(*lock.lock(), 7);
        let mutex = Mutex::alloc(String::from("fh")).unwrap();
        assert_eq!(*mutex.lock(), "fh");
    }

    #[test]
    fn mutex_try_lock() {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "atomic context")]
    fn mutex_in_atomic_context() {
        let lock = SpinLock::new(());
        let mutex = Mutex::new(());
        let _spin = lock.lock();
        let _sleeping = mutex.lock();
    }
}
