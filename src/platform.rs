//! Platform primitives
//!
//! The driver talks to the operating system only through this module:
//! allocation, strings, byte order, register access, time, locks, timers,
//! wait queues, tasklets, work queues, threads and DMA mapping. This
//! implementation is backed by the standard library.
//!
//! # Execution context
//!
//! Like a kernel, the platform distinguishes atomic context (a spinlock
//! is held, or a tasklet is running) from process context. Primitives
//! that may sleep call [`might_sleep`], which asserts, in debug builds,
//! that the caller isn't in atomic context.

pub mod byteorder;
pub mod dma;
pub mod mem;
pub mod reg;
pub mod string;
pub mod sync;
pub mod tasklet;
pub mod thread;
pub mod time;
pub mod timer;
pub mod waitq;
pub mod workq;

use std::cell::Cell;

thread_local! {
    static ATOMIC_DEPTH: Cell<u32> = const { Cell::new(0) };
    static SOFTIRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IRQS_DISABLED: Cell<bool> = const { Cell::new(false) };
}

/// Indicates if the caller is in atomic context
pub fn in_atomic() -> bool {
    ATOMIC_DEPTH.with(|depth| depth.get() != 0)
}

/// Indicates if the caller is running a tasklet
pub fn in_softirq() -> bool {
    SOFTIRQ_DEPTH.with(|depth| depth.get() != 0)
}

/// Indicates if interrupts are disabled for the caller
pub fn irqs_disabled() -> bool {
    IRQS_DISABLED.with(Cell::get)
}

/// Debug check for primitives that may sleep
///
/// # Panics
///
/// Panics in debug builds when called from atomic context.
#[track_caller]
pub fn might_sleep() {
    debug_assert!(!in_atomic(), "sleeping primitive used in atomic context");
}

/// Marks the caller as atomic until the guard drops
pub(crate) struct AtomicSection(());

impl AtomicSection {
    pub(crate) fn enter() -> Self {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get() + 1));
        AtomicSection(())
    }
}

impl Drop for AtomicSection {
    fn drop(&mut self) {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Run `f` as a tasklet would: atomic, in softirq context
pub(crate) fn softirq<R>(f: impl FnOnce() -> R) -> R {
    let _atomic = AtomicSection::enter();
    SOFTIRQ_DEPTH.with(|depth| depth.set(depth.get() + 1));
    struct Leave;
    impl Drop for Leave {
        fn drop(&mut self) {
            SOFTIRQ_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }
    let _leave = Leave;
    f()
}

/// Saved interrupt state, restored by [`local_irq_restore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(bool);

/// Disable interrupts for the caller, returning the previous state
pub fn local_irq_save() -> IrqFlags {
    IrqFlags(IRQS_DISABLED.with(|disabled| disabled.replace(true)))
}

/// Restore the interrupt state saved by [`local_irq_save`]
pub fn local_irq_restore(flags: IrqFlags) {
    IRQS_DISABLED.with(|disabled| disabled.set(flags.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_sections_nest() {
        assert!(!in_atomic());
        {
            let _outer = AtomicSection::enter();
            {
                let _inner = AtomicSection::enter();
                assert!(in_atomic());
            }
            assert!(in_atomic());
        }
        assert!(!in_atomic());
    }

    #[test]
    fn softirq_context() {
        assert!(!in_softirq());
        let inside = softirq(|| (in_softirq(), in_atomic()));
        assert_eq!(inside, (true, true));
        assert!(!in_softirq());
        assert!(!in_atomic());
    }

    #[test]
    fn irq_save_restore() {
        assert!(!irqs_disabled());
        let outer = local_irq_save();
        let inner = local_irq_save();
        assert!(irqs_disabled());
        local_irq_restore(inner);
        assert!(irqs_disabled());
        local_irq_restore(outer);
        assert!(!irqs_disabled());
    }
}
