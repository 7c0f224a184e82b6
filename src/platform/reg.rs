//! Register access
//!
//! [`Register`] is a volatile cell that conforms to the RAL's register API,
//! so the `ral-registers` macros work on register blocks built from it.
//! The free functions are the read / write / modify primitives used by
//! controller cores.

use core::cell::UnsafeCell;
use core::ops::{BitAnd, BitOr, Not};

/// A memory mapped register
#[repr(transparent)]
pub struct Register<T>(UnsafeCell<T>);

impl<T> Register<T> {
    pub const fn new(value: T) -> Self {
        Register(UnsafeCell::new(value))
    }
}

impl<T: Copy> Register<T> {
    pub fn read(&self) -> T {
        // Safety: the pointer comes from a live UnsafeCell.
        unsafe { self.0.get().read_volatile() }
    }

    pub fn write(&self, value: T) {
        // Safety: the pointer comes from a live UnsafeCell.
        unsafe { self.0.get().write_volatile(value) }
    }
}

/// Read a 32 bit register
pub fn read_reg32(reg: &Register<u32>) -> u32 {
    reg.read()
}

/// Write a 32 bit register
pub fn write_reg32(reg: &Register<u32>, value: u32) {
    reg.write(value)
}

/// Read, clear the `clear` bits, set the `set` bits, then write back
pub fn modify_reg32(reg: &Register<u32>, clear: u32, set: u32) {
    modify(reg, clear, set)
}

/// Read a 16 bit register
pub fn read_reg16(reg: &Register<u16>) -> u16 {
    reg.read()
}

/// Write a 16 bit register
pub fn write_reg16(reg: &Register<u16>, value: u16) {
    reg.write(value)
}

/// Read, clear the `clear` bits, set the `set` bits, then write back
pub fn modify_reg16(reg: &Register<u16>, clear: u16, set: u16) {
    modify(reg, clear, set)
}

fn modify<T>(reg: &Register<T>, clear: T, set: T)
where
    T: Copy + Not<Output = T> + BitAnd<Output = T> + BitOr<Output = T>,
{
    reg.write((reg.read() & !clear) | set)
}
