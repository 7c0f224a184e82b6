//! Re-exporting the RAL register macros
//!
//! The macros work on any register block whose registers have `read` and
//! `write` methods, and whose fields are described by `offset` / `mask`
//! modules. See [`crate::regs`] for the device registers.

pub use ral_registers::{modify_reg, read_reg, write_reg};
