//! A peripheral controller driver for FH OTG USB controllers
//!
//! `fh-otg-pcd` sits between a USB gadget driver and the controller's
//! register-level core. The crate has three parts:
//!
//! - [`platform`], the primitives the driver builds on: allocation,
//!   locks, timers, wait queues, tasklets, work queues, threads and DMA
//!   mapping. They're backed by the standard library, and track atomic
//!   context the way a kernel does.
//! - [`pcd`], the driver. It owns the endpoints and their request
//!   queues, runs the EP0 control state machine, and hands completed
//!   requests back to the gadget driver.
//! - [`regs`], the device mode registers, for controller cores.
//!
//! [`spi`] describes the SoC's SPI controller for board code.
//!
//! Enable the hidden `__log` feature to route diagnostics through the
//! [`log`](https://crates.io/crates/log) facade.

#[macro_use]
mod log;

mod ral;

pub mod error;
pub mod pcd;
pub mod platform;
pub mod regs;
pub mod spi;

pub use error::{Error, Status};
