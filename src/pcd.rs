//! Peripheral controller driver
//!
//! The PCD sits between a gadget driver (the USB function, above) and a
//! controller core (the register-level engine, below). The gadget driver
//! enables endpoints and queues [`Request`]s on a [`Device`]. The core
//! moves the data, then raises events on the `Device`: transfer
//! completion, setup packets, connect and disconnect, and the rest.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fh_otg_pcd::pcd::{Config, Core, Device, GadgetDriver, Request};
//! use fh_otg_pcd::platform::dma::HostDma;
//! use usb_device::endpoint::EndpointAddress;
//!
//! # fn example(core: impl Core + 'static, driver: Arc<dyn GadgetDriver>) -> Result<(), fh_otg_pcd::Error> {
//! let device = Device::new(Config::new().dma(true), core, HostDma::new())?;
//! device.register_driver(driver)?;
//!
//! let ep1in = device.endpoint_by_name("ep1in").unwrap();
//! let request = Request::new(vec![0; 64]).with_complete(|_device, _ep, request| {
//!     assert!(request.status().is_success());
//! });
//! device.queue(ep1in, request).map_err(|rejected| rejected.error)?;
//! # Ok(()) }
//! ```

mod bridge;
mod cil;
mod config;
mod device;
mod endpoint;
mod ep0;
mod gadget;
mod iso;
mod request;
mod setup;

#[cfg(test)]
mod testing;

pub use self::cil::{Core, EndpointConfig, IsoPacket, IsoParams, Transfer};
pub use self::config::Config;
pub use self::device::Device;
pub use self::endpoint::{EndpointDescriptor, EndpointFlags, Halt};
pub use self::ep0::{Ep0Event, Ep0State};
pub use self::gadget::GadgetDriver;
pub use self::iso::{IsoPacketDesc, IsoRequest, ProcessBufferFn};
pub use self::request::{CompleteFn, QueueError, Rejected, Request, RequestId};
pub use self::setup::SetupPacket;

use bitflags::bitflags;

/// Largest EP0 packet
pub const MAX_EP0_SIZE: u16 = 64;
/// Largest packet on any other endpoint
pub const MAX_PACKET_SIZE: u16 = 1024;
/// Largest transfer a single DMA descriptor moves
pub const DDMA_MAX_TRANSFER_SIZE: usize = 65535;
/// Endpoint channels, including EP0
pub const MAX_EPS_CHANNELS: usize = 16;
/// How long [`Device::wakeup`] drives resume signaling
pub const REMOTE_WAKEUP_SIGNAL_MS: u32 = 2;

/// USB link speed
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Speed {
    /// Not connected, or not yet enumerated
    #[default]
    Unknown,
    Low,
    Full,
    High,
}

/// USB 2.0 test modes, with their test selector values
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TestMode {
    J = 1,
    K = 2,
    SE0Nak = 3,
    Packet = 4,
    ForceEnable = 5,
}

impl TestMode {
    /// Decode a SET_FEATURE(TEST_MODE) selector
    pub const fn from_selector(selector: u8) -> Option<Self> {
        Some(match selector {
            1 => TestMode::J,
            2 => TestMode::K,
            3 => TestMode::SE0Nak,
            4 => TestMode::Packet,
            5 => TestMode::ForceEnable,
            _ => return None,
        })
    }
}

bitflags! {
    /// Host-granted device features
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OtgFlags: u8 {
        /// The host enabled HNP for this B-device
        const B_HNP_ENABLE = 1 << 0;
        /// The A-device port supports HNP
        const A_HNP_SUPPORT = 1 << 1;
        /// An alternate A-device port supports HNP
        const A_ALT_HNP_SUPPORT = 1 << 2;
        /// The host enabled remote wakeup
        const REMOTE_WAKEUP = 1 << 3;
    }
}

impl OtgFlags {
    /// The flags that [`Device::hnp_changed`] updates
    pub const HNP: Self = Self::B_HNP_ENABLE
        .union(Self::A_HNP_SUPPORT)
        .union(Self::A_ALT_HNP_SUPPORT);
}
