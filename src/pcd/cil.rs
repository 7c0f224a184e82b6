//! The controller core interface
//!
//! The [`Core`] trait is what the driver asks of the register-level
//! engine. The core answers asynchronously, by raising events on the
//! [`Device`](super::Device).

use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

use super::{RequestId, TestMode};
use crate::error::Error;
use crate::platform::dma::DmaAddr;

/// One request's transfer, as handed to the core
pub struct Transfer<'a> {
    /// Reported back in [`Device::complete`](super::Device::complete)
    pub id: RequestId,
    /// Device address of `buf`; [`DmaAddr::INVALID`] in slave mode
    pub dma: DmaAddr,
    /// The bytes to send, or the space to receive into
    pub buf: &'a mut [u8],
    pub length: usize,
    /// End with a zero length packet when `length` is a multiple of the
    /// max packet size
    pub zero: bool,
}

/// Endpoint programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet: u16,
    pub interval: u8,
}

/// Isochronous stream programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoParams {
    pub dma0: DmaAddr,
    pub dma1: DmaAddr,
    pub sync_frame: u32,
    pub data_pattern_frame: u32,
    pub data_per_frame: u32,
    /// `None` to start as soon as possible
    pub start_frame: Option<u32>,
    /// Frames between buffer completions
    pub interval: u32,
    /// Packets per buffer
    pub packets: usize,
}

/// One isochronous packet's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub status: Result<(), Error>,
    pub actual: u32,
    pub offset: u32,
}

/// The register-level controller engine
///
/// The device calls into the core with its lock held. Implementations
/// must not sleep, and must not call back into the device.
pub trait Core: Send {
    /// Program an endpoint for its type and max packet size
    fn ep_activate(&mut self, config: &EndpointConfig) -> Result<(), Error>;

    /// Stop an endpoint
    fn ep_deactivate(&mut self, address: EndpointAddress);

    /// Start a transfer
    ///
    /// The core later reports [`Device::complete`](super::Device::complete)
    /// with the transfer's `id`.
    fn start_transfer(&mut self, address: EndpointAddress, transfer: Transfer<'_>);

    /// Abandon the endpoint's active transfer
    fn stop_transfer(&mut self, address: EndpointAddress);

    /// Run the zero length status stage of a control transfer
    ///
    /// The core later reports
    /// [`Device::ep0_status_complete`](super::Device::ep0_status_complete).
    fn ep0_status(&mut self, direction: UsbDirection);

    /// Set or clear an endpoint stall
    fn set_stall(&mut self, address: EndpointAddress, stall: bool) -> Result<(), Error>;

    /// Start an isochronous stream
    fn iso_start(&mut self, address: EndpointAddress, params: &IsoParams) -> Result<(), Error>;

    /// Stop an isochronous stream
    fn iso_stop(&mut self, address: EndpointAddress);

    /// The result of packet `index` in isochronous buffer `buffer`
    fn iso_packet(&mut self, address: EndpointAddress, buffer: usize, index: usize) -> IsoPacket;

    /// The current (micro)frame number
    fn frame_number(&self) -> u16;

    /// Drive resume signaling
    fn set_remote_wakeup_signal(&mut self, signal: bool);

    /// Soft disconnect from the bus
    fn set_soft_disconnect(&mut self, disconnect: bool);

    /// Enter a USB test mode, or `None` to leave it
    fn set_test_mode(&mut self, mode: Option<TestMode>);
}
