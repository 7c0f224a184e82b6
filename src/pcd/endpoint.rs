//! Endpoints, and the per-type transfer operations
//!
//! Each endpoint type has its own [`TransferOps`]: control endpoints
//! follow the EP0 state machine, bulk and interrupt endpoints queue
//! requests, and isochronous endpoints stream through
//! [`Device::iso_start`](super::Device::iso_start) instead.

use bitflags::bitflags;
use usb_device::endpoint::{
    EndpointAddress, EndpointType, IsochronousSynchronizationType, IsochronousUsageType,
};

use super::cil::{Core, EndpointConfig};
use super::ep0::{Ep0Event, Ep0State};
use super::iso::IsoStream;
use super::request::{RequestId, RequestQueue};
use super::MAX_PACKET_SIZE;
use crate::error::Error;
use crate::platform::byteorder::read_le16;

const DESCRIPTOR_LEN: usize = 7;
const DESCRIPTOR_TYPE_ENDPOINT: u8 = 5;

/// The parts of an endpoint descriptor the driver uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const fn new(
        address: EndpointAddress,
        kind: EndpointType,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        EndpointDescriptor {
            address,
            kind,
            max_packet_size,
            interval,
        }
    }

    /// Decode a standard endpoint descriptor
    ///
    /// Returns [`Error::InvalidArgument`] for anything that isn't one.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < DESCRIPTOR_LEN
            || usize::from(raw[0]) < DESCRIPTOR_LEN
            || raw[1] != DESCRIPTOR_TYPE_ENDPOINT
        {
            return Err(Error::InvalidArgument);
        }
        let attributes = raw[3];
        let kind = match attributes & 0b11 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous {
                synchronization: match (attributes >> 2) & 0b11 {
                    0 => IsochronousSynchronizationType::NoSynchronization,
                    1 => IsochronousSynchronizationType::Asynchronous,
                    2 => IsochronousSynchronizationType::Adaptive,
                    _ => IsochronousSynchronizationType::Synchronous,
                },
                usage: match (attributes >> 4) & 0b11 {
                    0 => IsochronousUsageType::Data,
                    1 => IsochronousUsageType::Feedback,
                    2 => IsochronousUsageType::ImplicitFeedbackData,
                    _ => return Err(Error::InvalidArgument),
                },
            },
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        };
        Ok(EndpointDescriptor {
            address: EndpointAddress::from(raw[2]),
            kind,
            // Bits 11 and 12 count extra high-bandwidth transactions
            max_packet_size: read_le16(raw, 4) & 0x7FF,
            interval: raw[6],
        })
    }
}

bitflags! {
    /// Endpoint status
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointFlags: u8 {
        /// Halted, or not enabled
        const STOPPED = 1 << 0;
        /// Being disabled; refuses new requests
        const DISABLING = 1 << 1;
        /// Transfers use DMA
        const DMA = 1 << 2;
        /// A transfer start waits for the start-transfer tasklet
        const QUEUE_SOF = 1 << 3;
        /// The halt survives a clear-halt
        const WEDGED = 1 << 4;
    }
}

/// Halt requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Halt {
    /// Clear the halt, unless wedged
    Clear = 0,
    /// Halt the endpoint
    Set = 1,
    /// Halt the endpoint, and drop the wedge
    Unwedge = 2,
    /// Halt the endpoint so that only an unwedge or reset clears it
    Wedge = 3,
}

impl Halt {
    pub const fn from_value(value: u8) -> Option<Self> {
        Some(match value {
            0 => Halt::Clear,
            1 => Halt::Set,
            2 => Halt::Unwedge,
            3 => Halt::Wedge,
            _ => return None,
        })
    }
}

/// An endpoint and its request queue
pub(crate) struct Endpoint {
    pub(crate) address: EndpointAddress,
    pub(crate) name: String,
    /// `None` while disabled
    pub(crate) desc: Option<EndpointDescriptor>,
    pub(crate) flags: EndpointFlags,
    pub(crate) queue: RequestQueue,
    /// The request the core is working on
    pub(crate) active: Option<RequestId>,
    pub(crate) iso: Option<IsoStream>,
}

impl Endpoint {
    pub(crate) fn new(address: EndpointAddress, name: String) -> Self {
        Endpoint {
            address,
            name,
            desc: None,
            flags: EndpointFlags::STOPPED,
            queue: RequestQueue::default(),
            active: None,
            iso: None,
        }
    }

    /// EP0, always enabled
    pub(crate) fn control(max_packet: u16, name: String) -> Self {
        let address = EndpointAddress::from(0);
        Endpoint {
            desc: Some(EndpointDescriptor::new(
                address,
                EndpointType::Control,
                max_packet,
                0,
            )),
            flags: EndpointFlags::empty(),
            ..Endpoint::new(address, name)
        }
    }

    pub(crate) fn kind(&self) -> Option<EndpointType> {
        self.desc.map(|desc| desc.kind)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.desc.is_some()
    }

    /// The operations for the endpoint's type
    pub(crate) fn ops(&self) -> Option<&'static dyn TransferOps> {
        self.kind().map(ops)
    }
}

/// What the transfer operations work on
pub(crate) struct Parts<'a> {
    pub(crate) core: &'a mut dyn Core,
    pub(crate) ep: &'a mut Endpoint,
    pub(crate) ep0: &'a mut Ep0State,
}

/// Type-specific endpoint behavior
///
/// The device handles what all types share, like flushing queues and
/// completing requests. These methods accept or refuse the operation,
/// and program the core.
pub(crate) trait TransferOps: Sync {
    fn enable(&self, parts: Parts<'_>, desc: &EndpointDescriptor) -> Result<(), Error>;
    fn disable(&self, parts: Parts<'_>) -> Result<(), Error>;
    /// Accept (or refuse) a new request
    fn queue(&self, parts: Parts<'_>) -> Result<(), Error>;
    /// Accept (or refuse) removing request `id`, stopping it if active
    fn dequeue(&self, parts: Parts<'_>, id: RequestId) -> Result<(), Error>;
    fn halt(&self, parts: Parts<'_>, halt: Halt) -> Result<(), Error>;
}

/// EP0
struct Control;
/// Bulk and interrupt endpoints
struct Standard;
struct Isochronous;

/// The operations for `kind`
pub(crate) fn ops(kind: EndpointType) -> &'static dyn TransferOps {
    match kind {
        EndpointType::Control => &Control,
        EndpointType::Bulk | EndpointType::Interrupt => &Standard,
        EndpointType::Isochronous { .. } => &Isochronous,
    }
}

fn check_descriptor(ep: &Endpoint, desc: &EndpointDescriptor) -> Result<(), Error> {
    if desc.address != ep.address {
        warn!("{}: descriptor for {:?}", ep.name, desc.address);
        return Err(Error::InvalidArgument);
    }
    if desc.max_packet_size == 0 || desc.max_packet_size > MAX_PACKET_SIZE {
        warn!("{}: bad max packet size {}", ep.name, desc.max_packet_size);
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn activate(parts: Parts<'_>, desc: &EndpointDescriptor) -> Result<(), Error> {
    check_descriptor(parts.ep, desc)?;
    parts.core.ep_activate(&EndpointConfig {
        address: desc.address,
        kind: desc.kind,
        max_packet: desc.max_packet_size,
        interval: desc.interval,
    })?;
    parts.ep.desc = Some(*desc);
    parts.ep.flags.remove(
        EndpointFlags::STOPPED | EndpointFlags::DISABLING | EndpointFlags::WEDGED,
    );
    debug!("Enabled {} {:?}", parts.ep.name, desc.kind);
    Ok(())
}

fn deactivate(parts: Parts<'_>) {
    parts.core.ep_deactivate(parts.ep.address);
    parts.ep.desc = None;
    parts.ep.active = None;
    parts.ep.flags = EndpointFlags::STOPPED;
    debug!("Disabled {}", parts.ep.name);
}

/// Set or clear a stall, honoring wedges
fn stall(parts: Parts<'_>, halt: Halt) -> Result<(), Error> {
    let ep = parts.ep;
    if halt != Halt::Clear && !ep.queue.is_empty() {
        warn!("{}: halt with {} requests queued", ep.name, ep.queue.len());
        return Err(Error::Again);
    }
    match halt {
        Halt::Clear if ep.flags.contains(EndpointFlags::WEDGED) => {
            debug!("{}: wedged, halt stays", ep.name);
            return Ok(());
        }
        Halt::Clear => {
            parts.core.set_stall(ep.address, false)?;
            ep.flags.remove(EndpointFlags::STOPPED);
            return Ok(());
        }
        Halt::Set => {}
        Halt::Unwedge => ep.flags.remove(EndpointFlags::WEDGED),
        Halt::Wedge => ep.flags.insert(EndpointFlags::WEDGED),
    }
    parts.core.set_stall(ep.address, true)?;
    ep.flags.insert(EndpointFlags::STOPPED);
    Ok(())
}

impl TransferOps for Control {
    fn enable(&self, _: Parts<'_>, _: &EndpointDescriptor) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn disable(&self, _: Parts<'_>) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn queue(&self, parts: Parts<'_>) -> Result<(), Error> {
        if parts.ep0.data_direction().is_none() {
            warn!("EP0 request outside a data phase: {:?}", parts.ep0);
            return Err(Error::InvalidArgument);
        }
        if !parts.ep.queue.is_empty() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn dequeue(&self, parts: Parts<'_>, id: RequestId) -> Result<(), Error> {
        if parts.ep.active == Some(id) {
            if let Some(direction) = parts.ep0.data_direction() {
                parts
                    .core
                    .stop_transfer(EndpointAddress::from_parts(0, direction));
            }
            parts.ep.active = None;
        }
        Ok(())
    }

    fn halt(&self, parts: Parts<'_>, halt: Halt) -> Result<(), Error> {
        let event = match halt {
            Halt::Clear | Halt::Unwedge => Ep0Event::ClearHalt,
            Halt::Set | Halt::Wedge => Ep0Event::Stall,
        };
        let next = parts.ep0.next(event)?;
        // EP0 stalls never wedge
        let halt = match halt {
            Halt::Wedge => Halt::Set,
            Halt::Unwedge => Halt::Clear,
            halt => halt,
        };
        stall(
            Parts {
                core: &mut *parts.core,
                ep: &mut *parts.ep,
                ep0: &mut *parts.ep0,
            },
            halt,
        )?;
        *parts.ep0 = next;
        Ok(())
    }
}

impl TransferOps for Standard {
    fn enable(&self, parts: Parts<'_>, desc: &EndpointDescriptor) -> Result<(), Error> {
        activate(parts, desc)
    }

    fn disable(&self, parts: Parts<'_>) -> Result<(), Error> {
        deactivate(parts);
        Ok(())
    }

    fn queue(&self, parts: Parts<'_>) -> Result<(), Error> {
        if parts.ep.flags.contains(EndpointFlags::DISABLING) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn dequeue(&self, parts: Parts<'_>, id: RequestId) -> Result<(), Error> {
        if parts.ep.active == Some(id) {
            parts.core.stop_transfer(parts.ep.address);
            parts.ep.active = None;
        }
        Ok(())
    }

    fn halt(&self, parts: Parts<'_>, halt: Halt) -> Result<(), Error> {
        stall(parts, halt)
    }
}

impl TransferOps for Isochronous {
    fn enable(&self, parts: Parts<'_>, desc: &EndpointDescriptor) -> Result<(), Error> {
        let ep = &mut *parts.ep;
        activate(
            Parts {
                core: parts.core,
                ep: &mut *ep,
                ep0: parts.ep0,
            },
            desc,
        )?;
        ep.iso = Some(IsoStream::default());
        Ok(())
    }

    fn disable(&self, parts: Parts<'_>) -> Result<(), Error> {
        if let Some(stream) = parts.ep.iso.take() {
            if stream.is_running() {
                parts.core.iso_stop(parts.ep.address);
            }
        }
        deactivate(parts);
        Ok(())
    }

    fn queue(&self, parts: Parts<'_>) -> Result<(), Error> {
        warn!("{}: isochronous endpoints stream, use iso_start", parts.ep.name);
        Err(Error::InvalidArgument)
    }

    fn dequeue(&self, _: Parts<'_>, _: RequestId) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn halt(&self, _: Parts<'_>, _: Halt) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }
}
