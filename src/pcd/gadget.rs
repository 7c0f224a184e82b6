//! The gadget driver interface

use usb_device::device::UsbDeviceState;

use super::{Device, SetupPacket, Speed};
use crate::error::Error;

/// A USB function, bound to a [`Device`]
///
/// The device calls these methods without its lock held, so
/// implementations may call back into the device.
pub trait GadgetDriver: Send + Sync {
    /// The driver's name, for diagnostics
    fn name(&self) -> &str {
        "gadget"
    }

    /// The fastest speed the driver supports
    ///
    /// [`Speed::Unknown`] is rejected at registration.
    fn max_speed(&self) -> Speed;

    /// Called once at registration
    ///
    /// An error fails the registration.
    fn bind(&self, device: &Device) -> Result<(), Error>;

    /// Called once at unregistration or teardown
    fn unbind(&self, device: &Device);

    /// Handle a control request that the device doesn't
    ///
    /// Return [`Error::NotSupported`] for requests the driver doesn't
    /// know. Any error stalls EP0.
    fn setup(&self, device: &Device, setup: &SetupPacket) -> Result<(), Error>;

    /// The host went away
    fn disconnect(&self, device: &Device);

    /// The bus suspended
    fn suspend(&self, _device: &Device) {}

    /// The bus resumed
    fn resume(&self, _device: &Device) {}

    /// The device changed state
    ///
    /// Called from the device's work queue, after
    /// [`Device::set_gadget_state`].
    fn state_changed(&self, _device: &Device, _state: UsbDeviceState) {}
}
