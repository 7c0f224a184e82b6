//! Control setup packets

use usb_device::UsbDirection;

use crate::platform::byteorder::{cpu_to_le16, read_le16};

/// The eight-byte SETUP packet that starts a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;

    /// Decode a packet as received from the bus
    pub fn parse(raw: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: read_le16(raw, 2),
            index: read_le16(raw, 4),
            length: read_le16(raw, 6),
        }
    }

    /// Encode the packet for the bus
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = cpu_to_le16(self.value);
        let index = cpu_to_le16(self.index);
        let length = cpu_to_le16(self.length);
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data phase
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }
}

#[cfg(test)]
mod tests {
    use super::SetupPacket;
    use usb_device::UsbDirection;

    #[test]
    fn get_descriptor() {
        let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::parse(&raw);
        assert_eq!(setup.request, 6);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
        assert_eq!(setup.direction(), UsbDirection::In);
        assert_eq!(setup.to_bytes(), raw);
    }

    #[test]
    fn set_address() {
        let raw = [0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = SetupPacket::parse(&raw);
        assert_eq!(setup.request, SetupPacket::SET_ADDRESS);
        assert_eq!(setup.value, 42);
        assert_eq!(setup.length, 0);
        assert_eq!(setup.direction(), UsbDirection::Out);
    }
}
