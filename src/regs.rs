//! Device mode registers
//!
//! The module implements a RAL-compatible interface for the OTG core's
//! device configuration, control and status registers. Controller cores
//! use it to answer the driver's soft-disconnect, remote wakeup, frame
//! number and test mode requests.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::pcd::{Speed, TestMode};
use crate::platform::reg::Register;
use crate::ral;

/// Device configuration, control and status
#[repr(C)]
pub struct DeviceRegisters {
    pub DCFG: Register<u32>,
    pub DCTL: Register<u32>,
    pub DSTS: Register<u32>,
}

impl DeviceRegisters {
    pub const fn new() -> Self {
        DeviceRegisters {
            DCFG: Register::new(0),
            DCTL: Register::new(0),
            DSTS: Register::new(0),
        }
    }

    /// Drive (or stop driving) resume signaling on the bus
    pub fn set_remote_wakeup_signal(&self, signal: bool) {
        ral::modify_reg!(crate::regs, self, DCTL, RMTWKUPSIG: signal as u32);
    }

    /// Indicates that resume signaling is active
    pub fn remote_wakeup_signal(&self) -> bool {
        ral::read_reg!(crate::regs, self, DCTL, RMTWKUPSIG == 1)
    }

    /// Disconnect from (or reconnect to) the bus, in software
    pub fn set_soft_disconnect(&self, disconnect: bool) {
        ral::modify_reg!(crate::regs, self, DCTL, SFTDISCON: disconnect as u32);
    }

    /// Indicates a software disconnect
    pub fn soft_disconnected(&self) -> bool {
        ral::read_reg!(crate::regs, self, DCTL, SFTDISCON == 1)
    }

    /// Select a USB test mode, or `None` for normal operation
    pub fn set_test_mode(&self, mode: Option<TestMode>) {
        let selector = mode.map_or(0, |mode| mode as u32);
        ral::modify_reg!(crate::regs, self, DCTL, TSTCTL: selector);
    }

    /// The selected test mode
    pub fn test_mode(&self) -> Option<TestMode> {
        TestMode::from_selector(ral::read_reg!(crate::regs, self, DCTL, TSTCTL) as u8)
    }

    /// The frame number of the last received SOF
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(crate::regs, self, DSTS, SOFFN) as u16
    }

    /// Indicates that the bus is suspended
    pub fn suspended(&self) -> bool {
        ral::read_reg!(crate::regs, self, DSTS, SUSPSTS == 1)
    }

    /// The speed the core enumerated at
    pub fn enumerated_speed(&self) -> Speed {
        match ral::read_reg!(crate::regs, self, DSTS, ENUMSPD) {
            DSTS::ENUMSPD::RW::HIGH_30_60 => Speed::High,
            DSTS::ENUMSPD::RW::LOW_6 => Speed::Low,
            _ => Speed::Full,
        }
    }

    /// Set the address assigned by the host
    pub fn set_address(&self, address: u8) {
        ral::modify_reg!(crate::regs, self, DCFG, DEVADDR: u32::from(address));
    }
}

impl Default for DeviceRegisters {
    fn default() -> Self {
        Self::new()
    }
}

pub mod DCFG {
    pub mod DEVSPD {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DEVADDR {
        pub const offset: u32 = 4;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod DCTL {
    pub mod RMTWKUPSIG {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod SFTDISCON {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TSTCTL {
        pub const offset: u32 = 4;
        pub const mask: u32 = 0x7 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod DSTS {
    pub mod SUSPSTS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ENUMSPD {
        pub const offset: u32 = 1;
        pub const mask: u32 = 0x3 << offset;
        pub mod RW {
            pub const HIGH_30_60: u32 = 0;
            pub const FULL_30_60: u32 = 1;
            pub const LOW_6: u32 = 2;
            pub const FULL_48: u32 = 3;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod SOFFN {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0x3FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}
