//! Device configuration

use super::{Speed, MAX_EP0_SIZE};
use crate::error::Error;

/// Most IN (or OUT) endpoints, besides EP0
pub const MAX_ENDPOINTS: usize = 7;
/// Largest best effort service latency (BESL) value
pub const MAX_BESL: u8 = 15;

/// Device bring-up configuration
///
/// Use the `const` setters to build a configuration, then hand it to
/// [`Device::new`](super::Device::new).
///
/// ```
/// use fh_otg_pcd::pcd::{Config, Speed};
///
/// const CONFIG: Config = Config::new()
///     .dma(true)
///     .endpoints(2, 2)
///     .max_speed(Speed::High);
/// assert!(CONFIG.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub(crate) dma: bool,
    pub(crate) in_endpoints: usize,
    pub(crate) out_endpoints: usize,
    pub(crate) max_speed: Speed,
    pub(crate) otg: bool,
    pub(crate) ep0_max_packet: u16,
    pub(crate) defer_dma_start: bool,
    pub(crate) lpm: bool,
    pub(crate) besl: bool,
    pub(crate) baseline_besl: u8,
    pub(crate) deep_besl: u8,
}

impl Config {
    /// Slave mode, one IN and one OUT endpoint, high speed
    pub const fn new() -> Self {
        Config {
            dma: false,
            in_endpoints: 1,
            out_endpoints: 1,
            max_speed: Speed::High,
            otg: false,
            ep0_max_packet: MAX_EP0_SIZE,
            defer_dma_start: false,
            lpm: false,
            besl: false,
            baseline_besl: 0,
            deep_besl: 0,
        }
    }

    /// Use DMA for transfers
    pub const fn dma(mut self, dma: bool) -> Self {
        self.dma = dma;
        self
    }

    /// Number of IN and OUT endpoints, besides EP0
    ///
    /// IN endpoint `i` (from zero) has number `2i + 1`. OUT endpoint `i`
    /// has number `2i + 2`.
    pub const fn endpoints(mut self, ins: usize, outs: usize) -> Self {
        self.in_endpoints = ins;
        self.out_endpoints = outs;
        self
    }

    /// The fastest speed the controller supports
    pub const fn max_speed(mut self, speed: Speed) -> Self {
        self.max_speed = speed;
        self
    }

    /// The controller is OTG capable
    pub const fn otg(mut self, otg: bool) -> Self {
        self.otg = otg;
        self
    }

    /// EP0 max packet size
    pub const fn ep0_max_packet(mut self, size: u16) -> Self {
        self.ep0_max_packet = size;
        self
    }

    /// Start a DMA endpoint's first transfer from the start-transfer
    /// tasklet, not from the caller
    pub const fn defer_dma_start(mut self, defer: bool) -> Self {
        self.defer_dma_start = defer;
        self
    }

    /// The core supports link power management
    pub const fn lpm(mut self, lpm: bool) -> Self {
        self.lpm = lpm;
        self
    }

    /// The core reports best effort service latency in LPM
    ///
    /// `baseline` and `deep` are the BESL values the device advertises,
    /// up to [`MAX_BESL`]. BESL needs LPM.
    pub const fn besl(mut self, besl: bool, baseline: u8, deep: u8) -> Self {
        self.besl = besl;
        self.baseline_besl = baseline;
        self.deep_besl = deep;
        self
    }

    /// Check the configuration
    pub const fn validate(&self) -> Result<(), Error> {
        if self.in_endpoints > MAX_ENDPOINTS || self.out_endpoints > MAX_ENDPOINTS {
            return Err(Error::InvalidArgument);
        }
        if !matches!(self.ep0_max_packet, 8 | 16 | 32 | 64) {
            return Err(Error::InvalidArgument);
        }
        if matches!(self.max_speed, Speed::Unknown) {
            return Err(Error::InvalidArgument);
        }
        if self.besl && !self.lpm {
            return Err(Error::InvalidArgument);
        }
        if self.baseline_besl > MAX_BESL || self.deep_besl > MAX_BESL {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) const fn in_number(index: usize) -> u8 {
        (2 * index + 1) as u8
    }

    pub(crate) const fn out_number(index: usize) -> u8 {
        (2 * index + 2) as u8
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
