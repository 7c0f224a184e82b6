//! SPI controller platform data
//!
//! Board configuration for the on-chip SPI master. There's no driver
//! here; the block only describes the controller to whoever drives it.
//! Several fields are enables that take a magic value, and read as
//! disabled for anything else.

/// Chip selects per controller
pub const MAX_SLAVES: usize = 2;
/// [`PlatformData::dma_transfer_enable`] value that enables DMA
pub const TRANSFER_USE_DMA: u32 = 0x7788_8877;
/// DMA receives only
pub const RX_ONLY: u32 = 0x30;
/// DMA transmits and receives
pub const TX_RX: u32 = 0x31;
/// [`PlatformData::data_increase_support`] enable value
pub const INC_SUPPORT: u32 = 0x55;
/// [`PlatformData::swap_support`] enable value
pub const SWAP_SUPPORT: u32 = 0x55;
/// [`PlatformData::dma_protctl_enable`] enable value
pub const PROTCTL_ENABLE: u32 = 0x55;
/// [`PlatformData::dma_master_sel_enable`] enable value
pub const MASTER_SELECT_ENABLE: u32 = 0x55;

/// A chip select line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipSelect {
    pub gpio_pin: u32,
    pub name: String,
}

/// Per-device settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chip {
    /// Poll the controller instead of taking interrupts
    pub poll_mode: bool,
    /// SPI, SSP or Microwire
    pub kind: u8,
    pub enable_dma: bool,
}

/// The controller's platform data
#[derive(Debug, Clone, Default)]
pub struct PlatformData {
    pub apb_clock_in: u32,
    pub fifo_len: u32,
    pub slave_max_num: u32,
    pub cs_data: [ChipSelect; MAX_SLAVES],
    /// [`TRANSFER_USE_DMA`] to transfer with DMA
    pub dma_transfer_enable: u32,
    pub rx_handshake_num: u32,
    pub tx_handshake_num: u32,
    pub bus_no: u32,
    pub clk_name: String,
    pub rx_dma_channel: u32,
    pub tx_dma_channel: u32,
    /// [`RX_ONLY`] or [`TX_RX`]
    pub spidma_xfer_mode: u32,
    /// Supported wire widths
    pub ctl_wire_support: u32,
    pub max_speed_support: u32,
    pub data_reg_offset: u32,
    pub data_increase_support: u32,
    pub data_field_size: u32,
    pub swap_support: u32,
    /// Board hook, run by [`init`](Self::init)
    pub plat_init: Option<fn(&mut PlatformData)>,
    pub dma_protctl_enable: u32,
    pub dma_protctl_data: u32,
    pub dma_master_sel_enable: u32,
    pub dma_master_ctl_sel: u32,
    pub dma_master_mem_sel: u32,
}

impl PlatformData {
    /// Run the board hook, if there is one
    pub fn init(&mut self) {
        if let Some(plat_init) = self.plat_init {
            plat_init(self);
        }
    }

    pub fn uses_dma(&self) -> bool {
        self.dma_transfer_enable == TRANSFER_USE_DMA
    }

    /// Indicates that DMA only receives; anything else transmits too
    pub fn rx_only(&self) -> bool {
        self.spidma_xfer_mode == RX_ONLY
    }

    pub fn data_increase_supported(&self) -> bool {
        self.data_increase_support == INC_SUPPORT
    }

    pub fn swap_supported(&self) -> bool {
        self.swap_support == SWAP_SUPPORT
    }

    pub fn dma_protctl_enabled(&self) -> bool {
        self.dma_protctl_enable == PROTCTL_ENABLE
    }

    pub fn dma_master_select_enabled(&self) -> bool {
        self.dma_master_sel_enable == MASTER_SELECT_ENABLE
    }

    /// The configured chip selects, up to `slave_max_num`
    pub fn chip_selects(&self) -> &[ChipSelect] {
        let count = (self.slave_max_num as usize).min(MAX_SLAVES);
        &self.cs_data[..count]
    }
}
