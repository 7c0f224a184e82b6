//! Byte order conversions
//!
//! Bus data (descriptors, setup packets, DMA buffers) is little endian.
//! These helpers move between that wire layout and CPU integers, whatever
//! the CPU's own byte order.

/// Little endian bytes to a CPU `u16`
pub const fn le16_to_cpu(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// CPU `u16` to little endian bytes
pub const fn cpu_to_le16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Big endian bytes to a CPU `u16`
pub const fn be16_to_cpu(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// CPU `u16` to big endian bytes
pub const fn cpu_to_be16(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Little endian bytes to a CPU `u32`
pub const fn le32_to_cpu(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// CPU `u32` to little endian bytes
pub const fn cpu_to_le32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Big endian bytes to a CPU `u32`
pub const fn be32_to_cpu(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// CPU `u32` to big endian bytes
pub const fn cpu_to_be32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Read a little endian `u16` at `offset`
///
/// # Panics
///
/// Panics if `buf` doesn't hold two bytes at `offset`.
pub fn read_le16(buf: &[u8], offset: usize) -> u16 {
    le16_to_cpu([buf[offset], buf[offset + 1]])
}
