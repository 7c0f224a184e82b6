//! DMA mapping
//!
//! The driver maps request buffers through [`DmaOps`] before a transfer,
//! and unmaps them once the transfer completes. [`HostDma`] is the
//! mapping for controllers that use CPU addresses directly.
//!
//! Memory that the device uses for its whole life, like descriptor
//! chains, is [`Coherent`]. A [`DmaPool`] hands out fixed-size coherent
//! blocks.

use super::mem;

/// A device-visible buffer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    /// No mapping
    pub const INVALID: DmaAddr = DmaAddr(!0);

    /// Indicates a real mapping
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Indicates that the address is aligned to `align` bytes
    ///
    /// `align` must be a power of two.
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// Which way the device moves the data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads the buffer (IN transfers)
    ToDevice,
    /// The device writes the buffer (OUT transfers)
    FromDevice,
    /// Both; used for coherent memory
    Bidirectional,
}

/// Maps buffers for the device
///
/// Called with the device lock held; implementations must not sleep.
pub trait DmaOps: Send {
    /// Map `buf` for a single transfer
    ///
    /// Returns `None` if the buffer can't be mapped.
    fn map_single(&mut self, buf: &[u8], direction: DmaDirection) -> Option<DmaAddr>;

    /// Release a mapping made by [`map_single`](Self::map_single)
    fn unmap_single(&mut self, addr: DmaAddr, len: usize, direction: DmaDirection);

    /// Allocate `size` zeroed bytes that stay mapped until freed
    ///
    /// The CPU address is aligned to `align`, which must be a power of
    /// two. Returns `None`, and logs, when memory runs out. The default
    /// maps a fresh allocation in both directions.
    fn alloc_coherent(&mut self, size: usize, align: usize) -> Option<Coherent> {
        if !align.is_power_of_two() {
            error!("Coherent alignment {} isn't a power of two", align);
            return None;
        }
        let buf = mem::alloc_atomic(size.checked_add(align - 1)?)?;
        let offset = buf.as_ptr().align_offset(align).min(align - 1);
        let Some(addr) = self.map_single(&buf[offset..offset + size], DmaDirection::Bidirectional)
        else {
            error!("Cannot map {} bytes of coherent memory", size);
            return None;
        };
        Some(Coherent {
            buf,
            offset,
            len: size,
            addr,
        })
    }

    /// Release memory from [`alloc_coherent`](Self::alloc_coherent)
    fn free_coherent(&mut self, memory: Coherent) {
        self.unmap_single(memory.addr, memory.len, DmaDirection::Bidirectional);
    }
}

/// Identity mapping: the device address is the CPU address
#[derive(Debug, Default)]
pub struct HostDma {
    mapped: usize,
}

impl HostDma {
    pub const fn new() -> Self {
        HostDma { mapped: 0 }
    }

    /// Returns the number of live mappings
    pub fn mapped(&self) -> usize {
        self.mapped
    }
}

impl DmaOps for HostDma {
    fn map_single(&mut self, buf: &[u8], _direction: DmaDirection) -> Option<DmaAddr> {
        self.mapped += 1;
        Some(DmaAddr(buf.as_ptr() as usize as u64))
    }

    fn unmap_single(&mut self, _addr: DmaAddr, _len: usize, _direction: DmaDirection) {
        self.mapped -= 1;
    }
}

/// Memory shared by the CPU and the device
///
/// Free it with [`DmaOps::free_coherent`]; dropping it leaks the mapping.
pub struct Coherent {
    buf: Box<[u8]>,
    offset: usize,
    len: usize,
    addr: DmaAddr,
}

impl Coherent {
    /// Returns the device address
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + self.len]
    }
}

impl core::fmt::Debug for Coherent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coherent")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed-size blocks of coherent memory
///
/// Freed blocks are kept for reuse until the pool is destroyed. Like
/// [`Coherent`], the pool doesn't hold the [`DmaOps`] it allocates from;
/// every call takes it.
pub struct DmaPool {
    name: &'static str,
    size: usize,
    align: usize,
    free: Vec<Coherent>,
    outstanding: usize,
}

impl DmaPool {
    /// A pool of `size` byte blocks aligned to `align`
    ///
    /// Returns `None` if `size` is zero, or `align` isn't a power of two.
    pub fn create(name: &'static str, size: usize, align: usize) -> Option<Self> {
        if size == 0 || !align.is_power_of_two() {
            error!("Bad DMA pool {}: {} bytes, {} alignment", name, size, align);
            return None;
        }
        debug!("DMA pool {}: {} byte blocks", name, size);
        Some(DmaPool {
            name,
            size,
            align,
            free: Vec::new(),
            outstanding: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Blocks allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Take a block, reusing a freed one if there is one
    ///
    /// The contents of a reused block are what they were when freed.
    pub fn alloc(&mut self, dma: &mut dyn DmaOps) -> Option<Coherent> {
        let block = match self.free.pop() {
            Some(block) => block,
            None => dma.alloc_coherent(self.size, self.align)?,
        };
        self.outstanding += 1;
        Some(block)
    }

    /// Take a zeroed block
    pub fn zalloc(&mut self, dma: &mut dyn DmaOps) -> Option<Coherent> {
        let mut block = self.alloc(dma)?;
        block.as_mut_slice().fill(0);
        Some(block)
    }

    /// Return a block to the pool
    pub fn free(&mut self, block: Coherent) {
        debug_assert_eq!(block.len(), self.size, "block from another pool");
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(block);
    }

    /// Release every block the pool holds
    ///
    /// Blocks still out are the caller's to free with
    /// [`DmaOps::free_coherent`].
    pub fn destroy(mut self, dma: &mut dyn DmaOps) {
        if self.outstanding != 0 {
            warn!(
                "DMA pool {} destroyed with {} blocks out",
                self.name, self.outstanding
            );
        }
        for block in self.free.drain(..) {
            dma.free_coherent(block);
        }
    }
}

/// An aligned copy of a buffer, for controllers that require word
/// aligned DMA addresses
pub struct Bounce {
    buf: Box<[u8]>,
    offset: usize,
    len: usize,
    direction: DmaDirection,
    addr: DmaAddr,
}

impl Bounce {
    /// Allocate and map a bounce buffer for `data`
    ///
    /// For [`DmaDirection::ToDevice`], `data` is copied in. Doesn't sleep.
    /// Returns `None`, and logs, if the buffer can't be allocated or
    /// mapped.
    pub fn map(dma: &mut dyn DmaOps, data: &[u8], direction: DmaDirection) -> Option<Self> {
        let len = data.len();
        // Over-allocate so an aligned window always exists
        let mut buf = mem::alloc_atomic(len + 3)?;
        let offset = buf.as_ptr().align_offset(4).min(3);
        if direction == DmaDirection::ToDevice {
            buf[offset..offset + len].copy_from_slice(data);
        }
        let Some(addr) = dma.map_single(&buf[offset..offset + len], direction) else {
            error!("Cannot map {} byte bounce buffer", len);
            return None;
        };
        Some(Bounce {
            buf,
            offset,
            len,
            direction,
            addr,
        })
    }

    /// Returns the device address
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    /// The mapped window
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + self.len]
    }

    /// Unmap the buffer
    ///
    /// For [`DmaDirection::FromDevice`], the first `actual` bytes are
    /// copied into `dst`.
    pub fn unmap(self, dma: &mut dyn DmaOps, dst: &mut [u8], actual: usize) {
        dma.unmap_single(self.addr, self.len, self.direction);
        if self.direction == DmaDirection::FromDevice {
            let actual = actual.min(self.len).min(dst.len());
            dst[..actual].copy_from_slice(&self.buf[self.offset..self.offset + actual]);
        }
    }
}
