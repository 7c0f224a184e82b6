//! Isochronous streams
//!
//! An isochronous endpoint doesn't complete requests one by one. Once
//! started, the core fills (or drains) two buffers in turn. Each time a
//! buffer is done, the device calls the request's `process_buffer`
//! callback with that buffer's packet results. The stream runs until
//! [`Device::iso_stop`](super::Device::iso_stop).

use std::fmt;
use std::sync::Arc;

use usb_device::endpoint::EndpointAddress;

use super::Device;
use crate::error::Status;
use crate::platform::dma::{DmaAddr, DmaDirection, DmaOps};

/// Called each time the core finishes a buffer
///
/// [`IsoRequest::proc_buf_num`] says which. Runs without the device lock.
pub type ProcessBufferFn = Arc<dyn Fn(&Device, EndpointAddress, &mut IsoRequest) + Send + Sync>;

/// One packet's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDesc {
    pub status: Status,
    /// Where the packet starts in its buffer
    pub offset: u32,
    pub actual: u32,
}

impl Default for IsoPacketDesc {
    fn default() -> Self {
        IsoPacketDesc {
            status: Status::InProgress,
            offset: 0,
            actual: 0,
        }
    }
}

/// A double-buffered isochronous request
///
/// The buffers are fixed once set. While a stream runs, the callback may
/// change their contents, but not their size or location.
pub struct IsoRequest {
    buf0: Box<[u8]>,
    buf1: Box<[u8]>,
    dma0: DmaAddr,
    dma1: DmaAddr,
    pub sync_frame: u32,
    pub data_pattern_frame: u32,
    pub data_per_frame: u32,
    /// `None` to start as soon as possible
    pub start_frame: Option<u32>,
    /// Frames between `process_buffer` calls
    pub buf_proc_interval: u32,
    status: Status,
    proc_buf_num: usize,
    desc0: Vec<IsoPacketDesc>,
    desc1: Vec<IsoPacketDesc>,
    process_buffer: Option<ProcessBufferFn>,
    /// Set when the device mapped the buffers
    mapped: Option<DmaDirection>,
}

impl IsoRequest {
    /// A request with room for `packets` results per buffer
    ///
    /// Returns `None`, and logs, when memory runs out.
    pub fn alloc(packets: usize) -> Option<Self> {
        let mut desc0 = Vec::new();
        let mut desc1 = Vec::new();
        if desc0.try_reserve_exact(packets).is_err() || desc1.try_reserve_exact(packets).is_err()
        {
            error!("Cannot allocate {} isochronous packet descriptors", packets);
            return None;
        }
        desc0.resize(packets, IsoPacketDesc::default());
        desc1.resize(packets, IsoPacketDesc::default());
        Some(IsoRequest {
            buf0: Box::default(),
            buf1: Box::default(),
            dma0: DmaAddr::INVALID,
            dma1: DmaAddr::INVALID,
            sync_frame: 0,
            data_pattern_frame: 0,
            data_per_frame: 0,
            start_frame: None,
            buf_proc_interval: 1,
            status: Status::InProgress,
            proc_buf_num: 0,
            desc0,
            desc1,
            process_buffer: None,
            mapped: None,
        })
    }

    /// Set the buffer processing callback
    pub fn with_process_buffer(
        mut self,
        process: impl Fn(&Device, EndpointAddress, &mut IsoRequest) + Send + Sync + 'static,
    ) -> Self {
        self.process_buffer = Some(Arc::new(process));
        self
    }

    /// Set both data buffers
    pub fn with_buffers(
        mut self,
        buf0: impl Into<Box<[u8]>>,
        buf1: impl Into<Box<[u8]>>,
    ) -> Self {
        self.buf0 = buf0.into();
        self.buf1 = buf1.into();
        self
    }

    /// Use caller-made mappings of the two buffers
    ///
    /// Without them, the device maps the buffers when the stream starts.
    /// Caller-made mappings stay mapped when the stream stops.
    pub fn with_dma(mut self, dma0: DmaAddr, dma1: DmaAddr) -> Self {
        self.dma0 = dma0;
        self.dma1 = dma1;
        self
    }

    /// Data buffer 0 or 1
    ///
    /// # Panics
    ///
    /// Panics if `buffer` isn't 0 or 1.
    pub fn buffer(&self, buffer: usize) -> &[u8] {
        match buffer {
            0 => &self.buf0,
            1 => &self.buf1,
            _ => panic!("isochronous buffer {} doesn't exist", buffer),
        }
    }

    /// Data buffer 0 or 1, for filling or draining in place
    ///
    /// # Panics
    ///
    /// Panics if `buffer` isn't 0 or 1.
    pub fn buffer_mut(&mut self, buffer: usize) -> &mut [u8] {
        match buffer {
            0 => &mut self.buf0,
            1 => &mut self.buf1,
            _ => panic!("isochronous buffer {} doesn't exist", buffer),
        }
    }

    /// The device address of buffer 0 or 1
    ///
    /// [`DmaAddr::INVALID`] when not mapped.
    pub fn dma(&self, buffer: usize) -> DmaAddr {
        match buffer {
            0 => self.dma0,
            1 => self.dma1,
            _ => DmaAddr::INVALID,
        }
    }

    /// Packets per buffer
    pub fn packets(&self) -> usize {
        self.desc0.len()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The buffer (0 or 1) most recently completed
    pub fn proc_buf_num(&self) -> usize {
        self.proc_buf_num
    }

    /// Packet results for `buffer`
    ///
    /// # Panics
    ///
    /// Panics if `buffer` isn't 0 or 1.
    pub fn packet_descriptors(&self, buffer: usize) -> &[IsoPacketDesc] {
        match buffer {
            0 => &self.desc0,
            1 => &self.desc1,
            _ => panic!("isochronous buffer {} doesn't exist", buffer),
        }
    }

    pub(crate) fn process_buffer(&self) -> Option<ProcessBufferFn> {
        self.process_buffer.clone()
    }

    pub(crate) fn descriptors_mut(&mut self, buffer: usize) -> &mut [IsoPacketDesc] {
        if buffer == 0 {
            &mut self.desc0
        } else {
            &mut self.desc1
        }
    }

    pub(crate) fn set_processed(&mut self, buffer: usize) {
        self.status = Status::Success;
        self.proc_buf_num = buffer;
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Map both buffers for the device
    ///
    /// Returns `false` if either buffer can't be mapped; nothing stays
    /// mapped.
    pub(crate) fn map(&mut self, dma: &mut dyn DmaOps, direction: DmaDirection) -> bool {
        let Some(dma0) = dma.map_single(&self.buf0, direction) else {
            return false;
        };
        let Some(dma1) = dma.map_single(&self.buf1, direction) else {
            dma.unmap_single(dma0, self.buf0.len(), direction);
            return false;
        };
        self.dma0 = dma0;
        self.dma1 = dma1;
        self.mapped = Some(direction);
        true
    }

    /// Undo [`map`](Self::map); caller-made mappings stay
    pub(crate) fn release(&mut self, dma: &mut dyn DmaOps) {
        if let Some(direction) = self.mapped.take() {
            dma.unmap_single(self.dma0, self.buf0.len(), direction);
            dma.unmap_single(self.dma1, self.buf1.len(), direction);
            self.dma0 = DmaAddr::INVALID;
            self.dma1 = DmaAddr::INVALID;
        }
    }
}

impl fmt::Debug for IsoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsoRequest")
            .field("buf0", &self.buf0.len())
            .field("buf1", &self.buf1.len())
            .field("sync_frame", &self.sync_frame)
            .field("start_frame", &self.start_frame)
            .field("status", &self.status)
            .field("proc_buf_num", &self.proc_buf_num)
            .field("packets", &self.packets())
            .finish_non_exhaustive()
    }
}

/// An isochronous endpoint's stream
#[derive(Default)]
pub(crate) struct IsoStream {
    /// The running request; taken while its callback runs
    pub(crate) request: Option<IsoRequest>,
    pub(crate) running: bool,
    /// Stopped while the callback ran; drop the request after
    pub(crate) stop_requested: bool,
}

impl IsoStream {
    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Stop streaming, handing back the request if it isn't in its
    /// callback
    pub(crate) fn stop(&mut self, dma: &mut dyn DmaOps) -> Option<IsoRequest> {
        self.running = false;
        match self.request.take() {
            Some(mut request) => {
                request.release(dma);
                request.set_status(Status::Disconnected);
                Some(request)
            }
            None => {
                self.stop_requested = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IsoRequest, IsoStream};
    use crate::error::Status;
    use crate::platform::dma::{DmaDirection, HostDma};

    #[test]
    fn alloc_sizes_descriptors() {
        let request = IsoRequest::alloc(8).unwrap();
        assert_eq!(request.packets(), 8);
        assert_eq!(request.packet_descriptors(0).len(), 8);
        assert_eq!(request.packet_descriptors(1).len(), 8);
        assert_eq!(request.status(), Status::InProgress);
        assert!(!request.dma(0).is_valid());
        assert!(request.buffer(0).is_empty());
    }

    #[test]
    fn buffers_fill_in_place() {
        let mut dma = HostDma::new();
        let mut request = IsoRequest::alloc(1)
            .unwrap()
            .with_buffers(vec![0; 8], vec![0; 4]);
        assert!(request.map(&mut dma, DmaDirection::ToDevice));
        let dma1 = request.dma(1);
        request.buffer_mut(1).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(request.buffer(1), &[1, 2, 3, 4]);
        assert_eq!(request.dma(1), dma1);
        assert_eq!(request.buffer(1).as_ptr() as usize as u64, dma1.0);
        request.release(&mut dma);
        assert_eq!(dma.mapped(), 0);
    }

    #[test]
    #[should_panic(expected = "doesn't exist")]
    fn third_buffer() {
        let request = IsoRequest::alloc(1).unwrap();
        let _ = request.packet_descriptors(2);
    }

    #[test]
    fn map_and_stop() {
        let mut dma = HostDma::new();
        let mut request = IsoRequest::alloc(2)
            .unwrap()
            .with_buffers(vec![0; 32], vec![0; 32]);
        assert!(request.map(&mut dma, DmaDirection::FromDevice));
        assert_eq!(dma.mapped(), 2);

        let mut stream = IsoStream {
            request: Some(request),
            running: true,
            stop_requested: false,
        };
        let request = stream.stop(&mut dma).unwrap();
        assert_eq!(dma.mapped(), 0);
        assert!(!request.dma(0).is_valid());
        assert_eq!(request.status(), Status::Disconnected);
        assert!(!stream.is_running());
    }

    #[test]
    fn stop_during_callback() {
        let mut dma = HostDma::new();
        let mut stream = IsoStream {
            running: true,
            ..IsoStream::default()
        };
        assert!(stream.stop(&mut dma).is_none());
        assert!(stream.stop_requested);
    }
}
