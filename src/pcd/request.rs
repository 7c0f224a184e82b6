//! I/O requests and the endpoint request queue

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use usb_device::endpoint::EndpointAddress;

use super::cil::Transfer;
use super::Device;
use crate::error::{Error, Status};
use crate::platform::dma::{Bounce, DmaAddr, DmaDirection};

/// Called once a request completes
///
/// The callback owns the completed request. It runs without the device
/// lock held, so it may queue more requests.
pub type CompleteFn = Arc<dyn Fn(&Device, EndpointAddress, Request) + Send + Sync>;

/// Identifies a queued request
///
/// [`Device::queue`] hands out identifiers; use them to
/// [`dequeue`](Device::dequeue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u32);

/// A gadget driver's I/O request
pub struct Request {
    buf: Vec<u8>,
    length: usize,
    zero: bool,
    dma: DmaAddr,
    actual: usize,
    status: Status,
    sent_zlp: bool,
    complete: Option<CompleteFn>,
    context: usize,
}

impl Request {
    /// A request that transfers all of `buf`
    pub fn new(buf: Vec<u8>) -> Self {
        Request {
            length: buf.len(),
            buf,
            zero: false,
            dma: DmaAddr::INVALID,
            actual: 0,
            status: Status::InProgress,
            sent_zlp: false,
            complete: None,
            context: 0,
        }
    }

    /// A request with a zeroed, `len` byte buffer
    ///
    /// Returns `None`, and logs, when memory runs out.
    pub fn alloc(len: usize) -> Option<Self> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(len).is_err() {
            error!("Cannot allocate {} byte request buffer", len);
            return None;
        }
        buf.resize(len, 0);
        Some(Self::new(buf))
    }

    /// Transfer only the first `length` bytes of the buffer
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// End an IN transfer that fills its last packet with a zero length
    /// packet
    pub fn with_zero(mut self, zero: bool) -> Self {
        self.zero = zero;
        self
    }

    /// Use a caller-made DMA mapping
    ///
    /// With DMA on, the device unmaps it when the request completes.
    pub fn with_dma(mut self, dma: DmaAddr) -> Self {
        self.dma = dma;
        self
    }

    /// Set the completion callback
    pub fn with_complete(
        mut self,
        complete: impl Fn(&Device, EndpointAddress, Request) + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Arc::new(complete));
        self
    }

    /// Set a shared completion callback
    pub fn with_complete_fn(mut self, complete: CompleteFn) -> Self {
        self.complete = Some(complete);
        self
    }

    /// Attach an opaque value for the gadget driver
    pub fn with_context(mut self, context: usize) -> Self {
        self.context = context;
        self
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Give back the buffer
    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    /// Requested transfer length
    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes actually transferred
    pub fn actual(&self) -> usize {
        self.actual
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn zero(&self) -> bool {
        self.zero
    }

    /// The request's DMA address
    ///
    /// [`DmaAddr::INVALID`] when not mapped.
    pub fn dma(&self) -> DmaAddr {
        self.dma
    }

    /// Indicates that the transfer ended with a zero length packet
    pub fn sent_zlp(&self) -> bool {
        self.sent_zlp
    }

    pub fn context(&self) -> usize {
        self.context
    }

    pub(crate) fn complete_fn(&self) -> Option<&CompleteFn> {
        self.complete.as_ref()
    }

    /// Prepare for queuing
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.complete.is_none() || self.length > self.buf.len() {
            return Err(Error::InvalidArgument);
        }
        self.status = Status::InProgress;
        self.actual = 0;
        self.sent_zlp = false;
        Ok(())
    }

    pub(crate) fn set_dma(&mut self, dma: DmaAddr) {
        self.dma = dma;
    }

    pub(crate) fn finish(&mut self, status: Status, actual: usize) {
        self.status = status;
        self.actual = actual;
    }

    pub(crate) fn set_sent_zlp(&mut self) {
        self.sent_zlp = true;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("length", &self.length)
            .field("zero", &self.zero)
            .field("dma", &self.dma)
            .field("actual", &self.actual)
            .field("status", &self.status)
            .field("sent_zlp", &self.sent_zlp)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// An operation failed, handing back what it was given
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: Error,
    pub item: T,
}

/// A request that couldn't be queued
pub type QueueError = Rejected<Request>;

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected: {}", self.error)
    }
}

impl<T: fmt::Debug> std::error::Error for Rejected<T> {}

/// A request owned by an endpoint
pub(crate) struct Queued {
    pub(crate) id: RequestId,
    pub(crate) req: Request,
    /// The direction of a mapping to release on completion
    pub(crate) mapped: Option<DmaDirection>,
    pub(crate) bounce: Option<Bounce>,
}

impl Queued {
    /// Describe the request's transfer for the core
    pub(crate) fn transfer(&mut self) -> Transfer<'_> {
        let length = self.req.length;
        let zero = self.req.zero;
        match self.bounce.as_mut() {
            Some(bounce) => Transfer {
                id: self.id,
                dma: bounce.addr(),
                buf: bounce.data_mut(),
                length,
                zero,
            },
            None => Transfer {
                id: self.id,
                dma: self.req.dma,
                buf: &mut self.req.buf[..length],
                length,
                zero,
            },
        }
    }
}

/// An endpoint's requests, in service order
#[derive(Default)]
pub(crate) struct RequestQueue {
    requests: VecDeque<Queued>,
}

impl RequestQueue {
    pub(crate) fn push(&mut self, queued: Queued) {
        self.requests.push_back(queued);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Queued> {
        self.requests.pop_front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Queued> {
        self.requests.front_mut()
    }

    pub(crate) fn front_id(&self) -> Option<RequestId> {
        self.requests.front().map(|queued| queued.id)
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut Queued> {
        self.requests.iter_mut().find(|queued| queued.id == id)
    }

    /// Remove the request `id`, wherever it is
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Queued> {
        let position = self.requests.iter().position(|queued| queued.id == id)?;
        self.requests.remove(position)
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().map(|queued| queued.id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Queued, Request, RequestId, RequestQueue};
    use crate::error::{Error, Status};

    fn queued(id: u32, len: usize) -> Queued {
        Queued {
            id: RequestId(id),
            req: Request::new(vec![0; len]).with_complete(|_, _, _| {}),
            mapped: None,
            bounce: None,
        }
    }

    #[test]
    fn start_requires_callback() {
        let mut req = Request::new(vec![0; 4]);
        assert_eq!(req.start(), Err(Error::InvalidArgument));
        let mut req = req.with_complete(|_, _, _| {});
        assert_eq!(req.start(), Ok(()));
        assert_eq!(req.status(), Status::InProgress);
    }

    #[test]
    fn start_checks_length() {
        let mut req = Request::new(vec![0; 4])
            .with_length(5)
            .with_complete(|_, _, _| {});
        assert_eq!(req.start(), Err(Error::InvalidArgument));
    }

    #[test]
    fn start_resets_results() {
        let mut req = Request::alloc(8).unwrap().with_complete(|_, _, _| {});
        req.finish(Status::Success, 8);
        req.set_sent_zlp();
        req.start().unwrap();
        assert_eq!(req.actual(), 0);
        assert!(!req.sent_zlp());
    }

    #[test]
    fn fifo() {
        let mut queue = RequestQueue::default();
        for id in 0..3 {
            queue.push(queued(id, 10 * (id as usize + 1)));
        }
        assert_eq!(queue.front_id(), Some(RequestId(0)));
        let first = queue.pop_front().unwrap();
        assert_eq!(first.req.length(), 10);
        assert_eq!(queue.front_id(), Some(RequestId(1)));
    }

    #[test]
    fn remove_from_middle() {
        let mut queue = RequestQueue::default();
        for id in 0..3 {
            queue.push(queued(id, 1));
        }
        assert!(queue.remove(RequestId(7)).is_none());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.remove(RequestId(1)).unwrap().id, RequestId(1));
        assert_eq!(
            queue.ids().collect::<Vec<_>>(),
            [RequestId(0), RequestId(2)]
        );
    }

    #[test]
    fn transfer_covers_length() {
        let mut queued = Queued {
            id: RequestId(3),
            req: Request::new(vec![1; 16]).with_length(6),
            mapped: None,
            bounce: None,
        };
        let transfer = queued.transfer();
        assert_eq!(transfer.buf.len(), 6);
        assert_eq!(transfer.id, RequestId(3));
        assert!(!transfer.dma.is_valid());
    }
}
