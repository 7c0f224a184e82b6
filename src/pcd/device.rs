//! The device: endpoints, their requests, and the bound gadget driver
//!
//! All mutable state sits behind one spinlock. The lock is dropped only
//! to call out to the gadget driver: completion callbacks, isochronous
//! buffer processing, and the driver's own methods.

use std::sync::{Arc, Weak};

use usb_device::device::UsbDeviceState;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

use super::cil::{Core, IsoParams};
use super::config::Config;
use super::endpoint::{self, Endpoint, EndpointDescriptor, EndpointFlags, Halt, Parts};
use super::ep0::Ep0State;
use super::gadget::GadgetDriver;
use super::iso::IsoRequest;
use super::request::{QueueError, Queued, Rejected, Request, RequestId};
use super::{OtgFlags, Speed, TestMode, REMOTE_WAKEUP_SIGNAL_MS};
use crate::error::{Error, Status};
use crate::platform::dma::{Bounce, Coherent, DmaAddr, DmaDirection, DmaOps};
use crate::platform::sync::{SpinLock, SpinLockGuard};
use crate::platform::tasklet::{Tasklet, TaskletQueue};
use crate::platform::timer::Timer;
use crate::platform::workq::WorkQueue;

/// How long [`Device::shutdown`] waits for scheduled work
const SHUTDOWN_WORK_TIMEOUT_MS: u32 = 1000;

/// EP0, then the IN and OUT endpoints
pub(super) struct Endpoints {
    ep0: Endpoint,
    ins: Vec<Endpoint>,
    outs: Vec<Endpoint>,
}

impl Endpoints {
    fn new(config: &Config) -> Self {
        let ins = (0..config.in_endpoints)
            .map(|index| {
                let number = Config::in_number(index);
                Endpoint::new(
                    EndpointAddress::from_parts(usize::from(number), UsbDirection::In),
                    format!("ep{}in", number),
                )
            })
            .collect();
        let outs = (0..config.out_endpoints)
            .map(|index| {
                let number = Config::out_number(index);
                Endpoint::new(
                    EndpointAddress::from_parts(usize::from(number), UsbDirection::Out),
                    format!("ep{}out", number),
                )
            })
            .collect();
        Endpoints {
            ep0: Endpoint::control(config.ep0_max_packet, "ep0".into()),
            ins,
            outs,
        }
    }

    /// Look up an endpoint; both directions of endpoint 0 are EP0
    pub(super) fn get_mut(&mut self, address: EndpointAddress) -> Option<&mut Endpoint> {
        if address.index() == 0 {
            return Some(&mut self.ep0);
        }
        let eps = match address.direction() {
            UsbDirection::In => &mut self.ins,
            UsbDirection::Out => &mut self.outs,
        };
        eps.iter_mut().find(|ep| ep.address == address)
    }

    fn get(&self, address: EndpointAddress) -> Option<&Endpoint> {
        if address.index() == 0 {
            return Some(&self.ep0);
        }
        let eps = match address.direction() {
            UsbDirection::In => &self.ins,
            UsbDirection::Out => &self.outs,
        };
        eps.iter().find(|ep| ep.address == address)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        core::iter::once(&self.ep0)
            .chain(self.ins.iter())
            .chain(self.outs.iter())
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        core::iter::once(&mut self.ep0)
            .chain(self.ins.iter_mut())
            .chain(self.outs.iter_mut())
    }

    pub(super) fn addresses(&self) -> Vec<EndpointAddress> {
        self.iter().map(|ep| ep.address).collect()
    }
}

/// Everything the device lock guards
pub(super) struct State {
    pub(super) core: Box<dyn Core>,
    pub(super) dma: Box<dyn DmaOps>,
    pub(super) config: Config,
    pub(super) driver: Option<Arc<dyn GadgetDriver>>,
    pub(super) speed: Speed,
    pub(super) ep0_state: Ep0State,
    pub(super) eps: Endpoints,
    /// Requests queued on any endpoint
    pub(super) request_pending: usize,
    pub(super) otg: OtgFlags,
    /// Latched until the status phase completes
    pub(super) pending_test_mode: Option<TestMode>,
    pub(super) test_mode: Option<TestMode>,
    pub(super) next_id: u32,
    pub(super) gadget_state: UsbDeviceState,
}

impl State {
    pub(super) fn parts(&mut self, address: EndpointAddress) -> Option<Parts<'_>> {
        let State {
            core,
            eps,
            ep0_state,
            ..
        } = self;
        let ep = eps.get_mut(address)?;
        Some(Parts {
            core: &mut **core,
            ep,
            ep0: ep0_state,
        })
    }

    /// A driver is bound, and the link is up
    fn ready(&self) -> Result<(), Error> {
        if self.driver.is_none() || self.speed == Speed::Unknown {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Stop EP0's transfer, and move EP0 to `next`
    ///
    /// Outside a data phase, EP0 refuses requests.
    pub(super) fn stop_ep0(&mut self, next: Ep0State) {
        let State {
            core,
            eps,
            ep0_state,
            ..
        } = self;
        if eps.ep0.active.take().is_some() {
            if let Some(address) = target(eps.ep0.address, *ep0_state) {
                core.stop_transfer(address);
            }
        }
        *ep0_state = next;
    }
}

pub(super) struct Shared {
    pub(super) state: SpinLock<State>,
    pub(super) test_mode: Tasklet,
    pub(super) start_xfer: Tasklet,
    _tasklets: TaskletQueue,
    wakeup_timer: Option<Timer>,
    work: WorkQueue,
}

/// The address the core works with for `address`
///
/// EP0 transfers take the data phase's direction; there's no EP0
/// transfer outside a data phase.
pub(super) fn target(address: EndpointAddress, ep0: Ep0State) -> Option<EndpointAddress> {
    if address.index() != 0 {
        return Some(address);
    }
    ep0.data_direction()
        .map(|direction| EndpointAddress::from_parts(0, direction))
}

/// Hand the endpoint's head request to the core, if the endpoint is idle
pub(super) fn start_head(core: &mut dyn Core, ep: &mut Endpoint, ep0: Ep0State) {
    if ep.active.is_some()
        || ep
            .flags
            .intersects(EndpointFlags::STOPPED | EndpointFlags::QUEUE_SOF)
    {
        return;
    }
    let Some(address) = target(ep.address, ep0) else {
        return;
    };
    if let Some(queued) = ep.queue.front_mut() {
        ep.active = Some(queued.id);
        trace!("{}: start {:?}", ep.name, queued.id);
        core.start_transfer(address, queued.transfer());
    }
}

fn dma_direction(address: EndpointAddress) -> DmaDirection {
    match address.direction() {
        UsbDirection::In => DmaDirection::ToDevice,
        UsbDirection::Out => DmaDirection::FromDevice,
    }
}

/// Check a request against the device, and map it for DMA
fn prepare(
    state: &mut State,
    address: EndpointAddress,
    req: &mut Request,
) -> Result<(Option<DmaDirection>, Option<Bounce>), Error> {
    req.start()?;
    state.ready()?;
    let State {
        core,
        dma,
        config,
        eps,
        ep0_state,
        ..
    } = state;
    let ep = eps.get_mut(address).ok_or(Error::InvalidArgument)?;
    let ops = ep.ops().ok_or(Error::InvalidArgument)?;
    ops.queue(Parts {
        core: &mut **core,
        ep: &mut *ep,
        ep0: &mut *ep0_state,
    })?;

    // Zero length transfers have nothing to map
    if !config.dma || req.length() == 0 {
        return Ok((None, None));
    }
    let direction = target(ep.address, *ep0_state)
        .map(dma_direction)
        .ok_or(Error::InvalidArgument)?;
    // A caller's mapping is released on completion, like the device's own
    if req.dma().is_valid() {
        return Ok((Some(direction), None));
    }
    let length = req.length();
    let buf = &req.buf()[..length];
    match dma.map_single(buf, direction) {
        Some(addr) if addr.is_aligned(4) => {
            req.set_dma(addr);
            Ok((Some(direction), None))
        }
        Some(addr) => {
            dma.unmap_single(addr, length, direction);
            debug!("{}: bouncing unaligned buffer at {:#x}", ep.name, addr.0);
            match Bounce::map(&mut **dma, buf, direction) {
                Some(bounce) => Ok((None, Some(bounce))),
                None => Err(Error::NoMemory),
            }
        }
        None => {
            error!("{}: cannot map {} byte buffer", ep.name, length);
            Err(Error::NoMemory)
        }
    }
}

/// A USB peripheral controller
///
/// Cloning the device clones a handle; all clones share one device.
#[derive(Clone)]
pub struct Device {
    pub(super) shared: Arc<Shared>,
}

impl Device {
    /// Bring up a device
    ///
    /// Returns [`Error::InvalidArgument`] for a bad `config`, and
    /// [`Error::NoMemory`] if a deferred-work resource can't be created.
    /// Resources created before a failure are released.
    pub fn new(
        config: Config,
        core: impl Core + 'static,
        dma: impl DmaOps + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;
        let tasklets = TaskletQueue::new("pcd").ok_or(Error::NoMemory)?;
        let work = WorkQueue::new("pcd").ok_or(Error::NoMemory)?;
        let state = State {
            core: Box::new(core),
            dma: Box::new(dma),
            config,
            driver: None,
            speed: Speed::Unknown,
            ep0_state: Ep0State::Disconnected,
            eps: Endpoints::new(&config),
            request_pending: 0,
            otg: OtgFlags::empty(),
            pending_test_mode: None,
            test_mode: None,
            next_id: 0,
            gadget_state: UsbDeviceState::Default,
        };
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let test_mode = deferred(&tasklets, "test_mode", weak, Device::apply_test_mode);
            let start_xfer = deferred(&tasklets, "start_xfer", weak, Device::start_deferred);
            let wakeup_timer = Timer::builder("remote_wakeup").build({
                let weak = weak.clone();
                move || {
                    if let Some(shared) = weak.upgrade() {
                        Device { shared }.end_remote_wakeup();
                    }
                }
            });
            Shared {
                state: SpinLock::new(state),
                test_mode,
                start_xfer,
                _tasklets: tasklets,
                wakeup_timer,
                work,
            }
        });
        if shared.wakeup_timer.is_none() {
            return Err(Error::NoMemory);
        }
        info!(
            "Device up: {} IN, {} OUT endpoints, DMA {}",
            config.in_endpoints, config.out_endpoints, config.dma
        );
        Ok(Device { shared })
    }

    pub(super) fn lock(&self) -> SpinLockGuard<'_, State> {
        self.shared.state.lock_irqsave()
    }

    /// Bind a gadget driver
    ///
    /// Returns [`Error::Busy`] if a driver is already bound, or
    /// [`Error::InvalidArgument`] if the driver doesn't state a speed. A
    /// bind error unhooks the driver and is returned.
    pub fn register_driver(&self, driver: Arc<dyn GadgetDriver>) -> Result<(), Error> {
        if driver.max_speed() == Speed::Unknown {
            return Err(Error::InvalidArgument);
        }
        {
            let mut state = self.lock();
            if state.driver.is_some() {
                debug!("Driver {} refused, already bound", driver.name());
                return Err(Error::Busy);
            }
            state.driver = Some(Arc::clone(&driver));
        }
        debug!("Binding driver {}", driver.name());
        if let Err(err) = driver.bind(self) {
            error!("Bind to driver {} failed: {}", driver.name(), err);
            let mut state = self.lock();
            if state
                .driver
                .as_ref()
                .is_some_and(|bound| same_driver(bound, &driver))
            {
                state.driver = None;
            }
            return Err(err);
        }
        info!("Registered driver {}", driver.name());
        Ok(())
    }

    /// Unbind the gadget driver
    ///
    /// `driver` must be the instance that was registered; otherwise,
    /// returns [`Error::InvalidArgument`].
    pub fn unregister_driver(&self, driver: &Arc<dyn GadgetDriver>) -> Result<(), Error> {
        {
            let state = self.lock();
            match &state.driver {
                Some(bound) if same_driver(bound, driver) => {}
                _ => return Err(Error::InvalidArgument),
            }
        }
        driver.unbind(self);
        let mut state = self.lock();
        if state
            .driver
            .as_ref()
            .is_some_and(|bound| same_driver(bound, driver))
        {
            state.driver = None;
        }
        info!("Unregistered driver {}", driver.name());
        Ok(())
    }

    /// Indicates that a gadget driver is bound
    pub fn has_driver(&self) -> bool {
        self.lock().driver.is_some()
    }

    pub fn speed(&self) -> Speed {
        self.lock().speed
    }

    /// The fastest speed the controller supports
    pub fn max_speed(&self) -> Speed {
        self.lock().config.max_speed
    }

    pub fn is_otg(&self) -> bool {
        self.lock().config.otg
    }

    /// Indicates link power management support
    pub fn lpm_support(&self) -> bool {
        self.lock().config.lpm
    }

    /// Indicates best effort service latency support
    pub fn besl_support(&self) -> bool {
        self.lock().config.besl
    }

    pub fn baseline_besl(&self) -> u8 {
        self.lock().config.baseline_besl
    }

    pub fn deep_besl(&self) -> u8 {
        self.lock().config.deep_besl
    }

    pub fn otg_flags(&self) -> OtgFlags {
        self.lock().otg
    }

    pub fn ep0_state(&self) -> Ep0State {
        self.lock().ep0_state
    }

    /// Requests queued across all endpoints
    pub fn request_pending(&self) -> usize {
        self.lock().request_pending
    }

    /// The test mode the core is in
    pub fn test_mode(&self) -> Option<TestMode> {
        self.lock().test_mode
    }

    pub fn gadget_state(&self) -> UsbDeviceState {
        self.lock().gadget_state
    }

    /// Find an endpoint by its name, like `"ep1in"`
    pub fn endpoint_by_name(&self, name: &str) -> Option<EndpointAddress> {
        self.lock()
            .eps
            .iter()
            .find(|ep| ep.name == name)
            .map(|ep| ep.address)
    }

    /// All endpoints, EP0 first
    pub fn endpoints(&self) -> Vec<EndpointAddress> {
        self.lock().eps.addresses()
    }

    pub fn endpoint_flags(&self, address: EndpointAddress) -> Option<EndpointFlags> {
        self.lock().eps.get(address).map(|ep| ep.flags)
    }

    /// The type of an enabled endpoint
    pub fn endpoint_type(&self, address: EndpointAddress) -> Option<EndpointType> {
        self.lock().eps.get(address).and_then(Endpoint::kind)
    }

    /// Queued requests, in service order
    pub fn queued(&self, address: EndpointAddress) -> Vec<RequestId> {
        self.lock()
            .eps
            .get(address)
            .map(|ep| ep.queue.ids().collect())
            .unwrap_or_default()
    }

    /// Enable an endpoint for the transfers `desc` describes
    pub fn enable(&self, address: EndpointAddress, desc: &EndpointDescriptor) -> Result<(), Error> {
        let mut guard = self.lock();
        guard.ready()?;
        let dma = guard.config.dma;
        let parts = guard.parts(address).ok_or(Error::InvalidArgument)?;
        if address.index() != 0 && parts.ep.is_enabled() {
            warn!("{} is already enabled", parts.ep.name);
            return Err(Error::InvalidArgument);
        }
        let ops = if address.index() == 0 {
            endpoint::ops(EndpointType::Control)
        } else {
            endpoint::ops(desc.kind)
        };
        let ep = &mut *parts.ep;
        ops.enable(
            Parts {
                core: parts.core,
                ep: &mut *ep,
                ep0: parts.ep0,
            },
            desc,
        )?;
        if dma {
            ep.flags.insert(EndpointFlags::DMA);
        }
        Ok(())
    }

    /// Disable an endpoint
    ///
    /// Queued requests complete with [`Status::Disconnected`]. A running
    /// isochronous stream stops, and its request is dropped.
    pub fn disable(&self, address: EndpointAddress) -> Result<(), Error> {
        let mut guard = self.lock();
        {
            let State { core, dma, eps, .. } = &mut *guard;
            let ep = eps.get_mut(address).ok_or(Error::InvalidArgument)?;
            if address.index() == 0 || !ep.is_enabled() {
                return Err(Error::InvalidArgument);
            }
            ep.flags.insert(EndpointFlags::DISABLING);
            if let Some(stream) = ep.iso.as_mut().filter(|stream| stream.is_running()) {
                core.iso_stop(address);
                let _dropped = stream.stop(&mut **dma);
            }
        }
        guard = self.nuke(guard, address, Error::Shutdown);
        let parts = guard.parts(address).ok_or(Error::InvalidArgument)?;
        match parts.ep.ops() {
            Some(ops) => ops.disable(parts),
            // Disabled while a callback ran
            None => Ok(()),
        }
    }

    /// Queue a request
    ///
    /// Returns the request's identifier. On failure, the request comes
    /// back in the error:
    ///
    /// - [`Error::InvalidArgument`] if the request has no completion
    ///   callback, its length exceeds its buffer, or the endpoint is
    ///   unknown, disabled, or doesn't take requests now.
    /// - [`Error::NotReady`] if no driver is bound, or the link is down.
    /// - [`Error::NoMemory`] if the buffer can't be mapped for DMA.
    pub fn queue(&self, address: EndpointAddress, mut req: Request) -> Result<RequestId, QueueError> {
        let mut guard = self.lock();
        let (mapped, bounce) = match prepare(&mut guard, address, &mut req) {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!("Queue on {:?} refused: {}", address, error);
                return Err(Rejected { error, item: req });
            }
        };
        let State {
            core,
            config,
            eps,
            ep0_state,
            next_id,
            request_pending,
            ..
        } = &mut *guard;
        let Some(ep) = eps.get_mut(address) else {
            return Err(Rejected {
                error: Error::InvalidArgument,
                item: req,
            });
        };
        let id = RequestId(*next_id);
        *next_id = next_id.wrapping_add(1);
        *request_pending += 1;
        trace!("{}: queue {:?}, {} bytes", ep.name, id, req.length());
        ep.queue.push(Queued {
            id,
            req,
            mapped,
            bounce,
        });

        let idle = ep.active.is_none()
            && !ep
                .flags
                .intersects(EndpointFlags::STOPPED | EndpointFlags::QUEUE_SOF);
        if config.dma && config.defer_dma_start && idle {
            ep.flags.insert(EndpointFlags::QUEUE_SOF);
            self.shared.start_xfer.schedule();
        } else {
            start_head(&mut **core, ep, *ep0_state);
        }
        Ok(id)
    }

    /// Cancel a queued request
    ///
    /// The request completes with [`Error::Aborted`]. Returns
    /// [`Error::InvalidArgument`] if the request isn't queued on the
    /// endpoint, and leaves the queue as it was.
    pub fn dequeue(&self, address: EndpointAddress, id: RequestId) -> Result<(), Error> {
        let mut guard = self.lock();
        guard.ready()?;
        let parts = guard.parts(address).ok_or(Error::InvalidArgument)?;
        if !parts.ep.queue.ids().any(|queued| queued == id) {
            return Err(Error::InvalidArgument);
        }
        let ops = parts.ep.ops().ok_or(Error::InvalidArgument)?;
        ops.dequeue(parts, id)?;

        let State {
            core,
            eps,
            ep0_state,
            request_pending,
            ..
        } = &mut *guard;
        let ep = eps.get_mut(address).ok_or(Error::InvalidArgument)?;
        let queued = ep.queue.remove(id).ok_or(Error::InvalidArgument)?;
        *request_pending -= 1;
        debug!("{}: dequeued {:?}", ep.name, id);
        start_head(&mut **core, ep, *ep0_state);
        drop(self.give_back(guard, address, queued, Err(Error::Aborted), 0));
        Ok(())
    }

    /// Set or clear an endpoint halt
    ///
    /// Returns [`Error::Again`] when halting an endpoint with queued
    /// requests, and [`Error::InvalidArgument`] for isochronous or
    /// disabled endpoints.
    pub fn set_halt(&self, address: EndpointAddress, halt: Halt) -> Result<(), Error> {
        let mut guard = self.lock();
        let parts = guard.parts(address).ok_or(Error::InvalidArgument)?;
        let ops = parts.ep.ops().ok_or(Error::InvalidArgument)?;
        debug!("{}: {:?}", parts.ep.name, halt);
        ops.halt(parts, halt)?;
        if halt == Halt::Clear {
            let State {
                core,
                eps,
                ep0_state,
                ..
            } = &mut *guard;
            if let Some(ep) = eps.get_mut(address) {
                start_head(&mut **core, ep, *ep0_state);
            }
        }
        Ok(())
    }

    /// Halt an endpoint so that the host's clear-halt doesn't clear it
    pub fn wedge(&self, address: EndpointAddress) -> Result<(), Error> {
        self.set_halt(address, Halt::Wedge)
    }

    /// Allocate a coherent transfer buffer for an endpoint
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown endpoint, and
    /// [`Error::NoMemory`] if the memory can't be had. The device wants
    /// dword sized and aligned buffers; anything else is logged.
    pub fn alloc_buffer(&self, address: EndpointAddress, bytes: usize) -> Result<Coherent, Error> {
        let mut state = self.lock();
        let _name = match state.eps.get(address) {
            Some(ep) => ep.name.clone(),
            None => return Err(Error::InvalidArgument),
        };
        if bytes % 4 != 0 {
            warn!("{}: buffer size {} isn't a multiple of 4", _name, bytes);
        }
        let memory = state.dma.alloc_coherent(bytes, 4).ok_or(Error::NoMemory)?;
        if !memory.addr().is_aligned(4) {
            warn!("{}: buffer at {:#x} isn't dword aligned", _name, memory.addr().0);
        }
        Ok(memory)
    }

    /// Release a buffer from [`alloc_buffer`](Self::alloc_buffer)
    pub fn free_buffer(&self, memory: Coherent) {
        self.lock().dma.free_coherent(memory);
    }

    /// Allocate an isochronous request with `packets` packets per buffer
    pub fn alloc_iso_request(&self, packets: usize) -> Option<IsoRequest> {
        IsoRequest::alloc(packets)
    }

    /// Start an isochronous stream
    ///
    /// The request needs both buffers and a `process_buffer` callback.
    /// On failure, the request comes back in the error.
    pub fn iso_start(
        &self,
        address: EndpointAddress,
        mut req: IsoRequest,
    ) -> Result<(), Rejected<IsoRequest>> {
        let mut guard = self.lock();
        if let Err(error) = guard.ready() {
            return Err(Rejected { error, item: req });
        }
        let State {
            core,
            dma,
            config,
            eps,
            ..
        } = &mut *guard;
        let Some(stream) = eps.get_mut(address).and_then(|ep| ep.iso.as_mut()) else {
            return Err(Rejected {
                error: Error::InvalidArgument,
                item: req,
            });
        };
        if stream.is_running() {
            return Err(Rejected {
                error: Error::Busy,
                item: req,
            });
        }
        if req.process_buffer().is_none()
            || req.buffer(0).is_empty()
            || req.buffer(1).is_empty()
            || req.packets() == 0
        {
            return Err(Rejected {
                error: Error::InvalidArgument,
                item: req,
            });
        }
        if config.dma && !req.dma(0).is_valid() && !req.map(&mut **dma, dma_direction(address)) {
            error!("Cannot map isochronous buffers for {:?}", address);
            return Err(Rejected {
                error: Error::NoMemory,
                item: req,
            });
        }
        let params = IsoParams {
            dma0: req.dma(0),
            dma1: req.dma(1),
            sync_frame: req.sync_frame,
            data_pattern_frame: req.data_pattern_frame,
            data_per_frame: req.data_per_frame,
            start_frame: req.start_frame,
            interval: req.buf_proc_interval,
            packets: req.packets(),
        };
        if let Err(error) = core.iso_start(address, &params) {
            req.release(&mut **dma);
            return Err(Rejected { error, item: req });
        }
        req.set_status(Status::InProgress);
        stream.request = Some(req);
        stream.running = true;
        stream.stop_requested = false;
        Ok(())
    }

    /// Stop an isochronous stream
    ///
    /// Hands back the request. When called from the request's own
    /// `process_buffer`, returns `None`; the request is dropped once the
    /// callback returns.
    pub fn iso_stop(&self, address: EndpointAddress) -> Result<Option<IsoRequest>, Error> {
        let mut guard = self.lock();
        let State { core, dma, eps, .. } = &mut *guard;
        let stream = eps
            .get_mut(address)
            .and_then(|ep| ep.iso.as_mut())
            .filter(|stream| stream.is_running())
            .ok_or(Error::InvalidArgument)?;
        core.iso_stop(address);
        Ok(stream.stop(&mut **dma))
    }

    /// The current (micro)frame number
    pub fn frame_number(&self) -> Result<u16, Error> {
        let state = self.lock();
        if state.driver.is_none() {
            return Err(Error::NotReady);
        }
        Ok(state.core.frame_number())
    }

    /// Signal remote wakeup to the host
    ///
    /// Returns [`Error::NotSupported`] unless the host enabled remote
    /// wakeup. The resume signal drops after
    /// [`REMOTE_WAKEUP_SIGNAL_MS`](super::REMOTE_WAKEUP_SIGNAL_MS).
    pub fn wakeup(&self) -> Result<(), Error> {
        {
            let mut state = self.lock();
            if !state.otg.contains(OtgFlags::REMOTE_WAKEUP) {
                return Err(Error::NotSupported);
            }
            state.core.set_remote_wakeup_signal(true);
        }
        if let Some(timer) = &self.shared.wakeup_timer {
            timer.schedule(REMOTE_WAKEUP_SIGNAL_MS);
        }
        Ok(())
    }

    fn end_remote_wakeup(&self) {
        self.lock().core.set_remote_wakeup_signal(false);
    }

    /// Connect to, or disconnect from, the bus
    pub fn pullup(&self, on: bool) -> Result<(), Error> {
        self.lock().core.set_soft_disconnect(!on);
        Ok(())
    }

    /// Enter `mode` once the current control transfer's status phase
    /// completes
    pub fn set_test_mode(&self, mode: TestMode) {
        self.lock().pending_test_mode = Some(mode);
    }

    fn apply_test_mode(&self) {
        let mut state = self.lock();
        if let Some(mode) = state.pending_test_mode.take() {
            info!("Entering test mode {:?}", mode);
            state.core.set_test_mode(Some(mode));
            state.test_mode = Some(mode);
        }
    }

    /// Start transfers deferred by [`Config::defer_dma_start`]
    fn start_deferred(&self) {
        let mut guard = self.lock();
        let State {
            core,
            eps,
            ep0_state,
            ..
        } = &mut *guard;
        for ep in eps.iter_mut() {
            if ep.flags.contains(EndpointFlags::QUEUE_SOF) {
                ep.flags.remove(EndpointFlags::QUEUE_SOF);
                start_head(&mut **core, ep, *ep0_state);
            }
        }
    }

    /// Record the device state, and tell the driver from the work queue
    pub fn set_gadget_state(&self, gadget_state: UsbDeviceState) {
        self.lock().gadget_state = gadget_state;
        let weak = Arc::downgrade(&self.shared);
        self.shared.work.schedule("gadget_state", move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let device = Device { shared };
            let (driver, gadget_state) = {
                let state = device.lock();
                (state.driver.clone(), state.gadget_state)
            };
            if let Some(driver) = driver {
                driver.state_changed(&device, gadget_state);
            }
        });
    }

    /// Wait for scheduled work to finish
    ///
    /// Returns the time left, or [`Error::TimedOut`].
    pub fn wait_work_done(&self, msecs: u32) -> Result<u32, Error> {
        self.shared.work.wait_work_done(msecs)
    }

    /// Tear the device down
    ///
    /// Disconnects from the bus, completes every request with
    /// [`Status::Disconnected`], stops isochronous streams, and unbinds a
    /// driver that's still bound.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        guard.core.set_soft_disconnect(true);
        {
            let State { core, dma, eps, .. } = &mut *guard;
            for ep in eps.iter_mut() {
                if let Some(stream) = ep.iso.as_mut().filter(|stream| stream.is_running()) {
                    core.iso_stop(ep.address);
                    let _dropped = stream.stop(&mut **dma);
                }
            }
        }
        guard.speed = Speed::Unknown;
        guard.stop_ep0(Ep0State::Disconnected);
        guard = self.flush_all(guard, Error::Shutdown);
        let driver = guard.driver.take();
        drop(guard);

        if let Some(driver) = driver {
            warn!("Shutting down with driver {} bound", driver.name());
            driver.unbind(self);
        }
        if let Some(timer) = &self.shared.wakeup_timer {
            timer.cancel();
        }
        if self
            .shared
            .work
            .wait_work_done(SHUTDOWN_WORK_TIMEOUT_MS)
            .is_err()
        {
            warn!("Work still pending at shutdown");
        }
    }

    /// Complete a request that's off its queue
    ///
    /// Releases the request's DMA mapping, translates `result` to the
    /// request's status, and calls the completion callback with the lock
    /// dropped. Returns the relocked state.
    pub(super) fn give_back<'a>(
        &'a self,
        mut guard: SpinLockGuard<'a, State>,
        address: EndpointAddress,
        queued: Queued,
        result: Result<(), Error>,
        actual: usize,
    ) -> SpinLockGuard<'a, State> {
        let Queued {
            mut req,
            mapped,
            bounce,
            ..
        } = queued;
        let actual = actual.min(req.length());
        let dma = &mut *guard.dma;
        if let Some(bounce) = bounce {
            let length = req.length();
            bounce.unmap(dma, &mut req.buf_mut()[..length], actual);
        } else if let Some(direction) = mapped {
            dma.unmap_single(req.dma(), req.length(), direction);
            req.set_dma(DmaAddr::INVALID);
        }
        let status = Status::from_result(result);
        req.finish(status, actual);
        trace!("{:?}: complete {:?}, {} bytes", address, status, actual);

        let Some(complete) = req.complete_fn().cloned() else {
            return guard;
        };
        drop(guard);
        complete(self, address, req);
        self.lock()
    }

    /// Complete every request on an endpoint with `error`
    ///
    /// Only the requests queued on entry complete. A request that a
    /// callback queues stays on the endpoint.
    pub(super) fn nuke<'a>(
        &'a self,
        mut guard: SpinLockGuard<'a, State>,
        address: EndpointAddress,
        error: Error,
    ) -> SpinLockGuard<'a, State> {
        let Some(count) = guard.eps.get(address).map(|ep| ep.queue.len()) else {
            return guard;
        };
        for _ in 0..count {
            let State {
                core,
                eps,
                ep0_state,
                request_pending,
                ..
            } = &mut *guard;
            let Some(ep) = eps.get_mut(address) else {
                return guard;
            };
            ep.flags.remove(EndpointFlags::QUEUE_SOF);
            let Some(queued) = ep.queue.pop_front() else {
                return guard;
            };
            if ep.active == Some(queued.id) {
                if let Some(target) = target(ep.address, *ep0_state) {
                    core.stop_transfer(target);
                }
                ep.active = None;
            }
            *request_pending -= 1;
            guard = self.give_back(guard, address, queued, Err(error), 0);
        }
        guard
    }

    pub(super) fn flush_all<'a>(
        &'a self,
        mut guard: SpinLockGuard<'a, State>,
        error: Error,
    ) -> SpinLockGuard<'a, State> {
        for address in guard.eps.addresses() {
            guard = self.nuke(guard, address, error);
        }
        guard
    }
}

/// A tasklet that runs `run` on the device, if it's still alive
fn deferred(
    queue: &TaskletQueue,
    name: &str,
    weak: &Weak<Shared>,
    run: fn(&Device),
) -> Tasklet {
    let weak = weak.clone();
    queue.tasklet(name, move || {
        if let Some(shared) = weak.upgrade() {
            run(&Device { shared });
        }
    })
}

fn same_driver(a: &Arc<dyn GadgetDriver>, b: &Arc<dyn GadgetDriver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
