//! Events from the controller core
//!
//! The core reports transfer completions, setup packets, and bus events
//! by calling these methods. They run the EP0 state machine, hand
//! completed requests back to the gadget driver, and forward bus events.

use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use super::device::{start_head, State};
use super::endpoint::EndpointFlags;
use super::ep0::{Ep0Event, Ep0State};
use super::iso::IsoPacketDesc;
use super::request::RequestId;
use super::setup::SetupPacket;
use super::{Device, OtgFlags, Speed, TestMode};
use crate::error::{Error, Status};

const FEATURE_REMOTE_WAKEUP: u16 = 1;
const FEATURE_TEST_MODE: u16 = 2;
/// Standard, host to device, device recipient
const DEVICE_REQUEST: u8 = 0x00;

/// Handle the device features the driver owns
///
/// Returns `None` for requests the gadget driver handles.
fn device_feature(state: &mut State, setup: &SetupPacket) -> Option<Result<(), Error>> {
    if setup.request_type != DEVICE_REQUEST {
        return None;
    }
    match (setup.request, setup.value) {
        (SetupPacket::SET_FEATURE, FEATURE_TEST_MODE) => {
            let selector = (setup.index >> 8) as u8;
            Some(match TestMode::from_selector(selector) {
                Some(mode) => {
                    debug!("Test mode {:?} after status", mode);
                    state.pending_test_mode = Some(mode);
                    Ok(())
                }
                None => Err(Error::InvalidArgument),
            })
        }
        (SetupPacket::SET_FEATURE, FEATURE_REMOTE_WAKEUP) => {
            state.otg.insert(OtgFlags::REMOTE_WAKEUP);
            Some(Ok(()))
        }
        (SetupPacket::CLEAR_FEATURE, FEATURE_REMOTE_WAKEUP) => {
            state.otg.remove(OtgFlags::REMOTE_WAKEUP);
            Some(Ok(()))
        }
        _ => None,
    }
}

impl Device {
    /// The core finished the transfer for request `id`
    ///
    /// `actual` counts the bytes moved. Completions for requests that
    /// aren't active are logged and ignored.
    pub fn complete(&self, address: EndpointAddress, id: RequestId, result: Result<(), Error>, actual: usize) {
        let mut guard = self.lock();
        let State {
            core,
            eps,
            ep0_state,
            request_pending,
            ..
        } = &mut *guard;
        let Some(ep) = eps.get_mut(address) else {
            warn!("Completion on unknown endpoint {:?}", address);
            return;
        };
        if ep.active != Some(id) || ep.queue.front_id() != Some(id) {
            warn!("{}: completion for {:?}, which isn't active", ep.name, id);
            return;
        }
        ep.active = None;
        let Some(queued) = ep.queue.pop_front() else {
            return;
        };
        *request_pending -= 1;

        if ep.address.index() == 0 {
            if result.is_ok() {
                match ep0_state.next(Ep0Event::DataDone) {
                    Ok(next) => {
                        *ep0_state = next;
                        if let Some(direction) = next.status_direction() {
                            core.ep0_status(direction);
                        }
                    }
                    Err(_err) => {
                        warn!("EP0 data completion in {:?}", ep0_state);
                    }
                }
            }
        } else {
            start_head(&mut **core, ep, *ep0_state);
        }
        drop(self.give_back(guard, address, queued, result, actual));
    }

    /// The core ended request `id` with a zero length packet
    pub fn zlp_sent(&self, address: EndpointAddress, id: RequestId) {
        let mut state = self.lock();
        if let Some(queued) = state
            .eps
            .get_mut(address)
            .and_then(|ep| ep.queue.get_mut(id))
        {
            queued.req.set_sent_zlp();
        }
    }

    /// The core finished isochronous buffer `buffer` (0 or 1)
    ///
    /// Fills in the buffer's packet results, and calls the request's
    /// `process_buffer` without the lock held.
    pub fn isoc_complete(&self, address: EndpointAddress, buffer: usize) {
        let buffer = usize::from(buffer != 0);
        let mut guard = self.lock();
        let State { core, eps, .. } = &mut *guard;
        let Some(stream) = eps
            .get_mut(address)
            .and_then(|ep| ep.iso.as_mut())
            .filter(|stream| stream.is_running())
        else {
            debug!("Isochronous completion on idle {:?}", address);
            return;
        };
        let Some(mut request) = stream.request.take() else {
            warn!("{:?}: buffer {} done during processing", address, buffer);
            return;
        };
        for index in 0..request.packets() {
            let packet = core.iso_packet(address, buffer, index);
            match packet.status {
                Ok(()) | Err(Error::NoData) => {}
                Err(_err) => {
                    warn!("Unknown status in isochronous packet: {}", _err);
                }
            }
            request.descriptors_mut(buffer)[index] = IsoPacketDesc {
                status: Status::from_iso_packet(packet.status),
                offset: packet.offset,
                actual: packet.actual,
            };
        }
        request.set_processed(buffer);
        let process = request.process_buffer();
        drop(guard);

        if let Some(process) = process {
            process(self, address, &mut request);
        }

        let mut guard = self.lock();
        let State { dma, eps, .. } = &mut *guard;
        match eps.get_mut(address).and_then(|ep| ep.iso.as_mut()) {
            Some(stream) if stream.is_running() && stream.request.is_none() => {
                stream.request = Some(request);
            }
            // Stopped, or restarted with another request, while processing
            Some(stream) => {
                stream.stop_requested = false;
                request.release(&mut **dma);
            }
            None => request.release(&mut **dma),
        }
    }

    /// A setup packet arrived on EP0
    ///
    /// Returns [`Error::NotReady`] while disconnected. Driver errors
    /// stall EP0 and come back as [`Error::NotSupported`] or
    /// [`Error::InvalidArgument`].
    pub fn setup(&self, raw: &[u8; 8]) -> Result<(), Error> {
        let setup = SetupPacket::parse(raw);
        let ep0 = EndpointAddress::from(0);
        let mut guard = self.lock();
        let next = guard.ep0_state.next(Ep0Event::Setup {
            direction: setup.direction(),
            length: setup.length,
        })?;
        trace!("Setup {:?}", setup);
        if guard.ep0_state.in_transfer() {
            debug!("Setup during {:?}, aborting EP0", guard.ep0_state);
            guard.stop_ep0(Ep0State::Idle);
            guard = self.nuke(guard, ep0, Error::Aborted);
        }
        guard.ep0_state = next;
        if let Some(ep) = guard.eps.get_mut(ep0) {
            // A setup packet clears an EP0 stall
            ep.flags.remove(EndpointFlags::STOPPED);
        }

        let result = match device_feature(&mut guard, &setup) {
            Some(result) => result,
            None => {
                let driver = guard.driver.clone();
                drop(guard);
                let result = match driver {
                    Some(driver) => driver.setup(self, &setup),
                    None => Err(Error::NotSupported),
                };
                guard = self.lock();
                result
            }
        };
        let result = match result {
            Ok(()) => Ok(()),
            Err(Error::NotSupported) => Err(Error::NotSupported),
            Err(_err) => {
                debug!("Setup failed: {}", _err);
                Err(Error::InvalidArgument)
            }
        };

        match result {
            Err(_) => {
                guard.stop_ep0(Ep0State::Idle);
                guard = self.nuke(guard, ep0, Error::Aborted);
                let state = &mut *guard;
                if let Ok(stalled) = state.ep0_state.next(Ep0Event::Stall) {
                    if state.core.set_stall(ep0, true).is_err() {
                        warn!("Cannot stall EP0");
                    }
                    state.ep0_state = stalled;
                    if let Some(ep) = state.eps.get_mut(ep0) {
                        ep.flags.insert(EndpointFlags::STOPPED);
                    }
                }
            }
            Ok(()) if setup.length == 0 && guard.ep0_state == Ep0State::InStatusPhase => {
                guard.core.ep0_status(UsbDirection::In);
            }
            Ok(()) => {}
        }
        result
    }

    /// The EP0 status phase completed
    ///
    /// Enters a test mode requested during the transfer.
    pub fn ep0_status_complete(&self) {
        let mut state = self.lock();
        match state.ep0_state.next(Ep0Event::StatusDone) {
            Ok(idle) => state.ep0_state = idle,
            Err(_err) => {
                warn!("EP0 status completion in {:?}", state.ep0_state);
                return;
            }
        }
        if state.pending_test_mode.is_some() {
            self.shared.test_mode.schedule();
        }
    }

    /// The host attached, and the core enumerated at `speed`
    pub fn connect(&self, speed: Speed) {
        let mut state = self.lock();
        state.speed = speed;
        if let Ok(next) = state.ep0_state.next(Ep0Event::Attach) {
            state.ep0_state = next;
        }
        info!("Connected at {:?} speed", speed);
    }

    /// The host detached
    ///
    /// Every request completes with [`Status::Disconnected`], then the
    /// gadget driver hears about it.
    pub fn disconnect(&self) {
        let mut guard = self.lock();
        guard.speed = Speed::Unknown;
        if let Ok(next) = guard.ep0_state.next(Ep0Event::Detach) {
            guard.stop_ep0(next);
        }
        guard = self.flush_all(guard, Error::Shutdown);
        let driver = guard.driver.clone();
        drop(guard);
        info!("Disconnected");
        if let Some(driver) = driver {
            driver.disconnect(self);
        }
    }

    /// The host reset the bus
    pub fn reset(&self) {
        let mut guard = self.lock();
        if guard.ep0_state != Ep0State::Disconnected {
            guard.stop_ep0(Ep0State::Idle);
        }
        guard = self.flush_all(guard, Error::Shutdown);
        let state = &mut *guard;
        state.otg.remove(OtgFlags::REMOTE_WAKEUP);
        state.core.set_remote_wakeup_signal(false);
        state.pending_test_mode = None;
        for ep in state.eps.iter_mut().filter(|ep| ep.is_enabled()) {
            ep.flags.remove(EndpointFlags::STOPPED | EndpointFlags::WEDGED);
        }
        debug!("Bus reset");
    }

    pub fn suspend(&self) {
        let driver = self.lock().driver.clone();
        debug!("Suspended");
        if let Some(driver) = driver {
            driver.suspend(self);
        }
    }

    pub fn resume(&self) {
        let driver = self.lock().driver.clone();
        debug!("Resumed");
        if let Some(driver) = driver {
            driver.resume(self);
        }
    }

    /// The host changed the HNP features
    ///
    /// Ignored unless the device is OTG capable. Only the HNP flags in
    /// `flags` apply.
    pub fn hnp_changed(&self, flags: OtgFlags) {
        let mut state = self.lock();
        if !state.config.otg {
            return;
        }
        let otg = state.otg;
        state.otg = otg.difference(OtgFlags::HNP) | (flags & OtgFlags::HNP);
    }

    /// The host enabled or disabled remote wakeup
    pub fn set_remote_wakeup_enable(&self, enable: bool) {
        self.lock().otg.set(OtgFlags::REMOTE_WAKEUP, enable);
    }
}
