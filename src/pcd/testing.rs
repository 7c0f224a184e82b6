//! Test doubles: a controller core, DMA mappings, and a gadget driver

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use super::cil::{Core, EndpointConfig, IsoPacket, IsoParams, Transfer};
use super::{Config, Device, GadgetDriver, Request, RequestId, SetupPacket, Speed, TestMode};
use crate::error::{Error, Status};
use crate::platform::dma::{DmaAddr, DmaDirection, DmaOps, HostDma};
use crate::ral;
use crate::regs::DeviceRegisters;

/// Poll `condition` for up to five seconds
pub(crate) fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// A device with a bound driver, connected at high speed
pub(crate) fn connected(config: Config) -> (Device, MockCore, Arc<TestDriver>) {
    let (core, log) = MockCore::new();
    let device = Device::new(config, core, HostDma::new()).unwrap();
    let driver = TestDriver::new();
    device.register_driver(driver.clone()).unwrap();
    device.connect(Speed::High);
    (device, MockCore::from_log(log), driver)
}

/// Like [`connected`], with DMA on and scripted mappings
pub(crate) fn connected_dma(config: Config) -> (Device, MockCore, Mappings) {
    let (core, log) = MockCore::new();
    let (dma, mappings) = ScriptedDma::new();
    let device = Device::new(config.dma(true), core, dma).unwrap();
    device.register_driver(TestDriver::new()).unwrap();
    device.connect(Speed::High);
    (device, MockCore::from_log(log), mappings)
}

/// A GET_DESCRIPTOR(DEVICE) setup packet
pub(crate) fn get_descriptor(length: u16) -> [u8; 8] {
    SetupPacket {
        request_type: 0x80,
        request: 6,
        value: 0x0100,
        index: 0,
        length,
    }
    .to_bytes()
}

pub(crate) struct Started {
    pub(crate) address: EndpointAddress,
    pub(crate) id: RequestId,
    pub(crate) length: usize,
    pub(crate) dma: DmaAddr,
    pub(crate) zero: bool,
    /// What an IN transfer sends
    pub(crate) data: Vec<u8>,
}

/// Everything the mock core was asked to do
#[derive(Default)]
pub(crate) struct CoreLog {
    pub(crate) regs: DeviceRegisters,
    pub(crate) activated: Vec<EndpointConfig>,
    pub(crate) deactivated: Vec<EndpointAddress>,
    pub(crate) started: Vec<Started>,
    pub(crate) stopped: Vec<EndpointAddress>,
    pub(crate) status_phases: Vec<UsbDirection>,
    stalled: Vec<EndpointAddress>,
    pub(crate) iso_started: Vec<IsoParams>,
    pub(crate) iso_stopped: Vec<EndpointAddress>,
    /// Results for isochronous packets, by index
    pub(crate) iso_packets: Vec<IsoPacket>,
    /// What OUT transfers receive
    pub(crate) out_fill: Vec<u8>,
    pub(crate) wakeup_signals: Vec<bool>,
}

impl CoreLog {
    pub(crate) fn is_stalled(&self, address: EndpointAddress) -> bool {
        self.stalled.contains(&address)
    }
}

/// A core that records requests, and answers from [`CoreLog`]
///
/// Clones share the log.
#[derive(Clone)]
pub(crate) struct MockCore {
    log: Arc<Mutex<CoreLog>>,
}

impl MockCore {
    pub(crate) fn new() -> (Self, Arc<Mutex<CoreLog>>) {
        let log = Arc::new(Mutex::new(CoreLog::default()));
        (Self::from_log(Arc::clone(&log)), log)
    }

    pub(crate) fn from_log(log: Arc<Mutex<CoreLog>>) -> Self {
        MockCore { log }
    }

    fn log(&self) -> MutexGuard<'_, CoreLog> {
        self.log.lock().unwrap()
    }

    pub(crate) fn started(&self) -> Vec<(EndpointAddress, RequestId, usize)> {
        self.log()
            .started
            .iter()
            .map(|started| (started.address, started.id, started.length))
            .collect()
    }

    pub(crate) fn started_dma(&self) -> Vec<DmaAddr> {
        self.log().started.iter().map(|started| started.dma).collect()
    }

    pub(crate) fn started_zero(&self) -> Vec<bool> {
        self.log().started.iter().map(|started| started.zero).collect()
    }

    pub(crate) fn in_data(&self) -> Vec<Vec<u8>> {
        self.log()
            .started
            .iter()
            .filter(|started| started.address.direction() == UsbDirection::In)
            .map(|started| started.data.clone())
            .collect()
    }

    pub(crate) fn stopped(&self) -> Vec<EndpointAddress> {
        self.log().stopped.clone()
    }

    pub(crate) fn deactivated(&self) -> Vec<EndpointAddress> {
        self.log().deactivated.clone()
    }

    pub(crate) fn status_phases(&self) -> Vec<UsbDirection> {
        self.log().status_phases.clone()
    }

    pub(crate) fn is_stalled(&self, address: EndpointAddress) -> bool {
        self.log().is_stalled(address)
    }

    pub(crate) fn fill_out(&self, data: &[u8]) {
        self.log().out_fill = data.to_vec();
    }

    pub(crate) fn set_frame(&self, frame: u16) {
        let log = self.log();
        ral::write_reg!(crate::regs, &log.regs, DSTS, SOFFN: u32::from(frame));
    }

    pub(crate) fn remote_wakeup_signal(&self) -> bool {
        self.log().regs.remote_wakeup_signal()
    }

    pub(crate) fn wakeup_signals(&self) -> Vec<bool> {
        self.log().wakeup_signals.clone()
    }

    pub(crate) fn soft_disconnected(&self) -> bool {
        self.log().regs.soft_disconnected()
    }

    pub(crate) fn test_mode(&self) -> Option<TestMode> {
        self.log().regs.test_mode()
    }

    pub(crate) fn iso_started(&self) -> Vec<IsoParams> {
        self.log().iso_started.clone()
    }

    pub(crate) fn iso_stopped(&self) -> Vec<EndpointAddress> {
        self.log().iso_stopped.clone()
    }

    pub(crate) fn set_iso_packets(&self, packets: Vec<IsoPacket>) {
        self.log().iso_packets = packets;
    }
}

impl Core for MockCore {
    fn ep_activate(&mut self, config: &EndpointConfig) -> Result<(), Error> {
        self.log().activated.push(*config);
        Ok(())
    }

    fn ep_deactivate(&mut self, address: EndpointAddress) {
        self.log().deactivated.push(address);
    }

    fn start_transfer(&mut self, address: EndpointAddress, transfer: Transfer<'_>) {
        let mut log = self.log();
        if address.direction() == UsbDirection::Out {
            let len = log.out_fill.len().min(transfer.buf.len());
            transfer.buf[..len].copy_from_slice(&log.out_fill[..len]);
        }
        log.started.push(Started {
            address,
            id: transfer.id,
            length: transfer.length,
            dma: transfer.dma,
            zero: transfer.zero,
            data: transfer.buf.to_vec(),
        });
    }

    fn stop_transfer(&mut self, address: EndpointAddress) {
        self.log().stopped.push(address);
    }

    fn ep0_status(&mut self, direction: UsbDirection) {
        self.log().status_phases.push(direction);
    }

    fn set_stall(&mut self, address: EndpointAddress, stall: bool) -> Result<(), Error> {
        let mut log = self.log();
        log.stalled.retain(|stalled| *stalled != address);
        if stall {
            log.stalled.push(address);
        }
        Ok(())
    }

    fn iso_start(&mut self, _: EndpointAddress, params: &IsoParams) -> Result<(), Error> {
        self.log().iso_started.push(*params);
        Ok(())
    }

    fn iso_stop(&mut self, address: EndpointAddress) {
        self.log().iso_stopped.push(address);
    }

    fn iso_packet(&mut self, _: EndpointAddress, _: usize, index: usize) -> IsoPacket {
        self.log()
            .iso_packets
            .get(index)
            .copied()
            .unwrap_or(IsoPacket {
                status: Ok(()),
                actual: 0,
                offset: 0,
            })
    }

    fn frame_number(&self) -> u16 {
        self.log().regs.frame_number()
    }

    fn set_remote_wakeup_signal(&mut self, signal: bool) {
        let mut log = self.log();
        log.regs.set_remote_wakeup_signal(signal);
        log.wakeup_signals.push(signal);
    }

    fn set_soft_disconnect(&mut self, disconnect: bool) {
        self.log().regs.set_soft_disconnect(disconnect);
    }

    fn set_test_mode(&mut self, mode: Option<TestMode>) {
        self.log().regs.set_test_mode(mode);
    }
}

#[derive(Default)]
struct DmaLog {
    live: Vec<DmaAddr>,
    unmapped: Vec<DmaAddr>,
    maps: usize,
    misalign: usize,
    fail: bool,
    next: u64,
}

/// Hands out made-up, word aligned device addresses
pub(crate) struct ScriptedDma {
    log: Arc<Mutex<DmaLog>>,
}

/// The test's view of a [`ScriptedDma`]
#[derive(Clone)]
pub(crate) struct Mappings {
    log: Arc<Mutex<DmaLog>>,
}

impl ScriptedDma {
    pub(crate) fn new() -> (Self, Mappings) {
        let log = Arc::new(Mutex::new(DmaLog::default()));
        (
            ScriptedDma {
                log: Arc::clone(&log),
            },
            Mappings { log },
        )
    }
}

impl Mappings {
    /// Mappings not yet unmapped
    pub(crate) fn live(&self) -> usize {
        self.log.lock().unwrap().live.len()
    }

    /// Every address unmapped, in order
    pub(crate) fn unmapped(&self) -> Vec<DmaAddr> {
        self.log.lock().unwrap().unmapped.clone()
    }

    pub(crate) fn maps(&self) -> usize {
        self.log.lock().unwrap().maps
    }

    /// Make the next mapping unaligned
    pub(crate) fn misalign_next(&self) {
        self.log.lock().unwrap().misalign += 1;
    }

    /// Fail every mapping from now on
    pub(crate) fn fail(&self) {
        self.log.lock().unwrap().fail = true;
    }
}

impl DmaOps for ScriptedDma {
    fn map_single(&mut self, _: &[u8], _: DmaDirection) -> Option<DmaAddr> {
        let mut log = self.log.lock().unwrap();
        if log.fail {
            return None;
        }
        log.maps += 1;
        log.next += 0x1000;
        let mut addr = 0x2000_0000 + log.next;
        if log.misalign > 0 {
            log.misalign -= 1;
            addr += 2;
        }
        log.live.push(DmaAddr(addr));
        Some(DmaAddr(addr))
    }

    fn unmap_single(&mut self, addr: DmaAddr, _: usize, _: DmaDirection) {
        let mut log = self.log.lock().unwrap();
        log.live.retain(|live| *live != addr);
        log.unmapped.push(addr);
    }
}

/// Collects completed requests
#[derive(Clone, Default)]
pub(crate) struct Completions {
    done: Arc<Mutex<Vec<Request>>>,
}

impl Completions {
    /// A request that lands here when it completes
    pub(crate) fn request(&self, buf: Vec<u8>) -> Request {
        let done = Arc::clone(&self.done);
        Request::new(buf).with_complete(move |_, _, request| done.lock().unwrap().push(request))
    }

    pub(crate) fn take(&self) -> Vec<Request> {
        std::mem::take(&mut *self.done.lock().unwrap())
    }
}

/// Requests that queue themselves again from their completion
#[derive(Clone, Default)]
pub(crate) struct Requeue {
    statuses: Arc<Mutex<Vec<Status>>>,
    refused: Arc<Mutex<Vec<Error>>>,
}

impl Requeue {
    pub(crate) fn request(&self, buf: Vec<u8>) -> Request {
        let this = self.clone();
        Request::new(buf).with_complete(move |device, address, request| {
            this.statuses.lock().unwrap().push(request.status());
            if let Err(rejected) = device.queue(address, request) {
                this.refused.lock().unwrap().push(rejected.error);
            }
        })
    }

    /// Statuses seen by the callback, in order
    pub(crate) fn statuses(&self) -> Vec<Status> {
        self.statuses.lock().unwrap().clone()
    }

    /// Why the callback couldn't requeue
    pub(crate) fn refused(&self) -> Vec<Error> {
        self.refused.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverEvent {
    Bind,
    Unbind,
    Setup(SetupPacket),
    Disconnect,
    Suspend,
    Resume,
    StateChanged(UsbDeviceState),
}

/// A gadget driver that records its calls
///
/// Answers control reads with [`reply_with`](Self::reply_with) data, and
/// control writes with a [`receive`](Self::receive) buffer.
pub(crate) struct TestDriver {
    speed: Speed,
    events: Mutex<Vec<DriverEvent>>,
    bind_error: Mutex<Option<Error>>,
    setup_error: Mutex<Option<Error>>,
    reply: Mutex<Option<Vec<u8>>>,
    receive: Mutex<Option<usize>>,
    replies: Completions,
}

impl TestDriver {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_speed(Speed::High)
    }

    pub(crate) fn with_speed(speed: Speed) -> Arc<Self> {
        Arc::new(TestDriver {
            speed,
            events: Mutex::new(Vec::new()),
            bind_error: Mutex::new(None),
            setup_error: Mutex::new(None),
            reply: Mutex::new(None),
            receive: Mutex::new(None),
            replies: Completions::default(),
        })
    }

    pub(crate) fn fail_bind(&self, err: Error) {
        *self.bind_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn fail_setup(&self, err: Error) {
        *self.setup_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn reply_with(&self, data: Vec<u8>) {
        *self.reply.lock().unwrap() = Some(data);
    }

    pub(crate) fn receive(&self, len: usize) {
        *self.receive.lock().unwrap() = Some(len);
    }

    pub(crate) fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Completed EP0 requests
    pub(crate) fn replies(&self) -> Vec<Request> {
        self.replies.take()
    }

    fn record(&self, event: DriverEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl GadgetDriver for TestDriver {
    fn name(&self) -> &str {
        "test"
    }

    fn max_speed(&self) -> Speed {
        self.speed
    }

    fn bind(&self, _: &Device) -> Result<(), Error> {
        self.record(DriverEvent::Bind);
        match *self.bind_error.lock().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn unbind(&self, _: &Device) {
        self.record(DriverEvent::Unbind);
    }

    fn setup(&self, device: &Device, setup: &SetupPacket) -> Result<(), Error> {
        self.record(DriverEvent::Setup(*setup));
        if let Some(err) = *self.setup_error.lock().unwrap() {
            return Err(err);
        }
        if setup.length == 0 {
            return Ok(());
        }
        let ep0 = EndpointAddress::from(0);
        let request = match setup.direction() {
            UsbDirection::In => {
                let reply = self.reply.lock().unwrap().clone();
                reply.map(|data| {
                    let len = data.len().min(usize::from(setup.length));
                    self.replies.request(data).with_length(len)
                })
            }
            UsbDirection::Out => {
                let receive = *self.receive.lock().unwrap();
                receive.map(|len| self.replies.request(vec![0; len]))
            }
        };
        if let Some(request) = request {
            device
                .queue(ep0, request)
                .map_err(|rejected| rejected.error)?;
        }
        Ok(())
    }

    fn disconnect(&self, _: &Device) {
        self.record(DriverEvent::Disconnect);
    }

    fn suspend(&self, _: &Device) {
        self.record(DriverEvent::Suspend);
    }

    fn resume(&self, _: &Device) {
        self.record(DriverEvent::Resume);
    }

    fn state_changed(&self, _: &Device, state: UsbDeviceState) {
        self.record(DriverEvent::StateChanged(state));
    }
}
