//! A software USB device controller.
//!
//! [SimUDC] implements [UDCAdapter] without hardware: the "host" side is driven through a
//! [SimHost] handle, which raises bus events, issues control transfers, queues OUT packets and
//! collects IN packets. Every transaction the device starts is completed by a worker thread, the
//! same way an interrupt handler would report it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::timeout::Timeout;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};

use crate::{
    endpoint_is_in, BusEvent, EndpointCaps, EndpointCapability, EndpointTy, Result, Speed,
    UDCAdapter, UDCError, UDCEvents,
};

const CTRL_OUT: u8 = 0x00;
const CTRL_IN: u8 = 0x80;

enum Work {
    Complete {
        addr: u8,
        epoch: u64,
        result: Result<()>,
    },
    Shutdown,
}

struct SimEndpoint {
    ty: EndpointTy,
    max_packet_size: u16,
    stalled: bool,
    /// Bumped on abort so completions queued before it are dropped.
    epoch: u64,
    armed: Option<usize>,
    received: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Default)]
struct EndpointStats {
    transactions: usize,
    zlps: usize,
}

#[derive(Default)]
struct SimState {
    started: bool,
    address: u8,
    frame: u16,
    next_epoch: u64,
    endpoints: BTreeMap<u8, SimEndpoint>,
    /// Packets the host has queued for OUT endpoints, kept across endpoint open/close.
    host_out: BTreeMap<u8, VecDeque<Vec<u8>>>,
    /// Packets the device has sent on IN endpoints and the host has not collected yet.
    host_in: BTreeMap<u8, Vec<Vec<u8>>>,
    stats: BTreeMap<u8, EndpointStats>,
    fail_next: BTreeSet<u8>,
}

impl SimState {
    fn endpoint(&mut self, addr: u8) -> Result<&mut SimEndpoint> {
        self.endpoints.get_mut(&addr).ok_or(UDCError::NotOpen(addr))
    }

    fn completion(&mut self, addr: u8) -> Option<Work> {
        let epoch = match self.endpoints.get(&addr) {
            Some(ep) if !ep.stalled => ep.epoch,
            _ => return None,
        };
        let result = if self.fail_next.remove(&addr) {
            Err(UDCError::Transfer(addr))
        } else {
            Ok(())
        };
        Some(Work::Complete {
            addr,
            epoch,
            result,
        })
    }

    /// Hands the next queued host packet to an armed OUT endpoint.
    fn deliver_out(&mut self, addr: u8) -> Option<Work> {
        let ep = self.endpoints.get_mut(&addr)?;
        if ep.stalled || ep.armed.is_none() || ep.received.is_some() {
            return None;
        }
        let packet = self.host_out.get_mut(&addr)?.pop_front()?;
        ep.armed = None;
        ep.received = Some(packet);
        self.stats.entry(addr).or_default().transactions += 1;
        self.completion(addr)
    }
}

struct SimShared {
    speed: Speed,
    state: Mutex<SimState>,
    events: Mutex<Option<Arc<dyn UDCEvents>>>,
    work: Sender<Work>,
}

impl SimShared {
    fn events(&self) -> Option<Arc<dyn UDCEvents>> {
        self.events.lock().unwrap().clone()
    }

    fn post(&self, work: Option<Work>) {
        if let Some(work) = work {
            // The worker only goes away when the controller is dropped.
            let _ = self.work.send(work);
        }
    }
}

pub struct SimUDC {
    shared: Arc<SimShared>,
    table: Vec<EndpointCapability>,
    worker: Option<JoinHandle<()>>,
}

/// Host-side handle onto a [SimUDC].
#[derive(Clone)]
pub struct SimHost {
    shared: Arc<SimShared>,
}

/// Result of a control transfer issued through [SimHost::control].
#[derive(Clone, Debug, Default)]
pub struct ControlOutcome {
    /// The device answered with a STALL handshake.
    pub stalled: bool,
    /// The status stage completed.
    pub completed: bool,
    /// Bytes the device returned in the data stage.
    pub data: Vec<u8>,
}

impl ControlOutcome {
    pub fn is_ok(&self) -> bool {
        self.completed && !self.stalled
    }
}

impl SimUDC {
    pub fn new(speed: Speed, table: Vec<EndpointCapability>) -> (Self, SimHost) {
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SimShared {
            speed,
            state: Mutex::new(SimState::default()),
            events: Mutex::new(None),
            work: work_tx,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("sim-udc".into())
            .spawn(move || run_worker(worker_shared, work_rx))
            .ok();
        if worker.is_none() {
            warn!("sim-udc: failed to spawn completion worker");
        }

        let host = SimHost {
            shared: Arc::clone(&shared),
        };
        (
            SimUDC {
                shared,
                table,
                worker,
            },
            host,
        )
    }

    /// A full-speed controller with a control pair and six bidirectional 64 byte endpoints.
    pub fn full_speed() -> (Self, SimHost) {
        Self::new(Speed::Full, Self::endpoint_table_for(Speed::Full, 6))
    }

    /// A high-speed capable controller with a control pair and six bidirectional endpoints.
    pub fn high_speed() -> (Self, SimHost) {
        Self::new(Speed::High, Self::endpoint_table_for(Speed::High, 6))
    }

    pub fn endpoint_table_for(speed: Speed, data_endpoints: u8) -> Vec<EndpointCapability> {
        let max = match speed {
            Speed::High => 1024,
            _ => 64,
        };
        let data = EndpointCaps::BULK | EndpointCaps::INTR | EndpointCaps::ISOC;

        let mut table = vec![
            EndpointCapability::new(EndpointCaps::CTRL | EndpointCaps::DIR_OUT, 0, 64),
            EndpointCapability::new(EndpointCaps::CTRL | EndpointCaps::DIR_IN, 0, 64),
        ];
        for nbr in 1..=data_endpoints {
            table.push(EndpointCapability::new(data | EndpointCaps::DIR_OUT, nbr, max));
            table.push(EndpointCapability::new(data | EndpointCaps::DIR_IN, nbr, max));
        }
        table
    }
}

impl Drop for SimUDC {
    fn drop(&mut self) {
        let _ = self.shared.work.send(Work::Shutdown);
        if let Some(worker) = self.worker.take() {
            // The last handle may be released from a completion callback on the worker itself.
            if thread::current().id() != worker.thread().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(shared: Arc<SimShared>, work: Receiver<Work>) {
    loop {
        match work.recv() {
            Ok(Work::Complete {
                addr,
                epoch,
                result,
            }) => {
                let current = shared
                    .state
                    .lock()
                    .unwrap()
                    .endpoints
                    .get(&addr)
                    .map(|ep| ep.epoch);
                if current != Some(epoch) {
                    trace!("sim-udc: dropping stale completion on {:#04x}", addr);
                    continue;
                }
                match shared.events() {
                    Some(events) => events.endpoint_complete(addr, result),
                    None => warn!("sim-udc: completion on {:#04x} with no event sink", addr),
                }
            }
            Ok(Work::Shutdown) | Err(_) => break,
        }
    }
}

impl UDCAdapter for SimUDC {
    fn init(&mut self, events: Arc<dyn UDCEvents>) -> Result<()> {
        *self.shared.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.events().is_none() {
            return Err(UDCError::NoEventSink);
        }
        self.shared.state.lock().unwrap().started = true;
        debug!("sim-udc: started ({} speed)", self.shared.speed.as_str());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.started = false;
        state.endpoints.clear();
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.shared.speed
    }

    fn endpoint_table(&self) -> &[EndpointCapability] {
        &self.table
    }

    fn set_address(&mut self, addr: u8) -> Result<()> {
        self.shared.state.lock().unwrap().address = addr;
        Ok(())
    }

    fn frame_number(&self) -> u16 {
        self.shared.state.lock().unwrap().frame
    }

    fn open_endpoint(&mut self, addr: u8, ty: EndpointTy, max_packet_size: u16, transactions: u8) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.endpoints.contains_key(&addr) {
            return Err(UDCError::AlreadyOpen(addr));
        }
        trace!(
            "sim-udc: open {:#04x} {:?} mps {} x{}",
            addr,
            ty,
            max_packet_size,
            transactions
        );
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        state.endpoints.insert(
            addr,
            SimEndpoint {
                ty,
                max_packet_size,
                stalled: false,
                epoch,
                armed: None,
                received: None,
            },
        );
        Ok(())
    }

    fn close_endpoint(&mut self, addr: u8) {
        self.shared.state.lock().unwrap().endpoints.remove(&addr);
    }

    fn stall_endpoint(&mut self, addr: u8, stall: bool) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        let ep = state.endpoint(addr)?;
        ep.stalled = stall;
        if stall {
            ep.armed = None;
        }
        Ok(())
    }

    fn abort_endpoint(&mut self, addr: u8) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let ep = state.endpoint(addr)?;
        ep.epoch = epoch;
        ep.armed = None;
        ep.received = None;
        Ok(())
    }

    fn rx_start(&mut self, addr: u8, len: usize) -> Result<usize> {
        let work = {
            let mut state = self.shared.state.lock().unwrap();
            let ep = state.endpoint(addr)?;
            let accepted = len.min(usize::from(ep.max_packet_size));
            ep.armed = Some(accepted);
            (accepted, state.deliver_out(addr))
        };
        self.shared.post(work.1);
        Ok(work.0)
    }

    fn rx(&mut self, addr: u8, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.shared.state.lock().unwrap();
        let packet = state.endpoint(addr)?.received.take().ok_or(UDCError::NotReady(addr))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(packet.len())
    }

    fn rx_zlp(&mut self, addr: u8) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.endpoint(addr)?.received.take();
        state.stats.entry(addr).or_default().zlps += 1;
        Ok(())
    }

    fn tx(&mut self, addr: u8, buf: &[u8]) -> Result<usize> {
        let mut state = self.shared.state.lock().unwrap();
        let ep = state.endpoint(addr)?;
        Ok(buf.len().min(usize::from(ep.max_packet_size)))
    }

    fn tx_start(&mut self, addr: u8, buf: &[u8]) -> Result<()> {
        let work = {
            let mut state = self.shared.state.lock().unwrap();
            state.endpoint(addr)?;
            state.host_in.entry(addr).or_default().push(buf.to_vec());
            state.stats.entry(addr).or_default().transactions += 1;
            state.completion(addr)
        };
        self.shared.post(work);
        Ok(())
    }

    fn tx_zlp(&mut self, addr: u8) -> Result<()> {
        let work = {
            let mut state = self.shared.state.lock().unwrap();
            state.endpoint(addr)?;
            state.host_in.entry(addr).or_default().push(Vec::new());
            let stats = state.stats.entry(addr).or_default();
            stats.transactions += 1;
            stats.zlps += 1;
            state.completion(addr)
        };
        self.shared.post(work);
        Ok(())
    }
}

impl SimHost {
    fn bus(&self, event: BusEvent) {
        match self.shared.events() {
            Some(events) => events.bus_event(event),
            None => warn!("sim-udc: {:?} with no event sink", event),
        }
    }

    pub fn connect(&self) {
        self.bus(BusEvent::Connect);
    }

    pub fn disconnect(&self) {
        self.bus(BusEvent::Disconnect);
    }

    /// Drives a bus reset, followed by the high-speed handshake on a high-speed controller.
    pub fn reset(&self) {
        self.bus(BusEvent::Reset);
        if self.shared.speed == Speed::High {
            self.bus(BusEvent::HighSpeed);
        }
    }

    pub fn suspend(&self) {
        self.bus(BusEvent::Suspend);
    }

    pub fn resume(&self) {
        self.bus(BusEvent::Resume);
    }

    /// Issues a control transfer and waits for the device to finish the status stage or stall.
    ///
    /// `data` is sent in the data stage of host-to-device requests and ignored otherwise.
    pub fn control(&self, setup: [u8; 8], data: &[u8]) -> ControlOutcome {
        self.control_timeout(setup, data, Duration::from_secs(5))
    }

    pub fn control_timeout(&self, setup: [u8; 8], data: &[u8], timeout: Duration) -> ControlOutcome {
        let dev_to_host = setup[0] & 0x80 != 0;
        // The status stage runs opposite to the data stage.
        let status_addr = if dev_to_host { CTRL_OUT } else { CTRL_IN };

        let baseline = {
            let mut state = self.shared.state.lock().unwrap();
            // A SETUP token clears a protocol stall on the default pipe.
            for addr in [CTRL_OUT, CTRL_IN] {
                if let Some(ep) = state.endpoints.get_mut(&addr) {
                    ep.stalled = false;
                    ep.received = None;
                }
            }
            state.host_out.remove(&CTRL_OUT);
            state.host_in.remove(&CTRL_IN);

            let mps = state
                .endpoints
                .get(&CTRL_OUT)
                .map(|ep| usize::from(ep.max_packet_size))
                .unwrap_or(64);
            let queue = state.host_out.entry(CTRL_OUT).or_default();
            if dev_to_host {
                queue.push_back(Vec::new());
            } else {
                queue.extend(data.chunks(mps).map(|chunk| chunk.to_vec()));
            }
            state.stats.get(&status_addr).map(|s| s.zlps).unwrap_or(0)
        };

        match self.shared.events() {
            Some(events) => events.setup(setup),
            None => return ControlOutcome::default(),
        }

        let shared = &self.shared;
        let stalled = |state: &SimState| {
            [CTRL_OUT, CTRL_IN]
                .iter()
                .any(|addr| state.endpoints.get(addr).map(|ep| ep.stalled).unwrap_or(false))
        };
        let done = Timeout::new(timeout).wait_until(|| {
            let state = shared.state.lock().unwrap();
            stalled(&state) || state.stats.get(&status_addr).map(|s| s.zlps).unwrap_or(0) > baseline
        });

        let mut state = self.shared.state.lock().unwrap();
        let stalled = stalled(&state);
        let data = if dev_to_host {
            state
                .host_in
                .remove(&CTRL_IN)
                .unwrap_or_default()
                .concat()
        } else {
            Vec::new()
        };
        ControlOutcome {
            stalled,
            completed: done && !stalled,
            data,
        }
    }

    /// Queues one packet for an OUT endpoint.
    pub fn queue_out_packet(&self, addr: u8, packet: &[u8]) {
        let work = {
            let mut state = self.shared.state.lock().unwrap();
            state
                .host_out
                .entry(addr)
                .or_default()
                .push_back(packet.to_vec());
            state.deliver_out(addr)
        };
        self.shared.post(work);
    }

    /// Splits `data` into `max_packet_size` packets and queues them for an OUT endpoint. Empty
    /// data queues a single zero-length packet.
    pub fn queue_out(&self, addr: u8, data: &[u8], max_packet_size: usize) {
        if data.is_empty() {
            self.queue_out_packet(addr, &[]);
        }
        for chunk in data.chunks(max_packet_size.max(1)) {
            self.queue_out_packet(addr, chunk);
        }
    }

    /// Drains the packets the device sent on an IN endpoint.
    pub fn take_in(&self, addr: u8) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .unwrap()
            .host_in
            .remove(&addr)
            .unwrap_or_default()
    }

    pub fn wait_in_packets(&self, addr: u8, count: usize, timeout: Duration) -> bool {
        Timeout::new(timeout).wait_until(|| {
            let state = self.shared.state.lock().unwrap();
            state.host_in.get(&addr).map(Vec::len).unwrap_or(0) >= count
        })
    }

    /// Number of packets, zero-length ones included, that moved on `addr`.
    pub fn transactions(&self, addr: u8) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.stats.get(&addr).map(|s| s.transactions).unwrap_or(0)
    }

    pub fn zlps(&self, addr: u8) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.stats.get(&addr).map(|s| s.zlps).unwrap_or(0)
    }

    pub fn reset_stats(&self) {
        self.shared.state.lock().unwrap().stats.clear();
    }

    /// Makes the next transaction on `addr` complete with a transfer error.
    pub fn fail_next(&self, addr: u8) {
        self.shared.state.lock().unwrap().fail_next.insert(addr);
    }

    pub fn is_stalled(&self, addr: u8) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.endpoints.get(&addr).map(|ep| ep.stalled).unwrap_or(false)
    }

    pub fn is_open(&self, addr: u8) -> bool {
        self.shared.state.lock().unwrap().endpoints.contains_key(&addr)
    }

    pub fn endpoint_type(&self, addr: u8) -> Option<EndpointTy> {
        let state = self.shared.state.lock().unwrap();
        state.endpoints.get(&addr).map(|ep| ep.ty)
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.lock().unwrap().started
    }

    pub fn address(&self) -> u8 {
        self.shared.state.lock().unwrap().address
    }

    pub fn set_frame_number(&self, frame: u16) {
        self.shared.state.lock().unwrap().frame = frame & 0x7FF;
    }

    /// Whether `addr` names an IN endpoint, for host code that only has the address.
    pub fn is_in(addr: u8) -> bool {
        endpoint_is_in(addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Recorder(Mutex<Vec<(u8, Result<()>)>>);

    impl UDCEvents for Recorder {
        fn bus_event(&self, _event: BusEvent) {}
        fn setup(&self, _packet: [u8; 8]) {}
        fn endpoint_complete(&self, addr: u8, result: Result<()>) {
            self.0.lock().unwrap().push((addr, result));
        }
    }

    fn started() -> (SimUDC, SimHost, Arc<Recorder>) {
        let (mut udc, host) = SimUDC::full_speed();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        udc.init(recorder.clone()).unwrap();
        udc.start().unwrap();
        (udc, host, recorder)
    }

    #[test]
    fn tx_accepts_one_packet() {
        let (mut udc, host, recorder) = started();
        udc.open_endpoint(0x81, EndpointTy::Bulk, 64, 1).unwrap();

        let buf = [7u8; 100];
        let accepted = udc.tx(0x81, &buf).unwrap();
        assert_eq!(accepted, 64);
        udc.tx_start(0x81, &buf[..accepted]).unwrap();

        assert!(host.wait_in_packets(0x81, 1, Duration::from_secs(5)));
        assert!(Timeout::from_secs(5).wait_until(|| recorder.0.lock().unwrap().len() == 1));
        assert_eq!(host.take_in(0x81), vec![vec![7u8; 64]]);
        assert_eq!(host.transactions(0x81), 1);
    }

    #[test]
    fn rx_waits_for_host_data() {
        let (mut udc, host, recorder) = started();
        udc.open_endpoint(0x01, EndpointTy::Bulk, 64, 1).unwrap();

        assert_eq!(udc.rx_start(0x01, 512).unwrap(), 64);
        assert!(recorder.0.lock().unwrap().is_empty());

        host.queue_out(0x01, &[1, 2, 3], 64);
        assert!(Timeout::from_secs(5).wait_until(|| recorder.0.lock().unwrap().len() == 1));

        let mut buf = [0u8; 64];
        assert_eq!(udc.rx(0x01, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn unopened_endpoint_is_rejected() {
        let (mut udc, _host, _recorder) = started();
        assert_eq!(udc.tx(0x82, &[0]), Err(UDCError::NotOpen(0x82)));
        assert_eq!(udc.rx_start(0x02, 1), Err(UDCError::NotOpen(0x02)));
    }
}
