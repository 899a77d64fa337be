//! Runtime state of open physical endpoints.
//!
//! Each open endpoint gets a slot with its own lock and completion [Signal]. The lock covers the
//! URB queue and transfer state; it is never held while a caller blocks on the signal, so abort,
//! close and stall from another thread can always get in.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use driver_udc::{endpoint_addr_to_phy, EndpointTy, ENDP_DIR_IN};
use log::{debug, trace, warn};

use crate::device::Core;
use crate::registry::EndpointInfo;
use crate::urb::{AsyncCallback, Completion, Urb, UrbState};
use crate::{Error, Result};

pub(crate) const CTRL_OUT: u8 = 0x00;
pub(crate) const CTRL_IN: u8 = ENDP_DIR_IN;

pub(crate) fn is_ctrl(addr: u8) -> bool {
    addr & 0x7F == 0
}

/// Callbacks of finished asynchronous URBs, run once every lock is released.
pub(crate) type Finished = Vec<(AsyncCallback, Completion)>;

pub(crate) fn run_callbacks(finished: Finished) {
    for (callback, completion) in finished {
        callback(completion);
    }
}

/// Binary completion signal plus an independent abort signal.
pub(crate) struct Signal {
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    abort_tx: Sender<()>,
    abort_rx: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (done_tx, done_rx) = bounded(1);
        let (abort_tx, abort_rx) = bounded(1);
        Self {
            done_tx,
            done_rx,
            abort_tx,
            abort_rx,
        }
    }

    pub fn post(&self) {
        let _ = self.done_tx.try_send(());
    }

    pub fn abort(&self) {
        let _ = self.abort_tx.try_send(());
    }

    /// Drops pending posts left over from an earlier transfer.
    pub fn reset(&self) {
        while self.done_rx.try_recv().is_ok() {}
        while self.abort_rx.try_recv().is_ok() {}
    }

    /// Blocks until posted, aborted, or `timeout` runs out. `None` waits forever.
    pub fn pend(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(timeout) => select! {
                recv(self.done_rx) -> _ => Ok(()),
                recv(self.abort_rx) -> _ => Err(Error::Aborted),
                default(timeout) => Err(Error::Timeout),
            },
            None => select! {
                recv(self.done_rx) -> _ => Ok(()),
                recv(self.abort_rx) -> _ => Err(Error::Aborted),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EpState {
    Close,
    Open,
    Stall,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum XferState {
    None,
    Sync,
    /// The whole remaining length was handed to the controller.
    Async,
    /// The controller took less than the remaining length; every completion starts the next
    /// chunk.
    AsyncPartial,
}

pub(crate) struct EpInner {
    pub addr: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub state: EpState,
    pub xfer: XferState,
    pub urbs: VecDeque<Urb>,
    pub main_busy: bool,
}

impl EpInner {
    fn closed() -> Self {
        Self {
            addr: 0,
            attributes: 0,
            max_packet_size: 0,
            interval: 0,
            state: EpState::Close,
            xfer: XferState::None,
            urbs: VecDeque::new(),
            main_busy: false,
        }
    }

    pub fn ty(&self) -> EndpointTy {
        EndpointTy::from_attributes(self.attributes)
    }

    pub fn owns_head(&self, id: u64) -> bool {
        self.urbs.front().map_or(false, |urb| urb.id == id)
    }

    pub fn head_mut(&mut self, id: u64) -> Option<&mut Urb> {
        self.urbs.front_mut().filter(|urb| urb.id == id)
    }

    pub fn is_async(&self) -> bool {
        matches!(self.xfer, XferState::Async | XferState::AsyncPartial)
    }
}

pub(crate) struct Endpoint {
    pub inner: Mutex<EpInner>,
    pub signal: Signal,
}

struct SlotMap {
    phy_to_slot: [Option<u8>; 32],
    free: u32,
}

pub(crate) struct EndpointTable {
    slots: Vec<Endpoint>,
    map: Mutex<SlotMap>,
}

impl EndpointTable {
    pub fn new(count: usize) -> Self {
        let count = count.min(32);
        let slots = (0..count)
            .map(|_| Endpoint {
                inner: Mutex::new(EpInner::closed()),
                signal: Signal::new(),
            })
            .collect();
        let free = if count == 32 { u32::MAX } else { (1u32 << count) - 1 };
        Self {
            slots,
            map: Mutex::new(SlotMap {
                phy_to_slot: [None; 32],
                free,
            }),
        }
    }

    pub fn get(&self, addr: u8) -> Option<&Endpoint> {
        let phy = usize::from(endpoint_addr_to_phy(addr));
        let slot = self.map.lock().unwrap().phy_to_slot[phy]?;
        self.slots.get(usize::from(slot))
    }

    fn reserve(&self, addr: u8) -> Result<&Endpoint> {
        let phy = usize::from(endpoint_addr_to_phy(addr));
        let mut map = self.map.lock().unwrap();
        if map.phy_to_slot[phy].is_some() {
            return Err(Error::AlreadyExists);
        }
        if map.free == 0 {
            return Err(Error::AllocationExhausted);
        }
        let slot = map.free.trailing_zeros() as u8;
        map.free &= !(1 << slot);
        map.phy_to_slot[phy] = Some(slot);
        Ok(&self.slots[usize::from(slot)])
    }

    fn release(&self, addr: u8) {
        let phy = usize::from(endpoint_addr_to_phy(addr));
        let mut map = self.map.lock().unwrap();
        if let Some(slot) = map.phy_to_slot[phy].take() {
            map.free |= 1 << slot;
        }
    }
}

impl Core {
    pub(crate) fn open_endpoint(&self, info: &EndpointInfo) -> Result<()> {
        self.open_raw(info.address, info.attributes, info.max_packet_size, info.interval)
    }

    fn open_raw(&self, addr: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Result<()> {
        let ep = self.endpoints.reserve(addr)?;
        let mut inner = ep.inner.lock().unwrap();

        let ty = EndpointTy::from_attributes(attributes);
        let packet_size = max_packet_size & 0x7FF;
        let transactions = (((max_packet_size >> 11) & 0x3) + 1) as u8;
        let opened = self
            .driver
            .lock()
            .unwrap()
            .open_endpoint(addr, ty, packet_size, transactions);
        if let Err(err) = opened {
            drop(inner);
            self.endpoints.release(addr);
            warn!("usbd: failed to open endpoint {:#04x}: {}", addr, err);
            return Err(err.into());
        }

        *inner = EpInner {
            addr,
            attributes,
            max_packet_size: packet_size,
            interval,
            state: EpState::Open,
            xfer: XferState::None,
            urbs: VecDeque::new(),
            main_busy: false,
        };
        ep.signal.reset();
        debug!("usbd: opened endpoint {:#04x} {:?} mps {}", addr, ty, packet_size);
        Ok(())
    }

    /// Cancels whatever is queued on the endpoint. Synchronous waiters are woken with
    /// [Error::Aborted]; asynchronous URBs are returned for their callbacks to be run.
    fn abort_locked(&self, ep: &Endpoint, inner: &mut EpInner) -> Finished {
        let mut finished = Vec::new();
        if inner.xfer != XferState::None {
            if let Err(err) = self.driver.lock().unwrap().abort_endpoint(inner.addr) {
                warn!("usbd: controller abort on {:#04x} failed: {}", inner.addr, err);
            }
        }

        match inner.xfer {
            XferState::None => (),
            XferState::Sync => {
                if let Some(urb) = inner.urbs.pop_front() {
                    self.urbs.put(&urb, &mut inner.main_busy);
                }
                ep.signal.abort();
            }
            XferState::Async | XferState::AsyncPartial => {
                while let Some(urb) = inner.urbs.pop_front() {
                    self.urbs.put(&urb, &mut inner.main_busy);
                    debug_assert_eq!(urb.state, UrbState::Async);
                    finished.extend(urb.complete(inner.addr, Err(Error::Aborted)));
                }
            }
        }
        inner.xfer = XferState::None;
        if !finished.is_empty() {
            trace!("usbd: aborted {} urbs on {:#04x}", finished.len(), inner.addr);
        }
        finished
    }

    pub(crate) fn abort_endpoint(&self, addr: u8) -> Result<()> {
        let ep = self.endpoints.get(addr).ok_or(Error::InvalidState)?;
        let finished = {
            let mut inner = ep.inner.lock().unwrap();
            if inner.state == EpState::Close {
                return Err(Error::InvalidState);
            }
            self.abort_locked(ep, &mut inner)
        };
        run_callbacks(finished);
        Ok(())
    }

    pub(crate) fn close_endpoint(&self, addr: u8) {
        let ep = match self.endpoints.get(addr) {
            Some(ep) => ep,
            None => return,
        };
        let finished = {
            let mut inner = ep.inner.lock().unwrap();
            if inner.state == EpState::Close {
                return;
            }
            let finished = self.abort_locked(ep, &mut inner);
            self.driver.lock().unwrap().close_endpoint(addr);
            inner.state = EpState::Close;
            finished
        };
        self.endpoints.release(addr);
        debug!("usbd: closed endpoint {:#04x}", addr);
        run_callbacks(finished);
    }

    /// Halts or resumes a data endpoint. Halting aborts the transfers in flight.
    pub(crate) fn stall_endpoint(&self, addr: u8, stall: bool) -> Result<()> {
        if is_ctrl(addr) {
            return self.stall_ctrl(stall);
        }

        let ep = self.endpoints.get(addr).ok_or(Error::InvalidState)?;
        let (finished, result) = {
            let mut inner = ep.inner.lock().unwrap();
            if inner.state == EpState::Close {
                return Err(Error::InvalidState);
            }
            let finished = if stall {
                self.abort_locked(ep, &mut inner)
            } else {
                Vec::new()
            };
            let result = self.driver.lock().unwrap().stall_endpoint(addr, stall);
            if result.is_ok() {
                inner.state = if stall { EpState::Stall } else { EpState::Open };
            }
            (finished, result)
        };
        debug!("usbd: endpoint {:#04x} {}", addr, if stall { "halted" } else { "resumed" });
        run_callbacks(finished);
        result.map_err(Error::from)
    }

    pub(crate) fn is_endpoint_stalled(&self, addr: u8) -> Result<bool> {
        let ep = self.endpoints.get(addr).ok_or(Error::InvalidState)?;
        let inner = ep.inner.lock().unwrap();
        match inner.state {
            EpState::Close => Err(Error::InvalidState),
            state => Ok(state == EpState::Stall),
        }
    }

    pub(crate) fn open_ctrl(&self) -> Result<()> {
        let attributes = EndpointTy::Ctrl as u8;
        self.open_raw(CTRL_OUT, attributes, self.ctrl_max_pkt, 0)?;
        if let Err(err) = self.open_raw(CTRL_IN, attributes, self.ctrl_max_pkt, 0) {
            self.close_endpoint(CTRL_OUT);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn close_ctrl(&self) {
        self.close_endpoint(CTRL_IN);
        self.close_endpoint(CTRL_OUT);
    }

    /// Protocol stall of the default pipe. The controller clears it on the next SETUP, so the
    /// endpoints stay open as far as the core is concerned.
    pub(crate) fn stall_ctrl(&self, stall: bool) -> Result<()> {
        let mut driver = self.driver.lock().unwrap();
        driver.stall_endpoint(CTRL_IN, stall)?;
        driver.stall_endpoint(CTRL_OUT, stall)?;
        Ok(())
    }

    /// Number of URBs that could still be queued on open endpoints.
    pub(crate) fn urbs_available(&self) -> usize {
        let own = self
            .endpoints
            .slots
            .iter()
            .filter(|ep| {
                let inner = ep.inner.lock().unwrap();
                inner.state != EpState::Close && !inner.main_busy
            })
            .count();
        own + self.urbs.extra_available()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_distinguishes_abort_from_timeout() {
        let signal = Signal::new();
        assert_eq!(signal.pend(Some(Duration::from_millis(10))), Err(Error::Timeout));
        signal.abort();
        assert_eq!(signal.pend(Some(Duration::from_millis(10))), Err(Error::Aborted));
        signal.post();
        signal.post();
        assert_eq!(signal.pend(None), Ok(()));
        signal.post();
        signal.reset();
        assert_eq!(signal.pend(Some(Duration::from_millis(10))), Err(Error::Timeout));
    }

    #[test]
    fn slots_are_reused() {
        let table = EndpointTable::new(2);
        assert!(table.reserve(0x81).is_ok());
        assert!(matches!(table.reserve(0x81), Err(Error::AlreadyExists)));
        assert!(table.reserve(0x02).is_ok());
        assert!(matches!(table.reserve(0x03), Err(Error::AllocationExhausted)));
        table.release(0x81);
        assert!(table.reserve(0x03).is_ok());
        assert!(table.get(0x81).is_none());
        assert!(table.get(0x03).is_some());
    }
}
