//! The transfer engine: synchronous and asynchronous transfers over open endpoints.
//!
//! A synchronous transfer owns its endpoint's URB queue for its whole duration. It starts one
//! transaction at a time, releases the endpoint lock, blocks on the endpoint signal and picks the
//! lock up again to look at the outcome. Asynchronous transfers queue behind each other; only the
//! head URB is on the wire, and the event loop advances it on every completion.

use std::future::Future;
use std::sync::MutexGuard;
use std::time::Duration;

use driver_udc::{endpoint_is_in, EndpointTy};
use futures::channel::oneshot;
use log::{trace, warn};

use crate::device::Core;
use crate::endpoint::{run_callbacks, EpInner, EpState, Endpoint, Finished, XferState, CTRL_IN, CTRL_OUT};
use crate::event::CoreEvent;
use crate::state::DeviceState;
use crate::urb::{AsyncCallback, UrbFlags, UrbState};
use crate::{Error, Result, UsbDevice};

fn transport_error(addr: u8) -> Error {
    if endpoint_is_in(addr) {
        Error::Transmit
    } else {
        Error::Receive
    }
}

impl Core {
    fn begin_sync(&self, addr: u8, len: usize) -> Result<(&Endpoint, MutexGuard<'_, EpInner>, u64)> {
        let ep = self.endpoints.get(addr).ok_or(Error::InvalidState)?;
        let mut guard = ep.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state != EpState::Open {
            return Err(Error::InvalidState);
        }
        if inner.xfer != XferState::None {
            return Err(Error::NotReady);
        }

        let urb = self.urbs.get(&mut inner.main_busy, UrbState::Sync, Vec::new(), len)?;
        let id = urb.id;
        inner.urbs.push_back(urb);
        inner.xfer = XferState::Sync;
        ep.signal.reset();
        Ok((ep, guard, id))
    }

    fn end_sync(&self, inner: &mut EpInner, id: u64) {
        if inner.owns_head(id) {
            if let Some(urb) = inner.urbs.pop_front() {
                self.urbs.put(&urb, &mut inner.main_busy);
            }
            inner.xfer = XferState::None;
        }
    }

    /// Releases the endpoint lock, waits for the transaction and takes the lock again.
    fn wait_sync<'a>(
        &self,
        ep: &'a Endpoint,
        guard: MutexGuard<'a, EpInner>,
        id: u64,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, EpInner>, Result<()>) {
        drop(guard);
        let pended = ep.signal.pend(timeout);
        let mut guard = ep.inner.lock().unwrap();

        // Abort and close take the URB away from us.
        if !guard.owns_head(id) {
            return (guard, Err(Error::Aborted));
        }
        let result = match pended {
            Ok(()) => match guard.head_mut(id).and_then(|urb| urb.result.take()) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(Error::Timeout) => {
                let xfer_len = guard.head_mut(id).map(|urb| urb.xfer_len).unwrap_or(0);
                warn!(
                    "usbd: transfer on {:#04x} timed out after {} bytes",
                    guard.addr, xfer_len
                );
                if let Err(err) = self.driver.lock().unwrap().abort_endpoint(guard.addr) {
                    warn!("usbd: controller abort on {:#04x} failed: {}", guard.addr, err);
                }
                Err(Error::Timeout)
            }
            Err(err) => Err(err),
        };
        (guard, result)
    }

    /// Sends `buf`, followed by a zero-length packet when `end` is set and `buf` is a whole
    /// number of packets. An empty `buf` sends just the zero-length packet.
    pub(crate) fn write_sync(&self, addr: u8, buf: &[u8], end: bool, timeout: Option<Duration>) -> Result<usize> {
        let (ep, mut guard, id) = self.begin_sync(addr, buf.len())?;
        let mps = usize::from(guard.max_packet_size);
        if let Some(urb) = guard.head_mut(id) {
            if end {
                urb.flags |= UrbFlags::END;
            }
            if buf.is_empty() || (end && buf.len() % mps == 0) {
                urb.flags |= UrbFlags::ZLP;
            }
        }

        loop {
            let offset = match guard.head_mut(id) {
                Some(urb) => urb.xfer_len,
                None => return Err(Error::Aborted),
            };
            let started = if offset < buf.len() {
                let mut driver = self.driver.lock().unwrap();
                driver.tx(addr, &buf[offset..]).and_then(|accepted| {
                    driver
                        .tx_start(addr, &buf[offset..offset + accepted])
                        .map(|()| accepted)
                })
            } else {
                self.driver.lock().unwrap().tx_zlp(addr).map(|()| 0)
            };
            let next = match started {
                Ok(0) if offset < buf.len() => Err(Error::Transmit),
                Ok(next) => Ok(next),
                Err(err) => Err(err.into()),
            };
            let next = match next {
                Ok(next) => next,
                Err(err) => {
                    self.end_sync(&mut guard, id);
                    return Err(err);
                }
            };
            if let Some(urb) = guard.head_mut(id) {
                urb.next_xfer_len = next;
                if offset == buf.len() {
                    urb.flags.remove(UrbFlags::ZLP);
                }
            }

            let (next_guard, pended) = self.wait_sync(ep, guard, id, timeout);
            guard = next_guard;
            if let Err(err) = pended {
                self.end_sync(&mut guard, id);
                return Err(err);
            }

            let urb = match guard.head_mut(id) {
                Some(urb) => urb,
                None => return Err(Error::Aborted),
            };
            urb.xfer_len += urb.next_xfer_len;
            urb.next_xfer_len = 0;
            trace!("usbd: {:#04x} sent {}/{}", addr, urb.xfer_len, buf.len());
            if urb.xfer_len >= buf.len() && !urb.flags.contains(UrbFlags::ZLP) {
                let xfer_len = urb.xfer_len;
                self.end_sync(&mut guard, id);
                return Ok(xfer_len);
            }
        }
    }

    /// Receives into `buf` until it is full or the host sends a short or zero-length packet.
    pub(crate) fn read_sync(&self, addr: u8, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidParameter("buffer"));
        }
        let (ep, mut guard, id) = self.begin_sync(addr, buf.len())?;
        let mps = usize::from(guard.max_packet_size);

        loop {
            let offset = match guard.head_mut(id) {
                Some(urb) => urb.xfer_len,
                None => return Err(Error::Aborted),
            };
            let started = match self.driver.lock().unwrap().rx_start(addr, buf.len() - offset) {
                Ok(0) => Err(Error::Receive),
                Ok(accepted) => Ok(accepted),
                Err(err) => Err(err.into()),
            };
            let accepted = match started {
                Ok(accepted) => accepted.min(buf.len() - offset),
                Err(err) => {
                    self.end_sync(&mut guard, id);
                    return Err(err);
                }
            };
            if let Some(urb) = guard.head_mut(id) {
                urb.next_xfer_len = accepted;
            }

            let (next_guard, pended) = self.wait_sync(ep, guard, id, timeout);
            guard = next_guard;
            if let Err(err) = pended {
                self.end_sync(&mut guard, id);
                return Err(err);
            }

            let received = self
                .driver
                .lock()
                .unwrap()
                .rx(addr, &mut buf[offset..offset + accepted]);
            let actual = match received {
                Ok(actual) if actual <= accepted => actual,
                Ok(actual) => {
                    warn!("usbd: {:#04x} overflow, {} bytes for {}", addr, actual, accepted);
                    self.end_sync(&mut guard, id);
                    return Err(Error::Receive);
                }
                Err(err) => {
                    self.end_sync(&mut guard, id);
                    return Err(err.into());
                }
            };

            let urb = match guard.head_mut(id) {
                Some(urb) => urb,
                None => return Err(Error::Aborted),
            };
            urb.xfer_len += actual;
            urb.next_xfer_len = 0;
            trace!("usbd: {:#04x} received {}/{}", addr, urb.xfer_len, buf.len());
            if urb.xfer_len >= buf.len() || actual == 0 || actual % mps != 0 {
                let xfer_len = urb.xfer_len;
                self.end_sync(&mut guard, id);
                return Ok(xfer_len);
            }
        }
    }

    pub(crate) fn write_zlp(&self, addr: u8, timeout: Option<Duration>) -> Result<()> {
        self.write_sync(addr, &[], true, timeout).map(|_| ())
    }

    pub(crate) fn read_zlp(&self, addr: u8, timeout: Option<Duration>) -> Result<()> {
        let (ep, guard, id) = self.begin_sync(addr, 0)?;
        if let Err(err) = self.driver.lock().unwrap().rx_start(addr, 0) {
            let mut guard = guard;
            self.end_sync(&mut guard, id);
            return Err(err.into());
        }

        let (mut guard, pended) = self.wait_sync(ep, guard, id, timeout);
        let result = pended.and_then(|()| Ok(self.driver.lock().unwrap().rx_zlp(addr)?));
        self.end_sync(&mut guard, id);
        result
    }

    /// Data stage of a device-to-host control transfer.
    pub(crate) fn ctrl_tx(&self, buf: &[u8], end: bool, timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() && !end {
            return Ok(0);
        }
        self.write_sync(CTRL_IN, buf, end, timeout)
    }

    pub(crate) fn submit_async(
        &self,
        addr: u8,
        buf: Vec<u8>,
        len: usize,
        end: bool,
        callback: AsyncCallback,
    ) -> Result<()> {
        let ep = self.endpoints.get(addr).ok_or(Error::InvalidState)?;
        let mut guard = ep.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state != EpState::Open {
            return Err(Error::InvalidState);
        }
        if inner.xfer == XferState::Sync {
            return Err(Error::NotReady);
        }

        let mps = usize::from(inner.max_packet_size);
        let mut urb = self.urbs.get(&mut inner.main_busy, UrbState::Async, buf, len)?;
        urb.callback = Some(callback);
        if endpoint_is_in(addr) {
            if end {
                urb.flags |= UrbFlags::END;
            }
            if len == 0 || (end && len % mps == 0) {
                urb.flags |= UrbFlags::ZLP;
            }
        }
        inner.urbs.push_back(urb);

        if inner.urbs.len() == 1 {
            if let Err(err) = self.start_async(inner) {
                if let Some(urb) = inner.urbs.pop_back() {
                    self.urbs.put(&urb, &mut inner.main_busy);
                }
                inner.xfer = XferState::None;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Puts the next transaction of the head URB on the wire.
    fn start_async(&self, inner: &mut EpInner) -> Result<()> {
        let addr = inner.addr;
        let urb = inner.urbs.front_mut().ok_or(Error::NotReady)?;
        let offset = urb.xfer_len;
        let remaining = urb.buf_len - offset;

        let mut driver = self.driver.lock().unwrap();
        let partial = if endpoint_is_in(addr) {
            if remaining == 0 {
                driver.tx_zlp(addr)?;
                urb.flags.remove(UrbFlags::ZLP);
                urb.next_xfer_len = 0;
                false
            } else {
                let accepted = driver.tx(addr, &urb.buf[offset..urb.buf_len])?;
                if accepted == 0 {
                    return Err(Error::Transmit);
                }
                driver.tx_start(addr, &urb.buf[offset..offset + accepted])?;
                urb.next_xfer_len = accepted;
                accepted < remaining
            }
        } else {
            let accepted = driver.rx_start(addr, remaining)?.min(remaining);
            if accepted == 0 {
                return Err(Error::Receive);
            }
            urb.next_xfer_len = accepted;
            accepted < remaining
        };
        drop(driver);

        inner.xfer = if partial {
            XferState::AsyncPartial
        } else {
            XferState::Async
        };
        Ok(())
    }

    /// Accounts for a finished transaction of the head URB. Returns the URB's final status once
    /// it is done, or `None` when another transaction was started.
    fn advance_async(&self, inner: &mut EpInner, result: driver_udc::Result<()>) -> Option<Result<()>> {
        let addr = inner.addr;
        let mps = usize::from(inner.max_packet_size);
        if let Err(err) = result {
            warn!("usbd: transfer error on {:#04x}: {}", addr, err);
            return Some(Err(transport_error(addr)));
        }

        let urb = inner.urbs.front_mut()?;
        if endpoint_is_in(addr) {
            urb.xfer_len += urb.next_xfer_len;
            urb.next_xfer_len = 0;
            if urb.xfer_len >= urb.buf_len && !urb.flags.contains(UrbFlags::ZLP) {
                return Some(Ok(()));
            }
        } else {
            let offset = urb.xfer_len;
            let accepted = urb.next_xfer_len;
            let received = self
                .driver
                .lock()
                .unwrap()
                .rx(addr, &mut urb.buf[offset..offset + accepted]);
            let actual = match received {
                Ok(actual) if actual <= accepted => actual,
                Ok(_) => return Some(Err(Error::Receive)),
                Err(err) => return Some(Err(err.into())),
            };
            urb.xfer_len += actual;
            urb.next_xfer_len = 0;
            if urb.xfer_len >= urb.buf_len || actual == 0 || actual % mps != 0 {
                return Some(Ok(()));
            }
        }
        trace!("usbd: {:#04x} async progress {}/{}", addr, urb.xfer_len, urb.buf_len);

        match self.start_async(inner) {
            Ok(()) => None,
            Err(err) => Some(Err(err)),
        }
    }

    /// Starts the next queued URB, failing the ones the controller refuses.
    fn start_next_async(&self, inner: &mut EpInner, finished: &mut Finished) {
        while !inner.urbs.is_empty() {
            match self.start_async(inner) {
                Ok(()) => return,
                Err(err) => {
                    if let Some(urb) = inner.urbs.pop_front() {
                        self.urbs.put(&urb, &mut inner.main_busy);
                        finished.extend(urb.complete(inner.addr, Err(err)));
                    }
                }
            }
        }
        inner.xfer = XferState::None;
    }

    /// Event loop half of an asynchronous completion.
    pub(crate) fn process_async(&self, addr: u8, urb_id: u64, result: driver_udc::Result<()>) {
        let ep = match self.endpoints.get(addr) {
            Some(ep) => ep,
            None => {
                trace!("usbd: completion for closed endpoint {:#04x}", addr);
                return;
            }
        };

        let mut finished = Vec::new();
        {
            let mut guard = ep.inner.lock().unwrap();
            let inner = &mut *guard;
            if !inner.is_async() || !inner.owns_head(urb_id) {
                trace!("usbd: stale completion on {:#04x}", addr);
                return;
            }
            if let Some(result) = self.advance_async(inner, result) {
                if let Some(urb) = inner.urbs.pop_front() {
                    self.urbs.put(&urb, &mut inner.main_busy);
                    finished.extend(urb.complete(addr, result));
                }
                self.start_next_async(inner, &mut finished);
            }
        }
        run_callbacks(finished);
    }

    /// Controller half of a completion. Synchronous waiters are woken right here; asynchronous
    /// URBs are handed to the event loop.
    pub(crate) fn endpoint_complete(&self, addr: u8, result: driver_udc::Result<()>) -> Option<CoreEvent> {
        let ep = self.endpoints.get(addr)?;
        let mut guard = ep.inner.lock().unwrap();
        match guard.xfer {
            XferState::Sync => {
                if let Err(err) = result {
                    warn!("usbd: transfer error on {:#04x}: {}", addr, err);
                    if let Some(urb) = guard.urbs.front_mut() {
                        urb.result = Some(transport_error(addr));
                    }
                }
                ep.signal.post();
                None
            }
            XferState::Async | XferState::AsyncPartial => guard.urbs.front().map(|urb| CoreEvent::Endpoint {
                addr,
                urb: urb.id,
                result,
            }),
            XferState::None => {
                trace!("usbd: idle completion on {:#04x}", addr);
                None
            }
        }
    }
}

impl UsbDevice {
    /// Checks that `addr` is an open endpoint of the active configuration with the given type and
    /// direction.
    fn data_endpoint(&self, addr: u8, ty: EndpointTy, dir_in: bool) -> Result<()> {
        if self.device_state() != DeviceState::Configured {
            return Err(Error::InvalidState);
        }
        if endpoint_is_in(addr) != dir_in {
            return Err(Error::InvalidParameter("endpoint direction"));
        }
        let ep = self.core().endpoints.get(addr).ok_or(Error::InvalidState)?;
        let inner = ep.inner.lock().unwrap();
        if inner.state == EpState::Close {
            return Err(Error::InvalidState);
        }
        if inner.ty() != ty {
            return Err(Error::InvalidParameter("endpoint type"));
        }
        Ok(())
    }

    fn control_phase(&self) -> Result<()> {
        match self.device_state() {
            DeviceState::Default | DeviceState::Addressed | DeviceState::Configured => Ok(()),
            _ => Err(Error::InvalidState),
        }
    }

    pub fn read_bulk_sync(&self, addr: u8, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.data_endpoint(addr, EndpointTy::Bulk, false)?;
        self.core().read_sync(addr, buf, timeout)
    }

    pub fn write_bulk_sync(&self, addr: u8, buf: &[u8], end: bool, timeout: Option<Duration>) -> Result<usize> {
        self.data_endpoint(addr, EndpointTy::Bulk, true)?;
        self.core().write_sync(addr, buf, end, timeout)
    }

    pub fn read_bulk_async(&self, addr: u8, len: usize, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Bulk, false)?;
        if len == 0 {
            return Err(Error::InvalidParameter("length"));
        }
        self.core().submit_async(addr, vec![0; len], len, false, callback)
    }

    pub fn write_bulk_async(&self, addr: u8, data: Vec<u8>, end: bool, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Bulk, true)?;
        let len = data.len();
        self.core().submit_async(addr, data, len, end, callback)
    }

    pub fn read_interrupt_sync(&self, addr: u8, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.data_endpoint(addr, EndpointTy::Interrupt, false)?;
        self.core().read_sync(addr, buf, timeout)
    }

    pub fn write_interrupt_sync(&self, addr: u8, buf: &[u8], end: bool, timeout: Option<Duration>) -> Result<usize> {
        self.data_endpoint(addr, EndpointTy::Interrupt, true)?;
        self.core().write_sync(addr, buf, end, timeout)
    }

    pub fn read_interrupt_async(&self, addr: u8, len: usize, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Interrupt, false)?;
        if len == 0 {
            return Err(Error::InvalidParameter("length"));
        }
        self.core().submit_async(addr, vec![0; len], len, false, callback)
    }

    pub fn write_interrupt_async(&self, addr: u8, data: Vec<u8>, end: bool, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Interrupt, true)?;
        let len = data.len();
        self.core().submit_async(addr, data, len, end, callback)
    }

    pub fn read_isochronous_async(&self, addr: u8, len: usize, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Isoch, false)?;
        if len == 0 {
            return Err(Error::InvalidParameter("length"));
        }
        self.core().submit_async(addr, vec![0; len], len, false, callback)
    }

    /// Isochronous packets are never followed by a zero-length packet.
    pub fn write_isochronous_async(&self, addr: u8, data: Vec<u8>, callback: AsyncCallback) -> Result<()> {
        self.data_endpoint(addr, EndpointTy::Isoch, true)?;
        if data.is_empty() {
            return Err(Error::InvalidParameter("length"));
        }
        let len = data.len();
        self.core().submit_async(addr, data, len, false, callback)
    }

    /// Receives the data stage of the host-to-device control request being handled.
    pub fn read_control_sync(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.control_phase()?;
        let requested = usize::from(self.core().current_setup().length());
        let len = buf.len().min(requested);
        if len == 0 {
            return Err(Error::InvalidParameter("buffer"));
        }
        self.core().read_sync(CTRL_OUT, &mut buf[..len], timeout)
    }

    /// Sends the data stage of the device-to-host control request being handled. Data beyond
    /// wLength is dropped; a reply shorter than wLength is terminated properly.
    pub fn write_control_sync(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.control_phase()?;
        if buf.is_empty() {
            return Err(Error::InvalidParameter("buffer"));
        }
        let requested = usize::from(self.core().current_setup().length());
        let len = buf.len().min(requested);
        self.core().ctrl_tx(&buf[..len], len < requested, timeout)
    }

    /// Cancels everything queued on `addr`. Calling it on an idle endpoint is a no-op.
    pub fn abort_endpoint(&self, addr: u8) -> Result<()> {
        self.core().abort_endpoint(addr)
    }

    pub fn stall_endpoint(&self, addr: u8, stall: bool) -> Result<()> {
        self.core().stall_endpoint(addr, stall)
    }

    pub fn is_endpoint_stalled(&self, addr: u8) -> Result<bool> {
        self.core().is_endpoint_stalled(addr)
    }

    /// URBs that could still be queued, counting each open endpoint's own one.
    pub fn urbs_available(&self) -> usize {
        self.core().urbs_available()
    }

    pub fn bulk_read_future(&self, addr: u8, len: usize) -> Result<impl Future<Output = Result<Vec<u8>>>> {
        let (tx, rx) = oneshot::channel();
        self.read_bulk_async(
            addr,
            len,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        )?;
        Ok(async move {
            let completion = rx.await.map_err(|_| Error::Aborted)?;
            completion.result?;
            let mut buf = completion.buf;
            buf.truncate(completion.xfer_len);
            Ok(buf)
        })
    }

    pub fn bulk_write_future(&self, addr: u8, data: Vec<u8>, end: bool) -> Result<impl Future<Output = Result<usize>>> {
        let (tx, rx) = oneshot::channel();
        self.write_bulk_async(
            addr,
            data,
            end,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        )?;
        Ok(async move {
            let completion = rx.await.map_err(|_| Error::Aborted)?;
            completion.result.map(|()| completion.xfer_len)
        })
    }
}
