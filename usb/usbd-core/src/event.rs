//! The core event loop.
//!
//! Controller callbacks may arrive on any thread, often in interrupt context, so they only post a
//! [CoreEvent] on a bounded queue. Everything else, including standard request handling and class
//! callbacks, happens on the single thread draining that queue.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::TrySendError;
use driver_udc::{BusEvent, UDCEvents};
use log::{debug, error, trace, warn};

use crate::device::Core;
use crate::{Error, Result, UsbDevice};

#[derive(Debug)]
pub(crate) enum CoreEvent {
    Bus(BusEvent),
    Setup([u8; 8]),
    /// An asynchronous URB step finished.
    Endpoint {
        addr: u8,
        urb: u64,
        result: driver_udc::Result<()>,
    },
    Shutdown,
}

/// What the controller driver gets to talk back to the core.
pub(crate) struct EventSink {
    core: Weak<Core>,
}

impl EventSink {
    pub fn new(core: Weak<Core>) -> Self {
        Self { core }
    }

    fn post(&self, core: &Core, event: CoreEvent) {
        match core.events.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(event)) => warn!("usbd: event queue full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => (),
        }
    }
}

impl UDCEvents for EventSink {
    fn bus_event(&self, event: BusEvent) {
        if let Some(core) = self.core.upgrade() {
            self.post(&core, CoreEvent::Bus(event));
        }
    }

    fn setup(&self, packet: [u8; 8]) {
        if let Some(core) = self.core.upgrade() {
            self.post(&core, CoreEvent::Setup(packet));
        }
    }

    fn endpoint_complete(&self, addr: u8, result: driver_udc::Result<()>) {
        if let Some(core) = self.core.upgrade() {
            if let Some(event) = core.endpoint_complete(addr, result) {
                self.post(&core, event);
            }
        }
    }
}

impl UsbDevice {
    fn process_event(&self, event: CoreEvent) {
        trace!("usbd: event {:?}", event);
        match event {
            CoreEvent::Bus(event) => self.process_bus_event(event),
            CoreEvent::Setup(raw) => self.process_setup(raw),
            CoreEvent::Endpoint { addr, urb, result } => self.core().process_async(addr, urb, result),
            CoreEvent::Shutdown => (),
        }
    }

    /// Runs the event loop on the calling thread until [UsbDevice::shutdown_event_loop] is called.
    pub fn run_event_loop(&self) {
        let rx = self.core().event_rx.clone();
        while let Ok(event) = rx.recv() {
            if let CoreEvent::Shutdown = event {
                break;
            }
            self.process_event(event);
        }
        debug!("usbd: event loop stopped");
    }

    /// Runs the event loop on a thread of its own. The thread only keeps a weak reference to the
    /// device and ends once every [UsbDevice] handle is gone.
    pub fn spawn_event_loop(&self) -> Result<JoinHandle<()>> {
        let rx = self.core().event_rx.clone();
        let weak = Arc::downgrade(&self.core);
        thread::Builder::new()
            .name("usbd-core".to_string())
            .spawn(move || {
                debug!("usbd: event loop started");
                while let Ok(event) = rx.recv() {
                    if let CoreEvent::Shutdown = event {
                        break;
                    }
                    match weak.upgrade() {
                        Some(core) => UsbDevice { core }.process_event(event),
                        None => break,
                    }
                }
                debug!("usbd: event loop stopped");
            })
            .map_err(|err| {
                error!("usbd: failed to spawn the event loop: {}", err);
                Error::NotAvailable
            })
    }

    /// Handles every queued event without blocking and returns how many there were.
    pub fn tick(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.core().event_rx.try_recv() {
            handled += 1;
            self.process_event(event);
        }
        handled
    }

    /// Asks the event loop to return once the events queued so far are handled.
    pub fn shutdown_event_loop(&self) -> Result<()> {
        self.core().events.try_send(CoreEvent::Shutdown).map_err(|_| Error::Full)
    }
}
