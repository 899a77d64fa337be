//! The device state machine (USB2 9.1): bus events, the active configuration and the alternate
//! settings of its interfaces.

use driver_udc::{endpoint_addr_to_phy, BusEvent, Speed};
use log::{debug, error, info, warn};

use crate::class::ConfigEvent;
use crate::registry::{config_speed, AltSnapshot, ConfigSnapshot};
use crate::{Error, Result, UsbDevice};

/// Visible device states. `Suspended` remembers the state it was entered from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    /// Not started yet; the device model may be built.
    None,
    /// Started, not attached to a host.
    Init,
    Attached,
    Default,
    Addressed,
    Configured,
    Suspended,
}

pub(crate) struct DeviceStatus {
    pub state: DeviceState,
    /// State to go back to on resume.
    pub prev: DeviceState,
    pub address: u8,
    /// Negotiated bus speed, known after the first reset.
    pub speed: Option<Speed>,
    pub connected: bool,
    pub started: bool,
    /// The controller has been handed the event sink.
    pub inited: bool,
    pub self_power: bool,
    pub remote_wakeup: bool,
    pub config_cur: Option<u8>,
    pub ms_vendor_code: Option<u8>,
    /// Owning interface of each open physical endpoint.
    pub ep_if: [Option<u8>; 32],
    /// SET_ADDRESS takes effect once its status stage is through.
    pub pending_address: Option<u8>,
}

impl DeviceStatus {
    pub fn new() -> Self {
        Self {
            state: DeviceState::None,
            prev: DeviceState::None,
            address: 0,
            speed: None,
            connected: false,
            started: false,
            inited: false,
            self_power: false,
            remote_wakeup: false,
            config_cur: None,
            ms_vendor_code: None,
            ep_if: [None; 32],
            pending_address: None,
        }
    }
}

impl UsbDevice {
    pub fn device_state(&self) -> DeviceState {
        self.core().status.lock().unwrap().state
    }

    /// Speed negotiated with the host, full speed until a reset says otherwise.
    pub fn device_speed(&self) -> Result<Speed> {
        let status = self.core().status.lock().unwrap();
        if status.state == DeviceState::None {
            return Err(Error::InvalidState);
        }
        Ok(status.speed.unwrap_or(Speed::Full))
    }

    pub fn device_address(&self) -> u8 {
        self.core().status.lock().unwrap().address
    }

    /// Current (micro)frame number as reported by the controller.
    pub fn frame_number(&self) -> Result<u16> {
        if self.device_state() == DeviceState::None {
            return Err(Error::InvalidState);
        }
        Ok(self.core().driver.lock().unwrap().frame_number())
    }

    /// Value of the self-powered bit in GET_STATUS while no configuration is active.
    pub fn set_self_power(&self, self_power: bool) {
        self.core().status.lock().unwrap().self_power = self_power;
    }

    /// Enables the Microsoft OS descriptors; the host retrieves them with vendor requests using
    /// `code`.
    pub fn set_microsoft_vendor_code(&self, code: u8) {
        self.core().status.lock().unwrap().ms_vendor_code = Some(code);
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.core().status.lock().unwrap().remote_wakeup
    }

    /// The active configuration number, high-speed bit included.
    pub fn active_configuration(&self) -> Option<u8> {
        self.core().status.lock().unwrap().config_cur
    }

    /// Bus speed used for descriptors and configuration lookups.
    pub(crate) fn bus_speed(&self) -> Speed {
        self.core().status.lock().unwrap().speed.unwrap_or(Speed::Full)
    }

    pub(crate) fn process_bus_event(&self, event: BusEvent) {
        if !self.core().status.lock().unwrap().started {
            debug!("usbd: ignoring {:?} while stopped", event);
            return;
        }

        match event {
            BusEvent::Connect => {
                let mut status = self.core().status.lock().unwrap();
                status.connected = true;
                status.state = DeviceState::Attached;
                info!("usbd: connected");
            }
            BusEvent::Disconnect => {
                self.unset_configuration();
                self.core().close_ctrl();
                let mut status = self.core().status.lock().unwrap();
                status.connected = false;
                status.state = DeviceState::Init;
                status.address = 0;
                status.speed = None;
                status.remote_wakeup = false;
                status.pending_address = None;
                info!("usbd: disconnected");
            }
            BusEvent::Reset => {
                self.unset_configuration();
                self.core().close_ctrl();
                if let Err(err) = self.core().open_ctrl() {
                    error!("usbd: failed to open the control pipe: {}", err);
                }
                let mut status = self.core().status.lock().unwrap();
                status.address = 0;
                status.speed = Some(match self.core().drv_speed {
                    Speed::Low => Speed::Low,
                    _ => Speed::Full,
                });
                status.remote_wakeup = false;
                status.pending_address = None;
                status.state = DeviceState::Default;
                info!("usbd: bus reset");
            }
            BusEvent::HighSpeed => {
                if self.core().drv_speed == Speed::High {
                    self.core().status.lock().unwrap().speed = Some(Speed::High);
                    debug!("usbd: running at high speed");
                } else {
                    warn!("usbd: high-speed handshake on a full-speed controller");
                }
            }
            BusEvent::Suspend => {
                let mut status = self.core().status.lock().unwrap();
                if status.state != DeviceState::Suspended {
                    status.prev = status.state;
                    status.state = DeviceState::Suspended;
                    debug!("usbd: suspended from {:?}", status.prev);
                }
            }
            BusEvent::Resume => {
                let mut status = self.core().status.lock().unwrap();
                if status.state == DeviceState::Suspended {
                    status.state = status.prev;
                    debug!("usbd: resumed into {:?}", status.state);
                }
            }
        }

        if let Some(hooks) = self.core().hooks() {
            hooks.on_bus_event(self, event);
        }
    }

    /// Opens the endpoints of one alternate setting. On failure the ones already opened are closed
    /// again.
    pub(crate) fn open_alt(&self, if_nbr: u8, alt: &AltSnapshot) -> Result<()> {
        for (ix, info) in alt.endpoints.iter().enumerate() {
            if let Err(err) = self.core().open_endpoint(info) {
                for opened in &alt.endpoints[..ix] {
                    self.close_alt_endpoint(opened.address);
                }
                return Err(err);
            }
            let phy = usize::from(endpoint_addr_to_phy(info.address));
            self.core().status.lock().unwrap().ep_if[phy] = Some(if_nbr);
        }
        Ok(())
    }

    pub(crate) fn close_alt(&self, alt: &AltSnapshot) {
        for info in &alt.endpoints {
            self.close_alt_endpoint(info.address);
        }
    }

    fn close_alt_endpoint(&self, addr: u8) {
        self.core().close_endpoint(addr);
        let phy = usize::from(endpoint_addr_to_phy(addr));
        self.core().status.lock().unwrap().ep_if[phy] = None;
    }

    /// Activates configuration `cfg_nbr`, tearing down the active one first.
    pub(crate) fn set_configuration(&self, cfg_nbr: u8) -> Result<()> {
        self.unset_configuration();

        let snapshot = {
            let mut registry = self.core().registry.lock().unwrap();
            registry.reset_alt_cur(cfg_nbr)?;
            registry.snapshot(cfg_nbr)?
        };

        for (ix, interface) in snapshot.interfaces.iter().enumerate() {
            let opened = match interface.alts.first() {
                Some(alt) => self.open_alt(interface.nbr, alt),
                None => Ok(()),
            };
            if let Err(err) = opened {
                warn!(
                    "usbd: configuration {:#04x} interface {} failed to open: {}",
                    cfg_nbr, interface.nbr, err
                );
                for interface in &snapshot.interfaces[..ix] {
                    if let Some(alt) = interface.alts.first() {
                        self.close_alt(alt);
                    }
                }
                return Err(err);
            }
        }

        {
            let mut status = self.core().status.lock().unwrap();
            status.config_cur = Some(cfg_nbr);
            status.state = DeviceState::Configured;
        }
        info!(
            "usbd: configuration {} set ({} speed)",
            (cfg_nbr & 0x7F) + 1,
            config_speed(cfg_nbr).as_str()
        );

        for interface in &snapshot.interfaces {
            interface.driver.enable(self, &interface.ctx(cfg_nbr, 0));
        }
        if let Some(hooks) = self.core().hooks() {
            hooks.on_config_event(self, ConfigEvent::Set((cfg_nbr & 0x7F) + 1));
        }
        Ok(())
    }

    /// Deactivates the active configuration, if any. The device state is left to the caller.
    pub(crate) fn unset_configuration(&self) {
        let cfg_nbr = match self.core().status.lock().unwrap().config_cur.take() {
            Some(cfg_nbr) => cfg_nbr,
            None => return,
        };
        let snapshot = match self.core().registry.lock().unwrap().snapshot(cfg_nbr) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!("usbd: active configuration {:#04x} vanished: {}", cfg_nbr, err);
                return;
            }
        };

        for interface in &snapshot.interfaces {
            interface.driver.disable(self, &interface.ctx(cfg_nbr, interface.alt_cur));
        }
        for interface in &snapshot.interfaces {
            if let Some(alt) = interface.current_alt() {
                self.close_alt(alt);
            }
        }
        info!("usbd: configuration {} unset", (cfg_nbr & 0x7F) + 1);

        if let Some(hooks) = self.core().hooks() {
            hooks.on_config_event(self, ConfigEvent::Unset((cfg_nbr & 0x7F) + 1));
        }
    }

    /// Snapshot of the active configuration.
    pub(crate) fn active_snapshot(&self) -> Option<ConfigSnapshot> {
        let cfg_nbr = self.active_configuration()?;
        self.core().registry.lock().unwrap().snapshot(cfg_nbr).ok()
    }

    /// Switches interface `if_nbr` of the active configuration to `alt_nbr`. If the new setting
    /// cannot be opened the previous one is restored.
    pub(crate) fn set_interface(&self, if_nbr: u8, alt_nbr: u8) -> Result<()> {
        let snapshot = self.active_snapshot().ok_or(Error::InvalidState)?;
        let cfg_nbr = snapshot.nbr;
        let interface = snapshot
            .interfaces
            .get(usize::from(if_nbr))
            .ok_or(Error::InvalidHandle)?;
        let next = interface.alts.get(usize::from(alt_nbr)).ok_or(Error::InvalidHandle)?;
        let cur = interface.current_alt().ok_or(Error::InvalidHandle)?;

        self.close_alt(cur);
        if let Err(err) = self.open_alt(if_nbr, next) {
            warn!(
                "usbd: interface {} alternate setting {} failed to open: {}",
                if_nbr, alt_nbr, err
            );
            if let Err(err) = self.open_alt(if_nbr, cur) {
                error!(
                    "usbd: interface {} could not restore alternate setting {}: {}",
                    if_nbr, cur.nbr, err
                );
            }
            return Err(err);
        }

        self.core()
            .registry
            .lock()
            .unwrap()
            .set_alt_cur(cfg_nbr, if_nbr, alt_nbr)?;
        debug!("usbd: interface {} now on alternate setting {}", if_nbr, alt_nbr);

        interface.driver.alt_settings_update(self, &interface.ctx(cfg_nbr, alt_nbr));
        Ok(())
    }
}
