//! Setup packet dispatch (USB2 9.4).
//!
//! Every request ends in exactly one of two ways: the status stage is run, or both directions of
//! the default pipe are stalled. Handlers report why they refuse a request so that it can be
//! logged next to the stall.

use driver_udc::{endpoint_addr_to_phy, Speed};
use log::{debug, error, warn};

use crate::class::InterfaceCtx;
use crate::desc::DescriptorWriter;
use crate::endpoint::{is_ctrl, CTRL_IN, CTRL_OUT};
use crate::microsoft::{self, COMPAT_ID_INDEX, EXT_PROPERTIES_INDEX};
use crate::registry::{ConfigSnapshot, InterfaceSnapshot};
use crate::state::DeviceState;
use crate::usb::{
    DescriptorKind, FeatureSelector, ReqRecipient, ReqType, Setup, SetupReq, CONFIG_ATTR_REMOTE_WAKEUP,
    CONFIG_ATTR_SELF_POWERED,
};
use crate::UsbDevice;

/// `Err` carries the reason the request is refused.
type Handled = std::result::Result<(), &'static str>;

fn check(cond: bool, reason: &'static str) -> Handled {
    if cond {
        Ok(())
    } else {
        Err(reason)
    }
}

fn accepted(handled: bool) -> Handled {
    check(handled, "not handled by the class driver")
}

impl UsbDevice {
    pub(crate) fn process_setup(&self, raw: [u8; 8]) {
        let setup = Setup::parse(&raw);
        *self.core().current_setup.lock().unwrap() = setup;
        debug!(
            "usbd: setup {:?} {:?} {:?} req {:#04x} value {:#06x} index {:#06x} len {}",
            setup.direction(),
            setup.req_type(),
            setup.recipient(),
            setup.request,
            setup.value(),
            setup.index(),
            setup.length()
        );

        if !self.core().status.lock().unwrap().started {
            debug!("usbd: ignoring setup packet while stopped");
            return;
        }

        let handled = match setup.req_type() {
            ReqType::Standard => self.standard_req(&setup),
            ReqType::Class => self.class_req(&setup),
            ReqType::Vendor => self.vendor_req(&setup),
            ReqType::Reserved => Err("reserved request type"),
        };

        match handled {
            Ok(()) => self.status_stage(&setup),
            Err(reason) => {
                warn!(
                    "usbd: stalling request {:#04x}/{:#04x} (value {:#06x}, index {:#06x}): {}",
                    setup.kind,
                    setup.request,
                    setup.value(),
                    setup.index(),
                    reason
                );
                if let Err(err) = self.core().stall_ctrl(true) {
                    error!("usbd: failed to stall the control pipe: {}", err);
                }
            }
        }
    }

    fn status_stage(&self, setup: &Setup) {
        let timeout = Some(self.core().std_req_timeout());
        let result = if setup.is_device_to_host() && setup.length() > 0 {
            self.core().read_zlp(CTRL_OUT, timeout)
        } else {
            self.core().write_zlp(CTRL_IN, timeout)
        };
        if let Err(err) = result {
            warn!("usbd: status stage of request {:#04x} failed: {}", setup.request, err);
        }

        let pending = self.core().status.lock().unwrap().pending_address.take();
        if let Some(addr) = pending {
            if let Err(err) = self.core().driver.lock().unwrap().set_address(addr) {
                error!("usbd: controller refused address {}: {}", addr, err);
            }
        }
    }

    /// Sends a short data stage, cut to wLength.
    fn reply(&self, setup: &Setup, data: &[u8]) -> Handled {
        let requested = usize::from(setup.length());
        let len = data.len().min(requested);
        self.core()
            .ctrl_tx(&data[..len], len < requested, Some(self.core().std_req_timeout()))
            .map(|_| ())
            .map_err(|_| "data stage failed")
    }

    fn control_writer(&self, setup: &Setup) -> DescriptorWriter<'_> {
        DescriptorWriter::for_control(
            self.core(),
            usize::from(setup.length()),
            Some(self.core().std_req_timeout()),
        )
    }

    fn standard_req(&self, setup: &Setup) -> Handled {
        let req = SetupReq::from_u8(setup.request).ok_or("unknown standard request")?;
        match setup.recipient() {
            ReqRecipient::Device => self.device_req(setup, req),
            ReqRecipient::Interface => self.interface_std_req(setup, req),
            ReqRecipient::Endpoint => self.endpoint_std_req(setup, req),
            _ => Err("unsupported recipient"),
        }
    }

    fn device_req(&self, setup: &Setup, req: SetupReq) -> Handled {
        match req {
            SetupReq::GetDescriptor => self.get_descriptor_req(setup),
            SetupReq::SetAddress => self.set_address_req(setup),
            SetupReq::GetConfiguration => self.get_configuration_req(setup),
            SetupReq::SetConfiguration => self.set_configuration_req(setup),
            SetupReq::GetStatus => self.device_status_req(setup),
            SetupReq::SetFeature | SetupReq::ClearFeature => {
                self.remote_wakeup_req(setup, req == SetupReq::SetFeature)
            }
            _ => Err("unsupported device request"),
        }
    }

    fn get_descriptor_req(&self, setup: &Setup) -> Handled {
        check(setup.is_device_to_host(), "GET_DESCRIPTOR must be device-to-host")?;
        check(
            matches!(
                self.device_state(),
                DeviceState::Default | DeviceState::Addressed | DeviceState::Configured
            ),
            "GET_DESCRIPTOR in this state",
        )?;

        let core = self.core();
        let speed = self.bus_speed();
        let high_speed_capable = core.drv_speed == Speed::High;
        let kind = DescriptorKind::from_u8((setup.value() >> 8) as u8).ok_or("unknown descriptor type")?;
        let index = (setup.value() & 0xFF) as u8;

        let mut w = self.control_writer(setup);
        let written = match kind {
            DescriptorKind::Device => {
                core.write_device_descriptor(&mut w, speed);
                Ok(())
            }
            DescriptorKind::Configuration => {
                let cfg_nbr = core.config_by_index(index, speed).ok_or("no such configuration")?;
                core.write_configuration(&mut w, cfg_nbr, DescriptorKind::Configuration)
            }
            DescriptorKind::String => core.write_string_descriptor(&mut w, index),
            DescriptorKind::DeviceQualifier if high_speed_capable => {
                core.write_device_qualifier(&mut w, speed);
                Ok(())
            }
            DescriptorKind::OtherSpeedConfiguration if high_speed_capable => {
                let cfg_nbr = core
                    .other_speed_config(index, speed)
                    .ok_or("no other-speed configuration")?;
                core.write_configuration(&mut w, cfg_nbr, DescriptorKind::OtherSpeedConfiguration)
            }
            _ => return Err("unsupported descriptor type"),
        };
        written.map_err(|_| "descriptor could not be built")?;
        w.stop().map(|_| ()).map_err(|_| "descriptor data stage failed")
    }

    fn set_address_req(&self, setup: &Setup) -> Handled {
        check(
            !setup.is_device_to_host() && setup.index() == 0 && setup.length() == 0 && setup.value() <= 127,
            "malformed SET_ADDRESS",
        )?;
        let addr = setup.value() as u8;

        let mut status = self.core().status.lock().unwrap();
        match (status.state, addr) {
            (DeviceState::Default, 0) => (),
            (DeviceState::Default, _) | (DeviceState::Addressed, _) => {
                status.state = if addr == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                };
                status.address = addr;
                status.pending_address = Some(addr);
            }
            _ => return Err("SET_ADDRESS in this state"),
        }
        debug!("usbd: address {} ({:?})", addr, status.state);
        Ok(())
    }

    fn get_configuration_req(&self, setup: &Setup) -> Handled {
        check(
            setup.is_device_to_host() && setup.value() == 0 && setup.index() == 0 && setup.length() == 1,
            "malformed GET_CONFIGURATION",
        )?;
        let value = {
            let status = self.core().status.lock().unwrap();
            match (status.state, status.config_cur) {
                (DeviceState::Addressed, _) => 0,
                (DeviceState::Configured, Some(cfg_nbr)) => (cfg_nbr & 0x7F) + 1,
                _ => return Err("GET_CONFIGURATION in this state"),
            }
        };
        self.reply(setup, &[value])
    }

    fn set_configuration_req(&self, setup: &Setup) -> Handled {
        check(
            !setup.is_device_to_host() && setup.index() == 0 && setup.length() == 0 && setup.value() <= 0xFF,
            "malformed SET_CONFIGURATION",
        )?;
        check(
            matches!(self.device_state(), DeviceState::Addressed | DeviceState::Configured),
            "SET_CONFIGURATION in this state",
        )?;

        let value = setup.value() as u8;
        if value == 0 {
            self.unset_configuration();
            self.core().status.lock().unwrap().state = DeviceState::Addressed;
            return Ok(());
        }

        let cfg_nbr = self
            .core()
            .config_by_index(value - 1, self.bus_speed())
            .ok_or("no such configuration")?;
        if self.set_configuration(cfg_nbr).is_err() {
            self.core().status.lock().unwrap().state = DeviceState::Addressed;
            return Err("configuration could not be opened");
        }
        Ok(())
    }

    fn device_status_req(&self, setup: &Setup) -> Handled {
        check(
            setup.is_device_to_host() && setup.value() == 0 && setup.index() == 0 && setup.length() == 2,
            "malformed GET_STATUS",
        )?;
        let (state, self_power, remote_wakeup) = {
            let status = self.core().status.lock().unwrap();
            (status.state, status.self_power, status.remote_wakeup)
        };
        let bits = match state {
            DeviceState::Addressed => u8::from(self_power),
            DeviceState::Configured => {
                let attributes = self.active_snapshot().map(|cfg| cfg.attributes).unwrap_or(0);
                u8::from(attributes & CONFIG_ATTR_SELF_POWERED != 0) | (u8::from(remote_wakeup) << 1)
            }
            _ => return Err("GET_STATUS in this state"),
        };
        self.reply(setup, &[bits, 0])
    }

    fn remote_wakeup_req(&self, setup: &Setup, set: bool) -> Handled {
        check(
            !setup.is_device_to_host()
                && setup.value() == FeatureSelector::DeviceRemoteWakeup as u16
                && setup.index() == 0
                && setup.length() == 0,
            "unsupported device feature",
        )?;
        check(self.device_state() == DeviceState::Configured, "remote wakeup outside CONFIGURED")?;
        if set {
            let attributes = self.active_snapshot().map(|cfg| cfg.attributes).unwrap_or(0);
            check(attributes & CONFIG_ATTR_REMOTE_WAKEUP != 0, "configuration has no remote wakeup")?;
        }
        self.core().status.lock().unwrap().remote_wakeup = set;
        debug!("usbd: remote wakeup {}", if set { "enabled" } else { "disabled" });
        Ok(())
    }

    /// The active configuration and the interface `if_nbr` in it.
    fn active_interface(&self, if_nbr: u8) -> std::result::Result<(ConfigSnapshot, usize), &'static str> {
        check(self.device_state() == DeviceState::Configured, "interface request outside CONFIGURED")?;
        let snapshot = self.active_snapshot().ok_or("no active configuration")?;
        let ix = snapshot
            .interfaces
            .iter()
            .position(|interface| interface.nbr == if_nbr)
            .ok_or("no such interface")?;
        Ok((snapshot, ix))
    }

    fn current_ctx(snapshot: &ConfigSnapshot, interface: &InterfaceSnapshot) -> InterfaceCtx {
        interface.ctx(snapshot.nbr, interface.alt_cur)
    }

    fn interface_std_req(&self, setup: &Setup, req: SetupReq) -> Handled {
        let if_nbr = (setup.index() & 0xFF) as u8;
        let (snapshot, ix) = self.active_interface(if_nbr)?;
        let interface = &snapshot.interfaces[ix];
        let ctx = Self::current_ctx(&snapshot, interface);

        match req {
            SetupReq::GetStatus => {
                check(
                    setup.is_device_to_host() && setup.value() == 0 && setup.length() == 2,
                    "malformed GET_STATUS",
                )?;
                self.reply(setup, &[0, 0])
            }
            // USB2 defines no interface features; the request is acknowledged.
            SetupReq::SetFeature | SetupReq::ClearFeature => check(
                !setup.is_device_to_host() && setup.length() == 0,
                "malformed interface feature request",
            ),
            SetupReq::GetDescriptor => {
                check(setup.is_device_to_host(), "GET_DESCRIPTOR must be device-to-host")?;
                let mut w = self.control_writer(setup);
                if !interface
                    .driver
                    .interface_descriptor_req(self, &ctx, setup, &mut w)
                {
                    return Err("descriptor not provided by the class driver");
                }
                w.stop().map(|_| ()).map_err(|_| "descriptor data stage failed")
            }
            SetupReq::GetInterface => {
                check(
                    setup.is_device_to_host() && setup.value() == 0 && setup.length() == 1,
                    "malformed GET_INTERFACE",
                )?;
                self.reply(setup, &[interface.alt_cur])
            }
            SetupReq::SetInterface => {
                check(
                    !setup.is_device_to_host() && setup.length() == 0 && setup.value() <= 0xFF,
                    "malformed SET_INTERFACE",
                )?;
                self.set_interface(if_nbr, setup.value() as u8)
                    .map_err(|_| "alternate setting could not be selected")
            }
            _ => accepted(interface.driver.interface_req(self, &ctx, setup)),
        }
    }

    fn endpoint_std_req(&self, setup: &Setup, req: SetupReq) -> Handled {
        let addr = (setup.index() & 0x8F) as u8;

        if is_ctrl(addr) {
            check(
                matches!(self.device_state(), DeviceState::Addressed | DeviceState::Configured),
                "control endpoint request in this state",
            )?;
            return match req {
                // The next SETUP clears a halt of the default pipe, so it always reads as running.
                SetupReq::GetStatus => {
                    check(
                        setup.is_device_to_host() && setup.value() == 0 && setup.length() == 2,
                        "malformed GET_STATUS",
                    )?;
                    self.reply(setup, &[0, 0])
                }
                SetupReq::SetFeature | SetupReq::ClearFeature => {
                    check(
                        !setup.is_device_to_host()
                            && setup.value() == FeatureSelector::EndpointHalt as u16
                            && setup.length() == 0,
                        "unsupported endpoint feature",
                    )?;
                    if req == SetupReq::SetFeature {
                        // Halting the default pipe stalls this very request.
                        return Err("default pipe halted by the host");
                    }
                    self.core()
                        .stall_ctrl(false)
                        .map_err(|_| "default pipe could not be resumed")
                }
                _ => Err("unsupported endpoint request"),
            };
        }

        check(self.device_state() == DeviceState::Configured, "endpoint request outside CONFIGURED")?;
        let stalled = self.core().is_endpoint_stalled(addr).map_err(|_| "endpoint not open")?;

        match req {
            SetupReq::GetStatus => {
                check(
                    setup.is_device_to_host() && setup.value() == 0 && setup.length() == 2,
                    "malformed GET_STATUS",
                )?;
                self.reply(setup, &[u8::from(stalled), 0])
            }
            SetupReq::SetFeature | SetupReq::ClearFeature => {
                check(
                    !setup.is_device_to_host()
                        && setup.value() == FeatureSelector::EndpointHalt as u16
                        && setup.length() == 0,
                    "unsupported endpoint feature",
                )?;
                let halt = req == SetupReq::SetFeature;
                self.core()
                    .stall_endpoint(addr, halt)
                    .map_err(|_| "endpoint could not be halted")?;
                if let Some((snapshot, ix)) = self.endpoint_owner(addr) {
                    let interface = &snapshot.interfaces[ix];
                    let ctx = Self::current_ctx(&snapshot, interface);
                    interface.driver.endpoint_state_update(self, &ctx, addr);
                }
                Ok(())
            }
            _ => Err("unsupported endpoint request"),
        }
    }

    /// The interface of the active configuration that opened `addr`.
    fn endpoint_owner(&self, addr: u8) -> Option<(ConfigSnapshot, usize)> {
        let phy = usize::from(endpoint_addr_to_phy(addr));
        let if_nbr = self.core().status.lock().unwrap().ep_if[phy]?;
        self.active_interface(if_nbr).ok()
    }

    /// Class and vendor requests addressed to an interface or one of its endpoints.
    fn owning_interface(&self, setup: &Setup) -> std::result::Result<(ConfigSnapshot, usize), &'static str> {
        match setup.recipient() {
            ReqRecipient::Interface => self.active_interface((setup.index() & 0xFF) as u8),
            ReqRecipient::Endpoint => self
                .endpoint_owner((setup.index() & 0x8F) as u8)
                .ok_or("endpoint not owned by an interface"),
            _ => Err("unsupported recipient"),
        }
    }

    fn class_req(&self, setup: &Setup) -> Handled {
        let (snapshot, ix) = self.owning_interface(setup)?;
        let interface = &snapshot.interfaces[ix];
        let ctx = Self::current_ctx(&snapshot, interface);
        accepted(interface.driver.class_req(self, &ctx, setup))
    }

    fn vendor_req(&self, setup: &Setup) -> Handled {
        let ms_code = self.core().status.lock().unwrap().ms_vendor_code;
        let is_ms = ms_code == Some(setup.request);

        match setup.recipient() {
            ReqRecipient::Device if is_ms => self.microsoft_req(setup, true),
            ReqRecipient::Device => match self.core().hooks() {
                Some(hooks) => check(hooks.vendor_device_req(self, setup), "vendor request not handled"),
                None => Err("no vendor request handler"),
            },
            ReqRecipient::Interface if is_ms => self.microsoft_req(setup, false),
            ReqRecipient::Interface | ReqRecipient::Endpoint => {
                let (snapshot, ix) = self.owning_interface(setup)?;
                let interface = &snapshot.interfaces[ix];
                let ctx = Self::current_ctx(&snapshot, interface);
                accepted(interface.driver.vendor_req(self, &ctx, setup))
            }
            _ => Err("unsupported recipient"),
        }
    }

    /// Microsoft OS feature descriptors. The host does not say which configuration it means, so
    /// the first one of the current speed is used.
    fn microsoft_req(&self, setup: &Setup, device: bool) -> Handled {
        check(setup.is_device_to_host(), "Microsoft OS request must be device-to-host")?;
        check(
            matches!(
                self.device_state(),
                DeviceState::Default | DeviceState::Addressed | DeviceState::Configured
            ),
            "Microsoft OS request in this state",
        )?;
        let core = self.core();
        let cfg_nbr = core
            .config_by_index(0, self.bus_speed())
            .ok_or("no configuration")?;
        let snapshot = core
            .registry
            .lock()
            .unwrap()
            .snapshot(cfg_nbr)
            .map_err(|_| "no configuration")?;
        let if_nbr = (setup.value() & 0xFF) as u8;

        let mut w = self.control_writer(setup);
        let written = match setup.index() {
            COMPAT_ID_INDEX if device => microsoft::write_compat_id(&mut w, &snapshot, if_nbr),
            EXT_PROPERTIES_INDEX => microsoft::write_ext_properties(&mut w, &snapshot, if_nbr),
            _ => return Err("unsupported Microsoft OS feature"),
        };
        written.map_err(|_| "Microsoft OS descriptor could not be built")?;
        w.stop().map(|_| ()).map_err(|_| "descriptor data stage failed")
    }
}
