//! The device core object and the application facing calls that build the device model.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use driver_udc::{EndpointCapability, EndpointTy, Speed, UDCAdapter, UDCEvents};
use log::{debug, info};

use crate::alloc;
use crate::bitmap::EndpointMap;
use crate::class::{ClassArg, ClassDriver, DeviceHooks};
use crate::config::CoreConfig;
use crate::endpoint::EndpointTable;
use crate::event::{CoreEvent, EventSink};
use crate::registry::Registry;
use crate::state::{DeviceState, DeviceStatus};
use crate::urb::UrbPool;
use crate::usb::Setup;
use crate::{Error, Result};

pub(crate) struct Core {
    pub config: CoreConfig,
    pub driver: Mutex<Box<dyn UDCAdapter>>,
    /// Highest speed the controller supports.
    pub drv_speed: Speed,
    pub table: Vec<EndpointCapability>,
    pub ctrl_max_pkt: u16,
    pub registry: Mutex<Registry>,
    pub status: Mutex<DeviceStatus>,
    pub endpoints: EndpointTable,
    pub urbs: UrbPool,
    /// The setup packet being handled by the dispatcher.
    pub current_setup: Mutex<Setup>,
    pub events: Sender<CoreEvent>,
    pub event_rx: Receiver<CoreEvent>,
    pub sink: Arc<EventSink>,
    pub hooks: Mutex<Option<Arc<dyn DeviceHooks>>>,
    pub std_req_timeout: Mutex<Duration>,
}

impl Core {
    pub fn current_setup(&self) -> Setup {
        *self.current_setup.lock().unwrap()
    }

    pub fn std_req_timeout(&self) -> Duration {
        *self.std_req_timeout.lock().unwrap()
    }

    pub fn hooks(&self) -> Option<Arc<dyn DeviceHooks>> {
        self.hooks.lock().unwrap().clone()
    }
}

/// Handle onto one USB device stack instance.
///
/// Cloning is cheap; every clone talks to the same device. Class drivers receive a reference to
/// it in their callbacks.
#[derive(Clone)]
pub struct UsbDevice {
    pub(crate) core: Arc<Core>,
}

impl UsbDevice {
    /// Initialises the stack on top of `driver`. The controller is not touched until
    /// [UsbDevice::start].
    pub fn new(driver: Box<dyn UDCAdapter>, config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let drv_speed = driver.speed();
        let table = driver.endpoint_table().to_vec();
        if table.len() > 32 {
            return Err(Error::InvalidParameter("endpoint table"));
        }

        // The control pipe always takes the first two entries.
        let ctrl_out = alloc::allocate(&table, EndpointMap::EMPTY, drv_speed, EndpointTy::Ctrl, false, 0, 0)?;
        let ctrl_in = alloc::allocate(
            &table,
            EndpointMap::from_bits(1 << ctrl_out.slot),
            drv_speed,
            EndpointTy::Ctrl,
            true,
            0,
            0,
        )?;
        if ctrl_out.slot != 0 || ctrl_in.slot != 1 || ctrl_out.address != 0x00 || ctrl_in.address != 0x80 {
            return Err(Error::InvalidParameter("endpoint table"));
        }
        let ctrl_max_pkt = ctrl_out.max_packet_size.min(ctrl_in.max_packet_size);

        let mut registry = Registry::new(&config.pools);
        let identity = &config.device;
        for name in [&identity.manufacturer, &identity.product, &identity.serial]
            .iter()
            .filter_map(|name| name.as_deref())
        {
            registry.strings.add(name)?;
        }

        let (events, event_rx) = bounded(config.core.event_queue_len);
        let endpoints = EndpointTable::new(config.pools.open_endpoints);
        let urbs = UrbPool::new(config.pools.extra_urbs);
        let std_req_timeout = config.std_req_timeout();

        info!(
            "usbd: {} speed controller, {} endpoint slots, control packets of {}",
            drv_speed.as_str(),
            table.len(),
            ctrl_max_pkt
        );

        let core = Arc::new_cyclic(|weak| Core {
            config,
            driver: Mutex::new(driver),
            drv_speed,
            table,
            ctrl_max_pkt,
            registry: Mutex::new(registry),
            status: Mutex::new(DeviceStatus::new()),
            endpoints,
            urbs,
            current_setup: Mutex::new(Setup::default()),
            events,
            event_rx,
            sink: Arc::new(EventSink::new(weak.clone())),
            hooks: Mutex::new(None),
            std_req_timeout: Mutex::new(std_req_timeout),
        });
        Ok(Self { core })
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Starts the controller. The device shows up on the bus once the host sees a connect.
    pub fn start(&self) -> Result<()> {
        let core = self.core();
        let mut status = core.status.lock().unwrap();
        if status.started || !matches!(status.state, DeviceState::None | DeviceState::Init) {
            return Err(Error::InvalidState);
        }

        let mut driver = core.driver.lock().unwrap();
        if !status.inited {
            let sink: Arc<dyn UDCEvents> = core.sink.clone();
            driver.init(sink)?;
            status.inited = true;
        }
        driver.start()?;

        status.started = true;
        status.state = DeviceState::Init;
        info!("usbd: device started");
        Ok(())
    }

    /// Stops the controller, tearing down the active configuration first.
    pub fn stop(&self) -> Result<()> {
        if !self.core().status.lock().unwrap().started {
            return Err(Error::InvalidState);
        }

        self.unset_configuration();
        self.core().close_ctrl();
        let stopped = self.core().driver.lock().unwrap().stop();

        let mut status = self.core().status.lock().unwrap();
        status.started = false;
        status.connected = false;
        status.state = DeviceState::Init;
        status.address = 0;
        status.speed = None;
        status.pending_address = None;
        drop(status);

        info!("usbd: device stopped");
        stopped.map_err(Error::from)
    }

    /// Installs the application hooks for bus and configuration events.
    pub fn set_hooks(&self, hooks: Arc<dyn DeviceHooks>) {
        *self.core().hooks.lock().unwrap() = Some(hooks);
    }

    pub fn std_req_timeout(&self) -> Duration {
        self.core().std_req_timeout()
    }

    /// Timeout applied to the data and status stages of standard requests.
    pub fn set_std_req_timeout(&self, timeout: Duration) {
        *self.core().std_req_timeout.lock().unwrap() = timeout;
    }

    /// The registry, if the device model may still be changed.
    fn building(&self) -> Result<MutexGuard<'_, Registry>> {
        match self.device_state() {
            DeviceState::None | DeviceState::Init => Ok(self.core().registry.lock().unwrap()),
            _ => Err(Error::InvalidState),
        }
    }

    /// Adds a configuration for `speed` and returns its number, with [crate::CONFIG_NBR_SPD_BIT]
    /// set for high-speed configurations.
    ///
    /// `attributes` takes the self-powered and remote-wakeup bits; `max_power` is in mA.
    pub fn add_configuration(&self, name: Option<&str>, attributes: u8, max_power: u16, speed: Speed) -> Result<u8> {
        let drv_speed = self.core().drv_speed;
        let cfg_nbr = self
            .building()?
            .add_configuration(name, attributes, max_power, speed, drv_speed)?;
        debug!("usbd: added {} speed configuration {:#04x}", speed.as_str(), cfg_nbr);
        Ok(cfg_nbr)
    }

    /// Links a full-speed and a high-speed configuration as each other's other-speed variant.
    pub fn associate_other_speed_configuration(&self, cfg_nbr: u8, other_nbr: u8) -> Result<()> {
        if self.core().drv_speed != Speed::High {
            return Err(Error::InvalidState);
        }
        self.building()?.associate_other_speed(cfg_nbr, other_nbr)
    }

    /// Adds an interface, with its default alternate setting, to a configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interface(
        &self,
        cfg_nbr: u8,
        driver: Arc<dyn ClassDriver>,
        if_arg: Option<ClassArg>,
        alt_arg: Option<ClassArg>,
        class: u8,
        sub_class: u8,
        protocol: u8,
        name: Option<&str>,
    ) -> Result<u8> {
        self.building()?
            .add_interface(cfg_nbr, driver, if_arg, alt_arg, class, sub_class, protocol, name)
    }

    pub fn add_alt_interface(&self, cfg_nbr: u8, if_nbr: u8, alt_arg: Option<ClassArg>, name: Option<&str>) -> Result<u8> {
        self.building()?.add_alt_interface(cfg_nbr, if_nbr, alt_arg, name)
    }

    /// Groups `count` consecutive interfaces starting at `first` into one function, announced with
    /// an Interface Association Descriptor.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interface_group(
        &self,
        cfg_nbr: u8,
        class: u8,
        sub_class: u8,
        protocol: u8,
        first: u8,
        count: u8,
        name: Option<&str>,
    ) -> Result<u8> {
        self.building()?
            .add_interface_group(cfg_nbr, class, sub_class, protocol, first, count, name)
    }

    /// Returns the address of the allocated endpoint. A `max_packet_size` of zero takes the largest
    /// size the hardware allows.
    pub fn add_bulk_endpoint(&self, cfg_nbr: u8, if_nbr: u8, alt_nbr: u8, dir_in: bool, max_packet_size: u16) -> Result<u8> {
        let table = &self.core().table;
        self.building()?
            .add_bulk_endpoint(table, cfg_nbr, if_nbr, alt_nbr, dir_in, max_packet_size)
    }

    /// `interval` is in frames (ms) at full speed and in microframes at high speed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_interrupt_endpoint(
        &self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        dir_in: bool,
        max_packet_size: u16,
        interval: u16,
    ) -> Result<u8> {
        let table = &self.core().table;
        self.building()?
            .add_interrupt_endpoint(table, cfg_nbr, if_nbr, alt_nbr, dir_in, max_packet_size, interval)
    }

    /// `attributes` holds the synchronisation type and usage bits; `transactions` is the number of
    /// packets per microframe.
    #[allow(clippy::too_many_arguments)]
    pub fn add_isochronous_endpoint(
        &self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        dir_in: bool,
        attributes: u8,
        max_packet_size: u16,
        transactions: u8,
        interval: u16,
    ) -> Result<u8> {
        let table = &self.core().table;
        self.building()?.add_isochronous_endpoint(
            table,
            cfg_nbr,
            if_nbr,
            alt_nbr,
            dir_in,
            attributes,
            max_packet_size,
            transactions,
            interval,
        )
    }

    pub fn set_isochronous_endpoint_refresh_rate(
        &self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        sync_ep_addr: u8,
        refresh: u8,
    ) -> Result<()> {
        self.building()?
            .set_isochronous_refresh_rate(cfg_nbr, if_nbr, alt_nbr, sync_ep_addr, refresh)
    }

    pub fn set_isochronous_endpoint_sync_address(
        &self,
        cfg_nbr: u8,
        if_nbr: u8,
        alt_nbr: u8,
        data_ep_addr: u8,
        sync_addr: u8,
    ) -> Result<()> {
        self.building()?
            .set_isochronous_sync_address(cfg_nbr, if_nbr, alt_nbr, data_ep_addr, sync_addr)
    }

    /// Registers a string for use in descriptors and returns its index.
    pub fn add_string(&self, text: &str) -> Result<u8> {
        self.core().registry.lock().unwrap().strings.add(text)
    }

    /// Index of a registered string, or zero.
    pub fn get_string_index(&self, text: &str) -> u8 {
        self.core().registry.lock().unwrap().strings.index(text)
    }

    /// Highest physical endpoint number used by any configuration, plus one.
    pub fn max_phy_endpoint_number(&self) -> u8 {
        self.core().registry.lock().unwrap().max_phy()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use driver_udc::sim::SimUDC;
    use driver_udc::{EndpointCaps, EndpointCapability};

    struct Nop;
    impl ClassDriver for Nop {}

    #[test]
    fn control_pair_must_lead_the_table() {
        let (udc, _host) = SimUDC::new(
            Speed::Full,
            vec![
                EndpointCapability::new(EndpointCaps::BULK | EndpointCaps::DIR_IN, 1, 64),
                EndpointCapability::new(EndpointCaps::CTRL | EndpointCaps::DIR_OUT, 0, 64),
                EndpointCapability::new(EndpointCaps::CTRL | EndpointCaps::DIR_IN, 0, 64),
            ],
        );
        let err = UsbDevice::new(Box::new(udc), CoreConfig::default()).err();
        assert_eq!(err, Some(Error::InvalidParameter("endpoint table")));
    }

    #[test]
    fn model_is_frozen_once_running() {
        let (udc, _host) = SimUDC::full_speed();
        let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
        assert_eq!(dev.get_string_index("Redox OS"), 1);

        let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
        dev.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, None).unwrap();
        assert_eq!(dev.add_bulk_endpoint(cfg, 0, 0, true, 64), Ok(0x81));
        assert_eq!(dev.max_phy_endpoint_number(), 4);

        dev.start().unwrap();
        assert_eq!(dev.start(), Err(Error::InvalidState));
        // Still in INIT: no host has talked to us yet.
        assert!(dev.add_bulk_endpoint(cfg, 0, 0, false, 64).is_ok());

        dev.core().status.lock().unwrap().state = DeviceState::Attached;
        assert_eq!(dev.add_configuration(None, 0, 100, Speed::Full), Err(Error::InvalidState));
    }

    #[test]
    fn high_speed_configuration_needs_high_speed_controller() {
        let (udc, _host) = SimUDC::full_speed();
        let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
        assert_eq!(
            dev.add_configuration(None, 0, 100, Speed::High),
            Err(Error::InvalidParameter("speed"))
        );
        let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
        assert_eq!(dev.associate_other_speed_configuration(cfg, cfg), Err(Error::InvalidState));
    }
}
