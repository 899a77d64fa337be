#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use driver_udc::sim::{ControlOutcome, SimHost, SimUDC};
use usbd_core::usb::Setup;
use usbd_core::{ClassDriver, CoreConfig, DeviceState, InterfaceCtx, Speed, UsbDevice};

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

/// A vendor class that records what the core tells it and answers one vendor request.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

/// bRequest of the vendor request answered with "pong".
pub const PING: u8 = 0x01;

impl ClassDriver for Recorder {
    fn enable(&self, _dev: &UsbDevice, ctx: &InterfaceCtx) {
        self.push(format!("enable {}", ctx.interface));
    }

    fn disable(&self, _dev: &UsbDevice, ctx: &InterfaceCtx) {
        self.push(format!("disable {}", ctx.interface));
    }

    fn alt_settings_update(&self, _dev: &UsbDevice, ctx: &InterfaceCtx) {
        self.push(format!("alt {} {}", ctx.interface, ctx.alt));
    }

    fn endpoint_state_update(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx, ep_addr: u8) {
        self.push(format!("endpoint {:#04x}", ep_addr));
    }

    fn vendor_req(&self, dev: &UsbDevice, _ctx: &InterfaceCtx, setup: &Setup) -> bool {
        setup.request == PING && setup.is_device_to_host() && dev.write_control_sync(b"pong", TIMEOUT).is_ok()
    }
}

pub struct Bench {
    pub dev: UsbDevice,
    pub host: SimHost,
    pub class: Arc<Recorder>,
    pub cfg: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    /// The bulk IN endpoint of alternate setting 1.
    pub alt_in: u8,
}

/// One configuration with a vendor interface: bulk IN and OUT of 64 bytes on alternate setting 0
/// and a single bulk IN on alternate setting 1.
pub fn vendor_device() -> Bench {
    let _ = common::setup_logging("usb", "device", "usbd-test", common::output_level(), common::file_level());

    let (udc, host) = SimUDC::full_speed();
    let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
    let class = Arc::new(Recorder::default());

    let cfg = dev.add_configuration(Some("Test"), 0, 100, Speed::Full).unwrap();
    let if_nbr = dev
        .add_interface(cfg, class.clone(), None, None, 0xFF, 0, 0, None)
        .unwrap();
    let ep_in = dev.add_bulk_endpoint(cfg, if_nbr, 0, true, 64).unwrap();
    let ep_out = dev.add_bulk_endpoint(cfg, if_nbr, 0, false, 64).unwrap();
    let alt = dev.add_alt_interface(cfg, if_nbr, None, None).unwrap();
    let alt_in = dev.add_bulk_endpoint(cfg, if_nbr, alt, true, 64).unwrap();

    Bench {
        dev,
        host,
        class,
        cfg,
        ep_in,
        ep_out,
        alt_in,
    }
}

impl Bench {
    pub fn request(&self, setup: Setup, data: &[u8]) -> ControlOutcome {
        self.host.control(setup.to_bytes(), data)
    }

    /// Starts the device and takes it through reset into DEFAULT.
    pub fn attach(&self) {
        self.dev.spawn_event_loop().unwrap();
        self.dev.start().unwrap();
        self.host.connect();
        self.host.reset();
    }

    /// Attaches, addresses and configures the device.
    pub fn configure(&self) {
        self.attach();
        assert!(self.request(Setup::set_address(1), &[]).is_ok());
        assert!(self.request(Setup::set_configuration(1), &[]).is_ok());
        assert_eq!(self.dev.device_state(), DeviceState::Configured);
    }
}
