//! Enumerates a vendor class device on the software controller and echoes one bulk transfer,
//! logging what the host side sees.

use std::sync::Arc;
use std::time::Duration;

use driver_udc::sim::{SimHost, SimUDC};
use usbd_core::usb::{ConfigDescriptor, DescriptorKind, DeviceDescriptor, ReqRecipient, Setup};
use usbd_core::{
    ClassDriver, CompatId, CoreConfig, ExtProperty, InterfaceCtx, MicrosoftDescriptors, Speed, UsbDevice,
};

const VENDOR_CODE: u8 = 0x20;

struct Echo;

impl ClassDriver for Echo {
    fn enable(&self, _dev: &UsbDevice, ctx: &InterfaceCtx) {
        log::info!("usbd-sim: interface {} enabled", ctx.interface);
    }

    fn disable(&self, _dev: &UsbDevice, ctx: &InterfaceCtx) {
        log::info!("usbd-sim: interface {} disabled", ctx.interface);
    }

    fn microsoft(&self) -> Option<&dyn MicrosoftDescriptors> {
        Some(self)
    }
}

impl MicrosoftDescriptors for Echo {
    fn compat_id(&self, _ctx: &InterfaceCtx) -> Option<CompatId> {
        Some(CompatId::WinUsb)
    }

    fn ext_properties(&self, _ctx: &InterfaceCtx) -> Vec<ExtProperty> {
        vec![ExtProperty::string(
            "DeviceInterfaceGUID",
            "{8fe6d4d7-49dd-41e7-9486-49afc6bfe475}",
        )]
    }
}

fn host_request(host: &SimHost, setup: Setup, data: &[u8]) -> Vec<u8> {
    let outcome = host.control(setup.to_bytes(), data);
    if !outcome.is_ok() {
        panic!("request {:?} failed (stalled: {})", setup, outcome.stalled);
    }
    outcome.data
}

fn main() {
    common::setup_logging(
        "usb",
        "device",
        "usbd-sim",
        common::output_level(),
        common::file_level(),
    );

    let (udc, host) = SimUDC::full_speed();
    let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).expect("Failed to init device core");

    let cfg = dev
        .add_configuration(Some("Echo"), 0, 100, Speed::Full)
        .expect("Failed to add configuration");
    let if_nbr = dev
        .add_interface(cfg, Arc::new(Echo), None, None, 0xFF, 0, 0, Some("Echo interface"))
        .expect("Failed to add interface");
    let ep_in = dev
        .add_bulk_endpoint(cfg, if_nbr, 0, true, 64)
        .expect("Failed to add bulk IN endpoint");
    let ep_out = dev
        .add_bulk_endpoint(cfg, if_nbr, 0, false, 64)
        .expect("Failed to add bulk OUT endpoint");
    dev.set_microsoft_vendor_code(VENDOR_CODE);

    let _event_loop = dev.spawn_event_loop().expect("Failed to spawn event loop");
    dev.start().expect("Failed to start device");

    host.connect();
    host.reset();

    let raw = host_request(&host, Setup::get_descriptor(DescriptorKind::Device, 0, 0, 64), &[]);
    let desc = *plain::from_bytes::<DeviceDescriptor>(&raw).expect("Short device descriptor");
    let (vendor, product) = (desc.vendor, desc.product);
    log::info!(
        "usbd-sim: device {:04x}:{:04x}, {} configuration(s)",
        vendor,
        product,
        desc.configurations
    );

    host_request(&host, Setup::set_address(7), &[]);
    log::info!("usbd-sim: device at address {} ({:?})", host.address(), dev.device_state());

    let raw = host_request(
        &host,
        Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 255),
        &[],
    );
    let config = *plain::from_bytes::<ConfigDescriptor>(&raw).expect("Short configuration descriptor");
    let total_length = config.total_length;
    log::info!(
        "usbd-sim: configuration {} is {} bytes with {} interface(s)",
        config.configuration_value,
        total_length,
        config.interfaces
    );

    let compat = host_request(&host, Setup::custom(0xC0, VENDOR_CODE, 0, 4, 0x28), &[]);
    log::info!("usbd-sim: compatible ID descriptor {:02x?}", compat);

    host_request(&host, Setup::set_configuration(config.configuration_value), &[]);
    let status = host_request(&host, Setup::get_status(ReqRecipient::Device, 0), &[]);
    log::info!("usbd-sim: {:?}, status {:02x?}", dev.device_state(), status);

    let message = b"hello from the host side of the bus";
    host.queue_out(ep_out, message, 64);
    let mut buf = [0u8; 64];
    let len = dev
        .read_bulk_sync(ep_out, &mut buf, Some(Duration::from_secs(1)))
        .expect("Bulk read failed");
    dev.write_bulk_sync(ep_in, &buf[..len], true, Some(Duration::from_secs(1)))
        .expect("Bulk write failed");

    let echoed = host.take_in(ep_in).concat();
    log::info!("usbd-sim: echoed {:?}", String::from_utf8_lossy(&echoed));

    dev.stop().expect("Failed to stop device");
    dev.shutdown_event_loop().expect("Failed to stop event loop");
}
