mod support;

use std::sync::Arc;

use driver_udc::sim::SimUDC;
use support::{vendor_device, PING};
use usbd_core::usb::{
    ConfigDescriptor, DescriptorKind, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, ReqRecipient, Setup,
};
use usbd_core::{
    ClassDriver, CompatId, CoreConfig, DescriptorWriter, DeviceState, InterfaceCtx, MicrosoftDescriptors, Speed,
    UsbDevice,
};

struct Nop;
impl ClassDriver for Nop {}

#[test]
fn single_bulk_endpoint_configuration_is_25_bytes() {
    let (udc, _host) = SimUDC::full_speed();
    let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
    let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
    let if_nbr = dev.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, None).unwrap();
    let ep = dev.add_bulk_endpoint(cfg, if_nbr, 0, true, 64).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(dev.get_configuration_descriptor(&mut buf, cfg), Ok(25));

    let header = plain::from_bytes::<ConfigDescriptor>(&buf).unwrap();
    let total_length = header.total_length;
    assert_eq!(total_length, 25);
    assert_eq!(header.interfaces, 1);

    let interface = plain::from_bytes::<InterfaceDescriptor>(&buf[9..]).unwrap();
    assert_eq!(interface.endpoints, 1);
    assert_eq!(interface.class, 0xFF);

    let endpoint = plain::from_bytes::<EndpointDescriptor>(&buf[18..]).unwrap();
    let max_packet_size = endpoint.max_packet_size;
    assert_eq!(endpoint.address, ep);
    assert_eq!(endpoint.attributes, 0x02);
    assert_eq!(max_packet_size, 64);
}

#[test]
fn host_enumerates_the_device() {
    let bench = vendor_device();
    bench.attach();

    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::Device, 0, 0, 64), &[]);
    assert!(outcome.is_ok());
    assert_eq!(outcome.data.len(), 18);
    let desc = plain::from_bytes::<DeviceDescriptor>(&outcome.data).unwrap();
    assert_eq!(desc.packet_size, 64);
    assert_eq!(desc.configurations, 1);
    assert_eq!(bench.dev.device_state(), DeviceState::Default);

    // Windows asks for 8 bytes first.
    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::Device, 0, 0, 8), &[]);
    assert_eq!(outcome.data.len(), 8);

    assert!(bench.request(Setup::set_address(9), &[]).is_ok());
    assert_eq!(bench.dev.device_state(), DeviceState::Addressed);
    assert_eq!(bench.dev.device_address(), 9);

    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 255), &[]);
    assert!(outcome.is_ok());
    let header = plain::from_bytes::<ConfigDescriptor>(&outcome.data).unwrap();
    let total_length = header.total_length;
    assert_eq!(usize::from(total_length), outcome.data.len());
    assert_eq!(outcome.data.len(), 9 + 9 + 7 + 7 + 9 + 7);

    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::String, 0, 0, 255), &[]);
    assert_eq!(outcome.data, [4, 3, 0x09, 0x04]);
    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::String, 2, 0x0409, 255), &[]);
    assert_eq!(outcome.data[1], 3);
    assert_eq!(outcome.data[2..4], [b'u', 0]);

    assert_eq!(bench.request(Setup::get_configuration(), &[]).data, [0]);
    assert!(bench.request(Setup::set_configuration(1), &[]).is_ok());
    assert_eq!(bench.dev.device_state(), DeviceState::Configured);
    assert_eq!(bench.request(Setup::get_configuration(), &[]).data, [1]);
    assert_eq!(bench.class.events(), ["enable 0"]);
    assert!(bench.host.is_open(bench.ep_in));
    assert!(bench.host.is_open(bench.ep_out));
    assert!(!bench.host.is_open(bench.alt_in));
}

#[test]
fn full_speed_controller_has_no_qualifier() {
    let bench = vendor_device();
    bench.attach();
    let outcome = bench.request(Setup::get_descriptor(DescriptorKind::DeviceQualifier, 0, 0, 10), &[]);
    assert!(outcome.stalled);
}

#[test]
fn high_speed_device_reports_its_full_speed_self() {
    let (udc, host) = SimUDC::high_speed();
    let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
    let hs = dev.add_configuration(None, 0, 100, Speed::High).unwrap();
    let fs = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
    let fs2 = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
    for cfg in [hs, fs, fs2] {
        dev.add_interface(cfg, Arc::new(Nop), None, None, 0xFF, 0, 0, None).unwrap();
    }
    dev.add_bulk_endpoint(hs, 0, 0, true, 512).unwrap();
    dev.add_bulk_endpoint(fs, 0, 0, true, 64).unwrap();
    dev.associate_other_speed_configuration(hs, fs).unwrap();

    dev.spawn_event_loop().unwrap();
    dev.start().unwrap();
    host.connect();
    host.reset();

    let outcome = host.control(
        Setup::get_descriptor(DescriptorKind::DeviceQualifier, 0, 0, 10).to_bytes(),
        &[],
    );
    assert!(outcome.is_ok());
    assert_eq!(dev.device_speed(), Ok(Speed::High));
    assert_eq!(outcome.data.len(), 10);
    assert_eq!(outcome.data[1], DescriptorKind::DeviceQualifier as u8);
    // Two full-speed configurations.
    assert_eq!(outcome.data[8], 2);

    let outcome = host.control(
        Setup::get_descriptor(DescriptorKind::OtherSpeedConfiguration, 0, 0, 255).to_bytes(),
        &[],
    );
    assert!(outcome.is_ok());
    assert_eq!(outcome.data[1], DescriptorKind::OtherSpeedConfiguration as u8);
    assert_eq!(outcome.data.len(), 9 + 9 + 7);
    // wMaxPacketSize of the full-speed endpoint.
    assert_eq!(outcome.data[22..24], [64, 0]);
}

#[test]
fn set_address_while_addressed_readdresses() {
    let bench = vendor_device();
    bench.attach();
    assert!(bench.request(Setup::set_address(3), &[]).is_ok());
    assert_eq!(bench.dev.device_state(), DeviceState::Addressed);

    let outcome = bench.request(Setup::set_address(5), &[]);
    assert!(outcome.is_ok());
    assert!(!outcome.stalled);
    assert_eq!(bench.dev.device_state(), DeviceState::Addressed);
    assert_eq!(bench.dev.device_address(), 5);
}

#[test]
fn state_follows_the_chapter_9_graph() {
    let bench = vendor_device();
    bench.configure();

    // Not a configuration value this device has.
    assert!(bench.request(Setup::set_configuration(4), &[]).stalled);
    assert_eq!(bench.dev.device_state(), DeviceState::Configured);

    // SET_ADDRESS is not allowed once configured.
    assert!(bench.request(Setup::set_address(2), &[]).stalled);
    assert_eq!(bench.dev.device_state(), DeviceState::Configured);

    assert!(bench.request(Setup::set_configuration(0), &[]).is_ok());
    assert_eq!(bench.dev.device_state(), DeviceState::Addressed);
    assert_eq!(bench.class.events(), ["enable 0", "disable 0"]);
    assert!(!bench.host.is_open(bench.ep_in));

    assert!(bench.request(Setup::set_address(0), &[]).is_ok());
    assert_eq!(bench.dev.device_state(), DeviceState::Default);
    assert_eq!(bench.dev.device_address(), 0);

    assert!(bench.request(Setup::set_configuration(1), &[]).stalled);
    assert_eq!(bench.dev.device_state(), DeviceState::Default);
}

#[test]
fn malformed_requests_stall() {
    let bench = vendor_device();
    bench.configure();

    // GET_CONFIGURATION with a wValue.
    let setup = Setup::custom(0x80, 0x08, 1, 0, 1);
    assert!(bench.request(setup, &[]).stalled);
    // GET_STATUS asking for three bytes.
    let setup = Setup::custom(0x80, 0x00, 0, 0, 3);
    assert!(bench.request(setup, &[]).stalled);
    // Reserved request type.
    let setup = Setup::custom(0xE0, 0x00, 0, 0, 0);
    assert!(bench.request(setup, &[]).stalled);

    // The pipe recovers with the next setup packet.
    assert!(bench.request(Setup::get_configuration(), &[]).is_ok());
}

#[test]
fn device_status_and_remote_wakeup() {
    let bench = vendor_device();
    bench.attach();
    bench.dev.set_self_power(true);
    assert!(bench.request(Setup::set_address(1), &[]).is_ok());
    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Device, 0), &[]).data, [1, 0]);

    assert!(bench.request(Setup::set_configuration(1), &[]).is_ok());
    // The configuration is bus powered and has no remote wakeup.
    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Device, 0), &[]).data, [0, 0]);
    assert!(bench.request(Setup::set_feature(ReqRecipient::Device, 1, 0), &[]).stalled);
    assert!(bench.request(Setup::clear_feature(ReqRecipient::Device, 1, 0), &[]).is_ok());
    assert!(!bench.dev.remote_wakeup_enabled());
}

#[test]
fn unknown_alternate_setting_stalls_and_keeps_the_current_one() {
    let bench = vendor_device();
    bench.configure();

    assert!(bench.request(Setup::set_interface(0, 3), &[]).stalled);
    assert_eq!(bench.request(Setup::get_interface(0), &[]).data, [0]);
    assert!(bench.host.is_open(bench.ep_in));

    assert!(bench.request(Setup::set_interface(0, 1), &[]).is_ok());
    assert_eq!(bench.request(Setup::get_interface(0), &[]).data, [1]);
    assert!(!bench.host.is_open(bench.ep_in));
    assert!(bench.host.is_open(bench.alt_in));
    assert_eq!(bench.class.events(), ["enable 0", "alt 0 1"]);

    // No such interface.
    assert!(bench.request(Setup::set_interface(1, 0), &[]).stalled);
    assert!(bench.request(Setup::get_interface(1), &[]).stalled);
}

#[test]
fn endpoint_halt_from_the_host() {
    let bench = vendor_device();
    bench.configure();
    let ep = u16::from(bench.ep_in);

    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Endpoint, ep), &[]).data, [0, 0]);
    assert!(bench.request(Setup::set_feature(ReqRecipient::Endpoint, 0, ep), &[]).is_ok());
    assert_eq!(bench.dev.is_endpoint_stalled(bench.ep_in), Ok(true));
    assert!(bench.host.is_stalled(bench.ep_in));
    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Endpoint, ep), &[]).data, [1, 0]);

    assert!(bench.request(Setup::clear_feature(ReqRecipient::Endpoint, 0, ep), &[]).is_ok());
    assert_eq!(bench.dev.is_endpoint_stalled(bench.ep_in), Ok(false));
    assert_eq!(
        bench.class.events(),
        ["enable 0".to_string(), format!("endpoint {:#04x}", ep), format!("endpoint {:#04x}", ep)]
    );

    // Halting the default pipe stalls the request itself; the next SETUP clears it.
    assert!(bench.request(Setup::set_feature(ReqRecipient::Endpoint, 0, 0x80), &[]).stalled);
    assert!(bench.host.is_stalled(0x80));
    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Endpoint, 0x80), &[]).data, [0, 0]);
    assert!(bench.request(Setup::clear_feature(ReqRecipient::Endpoint, 0, 0x00), &[]).is_ok());
    assert!(!bench.host.is_stalled(0x00));
    // GET_STATUS(endpoint) with a nonzero wValue is malformed.
    assert!(bench.request(Setup::custom(0x82, 0x00, 1, 0x80, 2), &[]).stalled);

    // Endpoints of other alternate settings are not open.
    let alt = u16::from(bench.alt_in);
    assert!(bench.request(Setup::get_status(ReqRecipient::Endpoint, alt), &[]).stalled);
}

#[test]
fn interface_features_are_acknowledged() {
    let bench = vendor_device();
    bench.attach();
    assert!(bench.request(Setup::set_address(1), &[]).is_ok());
    // Interfaces only exist once configured.
    assert!(bench.request(Setup::set_feature(ReqRecipient::Interface, 0, 0), &[]).stalled);

    assert!(bench.request(Setup::set_configuration(1), &[]).is_ok());
    assert_eq!(bench.request(Setup::get_status(ReqRecipient::Interface, 0), &[]).data, [0, 0]);
    assert!(bench.request(Setup::set_feature(ReqRecipient::Interface, 0, 0), &[]).is_ok());
    assert!(bench.request(Setup::clear_feature(ReqRecipient::Interface, 0, 0), &[]).is_ok());

    assert!(bench.request(Setup::set_feature(ReqRecipient::Interface, 0, 3), &[]).stalled);
    // Device-to-host is not a valid direction for SET_FEATURE.
    assert!(bench.request(Setup::custom(0x81, 0x03, 0, 0, 0), &[]).stalled);
    assert_eq!(bench.class.events(), ["enable 0"]);
}

#[test]
fn vendor_requests_reach_the_class_driver() {
    let bench = vendor_device();
    bench.configure();

    let outcome = bench.request(Setup::custom(0xC1, PING, 0, 0, 4), &[]);
    assert!(outcome.is_ok());
    assert_eq!(outcome.data, b"pong");

    // Routed through the endpoint's owner.
    let outcome = bench.request(Setup::custom(0xC2, PING, 0, u16::from(bench.ep_in), 4), &[]);
    assert_eq!(outcome.data, b"pong");

    // Unknown requests and class requests it does not answer stall.
    assert!(bench.request(Setup::custom(0xC1, 0x7F, 0, 0, 4), &[]).stalled);
    assert!(bench.request(Setup::custom(0xA1, PING, 0, 0, 4), &[]).stalled);
}

struct WinUsb;
impl ClassDriver for WinUsb {
    fn microsoft(&self) -> Option<&dyn MicrosoftDescriptors> {
        Some(self)
    }
}
impl MicrosoftDescriptors for WinUsb {
    fn compat_id(&self, _ctx: &InterfaceCtx) -> Option<CompatId> {
        Some(CompatId::WinUsb)
    }
}

#[test]
fn microsoft_os_descriptors_before_configuration() {
    let (udc, host) = SimUDC::full_speed();
    let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
    let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
    dev.add_interface(cfg, Arc::new(WinUsb), None, None, 0xFF, 0, 0, None).unwrap();
    dev.set_microsoft_vendor_code(0x42);
    dev.spawn_event_loop().unwrap();
    dev.start().unwrap();
    host.connect();
    host.reset();
    assert!(host.control(Setup::set_address(1).to_bytes(), &[]).is_ok());

    let outcome = host.control(
        Setup::get_descriptor(DescriptorKind::String, 0xEE, 0, 255).to_bytes(),
        &[],
    );
    assert_eq!(outcome.data.len(), 18);
    assert_eq!(outcome.data[16], 0x42);

    // The header alone first, then everything.
    let outcome = host.control(Setup::custom(0xC0, 0x42, 0, 4, 16).to_bytes(), &[]);
    assert_eq!(outcome.data.len(), 16);
    assert_eq!(outcome.data[..4], 40u32.to_le_bytes());
    let outcome = host.control(Setup::custom(0xC0, 0x42, 0, 4, 40).to_bytes(), &[]);
    assert_eq!(outcome.data.len(), 40);
    assert_eq!(outcome.data[18..24], *b"WINUSB");

    let outcome = host.control(Setup::custom(0xC1, 0x42, 0, 5, 10).to_bytes(), &[]);
    assert!(outcome.is_ok());
    assert_eq!(outcome.data, [10, 0, 0, 0, 0, 1, 5, 0, 0, 0]);

    // Unknown feature index.
    assert!(host.control(Setup::custom(0xC0, 0x42, 0, 7, 16).to_bytes(), &[]).stalled);
}

/// Writes a class descriptor whose length depends on the alternate setting.
struct Sized;
impl ClassDriver for Sized {
    fn interface_descriptors(&self) -> Option<&dyn usbd_core::InterfaceDescriptors> {
        Some(self)
    }
}
impl usbd_core::InterfaceDescriptors for Sized {
    fn descriptor(&self, ctx: &InterfaceCtx, w: &mut DescriptorWriter) {
        let len = 3 + ctx.alt;
        let _ = w.write_u8(len);
        let _ = w.write_u8(0x24);
        for _ in 2..len {
            let _ = w.write_u8(0);
        }
    }

    fn size(&self, ctx: &InterfaceCtx) -> usize {
        usize::from(3 + ctx.alt)
    }
}

#[test]
fn total_length_matches_written_bytes() {
    for interfaces in 1..=3u8 {
        for alts in 0..=2u8 {
            for groups in 0..=1u8 {
                let (udc, _host) = SimUDC::full_speed();
                let dev = UsbDevice::new(Box::new(udc), CoreConfig::default()).unwrap();
                let cfg = dev.add_configuration(None, 0, 100, Speed::Full).unwrap();
                for nbr in 0..interfaces {
                    let class: Arc<dyn ClassDriver> = if nbr % 2 == 0 { Arc::new(Sized) } else { Arc::new(Nop) };
                    let if_nbr = dev.add_interface(cfg, class, None, None, 0xFF, 0, 0, None).unwrap();
                    dev.add_bulk_endpoint(cfg, if_nbr, 0, nbr % 2 == 0, 64).unwrap();
                    for _ in 0..alts {
                        let alt = dev.add_alt_interface(cfg, if_nbr, None, None).unwrap();
                        let dir_in = (nbr + alt) % 2 == 0;
                        dev.add_interrupt_endpoint(cfg, if_nbr, alt, dir_in, 8, 10).unwrap();
                    }
                }
                if groups == 1 && interfaces > 1 {
                    dev.add_interface_group(cfg, 0xFF, 0, 0, 0, 2, None).unwrap();
                }

                let mut buf = [0u8; 512];
                let written = dev.get_configuration_descriptor(&mut buf, cfg).unwrap();
                let header = plain::from_bytes::<ConfigDescriptor>(&buf).unwrap();
                let total_length = header.total_length;
                assert_eq!(
                    usize::from(total_length),
                    written,
                    "{} interfaces, {} alternate settings, {} groups",
                    interfaces,
                    alts,
                    groups
                );
            }
        }
    }
}
