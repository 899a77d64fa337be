//! Descriptor serialization.
//!
//! A [DescriptorWriter] either streams into the control pipe through a scratch buffer, flushing it
//! whenever it fills, or writes into a buffer supplied by the caller. Errors are sticky: once a
//! write fails every later write is a no-op and [DescriptorWriter::stop] reports the first error.

use std::time::Duration;

use driver_udc::{EndpointTy, Speed};

use crate::device::Core;
use crate::registry::{ConfigSnapshot, CONFIG_NBR_SPD_BIT};
use crate::usb::{
    ConfigDescriptor, DescriptorKind, DeviceDescriptor, DeviceQualifier, EndpointDescriptor,
    InterfaceAssociationDescriptor, InterfaceDescriptor, AudioEndpointDescriptor, CLASS_MISC,
    CONFIG_ATTR_RESERVED, MISC_PROTOCOL_IAD, MISC_SUBCLASS_COMMON, USB_VERSION_2_0,
};
use crate::{Error, Result, UsbDevice};

/// String descriptor index of the Microsoft OS string.
pub(crate) const MS_OS_STRING_INDEX: u8 = 0xEE;

enum Sink<'a> {
    Control {
        core: &'a Core,
        scratch: Vec<u8>,
        capacity: usize,
        timeout: Option<Duration>,
    },
    Buffer(&'a mut [u8]),
}

pub struct DescriptorWriter<'a> {
    sink: Sink<'a>,
    /// wLength of the request, or the size of the caller's buffer.
    requested: usize,
    written: usize,
    status: Result<()>,
}

impl<'a> DescriptorWriter<'a> {
    /// A writer filling `buf`. Writing past its end fails with [Error::AllocationExhausted].
    pub fn for_buffer(buf: &'a mut [u8]) -> Self {
        Self {
            requested: buf.len(),
            sink: Sink::Buffer(buf),
            written: 0,
            status: Ok(()),
        }
    }

    /// A writer answering a GET_DESCRIPTOR style request of `requested` bytes. Anything beyond
    /// that is dropped.
    pub(crate) fn for_control(core: &'a Core, requested: usize, timeout: Option<Duration>) -> Self {
        let capacity = core.config.core.desc_buf_len;
        Self {
            sink: Sink::Control {
                core,
                scratch: Vec::with_capacity(capacity),
                capacity,
                timeout,
            },
            requested,
            written: 0,
            status: Ok(()),
        }
    }

    /// The first error hit so far, if any.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Bytes accepted so far, truncated ones excluded.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_buf(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_buf(&value.to_le_bytes())
    }

    pub fn write_u24(&mut self, value: u32) -> Result<()> {
        self.write_buf(&value.to_le_bytes()[..3])
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_buf(&value.to_le_bytes())
    }

    pub fn write_buf(&mut self, data: &[u8]) -> Result<()> {
        self.status.clone()?;

        if let Sink::Buffer(buf) = &mut self.sink {
            let end = self.written + data.len();
            if end > buf.len() {
                self.status = Err(Error::AllocationExhausted);
            } else {
                buf[self.written..end].copy_from_slice(data);
                self.written = end;
            }
            return self.status.clone();
        }

        // The host asked for `requested` bytes; the rest is dropped.
        let take = data.len().min(self.requested.saturating_sub(self.written));
        let mut data = &data[..take];
        while !data.is_empty() && self.status.is_ok() {
            let (scratch, capacity) = match &mut self.sink {
                Sink::Control { scratch, capacity, .. } => (scratch, *capacity),
                Sink::Buffer(_) => break,
            };
            let chunk = data.len().min(capacity - scratch.len());
            scratch.extend_from_slice(&data[..chunk]);
            let full = scratch.len() == capacity;
            self.written += chunk;
            data = &data[chunk..];
            if full {
                self.flush(false);
            }
        }
        self.status.clone()
    }

    fn flush(&mut self, end: bool) {
        if let Sink::Control {
            core,
            scratch,
            timeout,
            ..
        } = &mut self.sink
        {
            if self.status.is_ok() {
                if let Err(err) = core.ctrl_tx(scratch, end, *timeout) {
                    self.status = Err(err);
                }
            }
            scratch.clear();
        }
    }

    /// Finishes the descriptor and returns the number of bytes produced. On the control pipe this
    /// sends what is left in the scratch buffer, ending the data stage.
    pub fn stop(mut self) -> Result<usize> {
        let end = self.written < self.requested;
        self.flush(end);
        self.status.clone().map(|()| self.written)
    }
}

fn class_triple(has_groups: bool) -> (u8, u8, u8) {
    if has_groups {
        (CLASS_MISC, MISC_SUBCLASS_COMMON, MISC_PROTOCOL_IAD)
    } else {
        (0, 0, 0)
    }
}

fn speed_bit(speed: Speed) -> u8 {
    match speed {
        Speed::High => CONFIG_NBR_SPD_BIT,
        _ => 0,
    }
}

fn other_speed(speed: Speed) -> Speed {
    match speed {
        Speed::High => Speed::Full,
        _ => Speed::High,
    }
}

fn utf16_units(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

impl Core {
    /// The device descriptor as seen by a host talking at `speed`.
    pub(crate) fn write_device_descriptor(&self, w: &mut DescriptorWriter, speed: Speed) {
        let (class, sub_class, protocol, configurations, manufacturer, product, serial) = {
            let registry = self.registry.lock().unwrap();
            let (class, sub_class, protocol) = class_triple(registry.has_groups(speed));
            let index = |name: &Option<String>| name.as_deref().map(|n| registry.strings.index(n)).unwrap_or(0);
            (
                class,
                sub_class,
                protocol,
                registry.config_count(speed) as u8,
                index(&self.config.device.manufacturer),
                index(&self.config.device.product),
                index(&self.config.device.serial),
            )
        };
        let identity = &self.config.device;

        let _ = w.write_u8(DeviceDescriptor::LEN);
        let _ = w.write_u8(DescriptorKind::Device as u8);
        let _ = w.write_u16(USB_VERSION_2_0);
        let _ = w.write_u8(class);
        let _ = w.write_u8(sub_class);
        let _ = w.write_u8(protocol);
        let _ = w.write_u8(self.ctrl_max_pkt as u8);
        let _ = w.write_u16(identity.vendor_id);
        let _ = w.write_u16(identity.product_id);
        let _ = w.write_u16(identity.release);
        let _ = w.write_u8(manufacturer);
        let _ = w.write_u8(product);
        let _ = w.write_u8(serial);
        let _ = w.write_u8(configurations);
    }

    /// How the device would look at the other speed (USB2 9.6.2).
    pub(crate) fn write_device_qualifier(&self, w: &mut DescriptorWriter, speed: Speed) {
        let other = other_speed(speed);
        let (class, sub_class, protocol, configurations) = {
            let registry = self.registry.lock().unwrap();
            let (class, sub_class, protocol) = class_triple(registry.has_groups(other));
            (class, sub_class, protocol, registry.config_count(other) as u8)
        };

        let _ = w.write_u8(DeviceQualifier::LEN);
        let _ = w.write_u8(DescriptorKind::DeviceQualifier as u8);
        let _ = w.write_u16(USB_VERSION_2_0);
        let _ = w.write_u8(class);
        let _ = w.write_u8(sub_class);
        let _ = w.write_u8(protocol);
        let _ = w.write_u8(self.ctrl_max_pkt as u8);
        let _ = w.write_u8(configurations);
        let _ = w.write_u8(0);
    }

    /// Configuration number for descriptor index `index` at `speed`, if it exists.
    pub(crate) fn config_by_index(&self, index: u8, speed: Speed) -> Option<u8> {
        let cfg_nbr = (index & !CONFIG_NBR_SPD_BIT) | speed_bit(speed);
        self.registry.lock().unwrap().config(cfg_nbr).ok().map(|_| cfg_nbr)
    }

    /// The other-speed counterpart of configuration `index` at `speed`.
    pub(crate) fn other_speed_config(&self, index: u8, speed: Speed) -> Option<u8> {
        let cfg_nbr = self.config_by_index(index, speed)?;
        self.registry.lock().unwrap().config(cfg_nbr).ok()?.other_speed
    }

    /// Writes configuration `cfg_nbr` with everything below it. `kind` is either
    /// `Configuration` or `OtherSpeedConfiguration`.
    pub(crate) fn write_configuration(&self, w: &mut DescriptorWriter, cfg_nbr: u8, kind: DescriptorKind) -> Result<()> {
        let snapshot = self.registry.lock().unwrap().snapshot(cfg_nbr)?;
        let total_len = configuration_len(&snapshot);

        let _ = w.write_u8(ConfigDescriptor::LEN);
        let _ = w.write_u8(kind as u8);
        let _ = w.write_u16(total_len as u16);
        let _ = w.write_u8(snapshot.interfaces.len() as u8);
        let _ = w.write_u8((cfg_nbr & !CONFIG_NBR_SPD_BIT) + 1);
        let _ = w.write_u8(snapshot.name_idx);
        let _ = w.write_u8(snapshot.attributes | CONFIG_ATTR_RESERVED);
        // bMaxPower is in 2 mA units.
        let _ = w.write_u8((snapshot.max_power / 2) as u8);

        for interface in &snapshot.interfaces {
            if let Some(group) = snapshot.groups.iter().find(|group| group.first == interface.nbr) {
                let _ = w.write_u8(InterfaceAssociationDescriptor::LEN);
                let _ = w.write_u8(DescriptorKind::InterfaceAssociation as u8);
                let _ = w.write_u8(group.first);
                let _ = w.write_u8(group.count);
                let _ = w.write_u8(group.class);
                let _ = w.write_u8(group.sub_class);
                let _ = w.write_u8(group.protocol);
                let _ = w.write_u8(group.name_idx);
            }

            let audio = interface.is_audio_v1();
            for alt in &interface.alts {
                let ctx = interface.ctx(cfg_nbr, alt.nbr);
                let _ = w.write_u8(InterfaceDescriptor::LEN);
                let _ = w.write_u8(DescriptorKind::Interface as u8);
                let _ = w.write_u8(interface.nbr);
                let _ = w.write_u8(alt.nbr);
                let _ = w.write_u8(alt.endpoints.len() as u8);
                let _ = w.write_u8(interface.class);
                let _ = w.write_u8(interface.sub_class);
                let _ = w.write_u8(interface.protocol);
                let _ = w.write_u8(alt.name_idx);
                if let Some(class) = interface.driver.interface_descriptors() {
                    class.descriptor(&ctx, w);
                }

                for ep in &alt.endpoints {
                    let extended = audio && matches!(ep.ty(), EndpointTy::Isoch | EndpointTy::Interrupt);
                    let len = if extended {
                        AudioEndpointDescriptor::LEN
                    } else {
                        EndpointDescriptor::LEN
                    };
                    let _ = w.write_u8(len);
                    let _ = w.write_u8(DescriptorKind::Endpoint as u8);
                    let _ = w.write_u8(ep.address);
                    let _ = w.write_u8(ep.attributes);
                    let _ = w.write_u16(ep.max_packet_size);
                    let _ = w.write_u8(ep.interval);
                    if extended {
                        let _ = w.write_u8(ep.sync_refresh);
                        let _ = w.write_u8(ep.sync_address);
                    }
                    if let Some(class) = interface.driver.endpoint_descriptors() {
                        class.descriptor(&ctx, ep.address, w);
                    }
                }
            }
        }
        w.status()
    }

    /// String descriptor `index`. Index 0 is the LANGID table.
    pub(crate) fn write_string_descriptor(&self, w: &mut DescriptorWriter, index: u8) -> Result<()> {
        match index {
            0 => {
                let _ = w.write_u8(4);
                let _ = w.write_u8(DescriptorKind::String as u8);
                let _ = w.write_u16(self.config.device.lang_id);
            }
            MS_OS_STRING_INDEX => {
                let code = self.status.lock().unwrap().ms_vendor_code.ok_or(Error::InvalidHandle)?;
                let _ = w.write_u8(18);
                let _ = w.write_u8(DescriptorKind::String as u8);
                for unit in utf16_units("MSFT100") {
                    let _ = w.write_u16(unit);
                }
                let _ = w.write_u8(code);
                let _ = w.write_u8(0);
            }
            index => {
                let units = {
                    let registry = self.registry.lock().unwrap();
                    utf16_units(registry.strings.get(index).ok_or(Error::InvalidHandle)?)
                };
                let len = (2 * units.len() + 2).min(255) & !1;
                let _ = w.write_u8(len as u8);
                let _ = w.write_u8(DescriptorKind::String as u8);
                for &unit in units.iter().take((len - 2) / 2) {
                    let _ = w.write_u16(unit);
                }
            }
        }
        w.status()
    }
}

/// wTotalLength of a configuration, computed before anything is written.
pub(crate) fn configuration_len(snapshot: &ConfigSnapshot) -> usize {
    let mut len = usize::from(ConfigDescriptor::LEN);
    for interface in &snapshot.interfaces {
        if snapshot.groups.iter().any(|group| group.first == interface.nbr) {
            len += usize::from(InterfaceAssociationDescriptor::LEN);
        }
        let audio = interface.is_audio_v1();
        for alt in &interface.alts {
            let ctx = interface.ctx(snapshot.nbr, alt.nbr);
            len += usize::from(InterfaceDescriptor::LEN);
            if let Some(class) = interface.driver.interface_descriptors() {
                len += class.size(&ctx);
            }
            for ep in &alt.endpoints {
                len += usize::from(EndpointDescriptor::LEN);
                if audio && matches!(ep.ty(), EndpointTy::Isoch | EndpointTy::Interrupt) {
                    len += 2;
                }
                if let Some(class) = interface.driver.endpoint_descriptors() {
                    len += class.size(&ctx, ep.address);
                }
            }
        }
    }
    len
}

impl UsbDevice {
    fn before_start(&self) -> Result<()> {
        if self.device_state() != crate::DeviceState::None {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Serializes the device descriptor into `buf`. Only available before the device is started.
    pub fn get_device_descriptor(&self, buf: &mut [u8]) -> Result<usize> {
        self.before_start()?;
        let mut w = DescriptorWriter::for_buffer(buf);
        self.core().write_device_descriptor(&mut w, self.core().drv_speed);
        w.stop()
    }

    /// Serializes configuration `cfg_nbr`, interfaces and endpoints included, into `buf`.
    pub fn get_configuration_descriptor(&self, buf: &mut [u8], cfg_nbr: u8) -> Result<usize> {
        self.before_start()?;
        let mut w = DescriptorWriter::for_buffer(buf);
        self.core()
            .write_configuration(&mut w, cfg_nbr, DescriptorKind::Configuration)?;
        w.stop()
    }

    pub fn get_string_descriptor(&self, buf: &mut [u8], index: u8) -> Result<usize> {
        self.before_start()?;
        let mut w = DescriptorWriter::for_buffer(buf);
        self.core().write_string_descriptor(&mut w, index)?;
        w.stop()
    }
}
