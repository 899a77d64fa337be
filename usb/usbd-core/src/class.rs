//! The contract between the core and the class drivers that own interfaces.
//!
//! Every callback runs on the core event loop thread with no core lock held, so a class driver is
//! free to call back into [UsbDevice], including blocking control transfers.

use std::any::Any;
use std::sync::Arc;

use driver_udc::BusEvent;

use crate::desc::DescriptorWriter;
use crate::microsoft::{CompatId, ExtProperty, SubCompatId};
use crate::usb::Setup;
use crate::UsbDevice;

/// Opaque per-interface or per-alternate-setting state handed back to the class driver.
pub type ClassArg = Arc<dyn Any + Send + Sync>;

/// Identifies the interface (and alternate setting) a callback is about.
#[derive(Clone)]
pub struct InterfaceCtx {
    /// Configuration number as returned by `add_configuration`, high-speed bit included.
    pub config: u8,
    pub interface: u8,
    pub alt: u8,
    pub if_arg: Option<ClassArg>,
    pub alt_arg: Option<ClassArg>,
}

impl InterfaceCtx {
    pub fn if_arg<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.if_arg.as_deref().and_then(|arg| arg.downcast_ref())
    }

    pub fn alt_arg<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.alt_arg.as_deref().and_then(|arg| arg.downcast_ref())
    }
}

pub trait ClassDriver: Send + Sync {
    /// The configuration containing this interface became active.
    fn enable(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx) {}

    /// The configuration containing this interface is being torn down.
    fn disable(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx) {}

    /// SET_INTERFACE switched the interface to `ctx.alt`.
    fn alt_settings_update(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx) {}

    /// The host set or cleared ENDPOINT_HALT on one of this interface's endpoints.
    fn endpoint_state_update(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx, _ep_addr: u8) {}

    /// Standard requests addressed to the interface that the core does not answer itself.
    fn interface_req(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx, _setup: &Setup) -> bool {
        false
    }

    /// GET_DESCRIPTOR addressed to the interface (HID report descriptors and the like). The
    /// writer is already limited to wLength and is flushed by the core afterwards.
    fn interface_descriptor_req(
        &self,
        _dev: &UsbDevice,
        _ctx: &InterfaceCtx,
        _setup: &Setup,
        _writer: &mut DescriptorWriter,
    ) -> bool {
        false
    }

    fn class_req(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx, _setup: &Setup) -> bool {
        false
    }

    fn vendor_req(&self, _dev: &UsbDevice, _ctx: &InterfaceCtx, _setup: &Setup) -> bool {
        false
    }

    /// Class specific descriptors that follow each interface descriptor.
    fn interface_descriptors(&self) -> Option<&dyn InterfaceDescriptors> {
        None
    }

    /// Class specific descriptors that follow each endpoint descriptor.
    fn endpoint_descriptors(&self) -> Option<&dyn EndpointDescriptors> {
        None
    }

    fn microsoft(&self) -> Option<&dyn MicrosoftDescriptors> {
        None
    }
}

/// `size` must return exactly the number of bytes `descriptor` writes for the same context.
pub trait InterfaceDescriptors {
    fn descriptor(&self, ctx: &InterfaceCtx, writer: &mut DescriptorWriter);
    fn size(&self, ctx: &InterfaceCtx) -> usize;
}

pub trait EndpointDescriptors {
    fn descriptor(&self, ctx: &InterfaceCtx, ep_addr: u8, writer: &mut DescriptorWriter);
    fn size(&self, ctx: &InterfaceCtx, ep_addr: u8) -> usize;
}

/// Microsoft OS 1.0 descriptor contents for one interface.
pub trait MicrosoftDescriptors {
    /// `None` leaves the interface out of the compatible ID descriptor.
    fn compat_id(&self, _ctx: &InterfaceCtx) -> Option<CompatId> {
        None
    }

    fn sub_compat_id(&self, _ctx: &InterfaceCtx) -> SubCompatId {
        SubCompatId::Null
    }

    fn ext_properties(&self, _ctx: &InterfaceCtx) -> Vec<ExtProperty> {
        Vec::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigEvent {
    /// Configuration value (1-based) the host selected.
    Set(u8),
    Unset(u8),
}

/// Device level notifications, for the application that owns the device rather than a class.
pub trait DeviceHooks: Send + Sync {
    fn on_bus_event(&self, _dev: &UsbDevice, _event: BusEvent) {}

    fn on_config_event(&self, _dev: &UsbDevice, _event: ConfigEvent) {}

    /// Vendor requests addressed to the device itself.
    fn vendor_device_req(&self, _dev: &UsbDevice, _setup: &Setup) -> bool {
        false
    }
}
