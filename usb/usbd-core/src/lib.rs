//! The device side of a USB 2.0 stack.
//!
//! [UsbDevice] builds the configuration/interface/endpoint model, allocates physical endpoints
//! from the controller's capability table, answers the chapter 9 standard requests and runs
//! synchronous and asynchronous transfers on top of a [driver_udc::UDCAdapter].
//!
//! References in this crate are to USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)

#[macro_use]
extern crate bitflags;

pub use driver_udc::{BusEvent, EndpointTy, Speed};

pub use crate::class::{
    ClassArg, ClassDriver, ConfigEvent, DeviceHooks, EndpointDescriptors, InterfaceCtx, InterfaceDescriptors,
    MicrosoftDescriptors,
};
pub use crate::config::{CoreConfig, CoreSettings, DeviceIdentity, PoolConfig};
pub use crate::desc::DescriptorWriter;
pub use crate::device::UsbDevice;
pub use crate::error::{Error, Result};
pub use crate::microsoft::{CompatId, ExtProperty, PropertyType, SubCompatId};
pub use crate::registry::{EndpointInfo, CONFIG_NBR_SPD_BIT};
pub use crate::state::DeviceState;
pub use crate::urb::{AsyncCallback, Completion};

mod alloc;
mod bitmap;
mod class;
mod config;
mod desc;
mod device;
mod endpoint;
mod error;
mod event;
mod microsoft;
mod pool;
mod registry;
mod request;
mod state;
mod transfer;
mod urb;
pub mod usb;
