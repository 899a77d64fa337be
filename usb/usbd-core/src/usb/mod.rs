//! Wire formats of USB2 chapter 9: the setup packet and the standard descriptors.
//!
//! The descriptor structs mirror the byte layout on the bus (`#[repr(C, packed)]`, little endian
//! multi-byte fields) so received or produced descriptors can be viewed with [plain::from_bytes].

pub use self::config::{ConfigDescriptor, InterfaceAssociationDescriptor};
pub use self::device::{DeviceDescriptor, DeviceQualifier};
pub use self::endpoint::{
    AudioEndpointDescriptor, EndpointDescriptor, ISOC_SYNC_ADAPTIVE, ISOC_SYNC_ASYNC, ISOC_SYNC_NONE,
    ISOC_SYNC_SYNC, ISOC_USAGE_DATA, ISOC_USAGE_FEEDBACK, ISOC_USAGE_IMPLICIT_FEEDBACK,
};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{FeatureSelector, ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};

mod config;
mod device;
mod endpoint;
mod interface;
mod setup;

/// Descriptor types (USB2 Table 9-5, plus the IAD from the ECN)
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    None = 0,
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    OnTheGo = 9,
    Debug = 10,
    InterfaceAssociation = 11,
}

impl DescriptorKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Device,
            2 => Self::Configuration,
            3 => Self::String,
            4 => Self::Interface,
            5 => Self::Endpoint,
            6 => Self::DeviceQualifier,
            7 => Self::OtherSpeedConfiguration,
            8 => Self::InterfacePower,
            9 => Self::OnTheGo,
            10 => Self::Debug,
            11 => Self::InterfaceAssociation,
            _ => return None,
        })
    }
}

pub const USB_VERSION_2_0: u16 = 0x0200;

pub const CLASS_AUDIO: u8 = 0x01;
pub const CLASS_MISC: u8 = 0xEF;
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

/// bDeviceSubClass/bDeviceProtocol pair announcing Interface Association Descriptors.
pub const MISC_SUBCLASS_COMMON: u8 = 0x02;
pub const MISC_PROTOCOL_IAD: u8 = 0x01;

/// bmAttributes bit 7 is reserved and must be set (USB2 Table 9-10).
pub const CONFIG_ATTR_RESERVED: u8 = 0x80;
pub const CONFIG_ATTR_SELF_POWERED: u8 = 0x40;
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 0x20;
