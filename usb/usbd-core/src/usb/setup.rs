/// The 8-byte setup packet that opens every control transfer (USB2 Table 9-2).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    /// bmRequestType
    pub kind: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqType {
    /// Requests defined by chapter 9, answered by the core itself.
    Standard = 0,

    /// Class specific requests, forwarded to the class driver owning the interface.
    Class = 1,

    /// Vendor specific requests.
    Vendor = 2,

    /// Reserved
    Reserved = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    // 4..=31 are reserved
    Reserved = 4,
}

/// Standard request codes (USB2 Table 9-4)
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

impl SetupReq {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::GetStatus,
            0x01 => Self::ClearFeature,
            0x03 => Self::SetFeature,
            0x05 => Self::SetAddress,
            0x06 => Self::GetDescriptor,
            0x07 => Self::SetDescriptor,
            0x08 => Self::GetConfiguration,
            0x09 => Self::SetConfiguration,
            0x0A => Self::GetInterface,
            0x0B => Self::SetInterface,
            0x0C => Self::SynchFrame,
            _ => return None,
        })
    }
}

/// Standard feature selectors (USB2 Table 9-6)
#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeatureSelector {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_DIR_SHIFT: u8 = 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

impl Setup {
    /// Decodes a setup packet as it arrives on the wire.
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            kind: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let (value, index, length) = (self.value, self.index, self.length);
        let mut raw = [0u8; 8];
        raw[0] = self.kind;
        raw[1] = self.request;
        raw[2..4].copy_from_slice(&value.to_le_bytes());
        raw[4..6].copy_from_slice(&index.to_le_bytes());
        raw[6..8].copy_from_slice(&length.to_le_bytes());
        raw
    }

    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.kind & USB_SETUP_DIR_BIT != 0
    }

    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub fn req_type(&self) -> ReqType {
        match self.req_ty() {
            0 => ReqType::Standard,
            1 => ReqType::Class,
            2 => ReqType::Vendor,
            _ => ReqType::Reserved,
        }
    }

    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }

    pub fn recipient(&self) -> ReqRecipient {
        match self.req_recipient() {
            0 => ReqRecipient::Device,
            1 => ReqRecipient::Interface,
            2 => ReqRecipient::Endpoint,
            3 => ReqRecipient::Other,
            _ => ReqRecipient::Reserved,
        }
    }

    /// wValue, copied out of the packed struct.
    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub const fn get_status(recipient: ReqRecipient, index: u16) -> Self {
        Self {
            kind: 0b1000_0000 | recipient as u8,
            request: 0x00,
            value: 0,
            index,
            length: 2,
        }
    }

    pub const fn clear_feature(recipient: ReqRecipient, feature: u16, index: u16) -> Self {
        Self {
            kind: 0b0000_0000 | recipient as u8,
            request: 0x01,
            value: feature,
            index,
            length: 0,
        }
    }

    pub const fn set_feature(recipient: ReqRecipient, feature: u16, index: u16) -> Self {
        Self {
            kind: 0b0000_0000 | recipient as u8,
            request: 0x03,
            value: feature,
            index,
            length: 0,
        }
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x05,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: super::DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x06,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn get_configuration() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x08,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x09,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_interface(interface: u8) -> Self {
        Self {
            kind: 0b1000_0001,
            request: 0x0A,
            value: 0,
            index: interface as u16,
            length: 1,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: 0b0000_0001,
            request: 0x0B,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }

    /// A class or vendor request, for host-side code.
    pub const fn custom(kind: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            kind,
            request,
            value,
            index,
            length,
        }
    }
}
