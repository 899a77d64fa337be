use plain::Plain;

/// Standard endpoint descriptor (USB2 Table 9-13)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    /// Bits 10:0 are the packet size, bits 12:11 the additional transactions per microframe.
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

impl EndpointDescriptor {
    pub const LEN: u8 = 7;

    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    pub fn transactions(&self) -> u8 {
        (((self.max_packet_size >> 11) & 0x3) + 1) as u8
    }
}

/// The USB Audio 1.0 flavour of the endpoint descriptor, with the two synchronisation fields
/// appended.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioEndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// bRefresh: feedback rate as a power of two.
    pub refresh: u8,
    /// bSynchAddress
    pub synch_address: u8,
}

unsafe impl Plain for AudioEndpointDescriptor {}

impl AudioEndpointDescriptor {
    pub const LEN: u8 = 9;
}

/// Isochronous synchronisation type, bits 3:2 of bmAttributes.
pub const ISOC_SYNC_NONE: u8 = 0x00;
pub const ISOC_SYNC_ASYNC: u8 = 0x04;
pub const ISOC_SYNC_ADAPTIVE: u8 = 0x08;
pub const ISOC_SYNC_SYNC: u8 = 0x0C;

/// Isochronous usage type, bits 5:4 of bmAttributes.
pub const ISOC_USAGE_DATA: u8 = 0x00;
pub const ISOC_USAGE_FEEDBACK: u8 = 0x10;
pub const ISOC_USAGE_IMPLICIT_FEEDBACK: u8 = 0x20;
