//! The contract between the USB device core and a USB device controller (UDC) driver.
//!
//! A controller driver implements [UDCAdapter]. The core hands the driver an [UDCEvents] sink at
//! init time; bus events, setup packets and endpoint completions are the only calls a driver makes
//! back into the core, and it may make them from any thread (typically its interrupt handler).
//!
//! References in this crate are to USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)

#[macro_use]
extern crate bitflags;

use std::sync::Arc;

use thiserror::Error;

pub mod sim;

/// Bus speed, either negotiated or supported by the controller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Speed {
    Low,
    Full,
    High,
}

impl Speed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Full => "full",
            Self::High => "high",
        }
    }
}

/// The transfer type in bits 1:0 of bmAttributes (USB2 Table 9-13).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

pub const ENDP_ATTR_TY_MASK: u8 = 0x03;
pub const ENDP_ATTR_SYNC_MASK: u8 = 0x0C;
pub const ENDP_ATTR_USAGE_MASK: u8 = 0x30;

/// Direction bit of an endpoint address.
pub const ENDP_DIR_IN: u8 = 0x80;

impl EndpointTy {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDP_ATTR_TY_MASK {
            0 => Self::Ctrl,
            1 => Self::Isoch,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Converts an endpoint address into the physical endpoint number used to index per-endpoint
/// tables: OUT endpoints land on even numbers and IN endpoints on odd ones.
#[inline]
pub const fn endpoint_addr_to_phy(addr: u8) -> u8 {
    ((addr & 0x0F) << 1) | ((addr & ENDP_DIR_IN) >> 7)
}

#[inline]
pub const fn endpoint_phy_to_addr(phy: u8) -> u8 {
    (phy >> 1) | ((phy & 1) << 7)
}

#[inline]
pub const fn endpoint_is_in(addr: u8) -> bool {
    addr & ENDP_DIR_IN != 0
}

bitflags! {
    /// What a hardware endpoint slot can be used for.
    pub struct EndpointCaps: u8 {
        const CTRL = 1 << 0;
        const ISOC = 1 << 1;
        const BULK = 1 << 2;
        const INTR = 1 << 3;
        const DIR_OUT = 1 << 4;
        const DIR_IN = 1 << 5;
    }
}

impl EndpointCaps {
    /// The capability bits a slot needs to carry a transfer of type `ty` in direction `dir_in`.
    pub fn for_transfer(ty: EndpointTy, dir_in: bool) -> Self {
        let dir = if dir_in { Self::DIR_IN } else { Self::DIR_OUT };
        dir | match ty {
            EndpointTy::Ctrl => Self::CTRL,
            EndpointTy::Isoch => Self::ISOC,
            EndpointTy::Bulk => Self::BULK,
            EndpointTy::Interrupt => Self::INTR,
        }
    }
}

/// One entry of a controller's endpoint capability table.
///
/// The table is ordered; the core allocates entries front to back, so the control endpoint pair
/// must come first (OUT, then IN).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointCapability {
    pub caps: EndpointCaps,
    /// Logical endpoint number this slot answers to.
    pub nbr: u8,
    pub max_packet_size: u16,
}

impl EndpointCapability {
    pub const fn new(caps: EndpointCaps, nbr: u8, max_packet_size: u16) -> Self {
        Self {
            caps,
            nbr,
            max_packet_size,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BusEvent {
    Connect,
    Disconnect,
    Reset,
    Suspend,
    Resume,
    /// The controller finished high-speed chirp negotiation after a reset.
    HighSpeed,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum UDCError {
    #[error("endpoint {0:#04x} is not open")]
    NotOpen(u8),

    #[error("endpoint {0:#04x} is already open")]
    AlreadyOpen(u8),

    #[error("endpoint {0:#04x} has no transfer ready")]
    NotReady(u8),

    #[error("transfer error on endpoint {0:#04x}")]
    Transfer(u8),

    #[error("controller is not started")]
    NotStarted,

    #[error("controller has no event sink")]
    NoEventSink,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T, E = UDCError> = std::result::Result<T, E>;

/// Notifications a controller driver raises towards the core.
pub trait UDCEvents: Send + Sync {
    fn bus_event(&self, event: BusEvent);
    /// A setup packet arrived on the control endpoint.
    fn setup(&self, packet: [u8; 8]);
    /// A transaction started with `rx_start`, `tx_start` or one of the zero-length variants
    /// finished.
    fn endpoint_complete(&self, addr: u8, result: Result<()>);
}

/// A USB device controller driver.
///
/// Transfers are split into two steps in each direction. For OUT endpoints `rx_start` arms the
/// endpoint for at most `len` bytes and returns how many the hardware accepted; once the
/// completion arrives, `rx` copies out the received packet and returns its actual length. For IN
/// endpoints `tx` reports how much of `buf` the hardware takes in one go and `tx_start` queues
/// exactly that slice.
///
/// The core calls adapter methods with its own locks held. An adapter must therefore never call
/// back into [UDCEvents] from within one of these methods; completions are reported later, from
/// the adapter's own context.
pub trait UDCAdapter: Send {
    fn init(&mut self, events: Arc<dyn UDCEvents>) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Highest speed the controller supports.
    fn speed(&self) -> Speed;
    fn endpoint_table(&self) -> &[EndpointCapability];

    fn set_address(&mut self, addr: u8) -> Result<()>;
    fn frame_number(&self) -> u16;

    fn open_endpoint(&mut self, addr: u8, ty: EndpointTy, max_packet_size: u16, transactions: u8) -> Result<()>;
    fn close_endpoint(&mut self, addr: u8);
    fn stall_endpoint(&mut self, addr: u8, stall: bool) -> Result<()>;
    fn abort_endpoint(&mut self, addr: u8) -> Result<()>;

    fn rx_start(&mut self, addr: u8, len: usize) -> Result<usize>;
    fn rx(&mut self, addr: u8, buf: &mut [u8]) -> Result<usize>;
    fn rx_zlp(&mut self, addr: u8) -> Result<()>;
    fn tx(&mut self, addr: u8, buf: &[u8]) -> Result<usize>;
    fn tx_start(&mut self, addr: u8, buf: &[u8]) -> Result<()>;
    fn tx_zlp(&mut self, addr: u8) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phy_numbers() {
        assert_eq!(endpoint_addr_to_phy(0x00), 0);
        assert_eq!(endpoint_addr_to_phy(0x80), 1);
        assert_eq!(endpoint_addr_to_phy(0x02), 4);
        assert_eq!(endpoint_addr_to_phy(0x83), 7);
        for phy in 0..32 {
            assert_eq!(endpoint_addr_to_phy(endpoint_phy_to_addr(phy)), phy);
        }
    }

    #[test]
    fn caps_for_transfer() {
        let caps = EndpointCaps::for_transfer(EndpointTy::Bulk, true);
        assert_eq!(caps, EndpointCaps::BULK | EndpointCaps::DIR_IN);
        assert!(!caps.contains(EndpointCaps::DIR_OUT));
    }
}
