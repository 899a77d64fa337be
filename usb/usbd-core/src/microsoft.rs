//! Microsoft OS 1.0 descriptors: the extended compatible ID and extended properties feature
//! descriptors a Windows host fetches with the vendor code announced in string descriptor 0xEE.

use crate::class::InterfaceCtx;
use crate::desc::DescriptorWriter;
use crate::registry::{ConfigSnapshot, InterfaceSnapshot};
use crate::{Error, Result};

/// wIndex of the extended compatible ID request.
pub const COMPAT_ID_INDEX: u16 = 4;
/// wIndex of the extended properties request.
pub const EXT_PROPERTIES_INDEX: u16 = 5;

const DESC_VERSION_1_0: u16 = 0x0100;
const COMPAT_ID_HDR_LEN: usize = 16;
const COMPAT_ID_SECTION_LEN: usize = 24;
const EXT_PROPERTIES_HDR_LEN: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompatId {
    Null,
    Rndis,
    Ptp,
    Mtp,
    Xusb20,
    Bluetooth,
    WinUsb,
}

impl CompatId {
    pub fn as_bytes(&self) -> [u8; 8] {
        pad(match self {
            Self::Null => b"",
            Self::Rndis => b"RNDIS",
            Self::Ptp => b"PTP",
            Self::Mtp => b"MTP",
            Self::Xusb20 => b"XUSB20",
            Self::Bluetooth => b"BLUTUTH",
            Self::WinUsb => b"WINUSB",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubCompatId {
    Null,
    Bluetooth11,
    Bluetooth12,
    BluetoothEdr,
}

impl SubCompatId {
    pub fn as_bytes(&self) -> [u8; 8] {
        pad(match self {
            Self::Null => b"",
            Self::Bluetooth11 => b"11",
            Self::Bluetooth12 => b"12",
            Self::BluetoothEdr => b"EDR",
        })
    }
}

fn pad(id: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..id.len()].copy_from_slice(id);
    out
}

/// Registry value types (dwPropertyDataType).
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyType {
    Sz = 1,
    ExpandSz = 2,
    Binary = 3,
    DwordLe = 4,
    DwordBe = 5,
    Link = 6,
    MultiSz = 7,
}

/// One registry property published through the extended properties descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtProperty {
    pub ty: PropertyType,
    /// Property name, UTF-16LE with its terminating NUL.
    name: Vec<u8>,
    pub value: Vec<u8>,
}

impl ExtProperty {
    pub fn new(ty: PropertyType, name: &str, value: Vec<u8>) -> Self {
        Self {
            ty,
            name: utf16le_z(name),
            value,
        }
    }

    /// A REG_SZ property; the value is encoded like the name.
    pub fn string(name: &str, value: &str) -> Self {
        Self::new(PropertyType::Sz, name, utf16le_z(value))
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// dwSize of the property section.
    pub fn size(&self) -> usize {
        14 + self.name.len() + self.value.len()
    }
}

fn utf16le_z(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

fn compat_entry(interface: &InterfaceSnapshot, cfg_nbr: u8) -> Option<(CompatId, SubCompatId)> {
    let ms = interface.driver.microsoft()?;
    let ctx = interface.ctx(cfg_nbr, interface.alt_cur);
    let compat = ms.compat_id(&ctx)?;
    Some((compat, ms.sub_compat_id(&ctx)))
}

/// Writes the extended compatible ID descriptor. `if_nbr` 0 lists every interface, anything else
/// only that one.
pub(crate) fn write_compat_id(w: &mut DescriptorWriter, snapshot: &ConfigSnapshot, if_nbr: u8) -> Result<()> {
    let sections: Vec<(u8, CompatId, SubCompatId)> = snapshot
        .interfaces
        .iter()
        .filter(|interface| if_nbr == 0 || interface.nbr == if_nbr)
        .filter_map(|interface| {
            compat_entry(interface, snapshot.nbr).map(|(compat, sub)| (interface.nbr, compat, sub))
        })
        .collect();

    let _ = w.write_u32((COMPAT_ID_HDR_LEN + COMPAT_ID_SECTION_LEN * sections.len()) as u32);
    let _ = w.write_u16(DESC_VERSION_1_0);
    let _ = w.write_u16(COMPAT_ID_INDEX);
    let _ = w.write_u8(sections.len() as u8);
    let _ = w.write_buf(&[0; 7]);

    for (nbr, compat, sub) in sections {
        let _ = w.write_u8(nbr);
        let _ = w.write_u8(0x01);
        let _ = w.write_buf(&compat.as_bytes());
        let _ = w.write_buf(&sub.as_bytes());
        let _ = w.write_buf(&[0; 6]);
    }
    w.status()
}

/// Writes the extended properties descriptor of interface `if_nbr`.
pub(crate) fn write_ext_properties(w: &mut DescriptorWriter, snapshot: &ConfigSnapshot, if_nbr: u8) -> Result<()> {
    let interface = snapshot
        .interfaces
        .get(usize::from(if_nbr))
        .ok_or(Error::InvalidHandle)?;
    let ctx: InterfaceCtx = interface.ctx(snapshot.nbr, interface.alt_cur);
    let properties = interface
        .driver
        .microsoft()
        .map(|ms| ms.ext_properties(&ctx))
        .unwrap_or_default();

    let total = EXT_PROPERTIES_HDR_LEN + properties.iter().map(ExtProperty::size).sum::<usize>();
    let _ = w.write_u32(total as u32);
    let _ = w.write_u16(DESC_VERSION_1_0);
    let _ = w.write_u16(EXT_PROPERTIES_INDEX);
    let _ = w.write_u16(properties.len() as u16);

    for property in &properties {
        let _ = w.write_u32(property.size() as u32);
        let _ = w.write_u32(property.ty as u32);
        let _ = w.write_u16(property.name.len() as u16);
        let _ = w.write_buf(&property.name);
        let _ = w.write_u32(property.value.len() as u32);
        let _ = w.write_buf(&property.value);
    }
    w.status()
}
