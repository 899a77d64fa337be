/// Configuration and Other Speed Configuration descriptor header (USB2 Tables 9-10 and 9-11).
///
/// It is followed by `total_length - 9` bytes of interface, endpoint and class descriptors.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    /// In 2 mA units.
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

impl ConfigDescriptor {
    pub const LEN: u8 = 9;
}

/// Interface Association Descriptor, from the IAD engineering change notice to USB2.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceAssociationDescriptor {
    pub length: u8,
    pub kind: u8,
    pub first_interface: u8,
    pub interface_count: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub function_str: u8,
}

unsafe impl plain::Plain for InterfaceAssociationDescriptor {}

impl InterfaceAssociationDescriptor {
    pub const LEN: u8 = 8;
}
