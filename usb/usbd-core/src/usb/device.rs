//! Implements the "Device" and "Device Qualifier" USB descriptors.
//!
//! These descriptors are described in USB2 sections 9.6.1 and 9.6.2

/// A USB Device Descriptor.
///
/// This "provides information that applies globally to the device and all the device's
/// configurations" (USB2 9.6.1). A device has exactly one.
///
/// USB2 Table 9-8 describes the offsets of the fields described by this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// The length of this descriptor in bytes, always 18.
    /// The bLength field in USB2 Table 9-8
    pub length: u8,
    /// The descriptor type. See [super::DescriptorKind]
    /// The bDescriptorType field in USB2 Table 9-8.
    pub kind: u8,
    /// The USB standard version in binary-coded decimal, 0x0200 here.
    pub usb: u16,
    /// The USB Class Code.
    ///
    /// bDeviceClass in USB2 Table 9-8.
    ///
    /// Zero means every interface states its own class. 0xEF, together with sub class 0x02 and
    /// protocol 0x01, announces that configurations carry Interface Association Descriptors.
    pub class: u8,
    /// bDeviceSubClass in USB2 Table 9-8
    pub sub_class: u8,
    /// bDeviceProtocol in USB2 Table 9-8
    pub protocol: u8,
    /// The maximum packet size for endpoint 0.
    ///
    /// bMaxPacketSize0 in USB2 Table 9-8
    pub packet_size: u8,
    /// idVendor in USB2 Table 9-8
    pub vendor: u16,
    /// idProduct in USB2 Table 9-8
    pub product: u16,
    /// The device release number in binary-coded decimal.
    ///
    /// bcdDevice in USB2 Table 9-8
    pub release: u16,
    /// String index of the manufacturer name, or zero.
    pub manufacturer_str: u8,
    /// String index of the product name, or zero.
    pub product_str: u8,
    /// String index of the serial number, or zero.
    pub serial_str: u8,
    /// The number of configurations at the current operating speed.
    ///
    /// bNumConfigurations in USB2 Table 9-8
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub const LEN: u8 = 18;

    pub fn major_version(&self) -> u8 {
        ((self.usb & 0xFF00) >> 8) as u8
    }

    pub fn minor_version(&self) -> u8 {
        self.usb as u8
    }
}

/// The Device Qualifier descriptor.
///
/// A high-speed capable device uses it to describe how it would look at the other operating
/// speed (USB2 9.6.2, Table 9-9).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceQualifier {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    /// Number of other-speed configurations.
    pub configurations: u8,
    pub reserved: u8,
}

unsafe impl plain::Plain for DeviceQualifier {}

impl DeviceQualifier {
    pub const LEN: u8 = 10;
}
