use std::mem::size_of;

use bytemuck_derive::{Pod, Zeroable};
use bytemuck::{bytes_of, pod_read_unaligned};
use num_enum::{IntoPrimitive, FromPrimitive};
use derive_more::{From, Into, Display};
use serde::{Deserialize, Serialize};

use crate::setup::SetupPacket;
use crate::vec_map::VecMap;

// Standard request codes.
pub const GET_STATUS: u8 = StandardRequest::GetStatus as u8;
pub const CLEAR_FEATURE: u8 = StandardRequest::ClearFeature as u8;
pub const SET_FEATURE: u8 = StandardRequest::SetFeature as u8;
pub const SET_ADDRESS: u8 = StandardRequest::SetAddress as u8;
pub const GET_DESCRIPTOR: u8 = StandardRequest::GetDescriptor as u8;
pub const SET_DESCRIPTOR: u8 = StandardRequest::SetDescriptor as u8;
pub const GET_CONFIGURATION: u8 = StandardRequest::GetConfiguration as u8;
pub const SET_CONFIGURATION: u8 = StandardRequest::SetConfiguration as u8;
pub const GET_INTERFACE: u8 = StandardRequest::GetInterface as u8;
pub const SET_INTERFACE: u8 = StandardRequest::SetInterface as u8;
pub const SYNCH_FRAME: u8 = StandardRequest::SynchFrame as u8;
pub const SET_SEL: u8 = StandardRequest::SetSel as u8;

// Descriptor types.
pub const TYPE_DEVICE: u8 = DescriptorType::Device as u8;
pub const TYPE_CONFIGURATION: u8 = DescriptorType::Configuration as u8;
pub const TYPE_STRING: u8 = DescriptorType::String as u8;
pub const TYPE_INTERFACE: u8 = DescriptorType::Interface as u8;
pub const TYPE_ENDPOINT: u8 = DescriptorType::Endpoint as u8;
pub const TYPE_DEVICE_QUALIFIER: u8 = DescriptorType::DeviceQualifier as u8;
pub const TYPE_INTERFACE_ASSOCIATION: u8 =
    DescriptorType::InterfaceAssociation as u8;
pub const TYPE_BOS: u8 = DescriptorType::Bos as u8;
pub const TYPE_DEVICE_CAP: u8 = DescriptorType::DeviceCapability as u8;
pub const TYPE_SS_EP_COMP: u8 = DescriptorType::SsEndpointCompanion as u8;

// Common bmRequestType values.
pub const DEVICE_READ: u8 = 0x80;
pub const DEVICE_WRITE: u8 = 0x00;
pub const INTERFACE_READ: u8 = 0x81;
pub const INTERFACE_WRITE: u8 = 0x01;
pub const ENDPOINT_READ: u8 = 0x82;
pub const ENDPOINT_WRITE: u8 = 0x02;

// Feature selectors.
pub const ENDPOINT_HALT: u16 = StandardFeature::EndpointHalt as u16;
pub const DEVICE_REMOTE_WAKEUP: u16 =
    StandardFeature::DeviceRemoteWakeup as u16;
pub const TEST_MODE: u16 = StandardFeature::TestMode as u16;

// Configuration attribute bits.
pub const CONFIG_ATTR_RESERVED: u8 = 0x80;
pub const CONFIG_ATTR_SELF_POWERED: u8 = 0x40;
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 0x20;

// Device capability types.
pub const CAP_USB_2_0_EXTENSION: u8 = 0x02;
pub const CAP_SUPERSPEED_USB: u8 = 0x03;

pub const MAX_ADDRESS: u8 = 127;
pub const MAX_ENDPOINT_NUMBER: u8 = 15;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct DeviceAddr(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct DeviceField(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct StringId(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct ConfigField(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct InterfaceNum(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct InterfaceField(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct InterfaceEpNum(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct EndpointNum(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct EndpointField(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
         Pod, Zeroable, From, Into)]
#[repr(transparent)]
pub struct EndpointAddr(pub u8);

impl EndpointAddr {
    /// The default control endpoint, in either direction.
    pub const CONTROL_OUT: EndpointAddr = EndpointAddr(0x00);
    pub const CONTROL_IN: EndpointAddr = EndpointAddr(0x80);

    pub fn number(&self) -> EndpointNum {
        EndpointNum(self.0 & 0x7F)
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x80 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub fn from_parts(number: EndpointNum, direction: Direction) -> Self {
        EndpointAddr((direction as u8) << 7 | number.0 & 0x7F)
    }

    pub fn is_control(&self) -> bool {
        self.number().0 == 0
    }

    /// Position of this endpoint in a 32-entry table, OUT endpoints first.
    pub fn slot(&self) -> usize {
        ((self.0 >> 7) as usize) << 4 | (self.0 & 0x0F) as usize
    }
}

impl std::fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:02X} ({} {})", self.0, self.number(), self.direction())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct EndpointAttr(pub u8);

impl EndpointAttr {
    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::from(self.0 & 0x03)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive,
         Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EndpointType {
    #[default]
    Control     = 0,
    Isochronous = 1,
    Bulk        = 2,
    Interrupt   = 3,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Isochronous => write!(f, "isochronous"),
            Self::Bulk => write!(f, "bulk"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BCDVersion {
    pub minor: u8,
    pub major: u8,
}

impl BCDVersion {
    pub const fn from_bcd(bcd: u16) -> Self {
        BCDVersion {
            minor: bcd as u8,
            major: (bcd >> 8) as u8,
        }
    }
}

impl std::fmt::Display for BCDVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:X}.{:02X}", self.major, self.minor)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
         Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Low,
    #[default]
    Full,
    High,
    Super,
}

impl Speed {
    pub fn description(&self) -> &'static str {
        use Speed::*;
        match self {
            Low => "Low (1.5Mbps)",
            Full => "Full (12Mbps)",
            High => "High (480Mbps)",
            Super => "Super (5Gbps)",
        }
    }

    /// Largest max packet size allowed for an endpoint type at this speed.
    pub fn max_packet_size(&self, endpoint_type: EndpointType) -> u16 {
        use Speed::*;
        use EndpointType::*;
        match (self, endpoint_type) {
            (Low, Control | Interrupt) => 8,
            (Low, Bulk | Isochronous) => 0,
            (Full, Control | Bulk | Interrupt) => 64,
            (Full, Isochronous) => 1023,
            (High, Control) => 64,
            (High, Bulk) => 512,
            (High, Interrupt | Isochronous) => 1024,
            (Super, Control) => 512,
            (Super, Bulk | Interrupt | Isochronous) => 1024,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    #[default]
    Reserved = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    #[default]
    Reserved = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive,
         Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Direction {
    #[default]
    Out = 0,
    In = 1,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", match self {
            Direction::In  => "IN",
            Direction::Out => "OUT"})
    }
}

bitfield! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    #[repr(C)]
    pub struct RequestTypeFields(u8);
    pub u8, into Recipient, recipient, _: 4, 0;
    pub u8, into RequestType, request_type, _: 6, 5;
    pub u8, into Direction, direction, _: 7, 7;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
    SetSel = 48,
    #[default]
    Unknown = 0xFF,
}

#[allow(clippy::useless_format)]
impl StandardRequest {
    pub fn description(&self, fields: &SetupPacket) -> String {
        use StandardRequest::*;
        match self {
            GetStatus => format!("Getting status"),
            ClearFeature | SetFeature => {
                let feature = StandardFeature::from(fields.value);
                format!("{} {}",
                    match self {
                        ClearFeature => "Clearing",
                        SetFeature => "Setting",
                        _ => ""
                    },
                    feature.description()
                )
            },
            SetAddress => format!("Setting address to {}", fields.value),
            GetDescriptor | SetDescriptor => {
                let descriptor_type =
                    DescriptorType::from((fields.value >> 8) as u8);
                format!(
                    "{} {} descriptor #{}{}",
                    match self {
                        GetDescriptor => "Getting",
                        SetDescriptor => "Setting",
                        _ => ""
                    },
                    descriptor_type.description(),
                    fields.value & 0xFF,
                    match (descriptor_type, fields.index) {
                        (DescriptorType::String, language) if language > 0 =>
                            format!(", language 0x{language:04x}"),
                        (..) => format!(""),
                    }
                )
            },
            GetConfiguration => format!("Getting configuration"),
            SetConfiguration => format!("Setting configuration {}", fields.value),
            GetInterface => format!("Getting interface {}", fields.index),
            SetInterface => format!("Setting interface {} to {}",
                                    fields.index, fields.value),
            SynchFrame => format!("Synchronising frame"),
            SetSel => format!("Setting system exit latency"),
            Unknown => format!("Unknown standard request"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    InterfaceAssociation = 11,
    Bos = 15,
    DeviceCapability = 16,
    SsEndpointCompanion = 48,
    #[default]
    Unknown = 0xFF,
}

impl DescriptorType {
    fn expected_length(&self) -> Option<usize> {
        use DescriptorType::*;
        match self {
            Device =>
                Some(size_of::<DeviceDescriptor>()),
            Configuration =>
                Some(size_of::<ConfigDescriptor>()),
            Interface =>
                Some(size_of::<InterfaceDescriptor>()),
            Endpoint =>
                Some(size_of::<EndpointDescriptor>()),
            DeviceQualifier =>
                Some(size_of::<DeviceQualifierDescriptor>()),
            InterfaceAssociation =>
                Some(size_of::<InterfaceAssociationDescriptor>()),
            Bos =>
                Some(size_of::<BosDescriptor>()),
            SsEndpointCompanion =>
                Some(size_of::<SsEndpointCompanionDescriptor>()),
            _ =>
                None
        }
    }

    pub fn description(self) -> &'static str {
        use DescriptorType::*;
        match self {
            Device => "device",
            Configuration => "configuration",
            String => "string",
            Interface => "interface",
            Endpoint => "endpoint",
            DeviceQualifier => "device qualifier",
            OtherSpeedConfiguration => "other speed configuration",
            InterfacePower => "interface power",
            InterfaceAssociation => "interface association",
            Bos => "BOS",
            DeviceCapability => "device capability",
            SsEndpointCompanion => "SuperSpeed endpoint companion",
            Unknown => "unknown",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum StandardFeature {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
    #[default]
    Unknown = 3
}

impl StandardFeature {
    pub fn description(self) -> &'static str {
        const STRINGS: [&str; 4] = [
            "endpoint halt",
            "device remote wakeup",
            "test mode",
            "unknown standard feature",
        ];
        STRINGS[self as usize]
    }
}

// Multi-byte fields in the descriptor structures below hold their values in
// little-endian byte order, so that the structures can be sent as they are.
// Constructors convert with to_le(), accessors with from_le().

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: BCDVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: BCDVersion,
    pub manufacturer_str_id: StringId,
    pub product_str_id: StringId,
    pub serial_str_id: StringId,
    pub num_configurations: u8
}

#[allow(clippy::useless_format)]
impl DeviceDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        pod_read_unaligned::<DeviceDescriptor>(bytes)
    }

    pub fn field_text(&self, id: DeviceField,
                      strings: &VecMap<StringId, UTF16ByteVec>)
        -> String
    {
        match id.0 {
        0  => format!("Length: {} bytes", self.length),
        1  => format!("Type: 0x{:02X}", self.descriptor_type),
        2  => format!("USB Version: {}", self.usb_version),
        3  => format!("Class: 0x{:02X}", self.device_class),
        4  => format!("Subclass: 0x{:02X}", self.device_subclass),
        5  => format!("Protocol: 0x{:02X}", self.device_protocol),
        6  => format!("Max EP0 packet size: {} bytes", self.max_packet_size_0),
        7  => format!("Vendor ID: 0x{:04X}", u16::from_le(self.vendor_id)),
        8  => format!("Product ID: 0x{:04X}", u16::from_le(self.product_id)),
        9  => format!("Version: {}", self.device_version),
        10 => format!("Manufacturer string: {}",
                      fmt_str_id(strings, self.manufacturer_str_id)),
        11 => format!("Product string: {}",
                      fmt_str_id(strings, self.product_str_id)),
        12 => format!("Serial string: {}",
                      fmt_str_id(strings, self.serial_str_id)),
        i  => format!("Error: Invalid field ID {i}")
        }
    }

    pub const NUM_FIELDS: usize = 13;
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceQualifierDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: BCDVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub num_configurations: u8,
    pub reserved: u8,
}

impl DeviceQualifierDescriptor {
    /// The qualifier repeats the device-wide fields of a device descriptor,
    /// as they would be at high speed. A SuperSpeed device reports USB 2.00
    /// and a 64 byte control endpoint there.
    pub fn from_device(device: &DeviceDescriptor, speed: Speed) -> Self {
        let (usb_version, max_packet_size_0) = match speed {
            Speed::Super => (BCDVersion::from_bcd(0x0200), 64),
            _ => (device.usb_version, device.max_packet_size_0),
        };
        DeviceQualifierDescriptor {
            length: size_of::<DeviceQualifierDescriptor>() as u8,
            descriptor_type: TYPE_DEVICE_QUALIFIER,
            usb_version,
            device_class: device.device_class,
            device_subclass: device.device_subclass,
            device_protocol: device.device_protocol,
            max_packet_size_0,
            num_configurations: device.num_configurations,
            reserved: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub config_value: u8,
    pub config_str_id: StringId,
    pub attributes: u8,
    pub max_power: u8
}

#[allow(clippy::useless_format)]
impl ConfigDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        pod_read_unaligned::<ConfigDescriptor>(bytes)
    }

    /// The header at the start of a configuration block, if there is room
    /// for one.
    pub fn header(bytes: &[u8]) -> Option<Self> {
        bytes.get(..size_of::<ConfigDescriptor>()).map(Self::from_bytes)
    }

    pub fn total_length(&self) -> u16 {
        let total_length = self.total_length;
        u16::from_le(total_length)
    }

    /// Power drawn in mA: `bMaxPower` counts 8 mA units at SuperSpeed and
    /// 2 mA units otherwise.
    pub fn max_power_ma(&self, speed: Speed) -> u16 {
        let unit = if speed == Speed::Super { 8 } else { 2 };
        self.max_power as u16 * unit
    }

    pub fn field_text(&self, id: ConfigField,
                      strings: &VecMap<StringId, UTF16ByteVec>,
                      speed: Speed)
        -> String
    {
        match id.0 {
        0 => format!("Length: {} bytes", self.length),
        1 => format!("Type: 0x{:02X}", self.descriptor_type),
        2 => format!("Total length: {} bytes", self.total_length()),
        3 => format!("Number of interfaces: {}", self.num_interfaces),
        4 => format!("Configuration number: {}", self.config_value),
        5 => format!("Configuration string: {}",
                      fmt_str_id(strings, self.config_str_id)),
        6 => format!("Attributes: 0x{:02X}", self.attributes),
        7 => format!("Max power: {}mA", self.max_power_ma(speed)),
        i => format!("Error: Invalid field ID {i}")
        }
    }

    pub const NUM_FIELDS: usize = 8;
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: InterfaceNum,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_str_id: StringId,
}

#[allow(clippy::useless_format)]
impl InterfaceDescriptor {
    pub fn field_text(&self, id: InterfaceField,
                      strings: &VecMap<StringId, UTF16ByteVec>)
        -> String
    {
        match id.0 {
        0 => format!("Length: {} bytes", self.length),
        1 => format!("Type: 0x{:02X}", self.descriptor_type),
        2 => format!("Interface number: {}", self.interface_number),
        3 => format!("Alternate setting: {}", self.alternate_setting),
        4 => format!("Number of endpoints: {}", self.num_endpoints),
        5 => format!("Class: 0x{:02X}", self.interface_class),
        6 => format!("Subclass: 0x{:02X}", self.interface_subclass),
        7 => format!("Protocol: 0x{:02X}", self.interface_protocol),
        8 => format!("Interface string: {}",
                      fmt_str_id(strings, self.interface_str_id)),
        i => format!("Error: Invalid field ID {i}")
        }
    }

    pub const NUM_FIELDS: usize = 9;
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: EndpointAddr,
    pub attributes: EndpointAttr,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[allow(clippy::useless_format)]
impl EndpointDescriptor {
    pub fn max_packet_size(&self) -> u16 {
        let size = self.max_packet_size;
        u16::from_le(size)
    }

    pub fn field_text(&self, id: EndpointField) -> String {
        match id.0 {
        0 => format!("Length: {} bytes", self.length),
        1 => format!("Type: 0x{:02X}", self.descriptor_type),
        2 => format!("Endpoint address: 0x{:02X}", self.endpoint_address.0),
        3 => format!("Attributes: 0x{:02X} ({})", self.attributes.0,
                     self.attributes.endpoint_type()),
        4 => format!("Max packet size: {} bytes", self.max_packet_size()),
        5 => format!("Interval: 0x{:02X}", self.interval),
        i => format!("Error: Invalid field ID {i}")
        }
    }

    pub const NUM_FIELDS: usize = 6;
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct InterfaceAssociationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub first_interface: InterfaceNum,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    pub function_str_id: StringId,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SsEndpointCompanionDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct BosDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_device_caps: u8,
}

impl BosDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        pod_read_unaligned::<BosDescriptor>(bytes)
    }

    pub fn header(bytes: &[u8]) -> Option<Self> {
        bytes.get(..size_of::<BosDescriptor>()).map(Self::from_bytes)
    }

    pub fn total_length(&self) -> u16 {
        let total_length = self.total_length;
        u16::from_le(total_length)
    }
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Usb2ExtensionDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub capability_type: u8,
    pub attributes: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SuperSpeedUsbDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub capability_type: u8,
    pub attributes: u8,
    pub speeds_supported: u16,
    pub functionality_support: u8,
    pub u1_exit_latency: u8,
    pub u2_exit_latency: u16,
}

/// Raw bytes of a descriptor structure, in wire order.
pub fn descriptor_bytes<T: bytemuck::Pod>(descriptor: &T) -> &[u8] {
    bytes_of(descriptor)
}

pub enum Descriptor {
    Device(DeviceDescriptor),
    Configuration(ConfigDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    InterfaceAssociation(InterfaceAssociationDescriptor),
    SsEndpointCompanion(SsEndpointCompanionDescriptor),
    Other(DescriptorType, u8)
}

impl Descriptor {
    pub fn length(&self) -> usize {
        use Descriptor::*;
        match self {
            Device(d) => d.length as usize,
            Configuration(c) => c.length as usize,
            Interface(i) => i.length as usize,
            Endpoint(e) => e.length as usize,
            InterfaceAssociation(a) => a.length as usize,
            SsEndpointCompanion(c) => c.length as usize,
            Other(_, length) => *length as usize,
        }
    }
}

/// Walks a block of concatenated descriptors.
///
/// Iteration stops at the first descriptor whose length field is zero or
/// runs past the end of the block, so the lengths of the yielded items only
/// add up to the block length if the whole block is well formed.
pub struct DescriptorIterator<'bytes> {
    bytes: &'bytes [u8],
    offset: usize,
}

impl<'bytes> DescriptorIterator<'bytes> {
    pub fn from(bytes: &'bytes [u8]) -> Self {
        DescriptorIterator {
            bytes,
            offset: 0
        }
    }
}

impl Iterator for DescriptorIterator<'_> {
    type Item = Descriptor;

    fn next(&mut self) -> Option<Descriptor> {
        let remaining_bytes = self.bytes.get(self.offset..)?;
        if remaining_bytes.len() < 2 {
            return None;
        }
        let desc_length = remaining_bytes[0] as usize;
        if desc_length < 2 || desc_length > remaining_bytes.len() {
            return None;
        }
        let desc_type = DescriptorType::from(remaining_bytes[1]);
        let bytes = &remaining_bytes[0 .. desc_length];
        self.offset += desc_length;
        if desc_type.expected_length() != Some(desc_length) {
            return Some(Descriptor::Other(desc_type, desc_length as u8));
        }
        Some(match desc_type {
            DescriptorType::Device =>
                Descriptor::Device(
                    DeviceDescriptor::from_bytes(bytes)),
            DescriptorType::Configuration =>
                Descriptor::Configuration(
                    ConfigDescriptor::from_bytes(bytes)),
            DescriptorType::Interface =>
                Descriptor::Interface(
                    pod_read_unaligned::<InterfaceDescriptor>(bytes)),
            DescriptorType::Endpoint =>
                Descriptor::Endpoint(
                    pod_read_unaligned::<EndpointDescriptor>(bytes)),
            DescriptorType::InterfaceAssociation =>
                Descriptor::InterfaceAssociation(
                    pod_read_unaligned::<InterfaceAssociationDescriptor>(
                        bytes)),
            DescriptorType::SsEndpointCompanion =>
                Descriptor::SsEndpointCompanion(
                    pod_read_unaligned::<SsEndpointCompanionDescriptor>(
                        bytes)),
            _ => Descriptor::Other(desc_type, desc_length as u8)
        })
    }
}

pub struct Interface {
    pub descriptor: InterfaceDescriptor,
    pub endpoint_descriptors: VecMap<InterfaceEpNum, EndpointDescriptor>
}

pub struct Configuration {
    pub descriptor: ConfigDescriptor,
    pub interfaces: VecMap<InterfaceNum, Interface>,
}

impl Configuration {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut result: Option<Configuration> = None;
        let mut iface_num: Option<InterfaceNum> = None;
        for descriptor in DescriptorIterator::from(bytes) {
            match descriptor {
                Descriptor::Configuration(config_desc) => {
                    result = Some(Configuration {
                        descriptor: config_desc,
                        interfaces:
                            VecMap::with_capacity(
                                config_desc.num_interfaces),
                    });
                },
                Descriptor::Interface(iface_desc) => {
                    if let Some(config) = result.as_mut() {
                        iface_num = Some(iface_desc.interface_number);
                        config.interfaces.set(
                            iface_desc.interface_number,
                            Interface {
                                descriptor: iface_desc,
                                endpoint_descriptors:
                                    VecMap::with_capacity(
                                        iface_desc.num_endpoints),
                            }
                        );
                    }
                },
                Descriptor::Endpoint(ep_desc) => {
                    if let Some(config) = result.as_mut() {
                        if let Some(num) = iface_num {
                            if let Some(iface) =
                                config.interfaces.get_mut(num)
                            {
                                iface.endpoint_descriptors.push(ep_desc);
                            }
                        }
                    }
                },
                _ => {},
            };
        }
        result
    }
}

fn fmt_str_id(strings: &VecMap<StringId, UTF16ByteVec>, id: StringId)
    -> String
{
    match id.0 {
        0 => "(none)".to_string(),
        _ => match &strings.get(id) {
            Some(utf16) => format!("#{id} {utf16}"),
            None => format!("#{id} (missing)")
        }
    }
}

pub struct UTF16Bytes<'b>(&'b [u8]);

impl<'b> UTF16Bytes<'b> {
    fn chars(&self) -> Vec<u16> {
        self.0.chunks_exact(2)
              .map(|a| u16::from_le_bytes([a[0], a[1]]))
              .collect()
    }
}

impl std::fmt::Display for UTF16Bytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let chars = self.chars();
        match String::from_utf16(&chars) {
            Ok(string) => write!(f, "'{}'", string.escape_default()),
            Err(_) => write!(f,
                "invalid UTF16, partial decode: '{}'",
                String::from_utf16_lossy(&chars).escape_default())
        }
    }
}

#[derive(Clone)]
pub struct UTF16ByteVec(pub Vec<u8>);

impl UTF16ByteVec {
    pub fn encode(text: &str) -> Self {
        UTF16ByteVec(
            text.encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect())
    }
}

impl std::fmt::Display for UTF16ByteVec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        UTF16Bytes(self.0.as_slice()).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_sizes() {
        assert_eq!(size_of::<DeviceDescriptor>(), 18);
        assert_eq!(size_of::<DeviceQualifierDescriptor>(), 10);
        assert_eq!(size_of::<ConfigDescriptor>(), 9);
        assert_eq!(size_of::<InterfaceDescriptor>(), 9);
        assert_eq!(size_of::<EndpointDescriptor>(), 7);
        assert_eq!(size_of::<InterfaceAssociationDescriptor>(), 8);
        assert_eq!(size_of::<SsEndpointCompanionDescriptor>(), 6);
        assert_eq!(size_of::<BosDescriptor>(), 5);
        assert_eq!(size_of::<Usb2ExtensionDescriptor>(), 7);
        assert_eq!(size_of::<SuperSpeedUsbDescriptor>(), 10);
    }

    #[test]
    fn test_wire_constants() {
        assert_eq!(GET_DESCRIPTOR, 6);
        assert_eq!(SET_ADDRESS, 5);
        assert_eq!(SET_SEL, 48);
        assert_eq!(TYPE_DEVICE, 1);
        assert_eq!(TYPE_CONFIGURATION, 2);
        assert_eq!(TYPE_BOS, 15);
        assert_eq!(TYPE_DEVICE_CAP, 16);
        assert_eq!(TYPE_SS_EP_COMP, 48);
    }

    #[test]
    fn test_request_type_fields() {
        let fields = RequestTypeFields(INTERFACE_READ | 0x20);
        assert_eq!(fields.direction(), Direction::In);
        assert_eq!(fields.request_type(), RequestType::Class);
        assert_eq!(fields.recipient(), Recipient::Interface);
        let fields = RequestTypeFields(ENDPOINT_WRITE);
        assert_eq!(fields.direction(), Direction::Out);
        assert_eq!(fields.request_type(), RequestType::Standard);
        assert_eq!(fields.recipient(), Recipient::Endpoint);
        assert_eq!(RequestTypeFields(0x1F).recipient(), Recipient::Reserved);
    }

    #[test]
    fn test_endpoint_addr() {
        let addr = EndpointAddr::from_parts(EndpointNum(3), Direction::In);
        assert_eq!(addr, EndpointAddr(0x83));
        assert_eq!(addr.number(), EndpointNum(3));
        assert_eq!(addr.direction(), Direction::In);
        assert_eq!(addr.slot(), 19);
        assert_eq!(EndpointAddr(0x03).slot(), 3);
        assert!(EndpointAddr::CONTROL_IN.is_control());
    }

    #[test]
    fn test_iterate_descriptors() {
        let bytes = [
            9, 2, 25, 0, 1, 1, 0, 0x80, 50,
            9, 4, 0, 0, 1, 0xFF, 0, 0, 0,
            7, 5, 0x81, 2, 64, 0, 0,
        ];
        let config = Configuration::from_bytes(&bytes).unwrap();
        assert_eq!(config.descriptor.total_length(), 25);
        let iface = config.interfaces.get(InterfaceNum(0)).unwrap();
        assert_eq!(iface.endpoint_descriptors.len(), 1);
        let ep = iface.endpoint_descriptors.get(InterfaceEpNum(0)).unwrap();
        assert_eq!(ep.endpoint_address, EndpointAddr(0x81));
        assert_eq!(ep.max_packet_size(), 64);
        let total: usize = DescriptorIterator::from(&bytes)
            .map(|d| d.length())
            .sum();
        assert_eq!(total, bytes.len());
    }

    #[test]
    fn test_iterate_truncated() {
        // Second descriptor claims more bytes than remain.
        let bytes = [9, 4, 0, 0, 0, 0, 0, 0, 0, 7, 5, 0x81];
        let total: usize = DescriptorIterator::from(&bytes)
            .map(|d| d.length())
            .sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_max_power_units() {
        let config = ConfigDescriptor {
            length: 9,
            descriptor_type: TYPE_CONFIGURATION,
            total_length: 9u16.to_le(),
            num_interfaces: 0,
            config_value: 1,
            config_str_id: StringId(0),
            attributes: CONFIG_ATTR_RESERVED,
            max_power: 50,
        };
        let strings = VecMap::new();
        assert_eq!(config.max_power_ma(Speed::High), 100);
        assert_eq!(config.max_power_ma(Speed::Super), 400);
        assert_eq!(config.field_text(ConfigField(7), &strings, Speed::Full),
                   "Max power: 100mA");
        assert_eq!(config.field_text(ConfigField(7), &strings, Speed::Super),
                   "Max power: 400mA");
    }

    #[test]
    fn test_utf16() {
        let text = UTF16ByteVec::encode("Gadget");
        assert_eq!(text.0.len(), 12);
        assert_eq!(format!("{text}"), "'Gadget'");
    }
}

pub mod prelude {
    #[allow(unused_imports)]
    pub use super::{
        Direction,
        EndpointAddr,
        EndpointAttr,
        EndpointType,
        StandardRequest,
        StandardFeature,
        RequestType,
        RequestTypeFields,
        Recipient,
        DescriptorType,
        DeviceDescriptor,
        ConfigDescriptor,
        InterfaceDescriptor,
        EndpointDescriptor,
        Configuration,
        Interface,
        DeviceAddr,
        DeviceField,
        StringId,
        ConfigField,
        InterfaceNum,
        InterfaceField,
        InterfaceEpNum,
        EndpointNum,
        EndpointField,
        Speed,
        BCDVersion,
        UTF16ByteVec,
    };
}
