//! Assembly of the descriptor registry from a device and its functions.

use std::collections::BTreeSet;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{
    ConfigurationEntry,
    DescriptorNode,
    EndpointRoute,
    InterfaceRoute,
    Registry,
    SelectedConfiguration,
    Tag,
};
use crate::gadget::{
    ENDPOINT_DESCRIPTOR_LENGTH,
    EndpointHandle,
    FunctionId,
    Gadget,
    HookFailure,
    Passive,
};
use crate::usb::{
    descriptor_bytes,
    BCDVersion,
    BosDescriptor,
    CAP_SUPERSPEED_USB,
    CAP_USB_2_0_EXTENSION,
    CONFIG_ATTR_REMOTE_WAKEUP,
    CONFIG_ATTR_RESERVED,
    CONFIG_ATTR_SELF_POWERED,
    ConfigDescriptor,
    DescriptorIterator,
    DeviceDescriptor,
    DeviceQualifierDescriptor,
    Direction,
    EndpointAddr,
    EndpointNum,
    EndpointType,
    InterfaceAssociationDescriptor,
    InterfaceDescriptor,
    InterfaceNum,
    MAX_ENDPOINT_NUMBER,
    Speed,
    SsEndpointCompanionDescriptor,
    StringId,
    SuperSpeedUsbDescriptor,
    TYPE_BOS,
    TYPE_CONFIGURATION,
    TYPE_DEVICE,
    TYPE_DEVICE_CAP,
    TYPE_DEVICE_QUALIFIER,
    TYPE_ENDPOINT,
    TYPE_INTERFACE,
    TYPE_INTERFACE_ASSOCIATION,
    TYPE_SS_EP_COMP,
    TYPE_STRING,
    Usb2ExtensionDescriptor,
    UTF16ByteVec,
};

/// US English, used when a device lists no languages.
pub const DEFAULT_LANGUAGE: u16 = 0x0409;

/// Longest string a string descriptor can hold, in UTF-16 code units.
const MAX_STRING_UNITS: usize = (u8::MAX as usize - 2) / 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("Device has no configurations")]
    NoConfigurations,
    #[error("Duplicate descriptor: {0}")]
    DuplicateTag(Tag),
    #[error("Configuration value {0} is used more than once")]
    DuplicateConfiguration(u8),
    #[error("No configuration has value {0}")]
    UnknownConfiguration(u8),
    #[error("Configuration {configuration} references missing function #{function}")]
    DanglingFunction { configuration: u8, function: usize },
    #[error("Interface {interface} of function '{function}' references missing endpoint #{endpoint}")]
    DanglingEndpoint { function: String, interface: u8, endpoint: usize },
    #[error("Interface {interface} lists endpoint {address} which has no descriptor")]
    MissingEndpoint { interface: u8, address: EndpointAddr },
    #[error("{what} {value} is out of range")]
    OutOfRange { what: &'static str, value: usize },
    #[error("{tag} declares {declared} bytes but holds {actual}")]
    LengthMismatch { tag: Tag, declared: usize, actual: usize },
    #[error("Filling endpoint descriptor {address} failed: {source}")]
    Fill { address: EndpointAddr, source: HookFailure },
}

use AssemblyError::OutOfRange;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub speed: Speed,
    pub languages: Vec<u16>,
    pub configurations: Vec<ConfigurationSpec>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec {
            usb_version: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size_0: 64,
            vendor_id: 0x1209,
            product_id: 0x0001,
            device_version: 0x0100,
            manufacturer: None,
            product: None,
            serial: None,
            speed: Speed::Full,
            languages: vec![DEFAULT_LANGUAGE],
            configurations: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationSpec {
    pub value: u8,
    pub name: Option<String>,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub max_power_ma: u16,
    /// Contributing functions, as positions in the function list.
    pub functions: Vec<usize>,
}

impl Default for ConfigurationSpec {
    fn default() -> Self {
        ConfigurationSpec {
            value: 1,
            name: None,
            self_powered: false,
            remote_wakeup: false,
            max_power_ma: 100,
            functions: Vec::new(),
        }
    }
}

impl ConfigurationSpec {
    fn attributes(&self) -> u8 {
        let mut attributes = CONFIG_ATTR_RESERVED;
        if self.self_powered {
            attributes |= CONFIG_ATTR_SELF_POWERED;
        }
        if self.remote_wakeup {
            attributes |= CONFIG_ATTR_REMOTE_WAKEUP;
        }
        attributes
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(skip, default = "passive_gadget")]
    pub gadget: Arc<dyn Gadget>,
}

fn passive_gadget() -> Arc<dyn Gadget> {
    Arc::new(Passive)
}

impl FunctionSpec {
    pub fn new(name: &str) -> Self {
        FunctionSpec {
            name: name.to_string(),
            interfaces: Vec::new(),
            endpoints: Vec::new(),
            capabilities: Vec::new(),
            gadget: passive_gadget(),
        }
    }

    pub fn with_gadget(mut self, gadget: Arc<dyn Gadget>) -> Self {
        self.gadget = gadget;
        self
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces)
            .field("endpoints", &self.endpoints)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSpec {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub name: Option<String>,
    /// Endpoints used by this interface, as positions in the function's
    /// endpoint list.
    pub endpoints: Vec<usize>,
    /// Class-specific descriptors placed after the interface descriptor.
    pub class_descriptors: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSpec {
    /// Fixed endpoint number, or None to take the next free one.
    pub number: Option<u8>,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    pub companion: Option<CompanionSpec>,
}

impl Default for EndpointSpec {
    fn default() -> Self {
        EndpointSpec {
            number: None,
            direction: Direction::In,
            transfer_type: EndpointType::Bulk,
            max_packet_size: 512,
            interval: 0,
            companion: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionSpec {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capability {
    Usb2Extension {
        #[serde(default)]
        lpm: bool,
    },
    SuperSpeed {
        #[serde(default)]
        u1_exit_latency: u8,
        #[serde(default)]
        u2_exit_latency: u16,
    },
}

impl Capability {
    fn encode(&self) -> Vec<u8> {
        match *self {
            Capability::Usb2Extension { lpm } => {
                let descriptor = Usb2ExtensionDescriptor {
                    length: size_of::<Usb2ExtensionDescriptor>() as u8,
                    descriptor_type: TYPE_DEVICE_CAP,
                    capability_type: CAP_USB_2_0_EXTENSION,
                    attributes: (if lpm { 0x02u32 } else { 0 }).to_le(),
                };
                descriptor_bytes(&descriptor).to_vec()
            },
            Capability::SuperSpeed { u1_exit_latency, u2_exit_latency } => {
                let descriptor = SuperSpeedUsbDescriptor {
                    length: size_of::<SuperSpeedUsbDescriptor>() as u8,
                    descriptor_type: TYPE_DEVICE_CAP,
                    capability_type: CAP_SUPERSPEED_USB,
                    attributes: 0,
                    // Full, high and SuperSpeed operation.
                    speeds_supported: 0x000Eu16.to_le(),
                    functionality_support: 1,
                    u1_exit_latency,
                    u2_exit_latency: u2_exit_latency.to_le(),
                };
                descriptor_bytes(&descriptor).to_vec()
            },
        }
    }
}

/// Assemble descriptors, selecting the device's first configuration.
pub fn assemble(device: &DeviceSpec, functions: &[FunctionSpec])
    -> Result<Registry, AssemblyError>
{
    assemble_for(device, functions, None)
}

/// Assemble descriptors, selecting the configuration with the given value.
pub fn assemble_for(device: &DeviceSpec,
                    functions: &[FunctionSpec],
                    selected: Option<u8>)
    -> Result<Registry, AssemblyError>
{
    let result = Assembler::new(device, functions, selected)
        .and_then(Assembler::run);
    match &result {
        Ok(registry) => debug!(
            "Assembled {} descriptors, configuration {} selected",
            registry.len(), registry.selected().entry.value),
        Err(e) => warn!("Descriptor assembly failed: {e}"),
    }
    result
}

/// String indices handed out during assembly. Equal strings share an index.
#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn intern(&mut self, text: Option<&str>) -> Result<StringId, AssemblyError> {
        let Some(text) = text else {
            return Ok(StringId(0));
        };
        if let Some(pos) = self.strings.iter().position(|s| s == text) {
            return Ok(StringId((pos + 1) as u8));
        }
        let units = text.encode_utf16().count();
        if units > MAX_STRING_UNITS {
            return Err(OutOfRange { what: "String length", value: units });
        }
        let index = self.strings.len() + 1;
        let id = u8::try_from(index)
            .map_err(|_| OutOfRange { what: "String index", value: index })?;
        self.strings.push(text.to_string());
        Ok(StringId(id))
    }
}

/// Hands out endpoint numbers within one configuration.
#[derive(Default)]
struct EndpointAllocator {
    used: [u16; 2],
}

impl EndpointAllocator {
    fn claim(&mut self, number: u8, direction: Direction)
        -> Result<(), AssemblyError>
    {
        if number == 0 || number > MAX_ENDPOINT_NUMBER {
            return Err(OutOfRange {
                what: "Endpoint number", value: number as usize });
        }
        let mask = &mut self.used[direction as usize];
        if *mask & (1 << number) != 0 {
            let address = EndpointAddr::from_parts(
                EndpointNum(number), direction);
            return Err(AssemblyError::DuplicateTag(
                Tag::new(TYPE_ENDPOINT, address.0)));
        }
        *mask |= 1 << number;
        Ok(())
    }

    fn next_free(&mut self, direction: Direction)
        -> Result<u8, AssemblyError>
    {
        let mask = &mut self.used[direction as usize];
        let number = (1..=MAX_ENDPOINT_NUMBER)
            .find(|n| *mask & (1 << n) == 0)
            .ok_or(OutOfRange {
                what: "Endpoint number",
                value: MAX_ENDPOINT_NUMBER as usize + 1 })?;
        *mask |= 1 << number;
        Ok(number)
    }
}

struct Assembler<'a> {
    device: &'a DeviceSpec,
    functions: &'a [FunctionSpec],
    selected_value: u8,
    strings: StringPool,
    nodes: Vec<DescriptorNode>,
    configurations: Vec<ConfigurationEntry>,
    selected: Option<SelectedConfiguration>,
    capabilities: Vec<Capability>,
    companions: bool,
}

impl<'a> Assembler<'a> {
    fn new(device: &'a DeviceSpec,
           functions: &'a [FunctionSpec],
           selected: Option<u8>)
        -> Result<Self, AssemblyError>
    {
        let configs = &device.configurations;
        let first = configs.first().ok_or(AssemblyError::NoConfigurations)?;
        if configs.len() > u8::MAX as usize {
            return Err(OutOfRange {
                what: "Configuration count", value: configs.len() });
        }
        let mut values = BTreeSet::new();
        for config in configs {
            if config.value == 0 {
                return Err(OutOfRange { what: "Configuration value", value: 0 });
            }
            if !values.insert(config.value) {
                return Err(AssemblyError::DuplicateConfiguration(config.value));
            }
        }
        let selected_value = selected.unwrap_or(first.value);
        if !values.contains(&selected_value) {
            return Err(AssemblyError::UnknownConfiguration(selected_value));
        }
        let valid_ep0 = match device.speed {
            Speed::Low => device.max_packet_size_0 == 8,
            Speed::Full | Speed::High =>
                matches!(device.max_packet_size_0, 8 | 16 | 32 | 64),
            // Encoded as an exponent: 2^9 = 512 bytes.
            Speed::Super => device.max_packet_size_0 == 9,
        };
        if !valid_ep0 {
            return Err(OutOfRange {
                what: "EP0 max packet size",
                value: device.max_packet_size_0 as usize });
        }
        Ok(Assembler {
            device,
            functions,
            selected_value,
            strings: StringPool::default(),
            nodes: Vec::new(),
            configurations: Vec::new(),
            selected: None,
            capabilities: Vec::new(),
            companions: false,
        })
    }

    fn run(mut self) -> Result<Registry, AssemblyError> {
        let device = self.device;
        self.add_device()?;
        for (index, config) in device.configurations.iter().enumerate() {
            self.add_configuration(index, config)?;
        }
        self.add_strings()?;
        self.add_bos()?;
        let selected = self.selected
            .ok_or(AssemblyError::UnknownConfiguration(self.selected_value))?;
        let registry = Registry::build(
                self.nodes, self.configurations, selected)
            .map_err(AssemblyError::DuplicateTag)?;
        validate(&registry)?;
        Ok(registry)
    }

    fn add_device(&mut self) -> Result<(), AssemblyError> {
        let device = self.device;
        let manufacturer = self.strings.intern(device.manufacturer.as_deref())?;
        let product = self.strings.intern(device.product.as_deref())?;
        let serial = self.strings.intern(device.serial.as_deref())?;
        let descriptor = DeviceDescriptor {
            length: size_of::<DeviceDescriptor>() as u8,
            descriptor_type: TYPE_DEVICE,
            usb_version: BCDVersion::from_bcd(device.usb_version),
            device_class: device.device_class,
            device_subclass: device.device_subclass,
            device_protocol: device.device_protocol,
            max_packet_size_0: device.max_packet_size_0,
            vendor_id: device.vendor_id.to_le(),
            product_id: device.product_id.to_le(),
            device_version: BCDVersion::from_bcd(device.device_version),
            manufacturer_str_id: manufacturer,
            product_str_id: product,
            serial_str_id: serial,
            num_configurations: device.configurations.len() as u8,
        };
        self.nodes.push(DescriptorNode::new(
            Tag::new(TYPE_DEVICE, 0),
            descriptor_bytes(&descriptor).to_vec()));
        if device.speed >= Speed::High {
            let qualifier = DeviceQualifierDescriptor::from_device(
                &descriptor, device.speed);
            self.nodes.push(DescriptorNode::new(
                Tag::new(TYPE_DEVICE_QUALIFIER, 0),
                descriptor_bytes(&qualifier).to_vec()));
        }
        Ok(())
    }

    fn add_configuration(&mut self, index: usize, config: &ConfigurationSpec)
        -> Result<(), AssemblyError>
    {
        let functions = self.functions;
        let speed = self.device.speed;
        let index = u8::try_from(index)
            .map_err(|_| OutOfRange { what: "Configuration index", value: index })?;
        let max_power = match speed {
            Speed::Super => config.max_power_ma.div_ceil(8),
            _ => config.max_power_ma.div_ceil(2),
        };
        let entry = ConfigurationEntry {
            value: config.value,
            index,
            attributes: config.attributes(),
            max_power: u8::try_from(max_power)
                .map_err(|_| OutOfRange {
                    what: "Max power", value: config.max_power_ma as usize })?,
        };
        let config_str = self.strings.intern(config.name.as_deref())?;
        let mut selected = (config.value == self.selected_value)
            .then(|| SelectedConfiguration::new(entry));

        // Reserve fixed endpoint numbers before handing out free ones.
        let mut allocator = EndpointAllocator::default();
        for &function_index in &config.functions {
            let function = functions.get(function_index)
                .ok_or(AssemblyError::DanglingFunction {
                    configuration: config.value,
                    function: function_index })?;
            for endpoint in &function.endpoints {
                if let Some(number) = endpoint.number {
                    allocator.claim(number, endpoint.direction)?;
                }
            }
        }

        // Accumulate everything nested under the configuration header; the
        // header itself is patched in once the total length is known.
        let mut block = vec![0u8; size_of::<ConfigDescriptor>()];
        let mut nested_nodes = Vec::new();
        let mut tags = BTreeSet::new();
        let mut next_interface = 0usize;

        for &function_index in &config.functions {
            let function = &functions[function_index];
            let id = FunctionId(function_index);
            for capability in &function.capabilities {
                if !self.capabilities.contains(capability) {
                    self.capabilities.push(*capability);
                }
            }

            let mut handles = Vec::with_capacity(function.endpoints.len());
            for endpoint in &function.endpoints {
                let number = match endpoint.number {
                    Some(number) => number,
                    None => allocator.next_free(endpoint.direction)?,
                };
                let limit = speed.max_packet_size(endpoint.transfer_type);
                if endpoint.max_packet_size > limit {
                    debug!("Endpoint {number} of function '{}': {} byte \
                            packets limited to {limit} for {} endpoints at \
                            {}",
                           function.name, endpoint.max_packet_size,
                           endpoint.transfer_type, speed.description());
                }
                handles.push(EndpointHandle {
                    function: id,
                    address: EndpointAddr::from_parts(
                        EndpointNum(number), endpoint.direction),
                    transfer_type: endpoint.transfer_type,
                    max_packet_size: endpoint.max_packet_size,
                    interval: endpoint.interval,
                    speed,
                });
            }

            if function.interfaces.len() > 1 {
                let first = &function.interfaces[0];
                let association = InterfaceAssociationDescriptor {
                    length: size_of::<InterfaceAssociationDescriptor>() as u8,
                    descriptor_type: TYPE_INTERFACE_ASSOCIATION,
                    first_interface: interface_number(next_interface)?,
                    interface_count: u8::try_from(function.interfaces.len())
                        .map_err(|_| OutOfRange {
                            what: "Interface count",
                            value: function.interfaces.len() })?,
                    function_class: first.class,
                    function_subclass: first.subclass,
                    function_protocol: first.protocol,
                    function_str_id: self.strings.intern(first.name.as_deref())?,
                };
                block.extend_from_slice(descriptor_bytes(&association));
            }

            for interface in &function.interfaces {
                let number = interface_number(next_interface)?;
                next_interface += 1;
                let mut endpoints = Vec::with_capacity(interface.endpoints.len());
                for &endpoint_index in &interface.endpoints {
                    let handle = handles.get(endpoint_index)
                        .ok_or_else(|| AssemblyError::DanglingEndpoint {
                            function: function.name.clone(),
                            interface: number.0,
                            endpoint: endpoint_index })?;
                    endpoints.push((*handle, &function.endpoints[endpoint_index]));
                }
                let descriptor = InterfaceDescriptor {
                    length: size_of::<InterfaceDescriptor>() as u8,
                    descriptor_type: TYPE_INTERFACE,
                    interface_number: number,
                    alternate_setting: 0,
                    num_endpoints: u8::try_from(endpoints.len())
                        .map_err(|_| OutOfRange {
                            what: "Endpoint count", value: endpoints.len() })?,
                    interface_class: interface.class,
                    interface_subclass: interface.subclass,
                    interface_protocol: interface.protocol,
                    interface_str_id: self.strings.intern(interface.name.as_deref())?,
                };
                let interface_bytes = descriptor_bytes(&descriptor);
                block.extend_from_slice(interface_bytes);
                block.extend_from_slice(&interface.class_descriptors);
                let tag = Tag::new(TYPE_INTERFACE, number.0);
                tags.insert(tag);
                nested_nodes.push(
                    DescriptorNode::new(tag, interface_bytes.to_vec()));

                for (handle, spec) in &endpoints {
                    let tag = Tag::new(TYPE_ENDPOINT, handle.address.0);
                    if !tags.insert(tag) {
                        return Err(AssemblyError::DuplicateTag(tag));
                    }
                    let endpoint_bytes = fill(function.gadget.as_ref(), handle)?;
                    block.extend_from_slice(&endpoint_bytes);
                    nested_nodes.push(
                        DescriptorNode::new(tag, endpoint_bytes.to_vec()));
                    if speed == Speed::Super || spec.companion.is_some() {
                        self.companions = true;
                        let companion = companion(handle, spec.companion);
                        let companion_bytes = descriptor_bytes(&companion);
                        block.extend_from_slice(companion_bytes);
                        nested_nodes.push(DescriptorNode::new(
                            Tag::new(TYPE_SS_EP_COMP, handle.address.0),
                            companion_bytes.to_vec()));
                    }
                    if let Some(selected) = selected.as_mut() {
                        selected.add_endpoint(EndpointRoute {
                            function: id,
                            handle: *handle,
                        });
                    }
                }

                if let Some(selected) = selected.as_mut() {
                    selected.interfaces.set(number, InterfaceRoute {
                        function: id,
                        endpoints: endpoints
                            .iter()
                            .map(|(handle, _)| handle.address)
                            .collect(),
                    });
                }
            }

            if let Some(selected) = selected.as_mut() {
                if !selected.functions.contains(&id) {
                    selected.functions.push(id);
                }
            }
        }

        let total_length = u16::try_from(block.len())
            .map_err(|_| OutOfRange {
                what: "Configuration total length", value: block.len() })?;
        let header = ConfigDescriptor {
            length: size_of::<ConfigDescriptor>() as u8,
            descriptor_type: TYPE_CONFIGURATION,
            total_length: total_length.to_le(),
            num_interfaces: interface_count(next_interface)?,
            config_value: config.value,
            config_str_id: config_str,
            attributes: entry.attributes,
            max_power: entry.max_power,
        };
        block[..size_of::<ConfigDescriptor>()]
            .copy_from_slice(descriptor_bytes(&header));
        debug!("Configuration {}: {} interfaces, {} bytes",
               config.value, next_interface, block.len());

        self.nodes.push(DescriptorNode::new(entry.tag(), block));
        self.configurations.push(entry);
        if let Some(selected) = selected {
            self.nodes.extend(nested_nodes);
            self.selected = Some(selected);
        }
        Ok(())
    }

    fn add_strings(&mut self) -> Result<(), AssemblyError> {
        let languages: &[u16] = if self.device.languages.is_empty() {
            &[DEFAULT_LANGUAGE]
        } else {
            &self.device.languages
        };
        if languages.len() > MAX_STRING_UNITS {
            return Err(OutOfRange {
                what: "Language count", value: languages.len() });
        }
        let mut table = vec![(2 + 2 * languages.len()) as u8, TYPE_STRING];
        for language in languages {
            table.extend_from_slice(&language.to_le_bytes());
        }
        self.nodes.push(DescriptorNode::new(Tag::new(TYPE_STRING, 0), table));

        for (i, text) in self.strings.strings.iter().enumerate() {
            let encoded = UTF16ByteVec::encode(text);
            let mut data = vec![(2 + encoded.0.len()) as u8, TYPE_STRING];
            data.extend_from_slice(&encoded.0);
            self.nodes.push(
                DescriptorNode::new(Tag::new(TYPE_STRING, (i + 1) as u8), data));
        }
        Ok(())
    }

    fn add_bos(&mut self) -> Result<(), AssemblyError> {
        if self.device.speed == Speed::Super || self.companions {
            let required = [
                Capability::Usb2Extension { lpm: false },
                Capability::SuperSpeed { u1_exit_latency: 0, u2_exit_latency: 0 },
            ];
            for capability in required {
                let present = self.capabilities
                    .iter()
                    .any(|c| std::mem::discriminant(c) ==
                             std::mem::discriminant(&capability));
                if !present {
                    self.capabilities.push(capability);
                }
            }
        }
        if self.capabilities.is_empty() {
            return Ok(());
        }
        if self.device.usb_version < 0x0201 {
            warn!("Device declares USB {} but has a BOS descriptor",
                  BCDVersion::from_bcd(self.device.usb_version));
        }

        let mut block = vec![0u8; size_of::<BosDescriptor>()];
        let mut capability_nodes = Vec::new();
        for (i, capability) in self.capabilities.iter().enumerate() {
            let tag = Tag::checked(TYPE_DEVICE_CAP, i)
                .ok_or(OutOfRange { what: "Capability index", value: i })?;
            let bytes = capability.encode();
            block.extend_from_slice(&bytes);
            capability_nodes.push(DescriptorNode::new(tag, bytes));
        }
        let total_length = u16::try_from(block.len())
            .map_err(|_| OutOfRange { what: "BOS total length", value: block.len() })?;
        let header = BosDescriptor {
            length: size_of::<BosDescriptor>() as u8,
            descriptor_type: TYPE_BOS,
            total_length: total_length.to_le(),
            num_device_caps: capability_nodes.len() as u8,
        };
        block[..size_of::<BosDescriptor>()]
            .copy_from_slice(descriptor_bytes(&header));
        self.nodes.push(DescriptorNode::new(Tag::new(TYPE_BOS, 0), block));
        self.nodes.extend(capability_nodes);
        Ok(())
    }
}

fn interface_number(count: usize) -> Result<InterfaceNum, AssemblyError> {
    u8::try_from(count)
        .map(InterfaceNum)
        .map_err(|_| OutOfRange { what: "Interface number", value: count })
}

fn interface_count(count: usize) -> Result<u8, AssemblyError> {
    u8::try_from(count)
        .map_err(|_| OutOfRange { what: "Interface count", value: count })
}

fn fill(gadget: &dyn Gadget, handle: &EndpointHandle)
    -> Result<[u8; ENDPOINT_DESCRIPTOR_LENGTH], AssemblyError>
{
    let mut data = [0; ENDPOINT_DESCRIPTOR_LENGTH];
    gadget.fill(handle, &mut data)
        .map_err(|source| AssemblyError::Fill {
            address: handle.address, source })?;
    if data[0] as usize != ENDPOINT_DESCRIPTOR_LENGTH ||
       data[1] != TYPE_ENDPOINT ||
       data[2] != handle.address.0
    {
        return Err(AssemblyError::Fill {
            address: handle.address,
            source: HookFailure::Failed(
                format!("Malformed endpoint descriptor {data:02X?}")),
        });
    }
    Ok(data)
}

fn companion(handle: &EndpointHandle, spec: Option<CompanionSpec>)
    -> SsEndpointCompanionDescriptor
{
    let spec = spec.unwrap_or_else(|| {
        let periodic = matches!(handle.transfer_type,
            EndpointType::Interrupt | EndpointType::Isochronous);
        CompanionSpec {
            bytes_per_interval: if periodic { handle.max_packet_size } else { 0 },
            ..CompanionSpec::default()
        }
    });
    SsEndpointCompanionDescriptor {
        length: size_of::<SsEndpointCompanionDescriptor>() as u8,
        descriptor_type: TYPE_SS_EP_COMP,
        max_burst: spec.max_burst,
        attributes: spec.attributes,
        bytes_per_interval: spec.bytes_per_interval.to_le(),
    }
}

/// Check the invariants every published registry must satisfy.
fn validate(registry: &Registry) -> Result<(), AssemblyError> {
    for entry in registry.configurations() {
        let tag = entry.tag();
        let node = registry.find(tag)
            .ok_or(AssemblyError::UnknownConfiguration(entry.value))?;
        let declared = ConfigDescriptor::header(node.payload())
            .ok_or_else(|| short_header::<ConfigDescriptor>(tag, node.payload()))?
            .total_length() as usize;
        check_aggregate(tag, declared, node.payload())?;
    }
    if let Some(node) = registry.find(Tag::new(TYPE_BOS, 0)) {
        let declared = BosDescriptor::header(node.payload())
            .ok_or_else(|| short_header::<BosDescriptor>(node.tag(), node.payload()))?
            .total_length() as usize;
        check_aggregate(node.tag(), declared, node.payload())?;
    }
    for (number, route) in registry.selected().interfaces.entries() {
        for address in &route.endpoints {
            if registry.find(Tag::new(TYPE_ENDPOINT, address.0)).is_none() {
                return Err(AssemblyError::MissingEndpoint {
                    interface: number.0, address: *address });
            }
        }
    }
    Ok(())
}

fn short_header<T>(tag: Tag, payload: &[u8]) -> AssemblyError {
    AssemblyError::LengthMismatch {
        tag,
        declared: size_of::<T>(),
        actual: payload.len(),
    }
}

fn check_aggregate(tag: Tag, declared: usize, payload: &[u8])
    -> Result<(), AssemblyError>
{
    let nested: usize = DescriptorIterator::from(payload)
        .map(|descriptor| descriptor.length())
        .sum();
    for actual in [payload.len(), nested] {
        if actual != declared {
            return Err(AssemblyError::LengthMismatch { tag, declared, actual });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{composite_device, composite_functions};
    use crate::usb::{Configuration, EndpointDescriptor};
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;

    #[test]
    fn test_composite_layout() {
        let device = composite_device();
        let functions = composite_functions();
        let registry = assemble(&device, &functions).unwrap();

        let device_node = registry.find(Tag::new(TYPE_DEVICE, 0)).unwrap();
        assert_eq!(device_node.length(), 18);
        let device_desc = DeviceDescriptor::from_bytes(device_node.payload());
        assert_eq!(device_desc.num_configurations, 2);
        assert_eq!(u16::from_le(device_desc.vendor_id), 0x1209);
        assert_eq!(registry.nodes()[0].tag(), Tag::new(TYPE_DEVICE, 0));

        let config_node = registry.find(Tag::new(TYPE_CONFIGURATION, 0)).unwrap();
        let config = Configuration::from_bytes(config_node.payload()).unwrap();
        assert_eq!(config.descriptor.total_length() as usize,
                   config_node.length());
        assert_eq!(config.descriptor.num_interfaces, 3);
        assert_eq!(config.descriptor.config_value, 1);

        // Serial function: control interface with one interrupt endpoint,
        // data interface with a bulk pair. Storage follows.
        let control = config.interfaces.get(InterfaceNum(0)).unwrap();
        assert_eq!(control.descriptor.interface_class, 0x02);
        assert_eq!(control.endpoint_descriptors.len(), 1);
        let data = config.interfaces.get(InterfaceNum(1)).unwrap();
        let addresses: Vec<u8> = data.endpoint_descriptors
            .into_iter()
            .map(|ep| ep.endpoint_address.0)
            .collect();
        assert_eq!(addresses, vec![0x82, 0x01]);
        let storage = config.interfaces.get(InterfaceNum(2)).unwrap();
        let addresses: Vec<u8> = storage.endpoint_descriptors
            .into_iter()
            .map(|ep| ep.endpoint_address.0)
            .collect();
        assert_eq!(addresses, vec![0x83, 0x02]);

        // Interface and endpoint nodes exist for the selected configuration.
        assert!(registry.find(Tag::new(TYPE_INTERFACE, 2)).is_some());
        assert!(registry.find(Tag::new(TYPE_ENDPOINT, 0x83)).is_some());
        assert_eq!(registry.interface(InterfaceNum(2)).unwrap().function,
                   FunctionId(1));
        assert_eq!(registry.endpoint(EndpointAddr(0x81)).unwrap().function,
                   FunctionId(0));
    }

    #[test]
    fn test_interface_association() {
        let registry = assemble(&composite_device(), &composite_functions())
            .unwrap();
        let config_node = registry.find(Tag::new(TYPE_CONFIGURATION, 0)).unwrap();
        let payload = config_node.payload();
        // The serial function spans two interfaces, so an IAD follows the
        // configuration header directly.
        assert_eq!(payload[9], 8);
        assert_eq!(payload[10], TYPE_INTERFACE_ASSOCIATION);
        assert_eq!(payload[11], 0);
        assert_eq!(payload[12], 2);
    }

    #[test]
    fn test_total_length() {
        let registry = assemble(&composite_device(), &composite_functions())
            .unwrap();
        // Header, IAD, CDC interface with its functionals and interrupt
        // endpoint, data interface with two endpoints, storage interface
        // with two endpoints.
        let expected = 9 + 8 + (9 + 19 + 7) + (9 + 7 + 7) + (9 + 7 + 7);
        let node = registry.find(Tag::new(TYPE_CONFIGURATION, 0)).unwrap();
        let header = ConfigDescriptor::header(node.payload()).unwrap();
        assert_eq!(header.total_length() as usize, expected);
        assert_eq!(node.length(), expected);
        let nested: usize = DescriptorIterator::from(node.payload())
            .map(|d| d.length())
            .sum();
        assert_eq!(nested, expected);
        assert!(ConfigDescriptor::header(&node.payload()[..5]).is_none());
    }

    #[test]
    fn test_truncated_configuration_rejected() {
        let entry = ConfigurationEntry {
            value: 1,
            index: 0,
            attributes: CONFIG_ATTR_RESERVED,
            max_power: 50,
        };
        let nodes = vec![
            DescriptorNode::new(entry.tag(), vec![9, TYPE_CONFIGURATION, 9, 0]),
        ];
        let registry = Registry::build(
            nodes, vec![entry], SelectedConfiguration::new(entry)).unwrap();
        assert_eq!(validate(&registry).unwrap_err(),
                   AssemblyError::LengthMismatch {
                       tag: entry.tag(), declared: 9, actual: 4 });
    }

    #[test]
    fn test_strings() {
        let registry = assemble(&composite_device(), &composite_functions())
            .unwrap();
        let languages = registry.find(Tag::new(TYPE_STRING, 0)).unwrap();
        assert_eq!(languages.payload(), &[4, 3, 0x09, 0x04]);
        let device_desc = DeviceDescriptor::from_bytes(
            registry.find(Tag::new(TYPE_DEVICE, 0)).unwrap().payload());
        let strings = registry.strings();
        let product = strings.get(device_desc.product_str_id).unwrap();
        assert_eq!(product.to_string(), "'Composite Gadget'");
        let manufacturer = registry
            .find(Tag::new(TYPE_STRING, device_desc.manufacturer_str_id.0))
            .unwrap();
        assert_eq!(manufacturer.length(), manufacturer.payload()[0] as usize);
        assert!(registry.find(Tag::new(TYPE_STRING, 7)).is_none());
    }

    #[test]
    fn test_selecting_second_configuration() {
        let device = composite_device();
        let functions = composite_functions();
        let registry = assemble_for(&device, &functions, Some(2)).unwrap();
        assert_eq!(registry.selected().entry.value, 2);
        assert_eq!(registry.selected().entry.index, 1);
        // Only the storage function is in configuration 2.
        assert_eq!(registry.selected().functions, vec![FunctionId(1)]);
        assert!(registry.find(Tag::new(TYPE_INTERFACE, 1)).is_none());
        assert!(registry.find(Tag::new(TYPE_ENDPOINT, 0x81)).is_some());
        assert!(registry.find(Tag::new(TYPE_CONFIGURATION, 0)).is_some());
        assert!(registry.find(Tag::new(TYPE_CONFIGURATION, 1)).is_some());
        assert_eq!(assemble_for(&device, &functions, Some(9)).unwrap_err(),
                   AssemblyError::UnknownConfiguration(9));
    }

    #[test]
    fn test_idempotent() {
        let device = composite_device();
        let functions = composite_functions();
        let first = assemble(&device, &functions).unwrap();
        let second = assemble(&device, &functions).unwrap();
        assert_eq!(first.nodes(), second.nodes());
    }

    #[test]
    fn test_duplicate_fixed_endpoint() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[0].endpoints[1].number = Some(4);
        functions[1].endpoints[0].number = Some(4);
        assert_eq!(assemble(&device, &functions).unwrap_err(),
                   AssemblyError::DuplicateTag(Tag::new(TYPE_ENDPOINT, 0x84)));
    }

    #[test]
    fn test_endpoint_shared_by_interfaces() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[0].interfaces[1].endpoints.push(0);
        assert_eq!(assemble(&device, &functions).unwrap_err(),
                   AssemblyError::DuplicateTag(Tag::new(TYPE_ENDPOINT, 0x81)));
    }

    #[test]
    fn test_dangling_references() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[1].interfaces[0].endpoints.push(5);
        assert_eq!(
            assemble(&device, &functions).unwrap_err(),
            AssemblyError::DanglingEndpoint {
                function: "storage".to_string(), interface: 2, endpoint: 5 });

        let mut device = composite_device();
        device.configurations[0].functions.push(3);
        assert_eq!(
            assemble(&device, &composite_functions()).unwrap_err(),
            AssemblyError::DanglingFunction { configuration: 1, function: 3 });
    }

    #[test]
    fn test_out_of_range() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[1].endpoints[0].number = Some(16);
        assert_eq!(
            assemble(&device, &functions).unwrap_err(),
            OutOfRange { what: "Endpoint number", value: 16 });

        let mut device = composite_device();
        device.product = Some("x".repeat(127));
        assert_eq!(
            assemble(&device, &composite_functions()).unwrap_err(),
            OutOfRange { what: "String length", value: 127 });

        let mut device = composite_device();
        device.max_packet_size_0 = 12;
        assert!(matches!(
            assemble(&device, &composite_functions()).unwrap_err(),
            OutOfRange { what: "EP0 max packet size", .. }));

        let mut device = composite_device();
        device.configurations.clear();
        assert_eq!(assemble(&device, &composite_functions()).unwrap_err(),
                   AssemblyError::NoConfigurations);
    }

    #[test]
    fn test_endpoint_numbers_exhausted() {
        let device = DeviceSpec {
            configurations: vec![ConfigurationSpec {
                functions: vec![0],
                ..ConfigurationSpec::default()
            }],
            ..DeviceSpec::default()
        };
        let mut function = FunctionSpec::new("greedy");
        function.endpoints = vec![EndpointSpec::default(); 16];
        function.interfaces.push(InterfaceSpec {
            endpoints: (0..16).collect(),
            ..InterfaceSpec::default()
        });
        assert_eq!(assemble(&device, &[function]).unwrap_err(),
                   OutOfRange { what: "Endpoint number", value: 16 });
    }

    struct BrokenFill;

    impl crate::gadget::EndpointFill for BrokenFill {
        fn fill(&self, endpoint: &EndpointHandle,
                data: &mut [u8; ENDPOINT_DESCRIPTOR_LENGTH])
            -> Result<(), HookFailure>
        {
            let mut descriptor = endpoint.descriptor()?;
            descriptor.endpoint_address = EndpointAddr(0x8F);
            data.copy_from_slice(descriptor_bytes(&descriptor));
            Ok(())
        }
    }

    impl Gadget for BrokenFill {}

    #[test]
    fn test_fill_hook_checked() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[1] = functions[1].clone().with_gadget(Arc::new(BrokenFill));
        assert!(matches!(
            assemble(&device, &functions).unwrap_err(),
            AssemblyError::Fill { address: EndpointAddr(0x83), .. }));
    }

    #[test]
    fn test_superspeed_bos() {
        let mut device = composite_device();
        device.speed = Speed::Super;
        device.usb_version = 0x0320;
        device.max_packet_size_0 = 9;
        let registry = assemble(&device, &composite_functions()).unwrap();
        let bos = registry.find(Tag::new(TYPE_BOS, 0)).unwrap();
        let header = BosDescriptor::header(bos.payload()).unwrap();
        assert_eq!(header.total_length() as usize, bos.length());
        assert_eq!(header.num_device_caps, 2);
        assert_eq!(registry.find(Tag::new(TYPE_DEVICE_CAP, 0)).unwrap().length(), 7);
        assert_eq!(registry.find(Tag::new(TYPE_DEVICE_CAP, 1)).unwrap().length(), 10);
        // Every endpoint is followed by its companion.
        let companion = registry.find(Tag::new(TYPE_SS_EP_COMP, 0x81)).unwrap();
        assert_eq!(companion.payload()[..2], [6, TYPE_SS_EP_COMP]);
        let endpoint = registry.find(Tag::new(TYPE_ENDPOINT, 0x82)).unwrap();
        let endpoint: EndpointDescriptor =
            bytemuck::pod_read_unaligned(endpoint.payload());
        assert_eq!(endpoint.max_packet_size(), 512);
    }

    #[test]
    fn test_function_capability() {
        let device = composite_device();
        let mut functions = composite_functions();
        functions[1].capabilities.push(Capability::Usb2Extension { lpm: true });
        let registry = assemble(&device, &functions).unwrap();
        let cap = registry.find(Tag::new(TYPE_DEVICE_CAP, 0)).unwrap();
        assert_eq!(cap.payload(), &[7, TYPE_DEVICE_CAP, 2, 2, 0, 0, 0]);
        assert!(registry.find(Tag::new(TYPE_DEVICE_CAP, 1)).is_none());
        let plain = assemble(&device, &composite_functions()).unwrap();
        assert!(plain.find(Tag::new(TYPE_BOS, 0)).is_none());
    }

    #[test]
    fn test_high_speed_qualifier() {
        let mut device = composite_device();
        device.speed = Speed::High;
        let registry = assemble(&device, &composite_functions()).unwrap();
        let qualifier = registry.find(Tag::new(TYPE_DEVICE_QUALIFIER, 0)).unwrap();
        assert_eq!(qualifier.length(), 10);
        assert_eq!(qualifier.payload()[8], 2);
        let full = assemble(&composite_device(), &composite_functions()).unwrap();
        assert!(full.find(Tag::new(TYPE_DEVICE_QUALIFIER, 0)).is_none());
    }

    #[test]
    fn test_superspeed_qualifier() {
        let mut device = composite_device();
        device.speed = Speed::Super;
        device.usb_version = 0x0320;
        device.max_packet_size_0 = 9;
        let registry = assemble(&device, &composite_functions()).unwrap();
        let qualifier = registry.find(Tag::new(TYPE_DEVICE_QUALIFIER, 0)).unwrap();
        // Describes the device as it would run at high speed.
        assert_eq!(qualifier.payload()[2..4], [0x00, 0x02]);
        assert_eq!(qualifier.payload()[7], 64);
        let device = registry.find(Tag::new(TYPE_DEVICE, 0)).unwrap();
        assert_eq!(device.payload()[2..4], [0x20, 0x03]);
        assert_eq!(device.payload()[7], 9);
    }

    #[test]
    fn test_random_functions() {
        let mut prng = XorShiftRng::seed_from_u64(42);
        for _ in 0..200 {
            let count = prng.gen_range(1..5);
            let mut functions = Vec::new();
            for f in 0..count {
                let mut function = FunctionSpec::new(&format!("function{f}"));
                for _ in 0..prng.gen_range(0..4) {
                    function.endpoints.push(EndpointSpec {
                        number: if prng.gen_bool(0.2) {
                            Some(prng.gen_range(1..16))
                        } else {
                            None
                        },
                        direction: if prng.gen_bool(0.5) {
                            Direction::In
                        } else {
                            Direction::Out
                        },
                        transfer_type: EndpointType::Bulk,
                        max_packet_size: 64,
                        ..EndpointSpec::default()
                    });
                }
                for _ in 0..prng.gen_range(1..3) {
                    let endpoints = (0..function.endpoints.len() + 1)
                        .filter(|_| prng.gen_bool(0.5))
                        .collect();
                    function.interfaces.push(InterfaceSpec {
                        class: 0xFF,
                        endpoints,
                        ..InterfaceSpec::default()
                    });
                }
                functions.push(function);
            }
            let device = DeviceSpec {
                product: Some("Random".to_string()),
                configurations: vec![ConfigurationSpec {
                    functions: (0..count).collect(),
                    ..ConfigurationSpec::default()
                }],
                ..DeviceSpec::default()
            };
            match assemble(&device, &functions) {
                Ok(registry) => {
                    let mut tags: Vec<Tag> = registry.nodes()
                        .iter()
                        .map(|node| node.tag())
                        .collect();
                    let node_count = tags.len();
                    tags.sort();
                    tags.dedup();
                    assert_eq!(tags.len(), node_count);
                    for entry in registry.configurations() {
                        let node = registry.find(entry.tag()).unwrap();
                        let header = ConfigDescriptor::header(node.payload()).unwrap();
                        assert_eq!(header.total_length() as usize, node.length());
                        let nested: usize = DescriptorIterator::from(node.payload())
                            .map(|d| d.length())
                            .sum();
                        assert_eq!(nested, node.length());
                    }
                    let again = assemble(&device, &functions).unwrap();
                    assert_eq!(registry.nodes(), again.nodes());
                },
                Err(AssemblyError::DanglingEndpoint { .. }) |
                Err(AssemblyError::DuplicateTag(_)) => {},
                Err(e) => panic!("Unexpected assembly error: {e}"),
            }
        }
    }
}
