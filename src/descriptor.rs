//! Descriptor nodes, and the registry that answers lookups by tag.

use std::fmt;

use derive_more::{From, Into};

use crate::gadget::{EndpointHandle, FunctionId};
use crate::usb::{
    CONFIG_ATTR_REMOTE_WAKEUP,
    CONFIG_ATTR_SELF_POWERED,
    DescriptorType,
    EndpointAddr,
    InterfaceNum,
    StringId,
    TYPE_STRING,
    UTF16ByteVec,
};
use crate::vec_map::VecMap;

/// Key of a descriptor: its type in the high byte, its index in the low byte.
///
/// This is also the layout of the `wValue` field of GET_DESCRIPTOR.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
         From, Into)]
pub struct Tag(pub u16);

impl Tag {
    pub const fn new(descriptor_type: u8, index: u8) -> Tag {
        Tag((descriptor_type as u16) << 8 | index as u16)
    }

    /// Compose a tag, if the index fits in its byte.
    pub fn checked(descriptor_type: u8, index: usize) -> Option<Tag> {
        u8::try_from(index)
            .ok()
            .map(|index| Tag::new(descriptor_type, index))
    }

    pub const fn type_code(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn index(&self) -> u8 {
        self.0 as u8
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::from(self.type_code())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} #{} (0x{:04X})",
               self.descriptor_type().description(), self.index(), self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tag(0x{:04X})", self.0)
    }
}

/// One encoded descriptor. Never modified once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorNode {
    tag: Tag,
    data: Box<[u8]>,
}

impl DescriptorNode {
    pub fn new(tag: Tag, data: Vec<u8>) -> Self {
        DescriptorNode {
            tag,
            data: data.into_boxed_slice(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Length of the encoded descriptor, including its header and anything
    /// nested within it.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationEntry {
    /// The `bConfigurationValue` that SET_CONFIGURATION selects.
    pub value: u8,
    /// Position among the device's configurations, as used by
    /// GET_DESCRIPTOR.
    pub index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationEntry {
    pub fn tag(&self) -> Tag {
        Tag::new(DescriptorType::Configuration as u8, self.index)
    }

    pub fn self_powered(&self) -> bool {
        self.attributes & CONFIG_ATTR_SELF_POWERED != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & CONFIG_ATTR_REMOTE_WAKEUP != 0
    }
}

#[derive(Clone, Debug)]
pub struct InterfaceRoute {
    pub function: FunctionId,
    pub endpoints: Vec<EndpointAddr>,
}

#[derive(Clone, Debug)]
pub struct EndpointRoute {
    pub function: FunctionId,
    pub handle: EndpointHandle,
}

/// Dispatch tables for the configuration a registry was assembled for.
#[derive(Clone, Debug)]
pub struct SelectedConfiguration {
    pub entry: ConfigurationEntry,
    pub functions: Vec<FunctionId>,
    pub interfaces: VecMap<InterfaceNum, InterfaceRoute>,
    endpoints: Vec<Option<EndpointRoute>>,
}

impl SelectedConfiguration {
    pub fn new(entry: ConfigurationEntry) -> Self {
        SelectedConfiguration {
            entry,
            functions: Vec::new(),
            interfaces: VecMap::new(),
            endpoints: vec![None; 32],
        }
    }

    pub fn endpoint(&self, address: EndpointAddr) -> Option<&EndpointRoute> {
        self.endpoints[address.slot()].as_ref()
    }

    pub fn add_endpoint(&mut self, route: EndpointRoute) {
        let slot = route.handle.address.slot();
        self.endpoints[slot] = Some(route);
    }

    pub fn endpoints(&self) -> impl Iterator<Item=&EndpointRoute> + '_ {
        self.endpoints.iter().flatten()
    }
}

/// The complete, validated set of descriptors for one assembly.
///
/// Nodes are kept in the order the host would traverse them. A tag-sorted
/// index alongside makes lookups a binary search.
#[derive(Clone, Debug)]
pub struct Registry {
    nodes: Vec<DescriptorNode>,
    index: Vec<(Tag, usize)>,
    configurations: Vec<ConfigurationEntry>,
    selected: SelectedConfiguration,
    generation: u64,
}

impl Registry {
    /// Index the given nodes. Fails with the first tag found twice.
    pub(crate) fn build(nodes: Vec<DescriptorNode>,
                        configurations: Vec<ConfigurationEntry>,
                        selected: SelectedConfiguration)
        -> Result<Registry, Tag>
    {
        let mut index: Vec<(Tag, usize)> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.tag(), i))
            .collect();
        index.sort_by_key(|(tag, i)| (*tag, *i));
        if let Some(pair) = index.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(pair[1].0);
        }
        Ok(Registry {
            nodes,
            index,
            configurations,
            selected,
            generation: 0,
        })
    }

    pub fn find(&self, tag: Tag) -> Option<&DescriptorNode> {
        self.index
            .binary_search_by_key(&tag, |(tag, _)| *tag)
            .ok()
            .map(|pos| &self.nodes[self.index[pos].1])
    }

    pub fn nodes(&self) -> &[DescriptorNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn configurations(&self) -> &[ConfigurationEntry] {
        &self.configurations
    }

    /// Look up a configuration by its `bConfigurationValue`.
    pub fn configuration(&self, value: u8) -> Option<&ConfigurationEntry> {
        self.configurations.iter().find(|entry| entry.value == value)
    }

    pub fn selected(&self) -> &SelectedConfiguration {
        &self.selected
    }

    pub fn interface(&self, number: InterfaceNum) -> Option<&InterfaceRoute> {
        self.selected.interfaces.get(number)
    }

    pub fn endpoint(&self, address: EndpointAddr) -> Option<&EndpointRoute> {
        self.selected.endpoint(address)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Decoded text of every string descriptor except the language table.
    pub fn strings(&self) -> VecMap<StringId, UTF16ByteVec> {
        let mut strings = VecMap::new();
        for node in &self.nodes {
            let tag = node.tag();
            if tag.type_code() == TYPE_STRING && tag.index() != 0 {
                strings.set(
                    StringId(tag.index()),
                    UTF16ByteVec(node.payload()[2..].to_vec()));
            }
        }
        strings
    }
}
