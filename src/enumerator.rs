//! The enumeration state machine: answers control requests on the default
//! endpoint and tracks the device through address and configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use arc_swap::ArcSwap;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::assembler::{assemble_for, AssemblyError, DeviceSpec, FunctionSpec};
use crate::controller::Controller;
use crate::descriptor::{DescriptorNode, EndpointRoute, Registry, Tag};
use crate::gadget::{EndpointHandle, FunctionId, HookFailure};
use crate::irq::{InterruptControl, IrqLock};
use crate::setup::{SetupPacket, SetupWords};
use crate::statistics::{Statistics, StatisticsSnapshot};
use crate::usb::{
    DeviceAddr,
    DEVICE_REMOTE_WAKEUP,
    Direction,
    ENDPOINT_HALT,
    EndpointAddr,
    EndpointType,
    InterfaceNum,
    MAX_ADDRESS,
    Recipient,
    RequestType,
    StandardRequest,
};

/// Length of the SET_SEL data stage.
pub const EXIT_LATENCIES_LENGTH: usize = 6;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Default,
    Addressed,
    Configured,
}

/// Why a control request was stalled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Stall {
    #[error("No such descriptor: {0}")]
    UnknownDescriptor(Tag),
    #[error("Not permitted in {0:?} state")]
    WrongState(DeviceState),
    #[error("Invalid value 0x{0:04X}")]
    InvalidValue(u16),
    #[error("No interface {0}")]
    UnknownInterface(u8),
    #[error("No endpoint {0}")]
    UnknownEndpoint(EndpointAddr),
    #[error("No configuration {0}")]
    UnknownConfiguration(u8),
    #[error("Unsupported request")]
    Unsupported,
    #[error("Function hook: {0}")]
    Hook(HookFailure),
    #[error("Reassembling descriptors failed: {0}")]
    Assembly(AssemblyError),
    #[error("Superseded by a newer SETUP")]
    Superseded,
    #[error("No data stage in progress")]
    NoDataStage,
}

/// What the driver should do after a SETUP or OUT data stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    /// An IN data stage of this many bytes is ready to be read.
    Data(usize),
    /// This many more OUT data bytes are expected.
    ReceiveData(usize),
    /// No data stage remains; complete the status stage.
    Status,
    Stall(Stall),
}

/// A copy of the enumeration state at one instant.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub address: DeviceAddr,
    pub configuration: u8,
    pub remote_wakeup: bool,
    pub exit_latencies: Option<[u8; EXIT_LATENCIES_LENGTH]>,
    pub transfer_pending: bool,
}

enum Source {
    Descriptor { registry: Arc<Registry>, tag: Tag },
    Buffer(Vec<u8>),
}

impl Source {
    fn bytes(&self) -> &[u8] {
        match self {
            Source::Descriptor { registry, tag } => registry
                .find(*tag)
                .map(DescriptorNode::payload)
                .unwrap_or_default(),
            Source::Buffer(bytes) => bytes,
        }
    }
}

enum OutTarget {
    ExitLatencies,
    Functions(Vec<FunctionId>),
}

enum DataStage {
    In { source: Source, offset: usize, length: usize },
    Out { expected: usize, received: Vec<u8>, target: OutTarget },
}

struct PendingTransfer {
    words: SetupWords,
    setup: SetupPacket,
    stage: DataStage,
}

#[derive(Default)]
struct EnumerationState {
    state: DeviceState,
    address: DeviceAddr,
    configuration: u8,
    remote_wakeup: bool,
    exit_latencies: Option<[u8; EXIT_LATENCIES_LENGTH]>,
    pending: Option<PendingTransfer>,
    sequence: u64,
}

impl EnumerationState {
    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            state: self.state,
            address: self.address,
            configuration: self.configuration,
            remote_wakeup: self.remote_wakeup,
            exit_latencies: self.exit_latencies,
            transfer_pending: self.pending.is_some(),
        }
    }
}

enum Transition {
    Address(DeviceAddr),
    Configure { value: u8, registry: Arc<Registry> },
    Deconfigure,
    RemoteWakeup(bool),
    ExitLatencies([u8; EXIT_LATENCIES_LENGTH]),
}

enum Reply {
    Data(Source),
    Receive(OutTarget),
    Status,
    Change(Transition),
}

pub struct Enumerator<C, I> {
    device: DeviceSpec,
    functions: Vec<FunctionSpec>,
    controller: C,
    registry: ArcSwap<Registry>,
    state: IrqLock<EnumerationState, I>,
    generation: AtomicU64,
    stats: Statistics,
}

impl<C: Controller, I: InterruptControl> Enumerator<C, I> {
    /// Assemble the device's descriptors and start in the Default state.
    pub fn new(device: DeviceSpec,
               functions: Vec<FunctionSpec>,
               controller: C,
               interrupts: I)
        -> Result<Self, AssemblyError>
    {
        let mut registry = assemble_for(&device, &functions, None)?;
        registry.set_generation(1);
        Ok(Enumerator {
            device,
            functions,
            controller,
            registry: ArcSwap::from_pointee(registry),
            state: IrqLock::new(EnumerationState::default(), interrupts),
            generation: AtomicU64::new(1),
            stats: Statistics::default(),
        })
    }

    /// Snapshot of the current registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.load_full()
    }

    pub fn functions(&self) -> &[FunctionSpec] {
        &self.functions
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().status()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Rebuild the registry for the selected configuration and swap it in.
    ///
    /// Reads already under way continue from the registry they started on.
    /// Returns the generation of the new registry.
    pub fn reassemble(&self) -> Result<u64, AssemblyError> {
        let selected = self.registry.load().selected().entry.value;
        let registry = Arc::new(self.assemble(selected)?);
        let generation = registry.generation();
        {
            let _state = self.state.lock();
            self.registry.store(registry);
        }
        self.stats.swap();
        info!("Registry generation {generation} swapped in");
        Ok(generation)
    }

    /// Return to the Default state, as after a reset signalled on the bus.
    pub fn bus_reset(&self) {
        let (previous, abandoned) = {
            let mut state = self.state.lock();
            let abandoned = state.pending.take();
            let previous = state.configuration;
            *state = EnumerationState {
                sequence: state.sequence.wrapping_add(1),
                ..EnumerationState::default()
            };
            (previous, abandoned)
        };
        if abandoned.is_some() {
            self.stats.abort();
        }
        info!("Bus reset");
        if previous != 0 {
            self.controller.disable_endpoints();
            self.notify_deconfigured(&self.registry.load());
        }
    }

    /// Handle a SETUP packet. Any transfer still in progress is abandoned.
    pub fn handle_setup(&self, bytes: &[u8; 8]) -> ControlOutcome {
        let setup = SetupPacket::decode(bytes);
        self.stats.setup();
        debug!("SETUP: {}", setup.summary());

        let (sequence, current, abandoned) = {
            let mut state = self.state.lock();
            let abandoned = state.pending.take();
            state.sequence = state.sequence.wrapping_add(1);
            (state.sequence, state.status(), abandoned)
        };
        if let Some(pending) = abandoned {
            self.stats.abort();
            debug!("Abandoned data stage of: {}", pending.setup.summary());
        }

        let reply = match setup.request_type() {
            RequestType::Standard => self.standard_request(&setup, &current),
            RequestType::Class | RequestType::Vendor =>
                self.function_request(&setup, &current),
            RequestType::Reserved => Err(Stall::Unsupported),
        };
        match reply {
            Ok(reply) => self.complete(sequence, &setup, reply),
            Err(reason) => self.stall(&setup, reason),
        }
    }

    /// Fetch the next packet of an IN data stage into `packet`.
    ///
    /// `current` is the SETUP the driver is servicing; if it is not the one
    /// this data stage belongs to, the stage is abandoned and nothing is
    /// copied. A packet shorter than `packet` ends the stage, including a
    /// zero-length one when the response is shorter than requested.
    pub fn read_in(&self, current: SetupWords, packet: &mut [u8])
        -> Result<usize, Stall>
    {
        let (count, sent, length) = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.as_mut() else {
                return Err(Stall::NoDataStage);
            };
            if pending.words != current {
                let abandoned = state.pending.take();
                drop(state);
                drop(abandoned);
                self.stats.abort();
                debug!("IN data stage superseded");
                return Err(Stall::Superseded);
            }
            let requested = pending.setup.length as usize;
            let DataStage::In { source, offset, length } = &mut pending.stage
            else {
                return Err(Stall::NoDataStage);
            };
            if packet.is_empty() {
                return Ok(0);
            }
            let count = packet.len().min(*length - *offset);
            packet[..count]
                .copy_from_slice(&source.bytes()[*offset..][..count]);
            *offset += count;
            let progress = (count, *offset, *length);
            let finished = count < packet.len() ||
                (*offset == *length && *length == requested);
            if finished {
                state.pending = None;
            }
            progress
        };
        trace!("IN data stage: {sent} of {length} bytes");
        self.stats.sent(count);
        Ok(count)
    }

    /// Deliver OUT data-stage bytes. Once all have arrived the request is
    /// carried out.
    pub fn write_out(&self, current: SetupWords, data: &[u8])
        -> ControlOutcome
    {
        let mut state = self.state.lock();
        let Some(mut pending) = state.pending.take() else {
            return ControlOutcome::Stall(Stall::NoDataStage);
        };
        if pending.words != current {
            drop(state);
            self.stats.abort();
            debug!("OUT data stage superseded");
            return self.stall(&pending.setup, Stall::Superseded);
        }
        let DataStage::Out { expected, received, .. } = &mut pending.stage else {
            state.pending = Some(pending);
            return ControlOutcome::Stall(Stall::NoDataStage);
        };
        let room = *expected - received.len();
        received.extend_from_slice(&data[..data.len().min(room)]);
        let (arrived, expected) = (received.len(), *expected);
        if arrived < expected {
            state.pending = Some(pending);
            drop(state);
            trace!("OUT data stage: {arrived} of {expected} bytes");
            return ControlOutcome::ReceiveData(expected - arrived);
        }
        let sequence = state.sequence;
        drop(state);
        trace!("OUT data stage: {arrived} of {expected} bytes");

        let PendingTransfer { setup, stage, .. } = pending;
        let DataStage::Out { received, target, .. } = stage else {
            return ControlOutcome::Stall(Stall::NoDataStage);
        };
        let reply = match target {
            OutTarget::ExitLatencies => <[u8; EXIT_LATENCIES_LENGTH]>::try_from(received)
                .map(|latencies| Reply::Change(Transition::ExitLatencies(latencies)))
                .map_err(|data| Stall::InvalidValue(data.len() as u16)),
            OutTarget::Functions(candidates) =>
                self.offer_out(&candidates, &setup, &received)
                    .map(|()| Reply::Status),
        };
        match reply {
            Ok(reply) => self.complete(sequence, &setup, reply),
            Err(reason) => self.stall(&setup, reason),
        }
    }

    fn assemble(&self, selected: u8) -> Result<Registry, AssemblyError> {
        let mut registry =
            assemble_for(&self.device, &self.functions, Some(selected))?;
        registry.set_generation(self.generation.fetch_add(1, Relaxed) + 1);
        Ok(registry)
    }

    fn stall(&self, setup: &SetupPacket, reason: Stall) -> ControlOutcome {
        self.stats.stall();
        match &reason {
            Stall::Hook(HookFailure::Failed(_)) | Stall::Assembly(_) =>
                warn!("Stalled {}: {reason}", setup.summary()),
            _ => debug!("Stalled {}: {reason}", setup.summary()),
        }
        ControlOutcome::Stall(reason)
    }

    /// Apply the outcome of a request, unless a newer SETUP has arrived
    /// since it was received.
    fn complete(&self, sequence: u64, setup: &SetupPacket, reply: Reply)
        -> ControlOutcome
    {
        let mut state = self.state.lock();
        if state.sequence != sequence {
            drop(state);
            return self.stall(setup, Stall::Superseded);
        }
        let pending = |stage| PendingTransfer {
            words: setup.words(),
            setup: *setup,
            stage,
        };
        match reply {
            Reply::Status => ControlOutcome::Status,
            Reply::Data(_) if setup.length == 0 => ControlOutcome::Status,
            Reply::Data(source) => {
                let length = source.bytes().len().min(setup.length as usize);
                state.pending = Some(pending(
                    DataStage::In { source, offset: 0, length }));
                ControlOutcome::Data(length)
            },
            Reply::Receive(target) => {
                let expected = setup.length as usize;
                state.pending = Some(pending(DataStage::Out {
                    expected,
                    received: Vec::with_capacity(expected),
                    target,
                }));
                ControlOutcome::ReceiveData(expected)
            },
            Reply::Change(Transition::Address(address)) => {
                state.address = address;
                state.state = if address.0 == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                };
                drop(state);
                info!("Address set to {}", address.0);
                self.controller.set_address(address);
                ControlOutcome::Status
            },
            Reply::Change(Transition::Configure { value, registry }) => {
                let previous_registry = self.registry.load_full();
                let swapped = !Arc::ptr_eq(&previous_registry, &registry);
                if swapped {
                    self.registry.store(registry.clone());
                }
                let previous = state.configuration;
                state.configuration = value;
                state.state = DeviceState::Configured;
                drop(state);
                if swapped {
                    self.stats.swap();
                    info!("Registry generation {} swapped in",
                          registry.generation());
                }
                info!("Configuration {value} selected");
                if previous != 0 {
                    self.notify_deconfigured(&previous_registry);
                }
                self.notify_configured(&registry);
                ControlOutcome::Status
            },
            Reply::Change(Transition::Deconfigure) => {
                let previous = state.configuration;
                state.configuration = 0;
                state.state = DeviceState::Addressed;
                drop(state);
                if previous != 0 {
                    info!("Configuration {previous} deselected");
                    self.controller.disable_endpoints();
                    self.notify_deconfigured(&self.registry.load());
                }
                ControlOutcome::Status
            },
            Reply::Change(Transition::RemoteWakeup(enabled)) => {
                state.remote_wakeup = enabled;
                ControlOutcome::Status
            },
            Reply::Change(Transition::ExitLatencies(latencies)) => {
                state.exit_latencies = Some(latencies);
                ControlOutcome::Status
            },
        }
    }

    fn notify_configured(&self, registry: &Registry) {
        let selected = registry.selected();
        for id in &selected.functions {
            let handles: Vec<EndpointHandle> = selected
                .endpoints()
                .filter(|route| route.function == *id)
                .map(|route| route.handle)
                .collect();
            if let Some(function) = self.functions.get(id.0) {
                function.gadget.configured(selected.entry.value, &handles);
            }
        }
    }

    fn notify_deconfigured(&self, registry: &Registry) {
        for id in &registry.selected().functions {
            if let Some(function) = self.functions.get(id.0) {
                function.gadget.deconfigured();
            }
        }
    }

    fn function(&self, id: FunctionId) -> Result<&FunctionSpec, Stall> {
        self.functions.get(id.0).ok_or(Stall::Unsupported)
    }

    fn interface_owner(&self,
                       registry: &Registry,
                       setup: &SetupPacket,
                       current: &DeviceStatus)
        -> Result<(InterfaceNum, FunctionId), Stall>
    {
        if current.state != DeviceState::Configured {
            return Err(Stall::WrongState(current.state));
        }
        let number = setup.interface()
            .ok_or(Stall::InvalidValue(setup.index))?;
        let route = registry.interface(number)
            .ok_or(Stall::UnknownInterface(number.0))?;
        Ok((number, route.function))
    }

    fn endpoint_route<'r>(&self,
                          registry: &'r Registry,
                          address: EndpointAddr,
                          current: &DeviceStatus)
        -> Result<&'r EndpointRoute, Stall>
    {
        if current.state != DeviceState::Configured {
            return Err(Stall::WrongState(current.state));
        }
        registry.endpoint(address)
            .filter(|route| route.handle.address == address)
            .ok_or(Stall::UnknownEndpoint(address))
    }

    /// An endpoint whose halt feature the host may access: the default
    /// control endpoint, or one of the active configuration.
    fn halt_target(&self,
                   registry: &Registry,
                   address: EndpointAddr,
                   current: &DeviceStatus)
        -> Result<EndpointAddr, Stall>
    {
        if address == EndpointAddr::CONTROL_OUT ||
           address == EndpointAddr::CONTROL_IN
        {
            return Ok(address);
        }
        self.endpoint_route(registry, address, current)
            .map(|route| route.handle.address)
    }

    fn standard_request(&self, setup: &SetupPacket, current: &DeviceStatus)
        -> Result<Reply, Stall>
    {
        use StandardRequest::*;
        let registry = self.registry.load_full();
        match (setup.standard_request(), setup.recipient()) {
            (GetDescriptor, Recipient::Device) => {
                let tag = setup.descriptor_tag();
                if registry.find(tag).is_none() {
                    return Err(Stall::UnknownDescriptor(tag));
                }
                Ok(Reply::Data(Source::Descriptor { registry, tag }))
            },
            (GetDescriptor, Recipient::Interface) => {
                let (number, id) =
                    self.interface_owner(&registry, setup, current)?;
                let bytes = self.function(id)?.gadget
                    .get_descriptor(number, setup)
                    .map_err(Stall::Hook)?;
                Ok(Reply::Data(Source::Buffer(bytes)))
            },
            (SetAddress, Recipient::Device) => {
                if setup.value > MAX_ADDRESS as u16 {
                    return Err(Stall::InvalidValue(setup.value));
                }
                if current.state == DeviceState::Configured {
                    return Err(Stall::WrongState(current.state));
                }
                let address = DeviceAddr(setup.value as u8);
                Ok(Reply::Change(Transition::Address(address)))
            },
            (GetConfiguration, Recipient::Device) =>
                Ok(Reply::Data(Source::Buffer(vec![current.configuration]))),
            (SetConfiguration, Recipient::Device) =>
                self.set_configuration(setup, current, registry),
            (GetStatus, recipient) => {
                let status = match recipient {
                    Recipient::Device => {
                        let mut status = 0u16;
                        if registry.selected().entry.self_powered() {
                            status |= 1;
                        }
                        if current.remote_wakeup {
                            status |= 2;
                        }
                        status
                    },
                    Recipient::Interface => {
                        let (number, id) =
                            self.interface_owner(&registry, setup, current)?;
                        self.function(id)?.gadget
                            .interface_status(number)
                            .map_err(Stall::Hook)?
                    },
                    Recipient::Endpoint => {
                        let address = self.halt_target(
                            &registry, requested_endpoint(setup)?, current)?;
                        self.controller.halted(address)
                            .map_err(Stall::Hook)? as u16
                    },
                    _ => return Err(Stall::Unsupported),
                };
                Ok(Reply::Data(Source::Buffer(status.to_le_bytes().to_vec())))
            },
            (SetFeature, _) => self.feature(setup, current, &registry, true),
            (ClearFeature, _) => self.feature(setup, current, &registry, false),
            (GetInterface, Recipient::Interface) => {
                self.interface_owner(&registry, setup, current)?;
                Ok(Reply::Data(Source::Buffer(vec![0])))
            },
            (SetInterface, Recipient::Interface) => {
                let (number, id) =
                    self.interface_owner(&registry, setup, current)?;
                if setup.value != 0 {
                    return Err(Stall::InvalidValue(setup.value));
                }
                self.function(id)?.gadget
                    .set_alternate(number, 0)
                    .map_err(Stall::Hook)?;
                Ok(Reply::Status)
            },
            (SynchFrame, Recipient::Endpoint) => {
                let address = requested_endpoint(setup)?;
                let route = self.endpoint_route(&registry, address, current)?;
                if route.handle.transfer_type != EndpointType::Isochronous {
                    return Err(Stall::Unsupported);
                }
                let frame = self.function(route.function)?.gadget
                    .synch_frame(address)
                    .map_err(Stall::Hook)?;
                Ok(Reply::Data(Source::Buffer(frame.to_le_bytes().to_vec())))
            },
            (SetSel, Recipient::Device) => {
                if current.state == DeviceState::Default {
                    return Err(Stall::WrongState(current.state));
                }
                if setup.length as usize != EXIT_LATENCIES_LENGTH {
                    return Err(Stall::InvalidValue(setup.length));
                }
                Ok(Reply::Receive(OutTarget::ExitLatencies))
            },
            _ => Err(Stall::Unsupported),
        }
    }

    fn set_configuration(&self,
                         setup: &SetupPacket,
                         current: &DeviceStatus,
                         registry: Arc<Registry>)
        -> Result<Reply, Stall>
    {
        if current.state == DeviceState::Default {
            return Err(Stall::WrongState(current.state));
        }
        let value = u8::try_from(setup.value)
            .map_err(|_| Stall::InvalidValue(setup.value))?;
        if value == 0 {
            return Ok(Reply::Change(Transition::Deconfigure));
        }
        if registry.configuration(value).is_none() {
            return Err(Stall::UnknownConfiguration(value));
        }
        let registry = if registry.selected().entry.value == value {
            registry
        } else {
            Arc::new(self.assemble(value).map_err(Stall::Assembly)?)
        };
        let handles: Vec<EndpointHandle> = registry
            .selected()
            .endpoints()
            .map(|route| route.handle)
            .collect();
        self.controller.enable_endpoints(&handles).map_err(Stall::Hook)?;
        Ok(Reply::Change(Transition::Configure { value, registry }))
    }

    fn feature(&self,
               setup: &SetupPacket,
               current: &DeviceStatus,
               registry: &Registry,
               set: bool)
        -> Result<Reply, Stall>
    {
        match (setup.recipient(), setup.value) {
            (Recipient::Device, DEVICE_REMOTE_WAKEUP) => {
                if !registry.selected().entry.remote_wakeup() {
                    return Err(Stall::Unsupported);
                }
                Ok(Reply::Change(Transition::RemoteWakeup(set)))
            },
            (Recipient::Endpoint, ENDPOINT_HALT) => {
                let address =
                    self.halt_target(registry, requested_endpoint(setup)?, current)?;
                self.controller.set_halt(address, set).map_err(Stall::Hook)?;
                Ok(Reply::Status)
            },
            (Recipient::Interface, feature) => {
                let (number, id) =
                    self.interface_owner(registry, setup, current)?;
                self.function(id)?.gadget
                    .interface_feature(number, feature, set)
                    .map_err(Stall::Hook)?;
                Ok(Reply::Status)
            },
            _ => Err(Stall::Unsupported),
        }
    }

    /// Route a class or vendor request to the function it is meant for.
    fn function_request(&self, setup: &SetupPacket, current: &DeviceStatus)
        -> Result<Reply, Stall>
    {
        let registry = self.registry.load();
        let candidates = match setup.recipient() {
            Recipient::Interface =>
                vec![self.interface_owner(&registry, setup, current)?.1],
            Recipient::Endpoint =>
                vec![self.endpoint_route(
                        &registry, requested_endpoint(setup)?, current)?
                        .function],
            // Offered to each function in turn, first taker answers.
            Recipient::Device => registry.selected().functions.clone(),
            _ => return Err(Stall::Unsupported),
        };
        match (setup.direction(), setup.length) {
            (Direction::In, _) => {
                for id in candidates {
                    match self.function(id)?.gadget.control_in(setup) {
                        Ok(bytes) => return Ok(Reply::Data(Source::Buffer(bytes))),
                        Err(HookFailure::Unhandled) => continue,
                        Err(failure) => return Err(Stall::Hook(failure)),
                    }
                }
                Err(Stall::Hook(HookFailure::Unhandled))
            },
            (Direction::Out, 0) => {
                self.offer_out(&candidates, setup, &[])?;
                Ok(Reply::Status)
            },
            (Direction::Out, _) =>
                Ok(Reply::Receive(OutTarget::Functions(candidates))),
        }
    }

    fn offer_out(&self,
                 candidates: &[FunctionId],
                 setup: &SetupPacket,
                 data: &[u8])
        -> Result<(), Stall>
    {
        for id in candidates {
            match self.function(*id)?.gadget.control_out(setup, data) {
                Ok(()) => return Ok(()),
                Err(HookFailure::Unhandled) => continue,
                Err(failure) => return Err(Stall::Hook(failure)),
            }
        }
        Err(Stall::Hook(HookFailure::Unhandled))
    }
}

fn requested_endpoint(setup: &SetupPacket) -> Result<EndpointAddr, Stall> {
    setup.endpoint().ok_or(Stall::InvalidValue(setup.index))
}
