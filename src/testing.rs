//! Fixtures shared by the unit tests and the fuzzer: a composite device with
//! a CDC serial function and a mass storage function, a controller that
//! records what it is asked to do, and gadgets that answer a few class
//! requests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::assembler::{
    ConfigurationSpec,
    DeviceSpec,
    EndpointSpec,
    FunctionSpec,
    InterfaceSpec,
};
use crate::controller::Controller;
use crate::enumerator::{Enumerator, Stall};
use crate::gadget::{EndpointFill, EndpointHandle, Gadget, HookFailure};
use crate::irq::{InterruptControl, NoInterrupts};
use crate::setup::SetupPacket;
use crate::usb::{
    DeviceAddr,
    Direction,
    EndpointAddr,
    EndpointType,
    InterfaceNum,
    RequestType,
};

/// 9600 baud, 8N1.
pub const LINE_CODING: [u8; 7] = [0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08];

/// Vendor request code the storage function answers with a signature.
pub const VENDOR_REQUEST: u8 = 0xEE;

const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const GET_MAX_LUN: u8 = 0xFE;
const BULK_ONLY_RESET: u8 = 0xFF;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn composite_device() -> DeviceSpec {
    DeviceSpec {
        device_class: 0xEF,
        device_subclass: 0x02,
        device_protocol: 0x01,
        manufacturer: Some("Gadgetry".to_string()),
        product: Some("Composite Gadget".to_string()),
        serial: Some("0001".to_string()),
        configurations: vec![
            ConfigurationSpec {
                value: 1,
                self_powered: true,
                remote_wakeup: true,
                functions: vec![0, 1],
                ..ConfigurationSpec::default()
            },
            ConfigurationSpec {
                value: 2,
                max_power_ma: 500,
                functions: vec![1],
                ..ConfigurationSpec::default()
            },
        ],
        ..DeviceSpec::default()
    }
}

fn bulk(direction: Direction) -> EndpointSpec {
    EndpointSpec {
        direction,
        transfer_type: EndpointType::Bulk,
        max_packet_size: 512,
        ..EndpointSpec::default()
    }
}

pub fn serial_function() -> FunctionSpec {
    let mut function = FunctionSpec::new("serial");
    function.endpoints = vec![
        EndpointSpec {
            direction: Direction::In,
            transfer_type: EndpointType::Interrupt,
            max_packet_size: 16,
            interval: 16,
            ..EndpointSpec::default()
        },
        bulk(Direction::In),
        bulk(Direction::Out),
    ];
    function.interfaces = vec![
        InterfaceSpec {
            class: 0x02,
            subclass: 0x02,
            protocol: 0x01,
            name: Some("Serial Port".to_string()),
            endpoints: vec![0],
            class_descriptors: vec![
                // Header, call management, ACM and union functionals.
                0x05, 0x24, 0x00, 0x10, 0x01,
                0x05, 0x24, 0x01, 0x00, 0x01,
                0x04, 0x24, 0x02, 0x02,
                0x05, 0x24, 0x06, 0x00, 0x01,
            ],
        },
        InterfaceSpec {
            class: 0x0A,
            endpoints: vec![1, 2],
            ..InterfaceSpec::default()
        },
    ];
    function
}

pub fn storage_function() -> FunctionSpec {
    let mut function = FunctionSpec::new("storage");
    function.endpoints = vec![bulk(Direction::In), bulk(Direction::Out)];
    function.interfaces = vec![
        InterfaceSpec {
            class: 0x08,
            subclass: 0x06,
            protocol: 0x50,
            name: Some("Mass Storage".to_string()),
            endpoints: vec![0, 1],
            ..InterfaceSpec::default()
        },
    ];
    function
}

pub fn composite_functions() -> Vec<FunctionSpec> {
    vec![serial_function(), storage_function()]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    Address(u8),
    Halt(EndpointAddr, bool),
    Enabled(Vec<EndpointAddr>),
    Disabled,
}

#[derive(Default)]
pub struct RecordingController {
    events: Mutex<Vec<ControllerEvent>>,
    halted: Mutex<BTreeSet<EndpointAddr>>,
    fail_enable: AtomicBool,
}

impl RecordingController {
    pub fn events(&self) -> Vec<ControllerEvent> {
        lock(&self.events).clone()
    }

    /// Make subsequent attempts to enable endpoints fail.
    pub fn fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    fn record(&self, event: ControllerEvent) {
        lock(&self.events).push(event);
    }
}

impl Controller for RecordingController {
    fn set_address(&self, address: DeviceAddr) {
        self.record(ControllerEvent::Address(address.0));
    }

    fn set_halt(&self, endpoint: EndpointAddr, halted: bool)
        -> Result<(), HookFailure>
    {
        let mut set = lock(&self.halted);
        if halted {
            set.insert(endpoint);
        } else {
            set.remove(&endpoint);
        }
        drop(set);
        self.record(ControllerEvent::Halt(endpoint, halted));
        Ok(())
    }

    fn halted(&self, endpoint: EndpointAddr) -> Result<bool, HookFailure> {
        Ok(lock(&self.halted).contains(&endpoint))
    }

    fn enable_endpoints(&self, endpoints: &[EndpointHandle])
        -> Result<(), HookFailure>
    {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(HookFailure::Failed(
                "endpoint resources exhausted".to_string()));
        }
        lock(&self.halted).clear();
        self.record(ControllerEvent::Enabled(
            endpoints.iter().map(|handle| handle.address).collect()));
        Ok(())
    }

    fn disable_endpoints(&self) {
        lock(&self.halted).clear();
        self.record(ControllerEvent::Disabled);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GadgetEvent {
    /// Configuration value, and how many endpoints the function was given.
    Configured(u8, usize),
    Deconfigured,
    Alternate(u8, u8),
}

/// Answers the CDC ACM requests a host sends to a serial port.
pub struct SerialGadget {
    line_coding: Mutex<[u8; 7]>,
    events: Mutex<Vec<GadgetEvent>>,
}

impl Default for SerialGadget {
    fn default() -> Self {
        SerialGadget {
            line_coding: Mutex::new(LINE_CODING),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl SerialGadget {
    pub fn line_coding(&self) -> MutexGuard<'_, [u8; 7]> {
        lock(&self.line_coding)
    }

    pub fn events(&self) -> Vec<GadgetEvent> {
        lock(&self.events).clone()
    }
}

impl EndpointFill for SerialGadget {}

impl Gadget for SerialGadget {
    fn control_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, HookFailure> {
        match (setup.request_type(), setup.request) {
            (RequestType::Class, GET_LINE_CODING) =>
                Ok(self.line_coding().to_vec()),
            _ => Err(HookFailure::Unhandled),
        }
    }

    fn control_out(&self, setup: &SetupPacket, data: &[u8])
        -> Result<(), HookFailure>
    {
        match (setup.request_type(), setup.request) {
            (RequestType::Class, SET_LINE_CODING) => {
                let coding = <[u8; 7]>::try_from(data)
                    .map_err(|_| HookFailure::Failed(
                        format!("line coding of {} bytes", data.len())))?;
                *self.line_coding() = coding;
                Ok(())
            },
            (RequestType::Class, SET_CONTROL_LINE_STATE) => Ok(()),
            _ => Err(HookFailure::Unhandled),
        }
    }

    fn set_alternate(&self, interface: InterfaceNum, alternate: u8)
        -> Result<(), HookFailure>
    {
        lock(&self.events).push(GadgetEvent::Alternate(interface.0, alternate));
        Ok(())
    }

    fn configured(&self, configuration: u8, endpoints: &[EndpointHandle]) {
        lock(&self.events).push(
            GadgetEvent::Configured(configuration, endpoints.len()));
    }

    fn deconfigured(&self) {
        lock(&self.events).push(GadgetEvent::Deconfigured);
    }
}

/// Answers the Bulk-Only Transport class requests, and one vendor request.
#[derive(Default)]
pub struct StorageGadget {
    events: Mutex<Vec<GadgetEvent>>,
}

impl StorageGadget {
    pub fn events(&self) -> Vec<GadgetEvent> {
        lock(&self.events).clone()
    }
}

impl EndpointFill for StorageGadget {}

impl Gadget for StorageGadget {
    fn control_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, HookFailure> {
        match (setup.request_type(), setup.request) {
            (RequestType::Class, GET_MAX_LUN) => Ok(vec![0]),
            (RequestType::Vendor, VENDOR_REQUEST) if setup.index == 4 =>
                Ok(b"MSFT".to_vec()),
            _ => Err(HookFailure::Unhandled),
        }
    }

    fn control_out(&self, setup: &SetupPacket, _data: &[u8])
        -> Result<(), HookFailure>
    {
        match (setup.request_type(), setup.request) {
            (RequestType::Class, BULK_ONLY_RESET) => Ok(()),
            _ => Err(HookFailure::Unhandled),
        }
    }

    fn configured(&self, configuration: u8, endpoints: &[EndpointHandle]) {
        lock(&self.events).push(
            GadgetEvent::Configured(configuration, endpoints.len()));
    }

    fn deconfigured(&self) {
        lock(&self.events).push(GadgetEvent::Deconfigured);
    }
}

pub struct Fixture {
    pub enumerator: Enumerator<Arc<RecordingController>, NoInterrupts>,
    pub controller: Arc<RecordingController>,
    pub serial: Arc<SerialGadget>,
    pub storage: Arc<StorageGadget>,
}

/// The composite device, ready to enumerate.
pub fn composite_enumerator() -> Fixture {
    let controller = Arc::new(RecordingController::default());
    let serial = Arc::new(SerialGadget::default());
    let storage = Arc::new(StorageGadget::default());
    let functions = vec![
        serial_function().with_gadget(serial.clone()),
        storage_function().with_gadget(storage.clone()),
    ];
    let enumerator = match Enumerator::new(
        composite_device(), functions, controller.clone(), NoInterrupts)
    {
        Ok(enumerator) => enumerator,
        Err(e) => panic!("Composite device failed to assemble: {e}"),
    };
    Fixture { enumerator, controller, serial, storage }
}

/// Drain the IN data stage of `setup` in packets of `packet_size` bytes.
pub fn read_all<C, I>(enumerator: &Enumerator<C, I>,
                      setup: &[u8; 8],
                      packet_size: usize)
    -> Result<Vec<u8>, Stall>
where C: Controller, I: InterruptControl
{
    let words = SetupPacket::decode(setup).words();
    let mut packet = vec![0; packet_size];
    let mut bytes = Vec::new();
    while enumerator.status().transfer_pending {
        let count = enumerator.read_in(words, &mut packet)?;
        bytes.extend_from_slice(&packet[..count]);
    }
    Ok(bytes)
}
