//! Extension points implemented by each function of a composite device.

use std::mem::size_of;

use derive_more::{Display, From, Into};
use thiserror::Error;

use crate::setup::SetupPacket;
use crate::usb::{
    descriptor_bytes,
    EndpointAddr,
    EndpointAttr,
    EndpointDescriptor,
    EndpointType,
    InterfaceNum,
    Speed,
    TYPE_ENDPOINT,
};

pub const ENDPOINT_DESCRIPTOR_LENGTH: usize = size_of::<EndpointDescriptor>();

/// Position of a function in the list the device was assembled from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
         From, Into, Display)]
pub struct FunctionId(pub usize);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookFailure {
    #[error("request not handled")]
    Unhandled,
    #[error("{0}")]
    Failed(String),
}

/// Everything a fill hook needs to know about one endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointHandle {
    pub function: FunctionId,
    pub address: EndpointAddr,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    pub speed: Speed,
}

impl EndpointHandle {
    /// The standard endpoint descriptor for this endpoint, with the max
    /// packet size limited to what the device speed allows.
    pub fn descriptor(&self) -> Result<EndpointDescriptor, HookFailure> {
        let limit = self.speed.max_packet_size(self.transfer_type);
        if limit == 0 {
            return Err(HookFailure::Failed(format!(
                "{} endpoints are not available at {} speed",
                self.transfer_type, self.speed.description())));
        }
        Ok(EndpointDescriptor {
            length: ENDPOINT_DESCRIPTOR_LENGTH as u8,
            descriptor_type: TYPE_ENDPOINT,
            endpoint_address: self.address,
            attributes: EndpointAttr(self.transfer_type.into()),
            max_packet_size: self.max_packet_size.min(limit).to_le(),
            interval: self.interval,
        })
    }
}

/// Writes the descriptor of one of a function's endpoints.
///
/// Only called while descriptors are being assembled, never while control
/// requests are being served.
pub trait EndpointFill {
    fn fill(&self,
            endpoint: &EndpointHandle,
            data: &mut [u8; ENDPOINT_DESCRIPTOR_LENGTH])
        -> Result<(), HookFailure>
    {
        let descriptor = endpoint.descriptor()?;
        data.copy_from_slice(descriptor_bytes(&descriptor));
        Ok(())
    }
}

/// Handler for the requests a function answers itself.
///
/// Every method has a default, so a function only implements what its class
/// needs. Returning `HookFailure::Unhandled` stalls the request.
pub trait Gadget: EndpointFill + Send + Sync {
    /// Class or vendor request with an IN data stage.
    fn control_in(&self, _setup: &SetupPacket)
        -> Result<Vec<u8>, HookFailure>
    {
        Err(HookFailure::Unhandled)
    }

    /// Class or vendor request with an OUT data stage, or none.
    fn control_out(&self, _setup: &SetupPacket, _data: &[u8])
        -> Result<(), HookFailure>
    {
        Err(HookFailure::Unhandled)
    }

    /// GET_DESCRIPTOR addressed to one of the function's interfaces, e.g. a
    /// HID report descriptor.
    fn get_descriptor(&self, _interface: InterfaceNum, _setup: &SetupPacket)
        -> Result<Vec<u8>, HookFailure>
    {
        Err(HookFailure::Unhandled)
    }

    fn interface_status(&self, _interface: InterfaceNum)
        -> Result<u16, HookFailure>
    {
        Ok(0)
    }

    fn interface_feature(&self, _interface: InterfaceNum, _feature: u16,
                         _set: bool)
        -> Result<(), HookFailure>
    {
        Err(HookFailure::Unhandled)
    }

    fn set_alternate(&self, _interface: InterfaceNum, _alternate: u8)
        -> Result<(), HookFailure>
    {
        Ok(())
    }

    fn synch_frame(&self, _endpoint: EndpointAddr)
        -> Result<u16, HookFailure>
    {
        Err(HookFailure::Unhandled)
    }

    /// The configuration containing this function became active.
    fn configured(&self, _configuration: u8, _endpoints: &[EndpointHandle]) {}

    /// The configuration containing this function was left.
    fn deconfigured(&self) {}
}

/// A function with no class behaviour of its own.
#[derive(Copy, Clone, Debug, Default)]
pub struct Passive;

impl EndpointFill for Passive {}

impl Gadget for Passive {}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(transfer_type: EndpointType, speed: Speed) -> EndpointHandle {
        EndpointHandle {
            function: FunctionId(0),
            address: EndpointAddr(0x81),
            transfer_type,
            max_packet_size: 512,
            interval: 0,
            speed,
        }
    }

    #[test]
    fn test_standard_fill() {
        let mut data = [0; ENDPOINT_DESCRIPTOR_LENGTH];
        Passive.fill(&handle(EndpointType::Bulk, Speed::High), &mut data)
            .unwrap();
        assert_eq!(data, [7, 5, 0x81, 2, 0x00, 0x02, 0]);
    }

    #[test]
    fn test_fill_clamps_to_speed() {
        let mut data = [0; ENDPOINT_DESCRIPTOR_LENGTH];
        Passive.fill(&handle(EndpointType::Bulk, Speed::Full), &mut data)
            .unwrap();
        assert_eq!(&data[4..6], &[64, 0]);
    }

    #[test]
    fn test_fill_rejects_low_speed_bulk() {
        let mut data = [0; ENDPOINT_DESCRIPTOR_LENGTH];
        let result =
            Passive.fill(&handle(EndpointType::Bulk, Speed::Low), &mut data);
        assert!(matches!(result, Err(HookFailure::Failed(_))));
    }
}
