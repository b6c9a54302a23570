//! The 8-byte SETUP packet that starts every control transfer.

use bytemuck_derive::{Pod, Zeroable};

use crate::descriptor::Tag;
use crate::usb::{
    Direction,
    EndpointAddr,
    InterfaceNum,
    Recipient,
    RequestType,
    RequestTypeFields,
    StandardRequest,
};

/// The SETUP packet as two little-endian machine words.
///
/// Only ever compared for equality: a driver reads these from its setup
/// buffer to find out whether a new SETUP has replaced the one whose data
/// stage it is servicing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SetupWords {
    pub w0: u32,
    pub w1: u32,
}

impl SetupWords {
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        SetupWords {
            w0: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            w1: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0..4].copy_from_slice(&self.w0.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.w1.to_le_bytes());
        bytes
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub type_fields: RequestTypeFields,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Decode a SETUP packet. Every input is accepted; whether the request
    /// makes sense is for the dispatcher to decide.
    pub fn decode(bytes: &[u8; 8]) -> Self {
        SetupPacket {
            type_fields: RequestTypeFields(bytes[0]),
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn from_words(words: SetupWords) -> Self {
        Self::decode(&words.to_bytes())
    }

    pub fn new(request_type: u8, request: u8, value: u16, index: u16,
               length: u16)
        -> Self
    {
        SetupPacket {
            type_fields: RequestTypeFields(request_type),
            request,
            value,
            index,
            length,
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = self.type_fields.0;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn words(&self) -> SetupWords {
        SetupWords::from_bytes(&self.to_bytes())
    }

    pub fn direction(&self) -> Direction {
        self.type_fields.direction()
    }

    pub fn request_type(&self) -> RequestType {
        self.type_fields.request_type()
    }

    pub fn recipient(&self) -> Recipient {
        self.type_fields.recipient()
    }

    pub fn standard_request(&self) -> StandardRequest {
        StandardRequest::from(self.request)
    }

    /// The descriptor named by a GET_DESCRIPTOR request.
    pub fn descriptor_tag(&self) -> Tag {
        Tag(self.value)
    }

    /// Interface addressed by an interface-recipient request. None if
    /// wIndex does not fit an interface number.
    pub fn interface(&self) -> Option<InterfaceNum> {
        u8::try_from(self.index).ok().map(InterfaceNum)
    }

    /// Endpoint addressed by an endpoint-recipient request. None if wIndex
    /// does not fit an endpoint address.
    pub fn endpoint(&self) -> Option<EndpointAddr> {
        u8::try_from(self.index).ok().map(EndpointAddr)
    }

    pub fn summary(&self) -> String {
        let request_type = self.request_type();
        let description = match request_type {
            RequestType::Standard =>
                self.standard_request().description(self),
            _ => format!(
                "{:?} request #{}, index {}, value {}",
                request_type, self.request, self.index, self.value),
        };
        let target = match self.recipient() {
            Recipient::Device => "for device".to_string(),
            Recipient::Interface => match self.interface() {
                Some(number) => format!("for interface {number}"),
                None => format!("for interface index 0x{:04X}", self.index),
            },
            Recipient::Endpoint => match self.endpoint() {
                Some(address) => format!("for endpoint {address}"),
                None => format!("for endpoint index 0x{:04X}", self.index),
            },
            _ => "for unknown recipient".to_string(),
        };
        match (self.length, self.direction()) {
            (0, _) => format!("{description} {target}"),
            (len, Direction::In) =>
                format!("{description} {target}, reading {len} bytes"),
            (len, Direction::Out) =>
                format!("{description} {target}, writing {len} bytes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{DEVICE_READ, GET_DESCRIPTOR, TYPE_DEVICE};

    #[test]
    fn test_decode_get_descriptor() {
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        let setup = SetupPacket::decode(&bytes);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.request_type(), RequestType::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!(setup.standard_request(), StandardRequest::GetDescriptor);
        assert_eq!(setup.descriptor_tag(), Tag::new(TYPE_DEVICE, 0));
        assert_eq!(setup.length, 64);
        assert_eq!(setup.to_bytes(), bytes);
        assert_eq!(
            setup,
            SetupPacket::new(DEVICE_READ, GET_DESCRIPTOR, 0x0100, 0, 64));
    }

    #[test]
    fn test_words_match_bytes() {
        let bytes = [0x21, 0x20, 0x00, 0x00, 0x02, 0x00, 0x07, 0x00];
        let words = SetupWords::from_bytes(&bytes);
        assert_eq!(words.w0, 0x0000_2021);
        assert_eq!(words.w1, 0x0007_0002);
        assert_eq!(words.to_bytes(), bytes);
        let setup = SetupPacket::from_words(words);
        assert_eq!(setup.words(), words);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.request_type(), RequestType::Class);
        assert_eq!(setup.interface(), Some(InterfaceNum(2)));
        assert_eq!(setup.endpoint(), Some(EndpointAddr(2)));
    }

    #[test]
    fn test_decode_is_total() {
        for first in [0x00, 0x1F, 0x60, 0x7F, 0xFF] {
            let setup = SetupPacket::decode(&[first, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]);
            assert_eq!(setup.type_fields.0, first);
            let _ = setup.summary();
        }
        let setup = SetupPacket::decode(&[0x60, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(setup.request_type(), RequestType::Reserved);
    }

    #[test]
    fn test_summary() {
        let setup = SetupPacket::new(0x00, 0x05, 5, 0, 0);
        assert_eq!(setup.summary(), "Setting address to 5 for device");
        let setup = SetupPacket::new(0x80, 0x06, 0x0302, 0x0409, 255);
        assert_eq!(
            setup.summary(),
            "Getting string descriptor #2, language 0x0409 for device, \
             reading 255 bytes");
    }
}
