//! Loading device descriptions from JSON.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::assembler::{assemble, AssemblyError, DeviceSpec, FunctionSpec};
use crate::descriptor::Registry;

/// A device and the functions its configurations refer to.
///
/// Functions loaded this way answer no class requests of their own; attach
/// handlers with `FunctionSpec::with_gadget` before enumerating.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub device: DeviceSpec,
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

impl DeviceDescription {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json)
            .context("Failed to parse device description")
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .context("Failed to serialize device description")
    }

    pub fn assemble(&self) -> Result<Registry, AssemblyError> {
        assemble(&self.device, &self.functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Capability;
    use crate::descriptor::Tag;
    use crate::testing::{composite_device, composite_functions};
    use crate::usb::{Direction, EndpointType, Speed, TYPE_DEVICE_CAP};

    const KEYBOARD: &str = r#"{
        "device": {
            "vendor_id": 4617,
            "product_id": 2,
            "product": "Keyboard",
            "speed": "high",
            "max_packet_size_0": 64,
            "configurations": [ { "value": 1, "functions": [0] } ]
        },
        "functions": [
            {
                "name": "hid",
                "interfaces": [
                    { "class": 3, "subclass": 1, "protocol": 1, "endpoints": [0],
                      "class_descriptors": [9, 33, 17, 1, 0, 1, 34, 63, 0] }
                ],
                "endpoints": [
                    { "direction": "in", "transfer_type": "interrupt",
                      "max_packet_size": 8, "interval": 10 }
                ],
                "capabilities": [ { "type": "usb2_extension", "lpm": true } ]
            }
        ]
    }"#;

    #[test]
    fn test_load_keyboard() {
        let description = DeviceDescription::from_json(KEYBOARD).unwrap();
        assert_eq!(description.device.speed, Speed::High);
        assert_eq!(description.device.languages, vec![0x0409]);
        let endpoint = &description.functions[0].endpoints[0];
        assert_eq!(endpoint.direction, Direction::In);
        assert_eq!(endpoint.transfer_type, EndpointType::Interrupt);
        assert_eq!(endpoint.number, None);
        assert_eq!(description.functions[0].capabilities,
                   vec![Capability::Usb2Extension { lpm: true }]);

        let registry = description.assemble().unwrap();
        assert_eq!(registry.selected().entry.value, 1);
        assert!(registry.find(Tag::new(TYPE_DEVICE_CAP, 0)).is_some());
    }

    #[test]
    fn test_json_round_trip() {
        let description = DeviceDescription {
            device: composite_device(),
            functions: composite_functions(),
        };
        let json = description.to_json().unwrap();
        let reloaded = DeviceDescription::from_json(&json).unwrap();
        assert_eq!(reloaded.device, description.device);
        assert_eq!(reloaded.assemble().unwrap().nodes(),
                   description.assemble().unwrap().nodes());
    }

    #[test]
    fn test_parse_error() {
        let error = DeviceDescription::from_json(r#"{ "device": 5 }"#)
            .unwrap_err();
        assert!(error.to_string().contains("Failed to parse"));
    }
}
