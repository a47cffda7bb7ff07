//! Parameter Catalogue
//!
//! Named amplifier controls and their device addresses. The default table
//! follows the Cube's 4-byte address layout:
//!
//! ```text
//! 00 01 00 00       : preset / channel select
//! 20 00 00 xx       : amp block (type, gain, volume, EQ, presence)
//! 20 00 01 xx       : effect block (reverb, delay, modulation)
//! 7F 00 00 00       : tuner on/off
//! ```
//!
//! The table can be replaced from settings for other firmware revisions.

use crate::infrastructure::midi::sysex::Address;
use serde::{Deserialize, Serialize};

pub const PRESET: &str = "preset";
pub const TUNER_ON: &str = "tuner_on";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub address: Address,
    #[serde(default)]
    pub min: u8,
    pub max: u8,
}

impl ParameterDef {
    pub fn contains(&self, value: u8) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterCatalogue {
    defs: Vec<ParameterDef>,
}

impl ParameterCatalogue {
    pub fn new(defs: Vec<ParameterDef>) -> Self {
        Self { defs }
    }

    pub fn by_name(&self, name: &str) -> Option<&ParameterDef> {
        self.defs.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn by_address(&self, address: &Address) -> Option<&ParameterDef> {
        self.defs.iter().find(|d| d.address == *address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDef> {
        self.defs.iter()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Resolve a console argument: a parameter name or a hex address
    pub fn resolve(&self, key: &str) -> Option<Address> {
        self.by_name(key)
            .map(|d| d.address)
            .or_else(|| key.parse().ok())
    }
}

fn def(name: &str, address: [u8; 4], min: u8, max: u8) -> ParameterDef {
    ParameterDef {
        name: name.to_string(),
        address: Address::from_u7(address),
        min,
        max,
    }
}

pub fn default_parameters() -> Vec<ParameterDef> {
    vec![
        def(PRESET, [0x00, 0x01, 0x00, 0x00], 0, 7),
        def("amp_type", [0x20, 0x00, 0x00, 0x00], 0, 9),
        def("gain", [0x20, 0x00, 0x00, 0x01], 0, 100),
        def("volume", [0x20, 0x00, 0x00, 0x02], 0, 100),
        def("bass", [0x20, 0x00, 0x00, 0x03], 0, 100),
        def("middle", [0x20, 0x00, 0x00, 0x04], 0, 100),
        def("treble", [0x20, 0x00, 0x00, 0x05], 0, 100),
        def("presence", [0x20, 0x00, 0x00, 0x06], 0, 100),
        def("reverb_on", [0x20, 0x00, 0x01, 0x00], 0, 1),
        def("reverb_level", [0x20, 0x00, 0x01, 0x01], 0, 100),
        def("delay_on", [0x20, 0x00, 0x01, 0x02], 0, 1),
        def("delay_level", [0x20, 0x00, 0x01, 0x03], 0, 100),
        def("mod_on", [0x20, 0x00, 0x01, 0x04], 0, 1),
        def(TUNER_ON, [0x7F, 0x00, 0x00, 0x00], 0, 1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalogue_is_consistent() {
        let catalogue = ParameterCatalogue::new(default_parameters());
        assert!(catalogue.by_name(PRESET).is_some());
        assert!(catalogue.by_name(TUNER_ON).is_some());
        for d in catalogue.iter() {
            assert!(d.min <= d.max && d.max < 0x80, "{}", d.name);
            assert_eq!(d.address.len(), 4);
        }
        let mut addresses: Vec<_> = catalogue.iter().map(|d| d.address).collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), catalogue.len());
    }

    #[test]
    fn test_resolve_by_name_or_address() {
        let catalogue = ParameterCatalogue::new(default_parameters());
        let gain = catalogue.resolve("GAIN").unwrap();
        assert_eq!(gain.as_bytes(), &[0x20, 0x00, 0x00, 0x01]);
        assert_eq!(catalogue.resolve("20 00 00 01"), Some(gain));
        assert_eq!(catalogue.resolve("not_a_param"), None);
    }

    #[test]
    fn test_definitions_deserialize_from_settings() {
        let json = r#"{ "name": "gain", "address": "01 02", "max": 127 }"#;
        let d: ParameterDef = serde_json::from_str(json).unwrap();
        assert_eq!(d.address.as_bytes(), &[0x01, 0x02]);
        assert_eq!(d.min, 0);
        assert!(d.contains(127));
    }
}
