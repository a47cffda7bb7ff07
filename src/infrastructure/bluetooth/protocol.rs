//! BLE-MIDI GATT Protocol
//!
//! GATT identifiers and device selection for BLE-MIDI peripherals. Both the
//! amp and the pedal speak standard BLE-MIDI: one service with a single I/O
//! characteristic used for write-without-response and notify.

use crate::infrastructure::bluetooth::transport::TransportError;
use uuid::Uuid;

/// Standard BLE-MIDI service UUID
pub const MIDI_SERVICE_UUID: &str = "03b80e5a-ede8-4b33-a751-6ce34ec4c700";

/// Standard BLE-MIDI I/O characteristic (write + notify)
pub const MIDI_IO_CHAR_UUID: &str = "7772e5db-3868-4112-a1a9-f2669d106bf3";

/// Default ATT MTU when nothing larger has been negotiated
pub const DEFAULT_MTU: usize = 23;

/// Delay after connect before GATT discovery; BlueZ reports the link up
/// before its service cache is populated.
pub const DISCOVERY_SETTLE_MS: u64 = 600;

/// Polling interval while waiting for a matching advertisement
pub const SCAN_POLL_MS: u64 = 250;

/// Which peripheral a link should attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    /// Advertised local name must start with this (empty matches any name)
    pub name_prefix: String,
    /// Exact peripheral address, if pinned
    pub address: Option<String>,
}

impl DeviceSelector {
    pub fn matches(&self, name: Option<&str>, address: &str) -> bool {
        if let Some(wanted) = &self.address {
            return wanted.eq_ignore_ascii_case(address);
        }
        match name {
            Some(name) => name.starts_with(&self.name_prefix),
            None => false,
        }
    }
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| TransportError::Connection(format!("invalid UUID '{}': {}", uuid_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(MIDI_SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_u128() >> 96, 0x03b80e5a);
        assert_eq!(
            parse_uuid("7772E5DB-3868-4112-A1A9-F2669D106BF3").unwrap(),
            parse_uuid(MIDI_IO_CHAR_UUID).unwrap()
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_selector_by_name_prefix() {
        let selector = DeviceSelector {
            name_prefix: "CUBE".into(),
            address: None,
        };
        assert!(selector.matches(Some("CUBE Street II"), "AA:BB"));
        assert!(!selector.matches(Some("FS-1-WL"), "AA:BB"));
        assert!(!selector.matches(None, "AA:BB"));
    }

    #[test]
    fn test_selector_pinned_address_wins() {
        let selector = DeviceSelector {
            name_prefix: "CUBE".into(),
            address: Some("aa:bb:cc:dd:ee:ff".into()),
        };
        assert!(selector.matches(None, "AA:BB:CC:DD:EE:FF"));
        assert!(!selector.matches(Some("CUBE"), "11:22:33:44:55:66"));
    }
}
