//! Vendor SysEx Codec
//!
//! Translates between typed parameter operations and the amplifier's
//! System-Exclusive wire format.
//!
//! # Message Structure
//!
//! ```text
//! F0                 : SysEx start
//! <manufacturer..>   : 41 (Roland/Boss)
//! <device-id>        : 10
//! <model-id..>       : 00 00 00 33
//! <command>          : 11 = RQ1 (read request), 12 = DT1 (data set), 13 = tuner stream
//! <address..>        : `address_width` 7-bit bytes
//! <data..|size..>    : DT1 data bytes, or RQ1 size as `address_width` 7-bit bytes
//! <checksum>         : (128 - sum(address ++ data) % 128) % 128
//! F7                 : SysEx end
//! ```
//!
//! The byte values above are the defaults of [`SysExProfile`] and can be
//! replaced from settings for other models.

use super::message::{SYSEX_END, SYSEX_START};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest supported parameter address
pub const MAX_ADDRESS_LEN: usize = 4;

/// Universal non-realtime SysEx ID
const UNIVERSAL_NON_REALTIME: u8 = 0x7E;
/// "All devices" channel for universal messages
const ALL_DEVICES: u8 = 0x7F;
const GENERAL_INFORMATION: u8 = 0x06;
const IDENTITY_REQUEST: u8 = 0x01;
const IDENTITY_REPLY: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("checksum mismatch: expected {expected:#04X}, found {found:#04X}")]
    Checksum { expected: u8, found: u8 },
    #[error("malformed SysEx message: {0}")]
    Malformed(String),
    #[error("invalid parameter address")]
    InvalidAddress,
    #[error("value {0} does not fit the 7-bit data range")]
    ValueOutOfRange(u32),
}

/// Device parameter address: 1 to 4 seven-bit bytes, big-endian
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    bytes: [u8; MAX_ADDRESS_LEN],
    len: u8,
}

impl Address {
    pub fn new(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() || bytes.len() > MAX_ADDRESS_LEN || bytes.iter().any(|b| b & 0x80 != 0)
        {
            return Err(CodecError::InvalidAddress);
        }
        let mut buf = [0u8; MAX_ADDRESS_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    /// Four-byte address from literal bytes, high bits masked off
    pub const fn from_u7(bytes: [u8; 4]) -> Self {
        Self {
            bytes: [
                bytes[0] & 0x7F,
                bytes[1] & 0x7F,
                bytes[2] & 0x7F,
                bytes[3] & 0x7F,
            ],
            len: 4,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Address as a base-128 integer
    fn index(&self) -> u32 {
        self.as_bytes()
            .iter()
            .fold(0u32, |acc, &b| (acc << 7) | b as u32)
    }

    fn from_index(index: u32, len: usize) -> Option<Self> {
        if len == 0 || len > MAX_ADDRESS_LEN || index >> (7 * len) != 0 {
            return None;
        }
        let mut buf = [0u8; MAX_ADDRESS_LEN];
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            *slot = ((index >> (7 * (len - 1 - i))) & 0x7F) as u8;
        }
        Some(Self {
            bytes: buf,
            len: len as u8,
        })
    }

    /// Address `n` steps further on, with base-128 carry. `None` past the end
    /// of the address space.
    pub fn offset(&self, n: usize) -> Option<Self> {
        let n = u32::try_from(n).ok()?;
        Self::from_index(self.index().checked_add(n)?, self.len())
    }

    /// Position of `self` inside `[start, start + size)`
    pub fn position_in(&self, start: &Address, size: usize) -> Option<usize> {
        if self.len != start.len {
            return None;
        }
        let delta = self.index().checked_sub(start.index())? as usize;
        (delta < size).then_some(delta)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = CodecError;

    /// Accepts "01 02", "01-02" or "0102"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != ':')
            .collect();
        if hex.is_empty() || !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(CodecError::InvalidAddress);
        }
        let bytes = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|digits| u8::from_str_radix(digits, 16).ok())
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or(CodecError::InvalidAddress)?;
        Self::new(&bytes)
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Command bytes distinguishing the message kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default = "default_read_request")]
    pub read_request: u8,
    #[serde(default = "default_data_set")]
    pub write: u8,
    #[serde(default = "default_data_set")]
    pub read_response: u8,
    #[serde(default = "default_tuner_stream")]
    pub tuner_stream: u8,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            read_request: default_read_request(),
            write: default_data_set(),
            read_response: default_data_set(),
            tuner_stream: default_tuner_stream(),
        }
    }
}

fn default_read_request() -> u8 {
    0x11
}
fn default_data_set() -> u8 {
    0x12
}
fn default_tuner_stream() -> u8 {
    0x13
}

/// Device-specific header bytes and addressing layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysExProfile {
    #[serde(default = "default_manufacturer_id")]
    pub manufacturer_id: Vec<u8>,
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    #[serde(default = "default_model_id")]
    pub model_id: Vec<u8>,
    #[serde(default = "default_address_width")]
    pub address_width: usize,
    #[serde(default)]
    pub commands: CommandSet,
}

impl Default for SysExProfile {
    fn default() -> Self {
        Self {
            manufacturer_id: default_manufacturer_id(),
            device_id: default_device_id(),
            model_id: default_model_id(),
            address_width: default_address_width(),
            commands: CommandSet::default(),
        }
    }
}

fn default_manufacturer_id() -> Vec<u8> {
    vec![0x41]
}
fn default_device_id() -> u8 {
    0x10
}
fn default_model_id() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x33]
}
fn default_address_width() -> usize {
    4
}

/// Identity reported in reply to the universal identity request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: u8,
    pub manufacturer: Vec<u8>,
    pub family: [u8; 2],
    pub member: [u8; 2],
    pub version: [u8; 4],
}

/// Decoded SysEx message, tagged once at the codec boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysExMessage {
    ReadRequest { address: Address, size: u32 },
    WriteRequest { address: Address, data: Vec<u8> },
    ReadResponse { address: Address, data: Vec<u8> },
    TunerStream { address: Address, data: Vec<u8> },
    IdentityReply(DeviceIdentity),
}

/// One discrete parameter value from a (possibly bulk) response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterUpdate {
    pub address: Address,
    pub value: u8,
}

/// Roland-style checksum: `(sum + checksum) % 128 == 0`
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    ((128 - sum % 128) % 128) as u8
}

/// Universal identity request, addressed to all devices
pub fn identity_request() -> Vec<u8> {
    vec![
        SYSEX_START,
        UNIVERSAL_NON_REALTIME,
        ALL_DEVICES,
        GENERAL_INFORMATION,
        IDENTITY_REQUEST,
        SYSEX_END,
    ]
}

/// Split a response into one update per data byte, address `start + i`
pub fn split_bulk(address: Address, data: &[u8]) -> Result<Vec<ParameterUpdate>, CodecError> {
    data.iter()
        .enumerate()
        .map(|(i, &value)| {
            if value & 0x80 != 0 {
                return Err(CodecError::ValueOutOfRange(value as u32));
            }
            let address = address.offset(i).ok_or(CodecError::InvalidAddress)?;
            Ok(ParameterUpdate { address, value })
        })
        .collect()
}

pub struct SysExCodec {
    profile: SysExProfile,
}

impl SysExCodec {
    pub fn new(profile: SysExProfile) -> Self {
        Self { profile }
    }

    pub fn read_request(&self, address: Address, size: u32) -> Result<Vec<u8>, CodecError> {
        self.encode(&SysExMessage::ReadRequest { address, size })
    }

    pub fn write_request(&self, address: Address, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.encode(&SysExMessage::WriteRequest {
            address,
            data: data.to_vec(),
        })
    }

    /// Build the complete wire message, F0..F7 included
    pub fn encode(&self, message: &SysExMessage) -> Result<Vec<u8>, CodecError> {
        let commands = &self.profile.commands;
        let (command, address, data) = match message {
            SysExMessage::ReadRequest { address, size } => (
                commands.read_request,
                address,
                self.encode_size(*size)?,
            ),
            SysExMessage::WriteRequest { address, data } => (commands.write, address, data.clone()),
            SysExMessage::ReadResponse { address, data } => {
                (commands.read_response, address, data.clone())
            }
            SysExMessage::TunerStream { address, data } => {
                (commands.tuner_stream, address, data.clone())
            }
            SysExMessage::IdentityReply(identity) => return Ok(encode_identity(identity)),
        };

        if address.len() != self.profile.address_width {
            return Err(CodecError::InvalidAddress);
        }
        if let Some(&bad) = data.iter().find(|&&b| b & 0x80 != 0) {
            return Err(CodecError::ValueOutOfRange(bad as u32));
        }

        let mut protected = Vec::with_capacity(address.len() + data.len());
        protected.extend_from_slice(address.as_bytes());
        protected.extend_from_slice(&data);

        let mut bytes = self.header(command);
        bytes.extend_from_slice(&protected);
        bytes.push(checksum(&protected));
        bytes.push(SYSEX_END);
        Ok(bytes)
    }

    /// Validate and decode one complete SysEx.
    ///
    /// Anything that fails validation is reported and must be discarded by
    /// the caller; no partially decoded data is returned.
    pub fn decode(&self, bytes: &[u8]) -> Result<SysExMessage, CodecError> {
        if bytes.len() < 2 || bytes[0] != SYSEX_START || bytes[bytes.len() - 1] != SYSEX_END {
            return Err(CodecError::Malformed("missing SysEx framing".into()));
        }
        let inner = &bytes[1..bytes.len() - 1];
        if inner.iter().any(|b| b & 0x80 != 0) {
            return Err(CodecError::Malformed("status byte inside SysEx body".into()));
        }

        if inner.first() == Some(&UNIVERSAL_NON_REALTIME) {
            return decode_identity(inner);
        }

        let prefix_len = self.profile.manufacturer_id.len() + 1 + self.profile.model_id.len();
        if inner.len() < prefix_len + 1 {
            return Err(CodecError::Malformed("message too short".into()));
        }

        let (manufacturer, rest) = inner.split_at(self.profile.manufacturer_id.len());
        if manufacturer != self.profile.manufacturer_id.as_slice() {
            return Err(CodecError::Malformed(format!(
                "unexpected manufacturer {:02X?}",
                manufacturer
            )));
        }
        let device_id = rest[0];
        if device_id != self.profile.device_id && device_id != ALL_DEVICES {
            return Err(CodecError::Malformed(format!(
                "unexpected device id {:#04X}",
                device_id
            )));
        }
        let (model, rest) = rest[1..].split_at(self.profile.model_id.len());
        if model != self.profile.model_id.as_slice() {
            return Err(CodecError::Malformed(format!("unexpected model {:02X?}", model)));
        }

        let command = rest[0];
        let body = &rest[1..];
        let width = self.profile.address_width;
        if body.len() < width + 1 {
            return Err(CodecError::Malformed("missing address or checksum".into()));
        }
        let (protected, found) = body.split_at(body.len() - 1);
        let found = found[0];
        let expected = checksum(protected);
        if expected != found {
            return Err(CodecError::Checksum { expected, found });
        }

        let address = Address::new(&protected[..width])?;
        let data = protected[width..].to_vec();
        let commands = &self.profile.commands;

        if command == commands.tuner_stream {
            Ok(SysExMessage::TunerStream { address, data })
        } else if command == commands.read_response {
            Ok(SysExMessage::ReadResponse { address, data })
        } else if command == commands.read_request {
            if data.len() != width {
                return Err(CodecError::Malformed("read request size field".into()));
            }
            let size = data.iter().fold(0u32, |acc, &b| (acc << 7) | b as u32);
            Ok(SysExMessage::ReadRequest { address, size })
        } else if command == commands.write {
            Ok(SysExMessage::WriteRequest { address, data })
        } else {
            Err(CodecError::Malformed(format!("unknown command {:#04X}", command)))
        }
    }

    fn header(&self, command: u8) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        bytes.push(SYSEX_START);
        bytes.extend_from_slice(&self.profile.manufacturer_id);
        bytes.push(self.profile.device_id);
        bytes.extend_from_slice(&self.profile.model_id);
        bytes.push(command);
        bytes
    }

    fn encode_size(&self, size: u32) -> Result<Vec<u8>, CodecError> {
        let width = self.profile.address_width;
        if width < 5 && size >> (7 * width) != 0 {
            return Err(CodecError::ValueOutOfRange(size));
        }
        Ok((0..width)
            .rev()
            .map(|i| ((size >> (7 * i)) & 0x7F) as u8)
            .collect())
    }
}

fn encode_identity(identity: &DeviceIdentity) -> Vec<u8> {
    let mut bytes = vec![
        SYSEX_START,
        UNIVERSAL_NON_REALTIME,
        identity.device_id,
        GENERAL_INFORMATION,
        IDENTITY_REPLY,
    ];
    bytes.extend_from_slice(&identity.manufacturer);
    bytes.extend_from_slice(&identity.family);
    bytes.extend_from_slice(&identity.member);
    bytes.extend_from_slice(&identity.version);
    bytes.push(SYSEX_END);
    bytes
}

/// `inner` is the body between F0 and F7, starting with 7E
fn decode_identity(inner: &[u8]) -> Result<SysExMessage, CodecError> {
    if inner.len() < 4 || inner[2] != GENERAL_INFORMATION || inner[3] != IDENTITY_REPLY {
        return Err(CodecError::Malformed("unsupported universal message".into()));
    }
    let device_id = inner[1];
    let rest = &inner[4..];
    // Extended manufacturer IDs start with 00 and take three bytes
    let mfr_len = if rest.first() == Some(&0x00) { 3 } else { 1 };
    if rest.len() != mfr_len + 8 {
        return Err(CodecError::Malformed("identity reply length".into()));
    }
    let (manufacturer, rest) = rest.split_at(mfr_len);
    Ok(SysExMessage::IdentityReply(DeviceIdentity {
        device_id,
        manufacturer: manufacturer.to_vec(),
        family: [rest[0], rest[1]],
        member: [rest[2], rest[3]],
        version: [rest[4], rest[5], rest[6], rest[7]],
    }))
}
