//! MIDI Module
//!
//! BLE-MIDI packet framing and the Roland-style SysEx codec.
//!
//! - [`message`] - Parsed MIDI messages
//! - [`framer`] - BLE-MIDI packet reassembly and packetization
//! - [`sysex`] - Read/write/tuner SysEx encoding and checksums

pub mod framer;
pub mod message;
pub mod sysex;

pub use framer::MidiFramer;
pub use message::MidiMessage;
pub use sysex::{Address, SysExCodec, SysExMessage};
