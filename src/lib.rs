//! Remote control for Boss Cube amplifiers over BLE-MIDI
//!
//! - [`domain`] - Parameter state, tuner decoding, pedal mapping, settings
//! - [`infrastructure`] - BLE links, MIDI framing, SysEx codec, logging
//! - [`presentation`] - Event loop and console

pub mod domain;
pub mod infrastructure;
pub mod presentation;
