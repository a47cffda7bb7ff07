//! Tuner Decoder
//!
//! Decodes the amplifier's continuously streamed tuner SysEx into a pitch
//! deviation reading.
//!
//! # Payload Structure (data region of a tuner-stream message)
//!
//! ```text
//! [0]     : Format
//!           00 = frequency, 01 = deviation, 7F = no signal
//!
//! Frequency format:
//! [1-3]   : Detected frequency in centi-hertz, three 7-bit bytes, big-endian
//!
//! Deviation format:
//! [1]     : MIDI note number (7F = no signal)
//! [2-3]   : Deviation in cents, 14-bit (MSB, LSB), offset 8192
//! ```

use crate::infrastructure::midi::sysex::CodecError;
use serde::{Deserialize, Serialize};
use tracing::warn;

const FORMAT_FREQUENCY: u8 = 0x00;
const FORMAT_DEVIATION: u8 = 0x01;
const NO_SIGNAL: u8 = 0x7F;

/// Detection range of the device; codes outside it carry no pitch
const MIN_FREQUENCY_HZ: f64 = 20.0;
const MAX_FREQUENCY_HZ: f64 = 5000.0;
const MAX_DEVIATION_CENTS: i32 = 1200;
const DEVIATION_OFFSET: i32 = 8192;

/// MIDI note number of A4
const A4_NOTE: i32 = 69;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerSettings {
    #[serde(default = "default_reference_hz")]
    pub reference_hz: f64,
    #[serde(default = "default_display_range_cents")]
    pub display_range_cents: f64,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            reference_hz: default_reference_hz(),
            display_range_cents: default_display_range_cents(),
        }
    }
}

impl TunerSettings {
    /// Replace unusable values (non-positive or non-finite) with defaults
    fn sanitized(self) -> Self {
        let reference_hz = if self.reference_hz.is_finite() && self.reference_hz > 0.0 {
            self.reference_hz
        } else {
            warn!("Ignoring tuner reference {} Hz", self.reference_hz);
            default_reference_hz()
        };
        let display_range_cents = match self.display_range_cents.abs() {
            range if range.is_finite() && range > 0.0 => range,
            _ => {
                warn!("Ignoring tuner display range {}", self.display_range_cents);
                default_display_range_cents()
            }
        };
        Self {
            reference_hz,
            display_range_cents,
        }
    }
}

fn default_reference_hz() -> f64 {
    440.0
}
fn default_display_range_cents() -> f64 {
    50.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pitch {
    pub midi_note: u8,
    pub name: &'static str,
    pub octave: i8,
    /// Deviation from `midi_note`, clamped to the display range
    pub cents: f64,
    /// True when `cents` was limited to the display range
    pub clamped: bool,
}

/// A single decoded reading. Silence is its own state and never a
/// numeric zero, so "no signal" cannot be read as "in tune".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TunerReading {
    NoSignal,
    Pitch(Pitch),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerSample {
    pub reading: TunerReading,
    /// Mean of this and the previous reading when both are on the same note
    pub smoothed_cents: Option<f64>,
}

pub struct TunerDecoder {
    settings: TunerSettings,
    current: Option<TunerReading>,
    previous: Option<TunerReading>,
}

impl TunerDecoder {
    pub fn new(settings: TunerSettings) -> Self {
        Self {
            settings: settings.sanitized(),
            current: None,
            previous: None,
        }
    }

    pub fn current(&self) -> Option<TunerReading> {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.previous = None;
    }

    /// Decode one tuner payload and make it the current sample
    pub fn decode(&mut self, data: &[u8]) -> Result<TunerSample, CodecError> {
        let reading = self.decode_reading(data)?;
        self.previous = self.current.replace(reading);
        Ok(TunerSample {
            reading,
            smoothed_cents: self.smoothed_cents(),
        })
    }

    pub fn smoothed_cents(&self) -> Option<f64> {
        match (self.current?, self.previous?) {
            (TunerReading::Pitch(now), TunerReading::Pitch(before))
                if now.midi_note == before.midi_note =>
            {
                Some((now.cents + before.cents) / 2.0)
            }
            (TunerReading::Pitch(now), _) => Some(now.cents),
            _ => None,
        }
    }

    fn decode_reading(&self, data: &[u8]) -> Result<TunerReading, CodecError> {
        match data.first() {
            Some(&NO_SIGNAL) => Ok(TunerReading::NoSignal),
            Some(&FORMAT_FREQUENCY) => {
                let [hi, mid, lo] = payload::<3>(data)?;
                let centi_hz = ((hi as u32) << 14) | ((mid as u32) << 7) | lo as u32;
                Ok(self.reading_for_frequency(centi_hz as f64 / 100.0))
            }
            Some(&FORMAT_DEVIATION) => {
                let [note, msb, lsb] = payload::<3>(data)?;
                let cents = (((msb as i32) << 7) | lsb as i32) - DEVIATION_OFFSET;
                if note == NO_SIGNAL || cents.abs() > MAX_DEVIATION_CENTS {
                    return Ok(TunerReading::NoSignal);
                }
                Ok(self.pitch(note, cents as f64))
            }
            Some(other) => Err(CodecError::Malformed(format!(
                "unknown tuner format {:#04X}",
                other
            ))),
            None => Err(CodecError::Malformed("empty tuner payload".into())),
        }
    }

    /// Nearest equal-tempered note and the deviation from it in cents
    fn reading_for_frequency(&self, hz: f64) -> TunerReading {
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
            return TunerReading::NoSignal;
        }
        let reference = self.settings.reference_hz;
        let note = (A4_NOTE as f64 + 12.0 * (hz / reference).log2()).round();
        let note_hz = reference * 2f64.powf((note - A4_NOTE as f64) / 12.0);
        let cents = 1200.0 * (hz / note_hz).log2();
        self.pitch(note.clamp(0.0, 127.0) as u8, cents)
    }

    fn pitch(&self, midi_note: u8, cents: f64) -> TunerReading {
        let range = self.settings.display_range_cents;
        let clamped = cents.abs() > range;
        TunerReading::Pitch(Pitch {
            midi_note,
            name: NOTE_NAMES[(midi_note % 12) as usize],
            octave: (midi_note / 12) as i8 - 1,
            cents: cents.clamp(-range, range),
            clamped,
        })
    }
}

fn payload<const N: usize>(data: &[u8]) -> Result<[u8; N], CodecError> {
    data.get(1..=N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CodecError::Malformed("truncated tuner payload".into()))
}
