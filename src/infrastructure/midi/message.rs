//! MIDI Message Types
//!
//! Typed MIDI events produced by the framer. Downstream code matches on
//! these variants instead of inspecting raw status bytes.

/// SysEx start byte
pub const SYSEX_START: u8 = 0xF0;
/// SysEx end byte (EOX)
pub const SYSEX_END: u8 = 0xF7;

/// A complete logical MIDI event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit bend value, 8192 is centre
    PitchBend { channel: u8, value: u16 },
    /// F1..F6 system common messages (MTC quarter frame, song position, ...)
    SystemCommon { status: u8, data: Vec<u8> },
    /// F8..FF single-byte real-time messages
    Realtime(u8),
    /// Complete SysEx including the F0/F7 brackets
    SysEx(Vec<u8>),
}

/// Number of data bytes that follow a (non-SysEx) status byte.
///
/// Returns `None` for bytes that are not a status byte, for SysEx
/// start/end, and for the undefined system common slots.
pub fn data_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(2),
        0xC0..=0xDF => Some(1),
        0xF1 | 0xF3 => Some(1),
        0xF2 => Some(2),
        0xF6 => Some(0),
        0xF8..=0xFF => Some(0),
        _ => None,
    }
}

/// True for F8..FF, which may appear anywhere, even inside a SysEx.
pub fn is_realtime(status: u8) -> bool {
    status >= 0xF8
}

impl MidiMessage {
    /// Build a message from a status byte and exactly `data_len(status)` data bytes
    pub fn from_short(status: u8, data: &[u8]) -> Option<Self> {
        if data_len(status)? != data.len() {
            return None;
        }
        let channel = status & 0x0F;
        let message = match status & 0xF0 {
            0x80 => Self::NoteOff {
                channel,
                note: data[0],
                velocity: data[1],
            },
            0x90 => Self::NoteOn {
                channel,
                note: data[0],
                velocity: data[1],
            },
            0xA0 => Self::PolyPressure {
                channel,
                note: data[0],
                pressure: data[1],
            },
            0xB0 => Self::ControlChange {
                channel,
                controller: data[0],
                value: data[1],
            },
            0xC0 => Self::ProgramChange {
                channel,
                program: data[0],
            },
            0xD0 => Self::ChannelPressure {
                channel,
                pressure: data[0],
            },
            0xE0 => Self::PitchBend {
                channel,
                value: (data[0] as u16) | ((data[1] as u16) << 7),
            },
            _ if is_realtime(status) => Self::Realtime(status),
            _ => Self::SystemCommon {
                status,
                data: data.to_vec(),
            },
        };
        Some(message)
    }

    /// Serialize back to a plain MIDI byte stream (no BLE framing)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::NoteOff {
                channel,
                note,
                velocity,
            } => vec![0x80 | channel, *note, *velocity],
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => vec![0x90 | channel, *note, *velocity],
            Self::PolyPressure {
                channel,
                note,
                pressure,
            } => vec![0xA0 | channel, *note, *pressure],
            Self::ControlChange {
                channel,
                controller,
                value,
            } => vec![0xB0 | channel, *controller, *value],
            Self::ProgramChange { channel, program } => vec![0xC0 | channel, *program],
            Self::ChannelPressure { channel, pressure } => vec![0xD0 | channel, *pressure],
            Self::PitchBend { channel, value } => {
                vec![0xE0 | channel, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
            }
            Self::SystemCommon { status, data } => {
                let mut bytes = vec![*status];
                bytes.extend_from_slice(data);
                bytes
            }
            Self::Realtime(status) => vec![*status],
            Self::SysEx(bytes) => bytes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_len() {
        assert_eq!(data_len(0x90), Some(2));
        assert_eq!(data_len(0xC3), Some(1));
        assert_eq!(data_len(0xF6), Some(0));
        assert_eq!(data_len(0xF0), None);
        assert_eq!(data_len(0x40), None);
    }

    #[test]
    fn test_from_short() {
        assert_eq!(
            MidiMessage::from_short(0xB2, &[80, 127]),
            Some(MidiMessage::ControlChange {
                channel: 2,
                controller: 80,
                value: 127
            })
        );
        assert_eq!(
            MidiMessage::from_short(0xE0, &[0x00, 0x40]),
            Some(MidiMessage::PitchBend {
                channel: 0,
                value: 8192
            })
        );
        // Wrong number of data bytes
        assert_eq!(MidiMessage::from_short(0xC0, &[1, 2]), None);
    }

    #[test]
    fn test_to_bytes() {
        let msg = MidiMessage::PitchBend {
            channel: 1,
            value: 8192,
        };
        assert_eq!(msg.to_bytes(), vec![0xE1, 0x00, 0x40]);
        assert_eq!(
            MidiMessage::ProgramChange {
                channel: 0,
                program: 5
            }
            .to_bytes(),
            vec![0xC0, 5]
        );
    }
}
