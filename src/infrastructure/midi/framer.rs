//! BLE-MIDI Framer
//!
//! Converts between BLE-MIDI packets (MTU-limited GATT writes/notifications)
//! and complete [`MidiMessage`]s.
//!
//! ## Packet Structure
//!
//! ```text
//! [0]     : Header     1 0 t12 t11 t10 t9 t8 t7   (timestamp high bits)
//! [1]     : Timestamp  1 t6 t5 t4 t3 t2 t1 t0     (timestamp low bits)
//! [2..]   : Status byte + data bytes, each status preceded by a timestamp
//!
//! SysEx continuation packet:
//! [0]     : Header
//! [1..]   : Raw SysEx data bytes ... [timestamp] [F7]
//! ```
//!
//! One framer instance exists per BLE link. Notifications on a link are
//! delivered in order, so a SysEx split over several packets is reassembled
//! without sequence numbers.

use super::message::{data_len, is_realtime, MidiMessage, SYSEX_END, SYSEX_START};
use thiserror::Error;
use tracing::{debug, trace};

/// ATT header bytes subtracted from the MTU to get the usable payload
pub const ATT_HEADER_LEN: usize = 3;

/// Smallest packet we will ever build: header, timestamp, status, 2 data bytes
pub const MIN_PACKET_LEN: usize = 5;

/// Default upper bound for one reassembled SysEx (including F0/F7)
pub const DEFAULT_MAX_SYSEX_LEN: usize = 4096;

/// BLE-MIDI timestamps wrap every 8192 ms
pub const TIMESTAMP_MODULUS: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("packet is empty or has no BLE-MIDI header byte")]
    MalformedPacket,
    #[error("data byte {0:#04X} without a preceding status")]
    UnexpectedData(u8),
    #[error("SysEx interrupted by status byte {0:#04X}")]
    InterruptedSysEx(u8),
    #[error("SysEx exceeded the {limit}-byte buffer limit")]
    SysExOverflow { limit: usize },
}

/// Incoming packet reassembly state for one link
pub struct MidiFramer {
    max_sysex_len: usize,
    sysex: Option<Vec<u8>>,
    /// Set after an overflow; bytes are skipped until the next F7
    discarding: bool,
    running_status: Option<u8>,
    pending: Vec<u8>,
}

impl Default for MidiFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SYSEX_LEN)
    }
}

impl MidiFramer {
    pub fn new(max_sysex_len: usize) -> Self {
        Self {
            max_sysex_len,
            sysex: None,
            discarding: false,
            running_status: None,
            pending: Vec::with_capacity(2),
        }
    }

    /// Drop any partially assembled message (e.g. after the link drops)
    pub fn reset(&mut self) {
        if self.in_sysex() {
            debug!("Dropping partial SysEx on reset");
        }
        self.sysex = None;
        self.discarding = false;
        self.running_status = None;
        self.pending.clear();
    }

    /// True while a SysEx is being accumulated across packets
    pub fn in_sysex(&self) -> bool {
        self.sysex.is_some()
    }

    /// Feed one BLE notification and collect every message it completes.
    ///
    /// Errors are per-message: a broken fragment is reported and dropped,
    /// and parsing continues with the remaining bytes.
    pub fn push_packet(&mut self, packet: &[u8]) -> Vec<Result<MidiMessage, FramingError>> {
        let mut out = Vec::new();

        let Some((&header, body)) = packet.split_first() else {
            out.push(Err(FramingError::MalformedPacket));
            return out;
        };
        if header & 0xC0 != 0x80 {
            debug!("Rejecting packet with header {:#04X}", header);
            out.push(Err(FramingError::MalformedPacket));
            return out;
        }

        #[cfg(debug_assertions)]
        trace!("BLE-MIDI packet: {:02X?}", packet);

        // Every status byte is preceded by a timestamp-low byte, so high
        // bytes alternate timestamp/status.
        let mut after_timestamp = false;
        for &byte in body {
            if byte & 0x80 == 0 {
                after_timestamp = false;
                self.push_data(byte, &mut out);
            } else if !after_timestamp {
                after_timestamp = true;
            } else {
                after_timestamp = false;
                self.push_status(byte, &mut out);
            }
        }

        out
    }

    fn push_data(&mut self, byte: u8, out: &mut Vec<Result<MidiMessage, FramingError>>) {
        if self.discarding {
            return;
        }

        if let Some(buffer) = self.sysex.as_mut() {
            // Leave room for the terminating F7
            if buffer.len() + 2 > self.max_sysex_len {
                debug!(
                    "SysEx overflow after {} bytes, discarding until F7",
                    buffer.len()
                );
                self.sysex = None;
                self.discarding = true;
                out.push(Err(FramingError::SysExOverflow {
                    limit: self.max_sysex_len,
                }));
            } else {
                buffer.push(byte);
            }
            return;
        }

        let Some(status) = self.running_status else {
            out.push(Err(FramingError::UnexpectedData(byte)));
            return;
        };

        self.pending.push(byte);
        if Some(self.pending.len()) == data_len(status) {
            if let Some(message) = MidiMessage::from_short(status, &self.pending) {
                out.push(Ok(message));
            }
            self.pending.clear();
            // Running status only applies to channel messages
            if status >= 0xF0 {
                self.running_status = None;
            }
        }
    }

    fn push_status(&mut self, status: u8, out: &mut Vec<Result<MidiMessage, FramingError>>) {
        if is_realtime(status) {
            out.push(Ok(MidiMessage::Realtime(status)));
            return;
        }

        if status == SYSEX_END {
            if let Some(mut buffer) = self.sysex.take() {
                buffer.push(SYSEX_END);
                out.push(Ok(MidiMessage::SysEx(buffer)));
            } else if self.discarding {
                self.discarding = false;
            } else {
                out.push(Err(FramingError::UnexpectedData(status)));
            }
            return;
        }

        if self.sysex.take().is_some() {
            out.push(Err(FramingError::InterruptedSysEx(status)));
        }
        self.discarding = false;
        self.pending.clear();

        if status == SYSEX_START {
            self.running_status = None;
            let mut buffer = Vec::with_capacity(64);
            buffer.push(SYSEX_START);
            self.sysex = Some(buffer);
            return;
        }

        match data_len(status) {
            Some(0) => {
                self.running_status = None;
                if let Some(message) = MidiMessage::from_short(status, &[]) {
                    out.push(Ok(message));
                }
            }
            Some(_) => self.running_status = Some(status),
            None => {
                debug!("Ignoring undefined status byte {:#04X}", status);
                self.running_status = None;
            }
        }
    }
}

/// Usable payload bytes per BLE write for a negotiated MTU
pub fn max_packet_len(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_HEADER_LEN).max(MIN_PACKET_LEN)
}

/// Header and timestamp-low bytes for a millisecond timestamp
fn timestamp_bytes(timestamp_ms: u64) -> (u8, u8) {
    let ts = timestamp_ms % TIMESTAMP_MODULUS;
    let header = 0x80 | ((ts >> 7) & 0x3F) as u8;
    let low = 0x80 | (ts & 0x7F) as u8;
    (header, low)
}

/// Split one MIDI message into BLE-MIDI packets no larger than `mtu - 3`.
///
/// Packets must be written in the returned order.
pub fn packetize(message: &[u8], mtu: usize, timestamp_ms: u64) -> Vec<Vec<u8>> {
    let max_len = max_packet_len(mtu);
    let (header, low) = timestamp_bytes(timestamp_ms);

    if message.first() != Some(&SYSEX_START) {
        let mut packet = Vec::with_capacity(message.len() + 2);
        packet.push(header);
        packet.push(low);
        packet.extend_from_slice(message);
        return vec![packet];
    }

    let body = match message.last() {
        Some(&SYSEX_END) if message.len() >= 2 => &message[1..message.len() - 1],
        _ => &message[1..],
    };

    let mut packets = Vec::new();
    let mut current = Vec::with_capacity(max_len);
    current.extend_from_slice(&[header, low, SYSEX_START]);

    for &byte in body {
        if current.len() == max_len {
            packets.push(std::mem::replace(&mut current, vec![header]));
        }
        current.push(byte);
    }

    // The terminating timestamp + F7 pair is never split
    if current.len() + 2 > max_len {
        packets.push(std::mem::replace(&mut current, vec![header]));
    }
    current.extend_from_slice(&[low, SYSEX_END]);
    packets.push(current);

    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sysex(len: usize) -> Vec<u8> {
        let mut msg = vec![SYSEX_START];
        msg.extend((0..len).map(|i| (i % 128) as u8));
        msg.push(SYSEX_END);
        msg
    }

    fn feed_all(framer: &mut MidiFramer, packets: &[Vec<u8>]) -> Vec<Result<MidiMessage, FramingError>> {
        packets.iter().flat_map(|p| framer.push_packet(p)).collect()
    }

    #[test]
    fn test_short_messages_with_running_status() {
        let mut framer = MidiFramer::default();
        // header, ts, CC 80 127, then running status data 81 0, ts, PC 3
        let out = framer.push_packet(&[0x80, 0x81, 0xB0, 80, 127, 81, 0, 0x82, 0xC0, 3]);
        assert_eq!(
            out,
            vec![
                Ok(MidiMessage::ControlChange {
                    channel: 0,
                    controller: 80,
                    value: 127
                }),
                Ok(MidiMessage::ControlChange {
                    channel: 0,
                    controller: 81,
                    value: 0
                }),
                Ok(MidiMessage::ProgramChange {
                    channel: 0,
                    program: 3
                }),
            ]
        );
    }

    #[test]
    fn test_running_status_after_timestamp() {
        let mut framer = MidiFramer::default();
        framer.push_packet(&[0x80, 0x81, 0x90, 60, 100]);
        let out = framer.push_packet(&[0x80, 0x85, 62, 90]);
        assert_eq!(
            out,
            vec![Ok(MidiMessage::NoteOn {
                channel: 0,
                note: 62,
                velocity: 90
            })]
        );
    }

    #[test]
    fn test_rejects_missing_header() {
        let mut framer = MidiFramer::default();
        assert_eq!(framer.push_packet(&[]), vec![Err(FramingError::MalformedPacket)]);
        assert_eq!(
            framer.push_packet(&[0x40, 0x80, 0x90, 1, 1]),
            vec![Err(FramingError::MalformedPacket)]
        );
    }

    #[test]
    fn test_stray_data_is_reported() {
        let mut framer = MidiFramer::default();
        let out = framer.push_packet(&[0x80, 0x10]);
        assert_eq!(out, vec![Err(FramingError::UnexpectedData(0x10))]);
    }

    #[test]
    fn test_sysex_across_packets() {
        let mut framer = MidiFramer::default();
        assert!(framer.push_packet(&[0x80, 0x80, 0xF0, 0x41, 0x10]).is_empty());
        assert!(framer.in_sysex());
        assert!(framer.push_packet(&[0x80, 0x12, 0x01]).is_empty());
        let out = framer.push_packet(&[0x80, 0x02, 0x80, 0xF7]);
        assert_eq!(
            out,
            vec![Ok(MidiMessage::SysEx(vec![0xF0, 0x41, 0x10, 0x12, 0x01, 0x02, 0xF7]))]
        );
        assert!(!framer.in_sysex());
    }

    #[test]
    fn test_realtime_inside_sysex() {
        let mut framer = MidiFramer::default();
        let out = framer.push_packet(&[0x80, 0x80, 0xF0, 0x01, 0x80, 0xF8, 0x02, 0x80, 0xF7]);
        assert_eq!(
            out,
            vec![
                Ok(MidiMessage::Realtime(0xF8)),
                Ok(MidiMessage::SysEx(vec![0xF0, 0x01, 0x02, 0xF7])),
            ]
        );
    }

    #[test]
    fn test_interrupted_sysex() {
        let mut framer = MidiFramer::default();
        let out = framer.push_packet(&[0x80, 0x80, 0xF0, 0x01, 0x80, 0x90, 60, 1]);
        assert_eq!(
            out,
            vec![
                Err(FramingError::InterruptedSysEx(0x90)),
                Ok(MidiMessage::NoteOn {
                    channel: 0,
                    note: 60,
                    velocity: 1
                }),
            ]
        );
    }

    #[test]
    fn test_overflow_discards_and_recovers() {
        let mut framer = MidiFramer::new(8);
        let oversized = packetize(&sample_sysex(20), 23, 0);
        let out = feed_all(&mut framer, &oversized);
        assert_eq!(out, vec![Err(FramingError::SysExOverflow { limit: 8 })]);

        // The link stays usable
        let fits = packetize(&sample_sysex(6), 23, 0);
        let out = feed_all(&mut framer, &fits);
        assert_eq!(out, vec![Ok(MidiMessage::SysEx(sample_sysex(6)))]);
    }

    #[test]
    fn test_fragmentation_is_transparent() {
        let message = sample_sysex(300);
        let mut whole = MidiFramer::default();
        let expected = feed_all(&mut whole, &packetize(&message, 512, 1234));
        assert_eq!(expected, vec![Ok(MidiMessage::SysEx(message.clone()))]);

        // Payload sizes from 1 data byte per packet upwards
        for mtu in [8, 9, 10, 23, 64, 185] {
            let packets = packetize(&message, mtu, 1234);
            assert!(packets.iter().all(|p| p.len() <= max_packet_len(mtu)));
            let mut framer = MidiFramer::default();
            assert_eq!(feed_all(&mut framer, &packets), expected, "mtu {}", mtu);
        }
    }

    #[test]
    fn test_one_and_two_byte_chunks() {
        let message = sample_sysex(40);
        let body = &message[1..message.len() - 1];

        for chunk in [1, 2, 7] {
            let mut packets = vec![vec![0x80, 0x80, SYSEX_START]];
            packets.extend(body.chunks(chunk).map(|c| {
                let mut p = vec![0x80];
                p.extend_from_slice(c);
                p
            }));
            packets.push(vec![0x80, 0x80, SYSEX_END]);

            let mut framer = MidiFramer::default();
            assert_eq!(
                feed_all(&mut framer, &packets),
                vec![Ok(MidiMessage::SysEx(message.clone()))],
                "chunk {}",
                chunk
            );
        }
    }

    #[test]
    fn test_packetize_short_message() {
        let packets = packetize(&[0xB0, 7, 100], 23, 0x1FFF);
        assert_eq!(packets, vec![vec![0xBF, 0xFF, 0xB0, 7, 100]]);
    }

    #[test]
    fn test_packetize_keeps_terminator_together() {
        // 17 data bytes fill the first 20-byte packet exactly
        let packets = packetize(&sample_sysex(17), 23, 0);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(packets[1], vec![0x80, 0x80, 0xF7]);
    }
}
