//! Device Controller
//!
//! Owns the amplifier's parameter model and drives read/write exchanges
//! through the codec, framer and transport.
//!
//! ## Parameter State Machine
//!
//! ```text
//! Unknown ──read──▶ ReadPending ──response──▶ Known
//! Known ──write──▶ WritePending ──echo──▶ Known
//!
//! any pending ──timeout / disconnect──▶ Unknown
//! ```
//!
//! At most one exchange is in flight per address. A write issued while an
//! exchange is outstanding is parked in the slot's `queued` value (last write
//! wins) and flushed when the outstanding exchange completes.
//!
//! All methods take `now` explicitly; the runtime calls [`DeviceController::poll_timeouts`]
//! on a fixed tick.

use crate::domain::models::{AppEvent, ConnectionStatus, ParameterChange};
use crate::domain::parameters::{ParameterCatalogue, ParameterDef, PRESET, TUNER_ON};
use crate::domain::pedal::PedalAction;
use crate::domain::tuner::{TunerDecoder, TunerReading, TunerSettings};
use crate::infrastructure::bluetooth::transport::{Transport, TransportError};
use crate::infrastructure::midi::framer::{packetize, MidiFramer};
use crate::infrastructure::midi::message::MidiMessage;
use crate::infrastructure::midi::sysex::{
    identity_request, split_bulk, Address, CodecError, SysExCodec, SysExMessage,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterState {
    #[default]
    Unknown,
    ReadPending {
        last: Option<u8>,
    },
    Known(u8),
    /// Optimistic: `value` is shown immediately, `previous` is what the
    /// device last reported
    WritePending {
        value: u8,
        previous: Option<u8>,
    },
}

impl ParameterState {
    /// Best current value for display
    pub fn value(&self) -> Option<u8> {
        match *self {
            Self::Unknown => None,
            Self::ReadPending { last } => last,
            Self::Known(v) => Some(v),
            Self::WritePending { value, .. } => Some(value),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::ReadPending { .. } | Self::WritePending { .. })
    }
}

impl fmt::Display for ParameterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Unknown => write!(f, "unknown"),
            Self::ReadPending { last: None } => write!(f, "reading"),
            Self::ReadPending { last: Some(v) } => write!(f, "reading (last {})", v),
            Self::Known(v) => write!(f, "{}", v),
            Self::WritePending { value, .. } => write!(f, "{} (pending)", value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound on concurrent exchanges started by `read_all`
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Re-read every parameter after (re)connecting
    #[serde(default = "default_true")]
    pub reload_on_connect: bool,
    #[serde(default = "default_max_sysex_len")]
    pub max_sysex_len: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            reload_on_connect: default_true(),
            max_sysex_len: default_max_sysex_len(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    1000
}
fn default_max_in_flight() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_max_sysex_len() -> usize {
    crate::infrastructure::midi::framer::DEFAULT_MAX_SYSEX_LEN
}
fn default_tick_interval_ms() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("value {value} is out of range for {address}")]
    ValueOutOfRange { address: Address, value: u8 },
}

#[derive(Debug, Clone, Copy)]
struct Exchange {
    kind: RequestKind,
    /// Value carried by a write exchange
    sent_value: Option<u8>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    state: ParameterState,
    in_flight: Option<Exchange>,
    queued: Option<u8>,
}

pub struct DeviceController<T: Transport> {
    transport: T,
    framer: MidiFramer,
    codec: SysExCodec,
    tuner: TunerDecoder,
    catalogue: ParameterCatalogue,
    slots: BTreeMap<Address, Slot>,
    read_queue: VecDeque<Address>,
    settings: ControllerSettings,
    epoch: Instant,
    status: ConnectionStatus,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: Transport> DeviceController<T> {
    pub fn new(
        transport: T,
        codec: SysExCodec,
        catalogue: ParameterCatalogue,
        settings: ControllerSettings,
        tuner: TunerSettings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let status = transport.status();
        Self {
            transport,
            framer: MidiFramer::new(settings.max_sysex_len),
            codec,
            tuner: TunerDecoder::new(tuner),
            catalogue,
            slots: BTreeMap::new(),
            read_queue: VecDeque::new(),
            settings,
            epoch: Instant::now(),
            status,
            event_sender,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn catalogue(&self) -> &ParameterCatalogue {
        &self.catalogue
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.settings.tick_interval_ms.max(1))
    }

    pub fn state(&self, address: &Address) -> ParameterState {
        self.slots
            .get(address)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Every address the controller has seen, in address order
    pub fn states(&self) -> impl Iterator<Item = (&Address, &ParameterState)> {
        self.slots.iter().map(|(a, s)| (a, &s.state))
    }

    /// Exchanges currently awaiting a response
    pub fn in_flight(&self) -> usize {
        self.slots.values().filter(|s| s.in_flight.is_some()).count()
    }

    pub fn queued_reads(&self) -> usize {
        self.read_queue.len()
    }

    /// Last tuner sample, cleared when the link drops
    pub fn tuner_reading(&self) -> Option<TunerReading> {
        self.tuner.current()
    }

    /// Issue a single-parameter read. A no-op if an exchange is already
    /// outstanding for the address.
    pub fn read_parameter(&mut self, address: Address, now: Instant) -> Result<(), ControllerError> {
        if self.slot_busy(&address) {
            trace!("Read of {} skipped, exchange outstanding", address);
            return Ok(());
        }
        let bytes = self.codec.read_request(address, 1)?;
        self.send(&bytes, now)?;

        let deadline = self.deadline(now);
        let slot = self.slots.entry(address).or_default();
        slot.state = ParameterState::ReadPending {
            last: slot.state.value(),
        };
        slot.in_flight = Some(Exchange {
            kind: RequestKind::Read,
            sent_value: None,
            deadline,
        });
        self.emit_change(address);
        Ok(())
    }

    /// One read request covering `size` consecutive addresses. Every catalogue
    /// parameter in the range is resolved by the bulk response.
    pub fn read_block(
        &mut self,
        start: Address,
        size: u32,
        now: Instant,
    ) -> Result<(), ControllerError> {
        if size == 0 {
            return Err(CodecError::ValueOutOfRange(0).into());
        }
        let bytes = self.codec.read_request(start, size)?;
        self.send(&bytes, now)?;

        let covered: Vec<Address> = self
            .catalogue
            .iter()
            .filter(|d| d.address.position_in(&start, size as usize).is_some())
            .map(|d| d.address)
            .collect();
        let deadline = self.deadline(now);
        for address in covered {
            if self.slot_busy(&address) {
                continue;
            }
            let slot = self.slots.entry(address).or_default();
            slot.state = ParameterState::ReadPending {
                last: slot.state.value(),
            };
            slot.in_flight = Some(Exchange {
                kind: RequestKind::Read,
                sent_value: None,
                deadline,
            });
            self.emit_change(address);
        }
        Ok(())
    }

    /// Set a parameter. Shown optimistically; if an exchange is outstanding
    /// the value replaces any earlier queued one and goes out after it.
    pub fn write_parameter(
        &mut self,
        address: Address,
        value: u8,
        now: Instant,
    ) -> Result<(), ControllerError> {
        let in_range = match self.catalogue.by_address(&address) {
            Some(def) => def.contains(value),
            None => value < 0x80,
        };
        if !in_range {
            return Err(ControllerError::ValueOutOfRange { address, value });
        }
        if !self.transport.status().is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        if self.slot_busy(&address) {
            let slot = self.slots.entry(address).or_default();
            slot.queued = Some(value);
            let mut shown_changed = false;
            if let ParameterState::WritePending { value: shown, .. } = &mut slot.state {
                shown_changed = *shown != value;
                *shown = value;
            }
            debug!("Write {} = {} queued behind outstanding exchange", address, value);
            // Behind a read the visible state stays ReadPending until it resolves
            if shown_changed {
                self.emit_change(address);
            }
            return Ok(());
        }

        self.start_write(address, value, now)?;
        self.emit_change(address);
        Ok(())
    }

    pub fn write_named(&mut self, name: &str, value: u8, now: Instant) -> Result<(), ControllerError> {
        let address = self.lookup(name)?.address;
        self.write_parameter(address, value, now)
    }

    /// Queue a read of every catalogue parameter; at most `max_in_flight`
    /// exchanges run at once.
    pub fn read_all(&mut self, now: Instant) -> Result<(), ControllerError> {
        if !self.transport.status().is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let addresses: Vec<Address> = self.catalogue.iter().map(|d| d.address).collect();
        for address in addresses {
            if !self.read_queue.contains(&address) && !self.slot_busy(&address) {
                self.read_queue.push_back(address);
            }
        }
        info!("Reading {} parameters", self.read_queue.len());
        self.pump_reads(now);
        Ok(())
    }

    /// Ask the device to identify itself; the reply arrives as
    /// `AppEvent::DeviceIdentified`.
    pub fn request_identity(&mut self, now: Instant) -> Result<(), ControllerError> {
        self.send(&identity_request(), now)
    }

    /// Feed one BLE notification from the amp link
    pub fn handle_packet(&mut self, packet: &[u8], now: Instant) {
        for result in self.framer.push_packet(packet) {
            match result {
                Ok(MidiMessage::SysEx(bytes)) => match self.codec.decode(&bytes) {
                    Ok(message) => self.handle_sysex(message, now),
                    Err(e) => warn!("Discarding SysEx from amp: {}", e),
                },
                Ok(other) => trace!("Ignoring {:?} from amp", other),
                Err(e) => warn!("Discarding amp data: {}", e),
            }
        }
        self.pump_reads(now);
    }

    /// Expire overdue exchanges. Each expired exchange moves its parameter
    /// to `Unknown` and emits exactly one `Timeout`; nothing is retried.
    pub fn poll_timeouts(&mut self, now: Instant) -> usize {
        let expired: Vec<(Address, RequestKind)> = self
            .slots
            .iter()
            .filter_map(|(address, slot)| {
                slot.in_flight
                    .filter(|e| e.deadline <= now)
                    .map(|e| (*address, e.kind))
            })
            .collect();

        for (address, kind) in &expired {
            if let Some(slot) = self.slots.get_mut(address) {
                slot.in_flight = None;
                slot.queued = None;
                slot.state = ParameterState::Unknown;
            }
            warn!("{} of {} timed out", kind, address);
            let _ = self.event_sender.send(AppEvent::Timeout {
                address: *address,
                kind: *kind,
            });
            self.emit_change(*address);
        }

        if !expired.is_empty() {
            self.pump_reads(now);
        }
        expired.len()
    }

    /// Link state input. Losing the link cancels every pending exchange to
    /// `Unknown`; regaining it optionally reloads every parameter.
    pub fn set_connection_status(&mut self, status: ConnectionStatus, now: Instant) {
        let was_connected = self.status.is_connected();
        self.status = status;

        if !status.is_connected() {
            self.framer.reset();
            self.tuner.reset();
            self.read_queue.clear();
            let cancelled: Vec<Address> = self
                .slots
                .iter_mut()
                .filter(|(_, s)| s.in_flight.is_some() || s.queued.is_some())
                .map(|(address, slot)| {
                    slot.in_flight = None;
                    slot.queued = None;
                    slot.state = ParameterState::Unknown;
                    *address
                })
                .collect();
            if !cancelled.is_empty() {
                info!("Link down, cancelled {} pending exchanges", cancelled.len());
            }
            for address in cancelled {
                self.emit_change(address);
            }
            return;
        }

        if !was_connected {
            if let Err(e) = self.request_identity(now) {
                warn!("Identity request failed: {}", e);
            }
            if self.settings.reload_on_connect {
                if let Err(e) = self.read_all(now) {
                    warn!("Reload after connect failed: {}", e);
                }
            }
        }
    }

    /// Run a pedal action. `value` is the triggering event's value (CC value
    /// or program number).
    pub fn apply_action(
        &mut self,
        action: &PedalAction,
        value: u8,
        now: Instant,
    ) -> Result<(), ControllerError> {
        match action {
            PedalAction::NextPreset | PedalAction::PreviousPreset => {
                let def = self.lookup(PRESET)?.clone();
                let current = self.state(&def.address).value().unwrap_or(def.min);
                let next = if matches!(action, PedalAction::NextPreset) {
                    if current >= def.max {
                        def.min
                    } else {
                        current + 1
                    }
                } else if current <= def.min {
                    def.max
                } else {
                    current - 1
                };
                self.write_parameter(def.address, next, now)
            }
            PedalAction::SelectPreset { preset } => {
                let def = self.lookup(PRESET)?.clone();
                let target = def.min.saturating_add(preset.unwrap_or(value));
                self.write_parameter(def.address, target, now)
            }
            PedalAction::Toggle { parameter } => self.toggle(parameter, now),
            PedalAction::ToggleTuner => self.toggle(TUNER_ON, now),
            PedalAction::Set { parameter, value } => self.write_named(parameter, *value, now),
            PedalAction::Expression { parameter } => {
                let def = self.lookup(parameter)?.clone();
                let span = def.max.saturating_sub(def.min) as u32;
                let scaled = (value.min(127) as u32 * span + 63) / 127;
                self.write_parameter(def.address, def.min + scaled as u8, now)
            }
            PedalAction::ReloadAll => self.read_all(now),
        }
    }

    fn toggle(&mut self, name: &str, now: Instant) -> Result<(), ControllerError> {
        let def = self.lookup(name)?.clone();
        let current = self.state(&def.address).value().unwrap_or(def.min);
        let next = if current == def.min { def.max } else { def.min };
        self.write_parameter(def.address, next, now)
    }

    fn lookup(&self, name: &str) -> Result<&ParameterDef, ControllerError> {
        self.catalogue
            .by_name(name)
            .ok_or_else(|| ControllerError::UnknownParameter(name.to_string()))
    }

    fn handle_sysex(&mut self, message: SysExMessage, now: Instant) {
        match message {
            SysExMessage::ReadResponse { address, data } => {
                self.handle_response(address, &data, now)
            }
            SysExMessage::TunerStream { data, .. } => match self.tuner.decode(&data) {
                Ok(sample) => {
                    let _ = self.event_sender.send(AppEvent::TunerSample(sample));
                }
                Err(e) => debug!("Discarding tuner payload: {}", e),
            },
            SysExMessage::IdentityReply(identity) => {
                info!(
                    "Device identified: manufacturer {:02X?}, family {:02X?}, version {:02X?}",
                    identity.manufacturer, identity.family, identity.version
                );
                let _ = self.event_sender.send(AppEvent::DeviceIdentified(identity));
            }
            other => debug!("Ignoring device-bound message from amp: {:?}", other),
        }
    }

    fn handle_response(&mut self, start: Address, data: &[u8], now: Instant) {
        let updates = match split_bulk(start, data) {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Discarding response at {}: {}", start, e);
                return;
            }
        };

        for update in updates {
            let address = update.address;
            match self.catalogue.by_address(&address) {
                Some(def) if !def.contains(update.value) => {
                    warn!(
                        "Discarding out-of-range value {} for {}",
                        update.value, def.name
                    );
                    continue;
                }
                None if !self.slots.contains_key(&address) => {
                    trace!("Ignoring data for untracked address {}", address);
                    continue;
                }
                _ => {}
            }
            self.settle(address, update.value, now);
        }
    }

    /// Apply a device-reported value to one slot
    fn settle(&mut self, address: Address, reported: u8, now: Instant) {
        let slot = self.slots.entry(address).or_default();
        let exchange = slot.in_flight.take();
        let queued = slot.queued.take();
        let before = slot.state;

        match (exchange, queued) {
            (Some(_), Some(next)) if next != reported => {
                slot.state = ParameterState::Known(reported);
                if let Err(e) = self.start_write(address, next, now) {
                    warn!("Flushing queued write {} = {} failed: {}", address, next, e);
                }
            }
            (Some(exchange), _) => {
                if let Some(sent) = exchange.sent_value.filter(|&v| v != reported) {
                    warn!(
                        "Device reported {} for {} after writing {}",
                        reported, address, sent
                    );
                }
                slot.state = ParameterState::Known(reported);
            }
            (None, _) => {
                debug!("Unsolicited update {} = {}", address, reported);
                slot.state = ParameterState::Known(reported);
            }
        }

        if self.state(&address) != before {
            self.emit_change(address);
        }
    }

    fn start_write(&mut self, address: Address, value: u8, now: Instant) -> Result<(), ControllerError> {
        let bytes = self.codec.write_request(address, &[value])?;
        self.send(&bytes, now)?;

        let deadline = self.deadline(now);
        let slot = self.slots.entry(address).or_default();
        let previous = match slot.state {
            ParameterState::WritePending { previous, .. } => previous,
            other => other.value(),
        };
        slot.state = ParameterState::WritePending { value, previous };
        slot.in_flight = Some(Exchange {
            kind: RequestKind::Write,
            sent_value: Some(value),
            deadline,
        });
        Ok(())
    }

    fn pump_reads(&mut self, now: Instant) {
        let limit = self.settings.max_in_flight.max(1);
        while self.in_flight() < limit {
            let Some(address) = self.read_queue.pop_front() else {
                break;
            };
            if let Err(e) = self.read_parameter(address, now) {
                warn!("Queued read of {} failed: {}", address, e);
                if matches!(e, ControllerError::Transport(_)) {
                    self.read_queue.clear();
                    break;
                }
            }
        }
    }

    /// Encode, packetize and hand the packets to the link in order
    fn send(&mut self, message: &[u8], now: Instant) -> Result<(), ControllerError> {
        if !self.transport.status().is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let timestamp_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        for packet in packetize(message, self.transport.mtu(), timestamp_ms) {
            self.transport.write(packet)?;
        }
        Ok(())
    }

    fn slot_busy(&self, address: &Address) -> bool {
        self.slots
            .get(address)
            .is_some_and(|s| s.in_flight.is_some())
    }

    fn deadline(&self, now: Instant) -> Instant {
        now + Duration::from_millis(self.settings.request_timeout_ms)
    }

    fn emit_change(&self, address: Address) {
        let change = ParameterChange {
            address,
            name: self.catalogue.by_address(&address).map(|d| d.name.clone()),
            state: self.state(&address),
        };
        let _ = self.event_sender.send(AppEvent::ParameterChanged(change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::fake::FakeTransport;
    use crate::infrastructure::midi::sysex::SysExProfile;

    fn addr(bytes: &[u8]) -> Address {
        Address::new(bytes).unwrap()
    }

    fn profile() -> SysExProfile {
        SysExProfile {
            model_id: Vec::new(),
            address_width: 2,
            ..SysExProfile::default()
        }
    }

    fn param(name: &str, address: [u8; 2], max: u8) -> ParameterDef {
        ParameterDef {
            name: name.to_string(),
            address: addr(&address),
            min: 0,
            max,
        }
    }

    fn catalogue() -> ParameterCatalogue {
        ParameterCatalogue::new(vec![
            param(PRESET, [0x00, 0x01], 3),
            param("gain", [0x01, 0x02], 100),
            param("volume", [0x01, 0x03], 100),
            param("reverb_on", [0x01, 0x04], 1),
            param("treble", [0x01, 0x05], 100),
            param("bass", [0x01, 0x06], 100),
            param(TUNER_ON, [0x7F, 0x00], 1),
        ])
    }

    fn controller() -> (
        DeviceController<FakeTransport>,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctl = DeviceController::new(
            FakeTransport::connected(),
            SysExCodec::new(profile()),
            catalogue(),
            ControllerSettings::default(),
            TunerSettings::default(),
            tx,
        );
        (ctl, rx)
    }

    /// Reassemble everything written so far into complete SysEx messages
    fn sent(ctl: &mut DeviceController<FakeTransport>) -> Vec<Vec<u8>> {
        let mut framer = MidiFramer::default();
        let packets = std::mem::take(&mut ctl.transport_mut().written);
        packets
            .iter()
            .flat_map(|p| framer.push_packet(p))
            .filter_map(|r| match r {
                Ok(MidiMessage::SysEx(bytes)) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    /// Device DT1 carrying `data` at `address`, as BLE packets
    fn device_data(address: Address, data: &[u8]) -> Vec<Vec<u8>> {
        let bytes = SysExCodec::new(profile())
            .encode(&SysExMessage::ReadResponse {
                address,
                data: data.to_vec(),
            })
            .unwrap();
        packetize(&bytes, 23, 0)
    }

    fn feed(ctl: &mut DeviceController<FakeTransport>, packets: Vec<Vec<u8>>, now: Instant) {
        for p in packets {
            ctl.handle_packet(&p, now);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn timeouts(events: &[AppEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, AppEvent::Timeout { .. }))
            .count()
    }

    #[test]
    fn test_write_echo_then_disconnect() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);

        ctl.write_parameter(gain, 64, now).unwrap();
        assert_eq!(
            sent(&mut ctl),
            vec![vec![0xF0, 0x41, 0x10, 0x12, 0x01, 0x02, 0x40, 0x3D, 0xF7]]
        );
        assert_eq!(
            ctl.state(&gain),
            ParameterState::WritePending {
                value: 64,
                previous: None
            }
        );

        feed(&mut ctl, device_data(gain, &[64]), now);
        assert_eq!(ctl.state(&gain), ParameterState::Known(64));

        // Second write, link drops before the echo
        ctl.write_parameter(gain, 70, now).unwrap();
        ctl.transport_mut().status = ConnectionStatus::Disconnected;
        ctl.set_connection_status(ConnectionStatus::Disconnected, now);
        assert_eq!(ctl.state(&gain), ParameterState::Unknown);
        assert_eq!(ctl.in_flight(), 0);
    }

    #[test]
    fn test_last_write_wins() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);

        ctl.write_parameter(gain, 10, now).unwrap();
        ctl.write_parameter(gain, 20, now).unwrap();
        ctl.write_parameter(gain, 30, now).unwrap();
        assert_eq!(sent(&mut ctl).len(), 1);
        assert_eq!(ctl.state(&gain).value(), Some(30));

        // Echo of the first write flushes the queued value
        feed(&mut ctl, device_data(gain, &[10]), now);
        let flushed = sent(&mut ctl);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0][6], 30);
        assert_eq!(
            ctl.state(&gain),
            ParameterState::WritePending {
                value: 30,
                previous: Some(10)
            }
        );

        feed(&mut ctl, device_data(gain, &[30]), now);
        assert_eq!(ctl.state(&gain), ParameterState::Known(30));
        assert!(sent(&mut ctl).is_empty());
    }

    #[test]
    fn test_device_value_wins_on_mismatched_echo() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);
        ctl.write_parameter(gain, 50, now).unwrap();
        feed(&mut ctl, device_data(gain, &[48]), now);
        assert_eq!(ctl.state(&gain), ParameterState::Known(48));
    }

    #[test]
    fn test_read_timeout_emits_one_event() {
        let (mut ctl, mut rx) = controller();
        let start = Instant::now();
        let gain = addr(&[0x01, 0x02]);

        ctl.read_parameter(gain, start).unwrap();
        assert_eq!(ctl.state(&gain), ParameterState::ReadPending { last: None });

        assert_eq!(ctl.poll_timeouts(start + Duration::from_millis(999)), 0);
        assert_eq!(ctl.poll_timeouts(start + Duration::from_millis(1000)), 1);
        assert_eq!(ctl.poll_timeouts(start + Duration::from_millis(5000)), 0);
        assert_eq!(ctl.state(&gain), ParameterState::Unknown);

        let events = drain(&mut rx);
        assert_eq!(timeouts(&events), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            AppEvent::Timeout {
                kind: RequestKind::Read,
                ..
            }
        )));

        // Late response is treated as unsolicited data
        feed(&mut ctl, device_data(gain, &[5]), start);
        assert_eq!(ctl.state(&gain), ParameterState::Known(5));
    }

    #[test]
    fn test_read_while_pending_does_not_resend() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);
        ctl.read_parameter(gain, now).unwrap();
        ctl.read_parameter(gain, now).unwrap();
        assert_eq!(sent(&mut ctl).len(), 1);
    }

    #[test]
    fn test_write_queued_behind_read() {
        let (mut ctl, mut rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);
        ctl.read_parameter(gain, now).unwrap();
        drain(&mut rx);
        ctl.write_parameter(gain, 99, now).unwrap();
        assert_eq!(sent(&mut ctl).len(), 1);
        // Still ReadPending, so nothing to report yet
        assert!(drain(&mut rx).is_empty());
        assert_eq!(ctl.state(&gain), ParameterState::ReadPending { last: None });

        feed(&mut ctl, device_data(gain, &[12]), now);
        let flushed = sent(&mut ctl);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0][3], 0x12);
        assert_eq!(flushed[0][6], 99);
    }

    #[test]
    fn test_read_all_is_bounded() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();

        ctl.read_all(now).unwrap();
        let first = sent(&mut ctl);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|m| m[3] == 0x11));
        assert_eq!(ctl.in_flight(), 4);
        assert_eq!(ctl.queued_reads(), 3);

        // One completion lets exactly one more read out
        let preset = addr(&[0x00, 0x01]);
        feed(&mut ctl, device_data(preset, &[2]), now);
        assert_eq!(sent(&mut ctl).len(), 1);
        assert_eq!(ctl.in_flight(), 4);

        // Timeouts also free capacity
        ctl.poll_timeouts(now + Duration::from_secs(2));
        assert_eq!(sent(&mut ctl).len(), 2);
        assert_eq!(ctl.queued_reads(), 0);
    }

    #[test]
    fn test_bulk_response_updates_each_parameter() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let start = addr(&[0x01, 0x02]);

        ctl.read_block(start, 3, now).unwrap();
        let request = sent(&mut ctl);
        assert_eq!(request[0][3..8], [0x11, 0x01, 0x02, 0x00, 0x03]);
        assert_eq!(ctl.in_flight(), 3);

        // reverb_on = 7 is out of range and dropped on its own
        feed(&mut ctl, device_data(start, &[40, 80, 7]), now);
        assert_eq!(ctl.state(&start), ParameterState::Known(40));
        assert_eq!(ctl.state(&addr(&[0x01, 0x03])), ParameterState::Known(80));
        assert!(ctl.state(&addr(&[0x01, 0x04])).is_pending());
    }

    #[test]
    fn test_corrupt_response_changes_nothing() {
        let (mut ctl, mut rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);
        ctl.read_parameter(gain, now).unwrap();
        drain(&mut rx);

        let mut bytes = SysExCodec::new(profile())
            .encode(&SysExMessage::ReadResponse {
                address: gain,
                data: vec![64],
            })
            .unwrap();
        bytes[6] = 65;
        feed(&mut ctl, packetize(&bytes, 23, 0), now);

        assert_eq!(ctl.state(&gain), ParameterState::ReadPending { last: None });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_writes_fail_while_disconnected() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        ctl.transport_mut().status = ConnectionStatus::Reconnecting { attempt: 1 };
        assert_eq!(
            ctl.write_parameter(addr(&[0x01, 0x02]), 1, now),
            Err(ControllerError::Transport(TransportError::NotConnected))
        );
        assert_eq!(ctl.state(&addr(&[0x01, 0x02])), ParameterState::Unknown);
        assert!(ctl.read_all(now).is_err());
    }

    #[test]
    fn test_rejected_write_leaves_state_untouched() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let gain = addr(&[0x01, 0x02]);
        ctl.transport_mut().reject_writes = true;
        assert!(matches!(
            ctl.write_parameter(gain, 1, now),
            Err(ControllerError::Transport(TransportError::Write(_)))
        ));
        assert_eq!(ctl.state(&gain), ParameterState::Unknown);
    }

    #[test]
    fn test_out_of_range_write_is_rejected() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        assert!(matches!(
            ctl.write_named("reverb_on", 2, now),
            Err(ControllerError::ValueOutOfRange { value: 2, .. })
        ));
        assert_eq!(
            ctl.write_named("nope", 1, now),
            Err(ControllerError::UnknownParameter("nope".into()))
        );
        assert!(sent(&mut ctl).is_empty());
    }

    #[test]
    fn test_reconnect_reloads_parameters() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        ctl.transport_mut().status = ConnectionStatus::Disconnected;
        ctl.set_connection_status(ConnectionStatus::Disconnected, now);

        ctl.transport_mut().status = ConnectionStatus::Connected;
        ctl.set_connection_status(ConnectionStatus::Connected, now);
        let messages = sent(&mut ctl);
        // Identity request plus the first batch of reads
        assert_eq!(messages[0], identity_request());
        assert_eq!(messages.len(), 1 + 4);
    }

    #[test]
    fn test_preset_navigation_wraps() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();
        let preset = addr(&[0x00, 0x01]);
        feed(&mut ctl, device_data(preset, &[3]), now);

        ctl.apply_action(&PedalAction::NextPreset, 127, now).unwrap();
        assert_eq!(ctl.state(&preset).value(), Some(0));
        feed(&mut ctl, device_data(preset, &[0]), now);

        ctl.apply_action(&PedalAction::PreviousPreset, 127, now).unwrap();
        assert_eq!(ctl.state(&preset).value(), Some(3));
    }

    #[test]
    fn test_pedal_actions_write_parameters() {
        let (mut ctl, _rx) = controller();
        let now = Instant::now();

        ctl.apply_action(&PedalAction::SelectPreset { preset: None }, 2, now)
            .unwrap();
        assert_eq!(ctl.state(&addr(&[0x00, 0x01])).value(), Some(2));

        ctl.apply_action(
            &PedalAction::Expression {
                parameter: "volume".into(),
            },
            127,
            now,
        )
        .unwrap();
        assert_eq!(ctl.state(&addr(&[0x01, 0x03])).value(), Some(100));

        ctl.apply_action(&PedalAction::ToggleTuner, 127, now).unwrap();
        assert_eq!(ctl.state(&addr(&[0x7F, 0x00])).value(), Some(1));

        ctl.apply_action(
            &PedalAction::Set {
                parameter: "gain".into(),
                value: 33,
            },
            0,
            now,
        )
        .unwrap();
        assert_eq!(ctl.state(&addr(&[0x01, 0x02])).value(), Some(33));

        assert!(ctl
            .apply_action(&PedalAction::SelectPreset { preset: Some(9) }, 0, now)
            .is_err());
    }

    #[test]
    fn test_tuner_stream_and_identity_events() {
        let (mut ctl, mut rx) = controller();
        let now = Instant::now();
        let codec = SysExCodec::new(profile());

        let tuner = codec
            .encode(&SysExMessage::TunerStream {
                address: addr(&[0x7F, 0x01]),
                data: vec![0x7F],
            })
            .unwrap();
        feed(&mut ctl, packetize(&tuner, 23, 0), now);

        let identity = [
            0xF0, 0x7E, 0x10, 0x06, 0x02, 0x41, 0x33, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0xF7,
        ];
        feed(&mut ctl, packetize(&identity, 23, 0), now);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            AppEvent::TunerSample(s) if s.reading == TunerReading::NoSignal
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::DeviceIdentified(_))));
        assert_eq!(ctl.tuner_reading(), Some(TunerReading::NoSignal));

        ctl.set_connection_status(ConnectionStatus::Disconnected, now);
        assert_eq!(ctl.tuner_reading(), None);
    }
}
