//! Pedal Controller
//!
//! Decodes MIDI events from a BLE-MIDI foot pedal on its own link and maps
//! them to logical actions. The pedal link is independent of the amp link:
//! nothing the pedal sends can fail the amp control path.

use crate::domain::models::{AppEvent, ConnectionStatus};
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::midi::framer::MidiFramer;
use crate::infrastructure::midi::message::MidiMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// CC values at or above this are "pressed"
const PRESS_THRESHOLD: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PedalTrigger {
    ControlChange {
        #[serde(default)]
        channel: Option<u8>,
        controller: u8,
    },
    ProgramChange {
        #[serde(default)]
        channel: Option<u8>,
        /// `None` matches every program number
        #[serde(default)]
        program: Option<u8>,
    },
    Note {
        #[serde(default)]
        channel: Option<u8>,
        note: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PedalAction {
    NextPreset,
    PreviousPreset,
    /// `None` takes the preset number from the incoming event value
    SelectPreset {
        #[serde(default)]
        preset: Option<u8>,
    },
    Toggle {
        parameter: String,
    },
    Set {
        parameter: String,
        value: u8,
    },
    /// Continuous 0..127 control scaled onto the parameter range
    Expression {
        parameter: String,
    },
    ToggleTuner,
    ReloadAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PedalBinding {
    pub trigger: PedalTrigger,
    #[serde(flatten)]
    pub action: PedalAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PedalEventKind {
    ControlChange,
    ProgramChange,
    NoteOn,
    NoteOff,
}

/// One physical pedal input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PedalEvent {
    pub kind: PedalEventKind,
    pub channel: u8,
    /// Controller, program or note number
    pub number: u8,
    /// CC value, velocity, or the program number
    pub value: u8,
}

impl PedalEvent {
    pub fn is_press(&self) -> bool {
        match self.kind {
            PedalEventKind::ControlChange => self.value >= PRESS_THRESHOLD,
            PedalEventKind::ProgramChange => true,
            PedalEventKind::NoteOn => self.value > 0,
            PedalEventKind::NoteOff => false,
        }
    }

    fn from_message(message: &MidiMessage) -> Option<Self> {
        let (kind, channel, number, value) = match *message {
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => (PedalEventKind::ControlChange, channel, controller, value),
            MidiMessage::ProgramChange { channel, program } => {
                (PedalEventKind::ProgramChange, channel, program, program)
            }
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => (PedalEventKind::NoteOn, channel, note, velocity),
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => (PedalEventKind::NoteOff, channel, note, velocity),
            _ => return None,
        };
        Some(Self {
            kind,
            channel,
            number,
            value,
        })
    }
}

impl PedalTrigger {
    fn matches(&self, event: &PedalEvent) -> bool {
        let channel_ok = |c: &Option<u8>| c.map_or(true, |c| c == event.channel);
        match (self, event.kind) {
            (Self::ControlChange { channel, controller }, PedalEventKind::ControlChange) => {
                channel_ok(channel) && *controller == event.number
            }
            (Self::ProgramChange { channel, program }, PedalEventKind::ProgramChange) => {
                channel_ok(channel) && program.map_or(true, |p| p == event.number)
            }
            (Self::Note { channel, note }, PedalEventKind::NoteOn | PedalEventKind::NoteOff) => {
                channel_ok(channel) && *note == event.number
            }
            _ => false,
        }
    }
}

/// An action to run against the device controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PedalDispatch {
    pub event: PedalEvent,
    pub action: PedalAction,
}

pub fn default_bindings() -> Vec<PedalBinding> {
    let cc = |controller| PedalTrigger::ControlChange {
        channel: None,
        controller,
    };
    vec![
        PedalBinding {
            trigger: cc(80),
            action: PedalAction::PreviousPreset,
        },
        PedalBinding {
            trigger: cc(81),
            action: PedalAction::NextPreset,
        },
        PedalBinding {
            trigger: cc(82),
            action: PedalAction::ToggleTuner,
        },
        PedalBinding {
            trigger: cc(11),
            action: PedalAction::Expression {
                parameter: "volume".to_string(),
            },
        },
        PedalBinding {
            trigger: PedalTrigger::ProgramChange {
                channel: None,
                program: None,
            },
            action: PedalAction::SelectPreset { preset: None },
        },
    ]
}

pub struct PedalController<T: Transport> {
    transport: T,
    framer: MidiFramer,
    bindings: Vec<PedalBinding>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: Transport> PedalController<T> {
    pub fn new(
        transport: T,
        framer: MidiFramer,
        bindings: Vec<PedalBinding>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            framer,
            bindings,
            event_sender,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        if !status.is_connected() {
            self.framer.reset();
        }
    }

    /// Decode one BLE notification into actions.
    ///
    /// Each physical event yields at most one action, emitted on the event
    /// channel and returned for dispatch. Anything unusable is logged and
    /// dropped.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Vec<PedalDispatch> {
        let mut dispatches = Vec::new();
        for result in self.framer.push_packet(packet) {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("Ignoring malformed pedal data: {}", e);
                    continue;
                }
            };
            if let Some(dispatch) = self.map(&message) {
                let _ = self.event_sender.send(AppEvent::PedalAction {
                    event: dispatch.event,
                    action: dispatch.action.clone(),
                });
                dispatches.push(dispatch);
            }
        }
        dispatches
    }

    fn map(&self, message: &MidiMessage) -> Option<PedalDispatch> {
        let Some(event) = PedalEvent::from_message(message) else {
            trace!("Ignoring pedal message {:02X?}", message.to_bytes());
            return None;
        };
        let Some(binding) = self.bindings.iter().find(|b| b.trigger.matches(&event)) else {
            debug!("No binding for pedal event {:?}", event);
            return None;
        };

        let fires = matches!(binding.action, PedalAction::Expression { .. }) || event.is_press();
        if !fires {
            trace!("Pedal release {:?}", event);
            return None;
        }

        Some(PedalDispatch {
            event,
            action: binding.action.clone(),
        })
    }
}
