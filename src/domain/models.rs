use crate::domain::controller::{ParameterState, RequestKind};
use crate::domain::pedal::{PedalAction, PedalEvent};
use crate::domain::tuner::TunerSample;
use crate::infrastructure::midi::sysex::{Address, DeviceIdentity};
use std::fmt;

/// Which BLE link an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    Amp,
    Pedal,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amp => write!(f, "amp"),
            Self::Pedal => write!(f, "pedal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Unexpected drop, reconnect attempt `attempt` in progress
    Reconnecting { attempt: u32 },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// A parameter's state after a change, as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    pub address: Address,
    pub name: Option<String>,
    pub state: ParameterState,
}

/// Everything the UI layer subscribes to
#[derive(Debug, Clone)]
pub enum AppEvent {
    ParameterChanged(ParameterChange),
    Timeout {
        address: Address,
        kind: RequestKind,
    },
    TunerSample(TunerSample),
    ConnectionStatus {
        link: LinkRole,
        status: ConnectionStatus,
    },
    /// Terminal: reconnect attempts exhausted, user action required
    ConnectionLost {
        link: LinkRole,
        attempts: u32,
    },
    WriteFailed {
        link: LinkRole,
        reason: String,
    },
    PedalAction {
        event: PedalEvent,
        action: PedalAction,
    },
    DeviceIdentified(DeviceIdentity),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
