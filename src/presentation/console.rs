//! Line-oriented console
//!
//! Parses stdin commands and renders [`AppEvent`]s as log lines.

use crate::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, StatusMessage};
use crate::domain::tuner::TunerReading;
use crate::infrastructure::midi::sysex::Address;
use thiserror::Error;

pub const HELP: &str = "commands: read <name|addr>, write <name|addr> <value>, readall, \
block <addr> <size>, tuner on|off, status, help, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Parameter name or hex address, resolved against the catalogue later
    Read(String),
    Write { key: String, value: u8 },
    ReadAll,
    Block { address: Address, size: u32 },
    Tuner(bool),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Accepts decimal or `0x` hex
fn parse_number<T: TryFrom<u32>>(s: &str) -> Result<T, ConsoleError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed
        .ok()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConsoleError::InvalidNumber(s.to_string()))
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Ok(None);
        };

        let command = match (verb.to_lowercase().as_str(), args) {
            ("read" | "r", [key]) => Self::Read(key.to_string()),
            ("read" | "r", _) => return Err(ConsoleError::Usage("read <name|addr>")),
            ("write" | "w", [key, value]) => Self::Write {
                key: key.to_string(),
                value: parse_number(value)?,
            },
            ("write" | "w", _) => return Err(ConsoleError::Usage("write <name|addr> <value>")),
            ("readall", []) => Self::ReadAll,
            ("block", [address, size]) => Self::Block {
                address: address
                    .parse()
                    .map_err(|_| ConsoleError::InvalidAddress(address.to_string()))?,
                size: parse_number(size)?,
            },
            ("block", _) => return Err(ConsoleError::Usage("block <addr> <size>")),
            ("tuner", ["on"]) => Self::Tuner(true),
            ("tuner", ["off"]) => Self::Tuner(false),
            ("tuner", _) => return Err(ConsoleError::Usage("tuner on|off")),
            ("status", []) => Self::Status,
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit" | "q", _) => Self::Quit,
            _ => return Err(ConsoleError::UnknownCommand(line.trim().to_string())),
        };
        Ok(Some(command))
    }
}

/// One-line rendering of an event, with the severity it should be logged at
pub fn describe(event: &AppEvent) -> StatusMessage {
    let (severity, message) = match event {
        AppEvent::ParameterChanged(change) => (
            MessageSeverity::Info,
            format!(
                "{} [{}] = {}",
                change.name.as_deref().unwrap_or("?"),
                change.address,
                change.state
            ),
        ),
        AppEvent::Timeout { address, kind } => (
            MessageSeverity::Warning,
            format!("{} of {} timed out", kind, address),
        ),
        AppEvent::TunerSample(sample) => {
            let text = match sample.reading {
                TunerReading::NoSignal => "tuner: --".to_string(),
                TunerReading::Pitch(p) => format!(
                    "tuner: {}{} {:+.1}c{}",
                    p.name,
                    p.octave,
                    sample.smoothed_cents.unwrap_or(p.cents),
                    if p.clamped { " (out of range)" } else { "" }
                ),
            };
            (MessageSeverity::Info, text)
        }
        AppEvent::ConnectionStatus { link, status } => {
            let severity = match status {
                ConnectionStatus::Connected => MessageSeverity::Success,
                ConnectionStatus::Reconnecting { .. } => MessageSeverity::Warning,
                _ => MessageSeverity::Info,
            };
            (severity, format!("{} link: {:?}", link, status))
        }
        AppEvent::ConnectionLost { link, attempts } => (
            MessageSeverity::Error,
            format!(
                "{} link lost after {} reconnect attempts; restart to retry",
                link, attempts
            ),
        ),
        AppEvent::WriteFailed { link, reason } => (
            MessageSeverity::Warning,
            format!("{} write failed: {}", link, reason),
        ),
        AppEvent::PedalAction { event, action } => (
            MessageSeverity::Info,
            format!("pedal {:?} {} -> {:?}", event.kind, event.number, action),
        ),
        AppEvent::DeviceIdentified(identity) => (
            MessageSeverity::Success,
            format!(
                "device id {:02X}: manufacturer {:02X?}, family {:02X?}, member {:02X?}, version {:02X?}",
                identity.device_id,
                identity.manufacturer,
                identity.family,
                identity.member,
                identity.version
            ),
        ),
        AppEvent::LogMessage(message) => return message.clone(),
    };
    StatusMessage { message, severity }
}

pub fn log_event(event: &AppEvent) {
    let StatusMessage { message, severity } = describe(event);
    match severity {
        MessageSeverity::Info | MessageSeverity::Success => tracing::info!("{}", message),
        MessageSeverity::Warning => tracing::warn!("{}", message),
        MessageSeverity::Error => tracing::error!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::controller::{ParameterState, RequestKind};
    use crate::domain::models::{LinkRole, ParameterChange};
    use crate::domain::tuner::{Pitch, TunerSample};

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  "), Ok(None));
        assert_eq!(
            ConsoleCommand::parse("read gain"),
            Ok(Some(ConsoleCommand::Read("gain".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("WRITE volume 0x40"),
            Ok(Some(ConsoleCommand::Write {
                key: "volume".into(),
                value: 64
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("block 20-00-00-00 16"),
            Ok(Some(ConsoleCommand::Block {
                address: Address::from_u7([0x20, 0, 0, 0]),
                size: 16
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("tuner off"),
            Ok(Some(ConsoleCommand::Tuner(false)))
        );
        assert_eq!(ConsoleCommand::parse("readall"), Ok(Some(ConsoleCommand::ReadAll)));
        assert_eq!(ConsoleCommand::parse("q"), Ok(Some(ConsoleCommand::Quit)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ConsoleCommand::parse("write gain"),
            Err(ConsoleError::Usage("write <name|addr> <value>"))
        );
        assert_eq!(
            ConsoleCommand::parse("write gain 300"),
            Err(ConsoleError::InvalidNumber("300".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("block zz 4"),
            Err(ConsoleError::InvalidAddress("zz".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("block aé1 4"),
            Err(ConsoleError::InvalidAddress("aé1".into()))
        );
        assert!(matches!(
            ConsoleCommand::parse("jump"),
            Err(ConsoleError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_describe_severity() {
        let address = Address::from_u7([0x20, 0, 0, 1]);
        let changed = describe(&AppEvent::ParameterChanged(ParameterChange {
            address,
            name: Some("gain".into()),
            state: ParameterState::Known(12),
        }));
        assert_eq!(changed.severity, MessageSeverity::Info);
        assert!(changed.message.starts_with("gain [20 00 00 01]"));

        let timeout = describe(&AppEvent::Timeout {
            address,
            kind: RequestKind::Write,
        });
        assert_eq!(timeout.severity, MessageSeverity::Warning);

        let lost = describe(&AppEvent::ConnectionLost {
            link: LinkRole::Amp,
            attempts: 5,
        });
        assert_eq!(lost.severity, MessageSeverity::Error);
        assert!(lost.message.contains("after 5"));
    }

    #[test]
    fn test_describe_tuner() {
        let silent = describe(&AppEvent::TunerSample(TunerSample {
            reading: TunerReading::NoSignal,
            smoothed_cents: None,
        }));
        assert_eq!(silent.message, "tuner: --");

        let pitched = describe(&AppEvent::TunerSample(TunerSample {
            reading: TunerReading::Pitch(Pitch {
                midi_note: 69,
                name: "A",
                octave: 4,
                cents: -3.0,
                clamped: false,
            }),
            smoothed_cents: Some(-2.5),
        }));
        assert_eq!(pitched.message, "tuner: A4 -2.5c");
    }
}
