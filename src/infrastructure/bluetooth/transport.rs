//! Transport Abstraction
//!
//! The seam between the protocol layers and a BLE link. Controllers only
//! see this trait, so tests substitute an in-memory fake for the radio.

use crate::domain::models::ConnectionStatus;
use crate::infrastructure::bluetooth::connection::LinkConfig;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Initial connect failed; the user can retry
    #[error("connection failed: {0}")]
    Connection(String),
    /// Reconnect attempts exhausted
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("link is not connected")]
    NotConnected,
    #[error("link is already connected")]
    AlreadyConnected,
    /// BLE write rejected by the stack or the peripheral
    #[error("write failed: {0}")]
    Write(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => Self::NotConnected,
            other => Self::Connection(other.to_string()),
        }
    }
}

/// Ordered, non-blocking packet sink for one BLE link.
///
/// `write` enqueues a single BLE-MIDI packet; packets reach the peripheral
/// in submission order. Writing while not connected fails immediately.
pub trait Transport {
    fn status(&self) -> ConnectionStatus;

    /// Negotiated (or configured) ATT MTU
    fn mtu(&self) -> usize;

    fn write(&mut self, packet: Vec<u8>) -> Result<(), TransportError>;
}

/// Notification payloads from the MIDI characteristic, in arrival order.
/// Ends when the peripheral goes away.
pub type PacketStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A connected peripheral as driven by its link task.
///
/// The async counterpart of [`Transport`]: the link task owns one of these,
/// the controllers never see it.
pub trait LinkConnection: Sized + Send + Sync + 'static {
    fn packets(&self) -> impl Future<Output = Result<PacketStream, TransportError>> + Send;

    /// One BLE-MIDI packet, write without response
    fn write(&self, packet: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Connect the same peripheral again after a drop
    fn reopen(&self, config: &LinkConfig)
        -> impl Future<Output = Result<Self, TransportError>> + Send;
}

/// Bounded exponential backoff for unexpected disconnects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}

impl ReconnectPolicy {
    /// Delay before 1-based attempt `attempt`, or `None` once the budget is spent
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory transport used by controller tests, and an in-memory
    //! peripheral for link task tests

    use super::*;
    use futures::channel::mpsc;
    use std::sync::{Arc, Mutex, MutexGuard};

    pub struct FakeTransport {
        pub status: ConnectionStatus,
        pub mtu: usize,
        pub written: Vec<Vec<u8>>,
        pub reject_writes: bool,
    }

    impl FakeTransport {
        pub fn connected() -> Self {
            Self {
                status: ConnectionStatus::Connected,
                mtu: 23,
                written: Vec::new(),
                reject_writes: false,
            }
        }
    }

    impl Transport for FakeTransport {
        fn status(&self) -> ConnectionStatus {
            self.status
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn write(&mut self, packet: Vec<u8>) -> Result<(), TransportError> {
            if !self.status.is_connected() {
                return Err(TransportError::NotConnected);
            }
            if self.reject_writes {
                return Err(TransportError::Write("rejected by fake".into()));
            }
            self.written.push(packet);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct Radio {
        /// Present while a session is subscribed; dropping it ends the stream
        pub packets: Option<mpsc::UnboundedSender<Vec<u8>>>,
        pub written: Vec<Vec<u8>>,
        pub reopen_ok: bool,
        pub reopens: u32,
        pub closed: bool,
    }

    /// Peripheral whose clones share one [`Radio`]
    #[derive(Clone, Default)]
    pub struct FakeLink(Arc<Mutex<Radio>>);

    impl FakeLink {
        pub fn radio(&self) -> MutexGuard<'_, Radio> {
            self.0.lock().unwrap()
        }

        /// Out of range: the current packet stream ends
        pub fn drop_link(&self) {
            self.radio().packets = None;
        }

        pub fn notify(&self, packet: &[u8]) {
            if let Some(tx) = &self.radio().packets {
                let _ = tx.unbounded_send(packet.to_vec());
            }
        }
    }

    impl LinkConnection for FakeLink {
        async fn packets(&self) -> Result<PacketStream, TransportError> {
            let (tx, rx) = mpsc::unbounded();
            self.radio().packets = Some(tx);
            Ok(Box::pin(rx))
        }

        async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
            let mut radio = self.radio();
            if radio.packets.is_none() {
                return Err(TransportError::NotConnected);
            }
            radio.written.push(packet.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.radio().closed = true;
        }

        async fn reopen(&self, _config: &LinkConfig) -> Result<Self, TransportError> {
            let mut radio = self.radio();
            radio.reopens += 1;
            if radio.reopen_ok {
                Ok(self.clone())
            } else {
                Err(TransportError::Connection("peripheral not in range".into()))
            }
        }
    }
}
