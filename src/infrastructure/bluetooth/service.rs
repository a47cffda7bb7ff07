//! Bluetooth Service Module
//!
//! Coordinates scanning and connection, then hands each link to its own task.
//!
//! A link task owns the peripheral. It drains an ordered write queue (one
//! write awaited at a time), forwards notifications, watches for
//! disconnects and runs the reconnect policy. The rest of the application
//! only talks to it through a [`LinkHandle`] and the [`LinkEvent`] channel.

use crate::domain::models::{ConnectionStatus, LinkRole};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::{
    connection::{BleConnection, LinkConfig},
    scanner::BleScanner,
    transport::{LinkConnection, Transport, TransportError},
};
use anyhow::Result;
use btleplug::api::{Central, Manager as _};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Everything a link reports back to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    State(ConnectionStatus),
    /// One BLE notification, in arrival order
    Packet(Vec<u8>),
    WriteFailed(TransportError),
    /// Reconnect attempts exhausted; the link is down for good
    Lost { attempts: u32 },
}

#[derive(Debug)]
enum LinkCommand {
    Write(Vec<u8>),
    Disconnect,
}

/// Controller-side end of a link
pub struct LinkHandle {
    role: LinkRole,
    mtu: usize,
    commands: mpsc::UnboundedSender<LinkCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl LinkHandle {
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Explicit teardown; never triggers a reconnect
    pub fn disconnect(&self) {
        info!("Disconnecting {} link", self.role);
        let _ = self.commands.send(LinkCommand::Disconnect);
    }
}

impl Transport for LinkHandle {
    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn write(&mut self, packet: Vec<u8>) -> Result<(), TransportError> {
        if !self.status().is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .send(LinkCommand::Write(packet))
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Main Bluetooth service coordinating all BLE links
pub struct BluetoothService {
    adapter: Adapter,
    links: HashMap<LinkRole, watch::Receiver<ConnectionStatus>>,
}

impl BluetoothService {
    /// Open the first Bluetooth adapter
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);
        Ok(Self {
            adapter,
            links: HashMap::new(),
        })
    }

    /// Scan for, connect and subscribe to the peripheral for `role`.
    ///
    /// Only one live link per role is allowed.
    pub async fn connect(
        &mut self,
        role: LinkRole,
        settings: &LinkSettings,
    ) -> Result<(LinkHandle, mpsc::UnboundedReceiver<LinkEvent>), TransportError> {
        if let Some(status) = self.links.get(&role) {
            if *status.borrow() != ConnectionStatus::Disconnected {
                return Err(TransportError::AlreadyConnected);
            }
        }

        let config = LinkConfig::from_settings(settings)?;
        let scanner = BleScanner::new(self.adapter.clone());
        let peripheral = scanner.find(&config.selector, config.scan_timeout).await?;
        let connection = BleConnection::open(&self.adapter, peripheral, &config).await?;
        info!("{} link connected", role);

        let (handle, events) = spawn_link(role, config, connection);
        self.links.insert(role, handle.status.clone());
        Ok((handle, events))
    }
}

/// Hand an open connection to its own task
fn spawn_link<C: LinkConnection>(
    role: LinkRole,
    config: LinkConfig,
    connection: C,
) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

    let handle = LinkHandle {
        role,
        mtu: config.mtu,
        commands: command_tx,
        status: status_rx,
    };
    let task = LinkTask {
        role,
        config,
        commands: command_rx,
        status: status_tx,
        events: event_tx,
    };
    tokio::spawn(task.run(connection));
    (handle, event_rx)
}

/// Why a connected session ended
enum SessionEnd {
    Requested,
    Dropped(&'static str),
}

enum ReconnectOutcome<C> {
    Reconnected(C),
    Exhausted(u32),
    Cancelled,
}

struct LinkTask {
    role: LinkRole,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkTask {
    async fn run<C: LinkConnection>(mut self, mut connection: C) {
        loop {
            self.publish(ConnectionStatus::Connected);

            match self.session(&connection).await {
                SessionEnd::Requested => {
                    connection.close().await;
                    self.publish(ConnectionStatus::Disconnected);
                    info!("{} link closed", self.role);
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    warn!("{} link dropped: {}", self.role, reason);
                }
            }

            if self.fail_queued_writes() {
                self.publish(ConnectionStatus::Disconnected);
                return;
            }

            match self.reconnect(&connection).await {
                ReconnectOutcome::Reconnected(next) => connection = next,
                ReconnectOutcome::Exhausted(attempts) => {
                    warn!("{} link: {}", self.role, TransportError::ConnectionLost { attempts });
                    self.publish(ConnectionStatus::Disconnected);
                    let _ = self.events.send(LinkEvent::Lost { attempts });
                    return;
                }
                ReconnectOutcome::Cancelled => {
                    self.publish(ConnectionStatus::Disconnected);
                    return;
                }
            }
        }
    }

    /// Pump writes and notifications until the link drops or is closed
    async fn session<C: LinkConnection>(&mut self, connection: &C) -> SessionEnd {
        let mut packets = match connection.packets().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}: no notification stream: {}", self.role, e);
                return SessionEnd::Dropped("notification stream unavailable");
            }
        };

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Write(packet)) => {
                        #[cfg(debug_assertions)]
                        tracing::trace!("{} write: {:02X?}", self.role, packet);
                        if let Err(e) = connection.write(&packet).await {
                            warn!("{} write failed: {}", self.role, e);
                            let _ = self.events.send(LinkEvent::WriteFailed(e));
                        }
                    }
                    Some(LinkCommand::Disconnect) | None => return SessionEnd::Requested,
                },
                packet = packets.next() => match packet {
                    Some(packet) => {
                        let _ = self.events.send(LinkEvent::Packet(packet));
                    }
                    None => return SessionEnd::Dropped("peripheral disconnected"),
                },
            }
        }
    }

    /// Writes queued when the link dropped are failed, never replayed.
    /// Returns true if a disconnect was requested in the meantime.
    fn fail_queued_writes(&mut self) -> bool {
        let mut failed = 0;
        let mut disconnect = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LinkCommand::Write(_) => {
                    failed += 1;
                    let _ = self
                        .events
                        .send(LinkEvent::WriteFailed(TransportError::NotConnected));
                }
                LinkCommand::Disconnect => disconnect = true,
            }
        }
        if failed > 0 {
            warn!("{}: failed {} queued writes", self.role, failed);
        }
        disconnect
    }

    async fn reconnect<C: LinkConnection>(&mut self, previous: &C) -> ReconnectOutcome<C> {
        let policy = self.config.reconnect.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(delay) = policy.delay_for(attempt) else {
                return ReconnectOutcome::Exhausted(attempt - 1);
            };
            self.publish(ConnectionStatus::Reconnecting { attempt });
            info!(
                "{}: reconnect attempt {} in {} ms",
                self.role,
                attempt,
                delay.as_millis()
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(LinkCommand::Write(_)) => {
                            let _ = self.events.send(LinkEvent::WriteFailed(TransportError::NotConnected));
                        }
                        Some(LinkCommand::Disconnect) | None => return ReconnectOutcome::Cancelled,
                    }
                }
            }

            match previous.reopen(&self.config).await {
                Ok(connection) => {
                    info!("{}: reconnected on attempt {}", self.role, attempt);
                    return ReconnectOutcome::Reconnected(connection);
                }
                Err(e) => warn!("{}: reconnect attempt {} failed: {}", self.role, attempt, e),
            }
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        let _ = self.events.send(LinkEvent::State(status));
    }
}
