//! BLE Connection Module
//!
//! Handles connecting a peripheral, GATT discovery and the BLE-MIDI
//! characteristic subscription.

use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::protocol::{self, DeviceSelector};
use crate::infrastructure::bluetooth::transport::{
    LinkConnection, PacketStream, ReconnectPolicy, TransportError,
};
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::{future, stream, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parsed, validated link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub selector: DeviceSelector,
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    pub mtu: usize,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl LinkConfig {
    pub fn from_settings(settings: &LinkSettings) -> Result<Self, TransportError> {
        Ok(Self {
            selector: DeviceSelector {
                name_prefix: settings.name_prefix.clone(),
                address: settings.address.clone(),
            },
            service_uuid: protocol::parse_uuid(&settings.service_uuid)?,
            write_char_uuid: protocol::parse_uuid(&settings.write_char_uuid)?,
            notify_char_uuid: protocol::parse_uuid(&settings.notify_char_uuid)?,
            mtu: settings.mtu.max(protocol::DEFAULT_MTU),
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            reconnect: settings.reconnect.clone(),
        })
    }
}

/// A connected peripheral with its BLE-MIDI characteristics resolved
pub struct BleConnection {
    /// Source of disconnect events for this peripheral
    adapter: Adapter,
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
}

impl BleConnection {
    /// Connect (or reconnect) `peripheral` and subscribe to notifications
    pub async fn open(
        adapter: &Adapter,
        peripheral: Peripheral,
        config: &LinkConfig,
    ) -> Result<Self, TransportError> {
        if !peripheral.is_connected().await? {
            tokio::time::timeout(config.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| {
                    TransportError::Connection(format!(
                        "connect timed out after {} ms",
                        config.connect_timeout.as_millis()
                    ))
                })??;
        }

        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(protocol::DISCOVERY_SETTLE_MS)).await;

        tokio::time::timeout(config.connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Connection("service discovery timed out".into()))??;

        let (write_char, notify_char) = Self::find_characteristics(&peripheral, config)?;

        peripheral.subscribe(&notify_char).await?;
        info!("Subscribed to BLE-MIDI notifications");

        Ok(Self {
            adapter: adapter.clone(),
            peripheral,
            write_char,
            notify_char,
        })
    }

    fn find_characteristics(
        peripheral: &Peripheral,
        config: &LinkConfig,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == config.service_uuid)
            .ok_or_else(|| {
                TransportError::Connection(format!("service {} not found", config.service_uuid))
            })?;
        debug!(
            "Found service {} with {} characteristics",
            service.uuid,
            service.characteristics.len()
        );

        let find = |uuid: Uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Connection(format!("characteristic {} not found", uuid)))
        };

        Ok((find(config.write_char_uuid)?, find(config.notify_char_uuid)?))
    }
}

impl LinkConnection for BleConnection {
    /// Notifications merged with the adapter's disconnect event for this
    /// peripheral; the stream ends at whichever comes first
    async fn packets(&self) -> Result<PacketStream, TransportError> {
        let notify_uuid = self.notify_char.uuid;
        let notifications = self.peripheral.notifications().await?.filter_map(move |n| {
            if n.uuid != notify_uuid {
                debug!("Ignoring notification from {}", n.uuid);
            }
            future::ready((n.uuid == notify_uuid).then(|| Some(n.value)))
        });

        let id = self.peripheral.id();
        let disconnects = match self.adapter.events().await {
            Ok(events) => events
                .filter_map(move |event| {
                    let gone = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
                    future::ready(gone.then_some(None::<Vec<u8>>))
                })
                .boxed(),
            Err(e) => {
                warn!("No adapter events, drops surface when notifications end: {}", e);
                stream::empty().boxed()
            }
        };

        let packets = stream::select(notifications, disconnects)
            .take_while(|packet| future::ready(packet.is_some()))
            .filter_map(future::ready);
        Ok(Box::pin(packets))
    }

    async fn write(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.write_char, packet, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.peripheral.unsubscribe(&self.notify_char).await {
            debug!("Unsubscribe failed: {}", e);
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    async fn reopen(&self, config: &LinkConfig) -> Result<Self, TransportError> {
        Self::open(&self.adapter, self.peripheral.clone(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_from_defaults() {
        let config = LinkConfig::from_settings(&LinkSettings::amp()).unwrap();
        assert_eq!(config.service_uuid, protocol::parse_uuid(protocol::MIDI_SERVICE_UUID).unwrap());
        assert_eq!(config.write_char_uuid, config.notify_char_uuid);
        assert_eq!(config.mtu, protocol::DEFAULT_MTU);
    }

    #[test]
    fn test_link_config_rejects_bad_uuid() {
        let settings = LinkSettings {
            service_uuid: "bogus".into(),
            ..LinkSettings::amp()
        };
        assert!(matches!(
            LinkConfig::from_settings(&settings),
            Err(TransportError::Connection(_))
        ));
    }
}
