//! BLE Scanner Module
//!
//! Finds the peripheral a link should attach to.

use crate::infrastructure::bluetooth::protocol::{DeviceSelector, SCAN_POLL_MS};
use crate::infrastructure::bluetooth::transport::TransportError;
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scan until a peripheral matching `selector` shows up or `timeout`
    /// expires
    pub async fn find(
        &self,
        selector: &DeviceSelector,
        timeout: Duration,
    ) -> Result<Peripheral, TransportError> {
        info!(
            "Scanning for '{}*' (timeout: {} ms)",
            selector.name_prefix,
            timeout.as_millis()
        );
        // Some peripherals do not advertise the MIDI service; match on name
        self.adapter.start_scan(ScanFilter::default()).await?;

        let result = tokio::time::timeout(timeout, self.poll(selector)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        match result {
            Ok(peripheral) => peripheral,
            Err(_) => Err(TransportError::Connection(format!(
                "no device matching '{}' found within {} ms",
                selector.name_prefix,
                timeout.as_millis()
            ))),
        }
    }

    async fn poll(&self, selector: &DeviceSelector) -> Result<Peripheral, TransportError> {
        loop {
            for peripheral in self.adapter.peripherals().await? {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let address = peripheral.address().to_string();
                if selector.matches(props.local_name.as_deref(), &address) {
                    info!(
                        "Found {} ({})",
                        props.local_name.as_deref().unwrap_or("Unknown"),
                        address
                    );
                    return Ok(peripheral);
                }
                debug!("Skipping {:?} ({})", props.local_name, address);
            }
            tokio::time::sleep(Duration::from_millis(SCAN_POLL_MS)).await;
        }
    }
}
