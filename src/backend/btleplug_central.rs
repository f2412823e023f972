use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AggregatorError, Result};

use super::{CentralBackend, CentralHandle, DiscoveredDevice, NotifyStream};

/// `btleplug`-backed [`CentralBackend`]. Wraps the first adapter returned by
/// the platform manager, mirroring how a single-adapter host normally works.
pub struct BtleplugCentral {
    adapter: Adapter,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to create BLE manager: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to list BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| AggregatorError::Fatal("no BLE adapters found".into()))?;
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await.map_err(|e| {
            AggregatorError::TransientLink {
                peer: address.to_string(),
                reason: format!("failed to list peripherals: {e}"),
            }
        })?;

        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(peripheral);
                }
            }
        }

        Err(AggregatorError::TransientLink {
            peer: address.to_string(),
            reason: "peripheral not found after scan".into(),
        })
    }
}

#[async_trait]
impl CentralBackend for BtleplugCentral {
    async fn scan(&self, addresses: HashSet<String>) -> Result<NotifyStream> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| AggregatorError::TransientLink {
                peer: "*".into(),
                reason: format!("failed to start scan: {e}"),
            })?;

        let adapter = self.adapter.clone();
        let events = adapter
            .events()
            .await
            .map_err(|e| AggregatorError::TransientLink {
                peer: "*".into(),
                reason: format!("failed to get adapter events: {e}"),
            })?;

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let addresses = addresses.clone();
            async move {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    return None;
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok()??;
                let address = props.address.to_string();
                if !addresses.iter().any(|a| a.eq_ignore_ascii_case(&address)) {
                    return None;
                }
                Some(DiscoveredDevice {
                    address,
                    name: props.local_name,
                })
            }
        });

        Ok(Box::pin(stream))
    }

    async fn connect(&self, device: &DiscoveredDevice, timeout: Duration) -> Result<CentralHandle> {
        let peripheral = self.find_peripheral(&device.address).await?;

        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(AggregatorError::TransientLink {
                    peer: device.address.clone(),
                    reason: "connect timed out".into(),
                });
            }
            Ok(Err(e)) => {
                let _ = peripheral.disconnect().await;
                return Err(AggregatorError::TransientLink {
                    peer: device.address.clone(),
                    reason: format!("connect failed: {e}"),
                });
            }
            Ok(Ok(())) => {}
        }

        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(AggregatorError::TransientLink {
                peer: device.address.clone(),
                reason: format!("service discovery failed: {e}"),
            });
        }

        Ok(CentralHandle(peripheral))
    }

    async fn start_notify(
        &self,
        handle: &CentralHandle,
        characteristic_uuid: Uuid,
        on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
        on_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        let peripheral = handle.0.clone();

        let target: Characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic_uuid)
            .ok_or_else(|| AggregatorError::TransientLink {
                peer: format!("{:?}", peripheral.id()),
                reason: format!("characteristic {characteristic_uuid} not found"),
            })?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| AggregatorError::TransientLink {
                peer: format!("{:?}", peripheral.id()),
                reason: format!("subscribe failed: {e}"),
            })?;

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| AggregatorError::TransientLink {
                peer: format!("{:?}", peripheral.id()),
                reason: format!("failed to get notification stream: {e}"),
            })?;

        let filter_uuid = target.uuid;
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == filter_uuid {
                    on_data(notification.value);
                }
            }
            // The notification stream ends when the peripheral disconnects.
            debug!("notification stream closed, reporting disconnect");
            on_disconnect();
        });

        Ok(())
    }

    async fn disconnect(&self, handle: &CentralHandle) -> Result<()> {
        match handle.0.is_connected().await {
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to query connection state before disconnect");
            }
            Ok(true) => {}
        }

        handle.0.disconnect().await.or_else(|e| {
            // Already-disconnected is not an error; disconnect must be idempotent.
            warn!(error = %e, "disconnect returned an error, treating as already-disconnected");
            Ok(())
        })
    }
}
