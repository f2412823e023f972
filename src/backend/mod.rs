//! Pluggable BLE transport contracts.
//!
//! The aggregation core (supervisor, aggregator, publish path) depends only on
//! [`CentralBackend`] and [`PeripheralBackend`]. Concrete implementations live in
//! [`btleplug_central`] and [`bluer_peripheral`] and are the only places that know
//! about a specific BLE stack.

pub mod bluer_peripheral;
pub mod btleplug_central;

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

pub use bluer_peripheral::BluerPeripheral;
pub use btleplug_central::BtleplugCentral;

/// A device seen during a scan, matched against the fixed roster by address.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Opaque live connection to one peer. Implementations are free to wrap
/// whatever the underlying BLE stack hands back; the core only ever clones,
/// stores, or passes this value back to the backend that produced it.
#[derive(Clone)]
pub struct CentralHandle(pub(crate) btleplug::platform::Peripheral);

pub type NotifyStream = Pin<Box<dyn Stream<Item = DiscoveredDevice> + Send>>;

/// The BLE central role: scan the fixed roster, connect, subscribe to
/// notifications, and report disconnects.
///
/// `on_data` and `on_disconnect` may be invoked from any thread; their bodies
/// must be non-blocking and must not re-enter the backend.
#[async_trait]
pub trait CentralBackend: Send + Sync {
    /// Scan indefinitely for devices matching `addresses`. The caller is
    /// responsible for bounding and cancelling the scan (dropping the stream).
    async fn scan(&self, addresses: HashSet<String>) -> Result<NotifyStream>;

    /// Connect to a discovered device, bounded by `timeout`.
    async fn connect(&self, device: &DiscoveredDevice, timeout: Duration) -> Result<CentralHandle>;

    /// Subscribe to notifications on `characteristic_uuid`, invoking `on_data`
    /// for every notification and `on_disconnect` if the link drops.
    async fn start_notify(
        &self,
        handle: &CentralHandle,
        characteristic_uuid: Uuid,
        on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
        on_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<()>;

    /// Idempotent: disconnecting an already-disconnected handle is a no-op.
    async fn disconnect(&self, handle: &CentralHandle) -> Result<()>;
}

/// The BLE peripheral role: advertise a single NOTIFY characteristic carrying
/// the combined, compressed telemetry frame.
#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    async fn register_service(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<()>;

    /// Push a new characteristic value. Notifies any subscriber. The actual
    /// transmission may complete asynchronously but must be observable to the
    /// subscriber before the next tick.
    async fn update(&self, value: Vec<u8>) -> Result<()>;

    async fn register_advertisement(
        &self,
        name: String,
        service_uuids: Vec<Uuid>,
        appearance: u16,
    ) -> Result<()>;

    /// Power-cycle the local adapter to recover from a "connected but silent"
    /// pathology. The central and peripheral roles share one physical adapter,
    /// so this is exposed on whichever backend has access to adapter power
    /// control (BlueZ, via `bluer`, on Linux).
    async fn restart_adapter(&self) -> Result<()>;
}
