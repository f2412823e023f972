use std::collections::HashSet as StdHashSet;
use std::time::Duration;

use async_trait::async_trait;
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, Service,
};
use bluer::{Adapter, AdvertisementHandle, Session};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AggregatorError, Result};

use super::PeripheralBackend;

/// `bluer` (BlueZ over D-Bus) backed [`PeripheralBackend`]. Registers one GATT
/// service with a single NOTIFY characteristic whose value is pushed through
/// a watch channel to the live BlueZ notify loop.
pub struct BluerPeripheral {
    adapter: Adapter,
    value_tx: watch::Sender<Vec<u8>>,
    app_handle: Mutex<Option<ApplicationHandle>>,
    adv_handle: Mutex<Option<AdvertisementHandle>>,
}

impl BluerPeripheral {
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to open BlueZ session: {e}")))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to get default adapter: {e}")))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to power on adapter: {e}")))?;

        let (value_tx, _value_rx) = watch::channel(Vec::new());

        Ok(Self {
            adapter,
            value_tx,
            app_handle: Mutex::new(None),
            adv_handle: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PeripheralBackend for BluerPeripheral {
    async fn register_service(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<()> {
        let value_rx = self.value_tx.subscribe();

        let characteristic = Characteristic {
            uuid: characteristic_uuid,
            notify: Some(CharacteristicNotify {
                notify: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let mut value_rx = value_rx.clone();
                    Box::pin(async move {
                        debug!("notify session started for upstream subscriber");
                        loop {
                            if value_rx.changed().await.is_err() {
                                break;
                            }
                            let value = value_rx.borrow_and_update().clone();
                            if notifier.notify(value).await.is_err() {
                                debug!("notify session ended");
                                break;
                            }
                        }
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        let service = Service {
            uuid: service_uuid,
            primary: true,
            characteristics: vec![characteristic],
            ..Default::default()
        };

        let app = Application {
            services: vec![service],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to register GATT service: {e}")))?;

        *self.app_handle.lock().await = Some(handle);
        info!(%service_uuid, %characteristic_uuid, "registered GATT service");
        Ok(())
    }

    async fn update(&self, value: Vec<u8>) -> Result<()> {
        self.value_tx
            .send(value)
            .map_err(|e| AggregatorError::Publish {
                reason: format!("no notify loop subscribed to the value channel: {e}"),
            })
    }

    async fn register_advertisement(
        &self,
        name: String,
        service_uuids: Vec<Uuid>,
        appearance: u16,
    ) -> Result<()> {
        let advertisement = Advertisement {
            service_uuids: service_uuids.into_iter().collect::<StdHashSet<_>>(),
            local_name: Some(name),
            appearance: Some(appearance),
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to register advertisement: {e}")))?;

        *self.adv_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn restart_adapter(&self) -> Result<()> {
        warn!("power-cycling BLE adapter to recover from connected-but-silent pathology");
        self.adapter
            .set_powered(false)
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to power off adapter: {e}")))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.adapter
            .set_powered(true)
            .await
            .map_err(|e| AggregatorError::Fatal(format!("failed to power on adapter: {e}")))?;
        Ok(())
    }
}
