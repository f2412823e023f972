use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{CentralBackend, DiscoveredDevice, PeripheralBackend};
use crate::config::Config;
use crate::session::{PeerSession, PeerStatus};

/// Maintains as many sessions as possible in the `Connected` state.
///
/// Owns no peer state itself; `sessions` is owned by the scheduler and passed
/// in by reference on every call, matching [`crate::aggregator::Aggregator`].
pub struct Supervisor {
    central: Arc<dyn CentralBackend>,
    peripheral: Arc<dyn PeripheralBackend>,
    config: Arc<Config>,
    characteristic_uuid: Uuid,
    /// Enforces at most one concurrent scan process-wide.
    scanning: AtomicBool,
}

/// Releases the scan guard on drop, including on early return or panic.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(
        central: Arc<dyn CentralBackend>,
        peripheral: Arc<dyn PeripheralBackend>,
        config: Arc<Config>,
        characteristic_uuid: Uuid,
    ) -> Self {
        Self {
            central,
            peripheral,
            config,
            characteristic_uuid,
            scanning: AtomicBool::new(false),
        }
    }

    /// One supervisor pass: short-circuits if nothing is missing or a scan is
    /// already in progress, otherwise scans once and attempts to reconnect
    /// every missing slot it found.
    pub async fn reconcile(&self, sessions: &mut [PeerSession]) {
        let missing: Vec<usize> = sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != PeerStatus::Connected)
            .map(|(i, _)| i)
            .collect();

        if missing.is_empty() {
            return;
        }

        if self.scanning.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = ScanGuard(&self.scanning);

        let pre_scan_status: HashMap<usize, PeerStatus> =
            missing.iter().map(|&i| (i, sessions[i].status)).collect();
        for &i in &missing {
            sessions[i].mark_reconnecting();
        }

        let addresses: HashSet<String> = missing.iter().map(|&i| sessions[i].spec.address.clone()).collect();
        info!(count = addresses.len(), "scanning for missing peers");
        let found = self.scan_for(addresses).await;

        for &i in &missing {
            let address = sessions[i].spec.address.clone();
            let Some(device) = found.get(&address) else {
                // Not found this pass: revert to the pre-scan status rather
                // than leaving it stuck at Reconnecting with nothing to show
                // for it (matches "scan did not find device -> Unavailable").
                sessions[i].status = pre_scan_status[&i];
                continue;
            };

            tokio::time::sleep(self.config.settle_delay()).await;

            match self.connect_and_subscribe(device, &sessions[i]).await {
                Ok(handle) => {
                    info!(peer = %sessions[i].short_name(), "connected");
                    sessions[i].mark_connected(handle);
                }
                Err(e) => {
                    warn!(peer = %sessions[i].short_name(), error = %e, "reconnect attempt failed");
                    sessions[i].status = PeerStatus::Disconnected;
                }
            }
        }
    }

    /// Force-disconnect every session and power-cycle the adapter.
    pub async fn recover_adapter(&self, sessions: &mut [PeerSession], consecutive_fails: u32) {
        let reason = crate::error::AggregatorError::AdapterPathology { consecutive_fails };
        warn!(%reason, "disconnecting all sessions and power-cycling adapter");
        for session in sessions.iter_mut() {
            if let Some(handle) = session.handle.take() {
                if let Err(e) = self.central.disconnect(&handle).await {
                    warn!(peer = %session.short_name(), error = %e, "disconnect during adapter recovery failed");
                }
            }
            session.status = PeerStatus::Disconnected;
        }
        if let Err(e) = self.peripheral.restart_adapter().await {
            warn!(error = %e, "adapter restart failed");
        }
    }

    async fn scan_for(&self, addresses: HashSet<String>) -> HashMap<String, DiscoveredDevice> {
        let mut stream = match self.central.scan(addresses.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to start scan");
                return HashMap::new();
            }
        };

        let mut found = HashMap::new();
        let deadline = tokio::time::sleep(self.config.scan_timeout());
        tokio::pin!(deadline);

        loop {
            if found.len() >= addresses.len() {
                break;
            }
            tokio::select! {
                _ = &mut deadline => break,
                next = stream.next() => {
                    match next {
                        Some(device) => {
                            found.insert(device.address.clone(), device);
                        }
                        None => break,
                    }
                }
            }
        }

        found
    }

    async fn connect_and_subscribe(
        &self,
        device: &DiscoveredDevice,
        session: &PeerSession,
    ) -> crate::error::Result<crate::backend::CentralHandle> {
        let handle = self.central.connect(device, self.config.connection_timeout()).await?;

        let queue = session.queue.clone();
        let on_data: Box<dyn Fn(Vec<u8>) + Send + Sync> = Box::new(move |bytes| queue.put(bytes));

        let link_lost = session.link_lost.clone();
        let on_disconnect: Box<dyn Fn() + Send + Sync> =
            Box::new(move || link_lost.store(true, Ordering::SeqCst));

        if let Err(e) = self
            .central
            .start_notify(&handle, self.characteristic_uuid, on_data, on_disconnect)
            .await
        {
            let _ = self.central.disconnect(&handle).await;
            return Err(e);
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NotifyStream;
    use crate::config::PeerSpec;
    use crate::error::{AggregatorError, Result};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeCentral {
        devices: Vec<DiscoveredDevice>,
        scans_in_flight: Arc<AtomicBool>,
        connect_should_fail: bool,
    }

    #[async_trait]
    impl CentralBackend for FakeCentral {
        async fn scan(&self, addresses: HashSet<String>) -> Result<NotifyStream> {
            if self.scans_in_flight.swap(true, Ordering::SeqCst) {
                panic!("two concurrent scans observed");
            }
            let scans_in_flight = self.scans_in_flight.clone();
            let items: Vec<DiscoveredDevice> = self
                .devices
                .iter()
                .filter(|d| addresses.contains(&d.address))
                .cloned()
                .collect();
            let stream = futures::stream::iter(items).then(move |d| {
                let scans_in_flight = scans_in_flight.clone();
                async move {
                    scans_in_flight.store(false, Ordering::SeqCst);
                    d
                }
            });
            Ok(Box::pin(stream))
        }

        async fn connect(&self, device: &DiscoveredDevice, _timeout: Duration) -> Result<crate::backend::CentralHandle> {
            if self.connect_should_fail {
                return Err(AggregatorError::TransientLink {
                    peer: device.address.clone(),
                    reason: "forced failure".into(),
                });
            }
            Err(AggregatorError::TransientLink {
                peer: device.address.clone(),
                reason: "FakeCentral cannot produce a real handle; use start_notify-free tests".into(),
            })
        }

        async fn start_notify(
            &self,
            _handle: &crate::backend::CentralHandle,
            _characteristic_uuid: Uuid,
            _on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
            _on_disconnect: Box<dyn Fn() + Send + Sync>,
        ) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _handle: &crate::backend::CentralHandle) -> Result<()> {
            Ok(())
        }
    }

    struct FakePeripheral {
        restart_calls: StdMutex<u32>,
    }

    #[async_trait]
    impl PeripheralBackend for FakePeripheral {
        async fn register_service(&self, _service_uuid: Uuid, _characteristic_uuid: Uuid) -> Result<()> {
            Ok(())
        }
        async fn update(&self, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn register_advertisement(
            &self,
            _name: String,
            _service_uuids: Vec<Uuid>,
            _appearance: u16,
        ) -> Result<()> {
            Ok(())
        }
        async fn restart_adapter(&self) -> Result<()> {
            *self.restart_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            roster: vec![],
            main_loop_interval_ms: 120,
            max_mcu_time_difference_ms: 150,
            data_validity_threshold_ms: 300,
            scan_timeout_ms: 200,
            scan_check_interval_ms: 50,
            connection_timeout_ms: 100,
            reconnection_delay_ms: 10,
            settle_delay_ms: 1,
            max_consecutive_fail: 15,
            mtu_ceiling: 512,
            advertisement_name: "CENTRAL_PI".into(),
        })
    }

    fn session(address: &str) -> PeerSession {
        PeerSession::new(
            PeerSpec {
                address: address.to_string(),
                display_name: address.to_string(),
                short_name: Some(address.to_string()),
            },
            Duration::from_millis(300),
        )
    }

    #[tokio::test]
    async fn reconcile_is_a_no_op_when_all_connected() {
        let mut sessions = vec![session("A")];
        sessions[0].status = PeerStatus::Connected;

        let central = Arc::new(FakeCentral {
            devices: vec![],
            scans_in_flight: Arc::new(AtomicBool::new(false)),
            connect_should_fail: false,
        });
        let peripheral = Arc::new(FakePeripheral {
            restart_calls: StdMutex::new(0),
        });
        let sup = Supervisor::new(central, peripheral, test_config(), Uuid::nil());

        sup.reconcile(&mut sessions).await;
        assert_eq!(sessions[0].status, PeerStatus::Connected);
    }

    #[tokio::test]
    async fn unfound_device_reverts_to_pre_scan_status() {
        let mut sessions = vec![session("AA:BB:CC:DD:EE:01")];
        // starts Unavailable

        let central = Arc::new(FakeCentral {
            devices: vec![], // never found
            scans_in_flight: Arc::new(AtomicBool::new(false)),
            connect_should_fail: false,
        });
        let peripheral = Arc::new(FakePeripheral {
            restart_calls: StdMutex::new(0),
        });
        let sup = Supervisor::new(central, peripheral, test_config(), Uuid::nil());

        sup.reconcile(&mut sessions).await;
        assert_eq!(sessions[0].status, PeerStatus::Unavailable);
    }

    #[tokio::test]
    async fn connect_failure_after_discovery_lands_on_disconnected() {
        let mut sessions = vec![session("AA:BB:CC:DD:EE:01")];

        let central = Arc::new(FakeCentral {
            devices: vec![DiscoveredDevice {
                address: "AA:BB:CC:DD:EE:01".into(),
                name: Some("sensor".into()),
            }],
            scans_in_flight: Arc::new(AtomicBool::new(false)),
            connect_should_fail: true,
        });
        let peripheral = Arc::new(FakePeripheral {
            restart_calls: StdMutex::new(0),
        });
        let sup = Supervisor::new(central, peripheral, test_config(), Uuid::nil());

        sup.reconcile(&mut sessions).await;
        assert_eq!(sessions[0].status, PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn recover_adapter_disconnects_everyone_and_power_cycles() {
        let mut sessions = vec![session("A"), session("B")];
        sessions[0].status = PeerStatus::Connected;
        sessions[1].status = PeerStatus::Connected;

        let central = Arc::new(FakeCentral {
            devices: vec![],
            scans_in_flight: Arc::new(AtomicBool::new(false)),
            connect_should_fail: false,
        });
        let peripheral = Arc::new(FakePeripheral {
            restart_calls: StdMutex::new(0),
        });
        let sup = Supervisor::new(central, peripheral.clone(), test_config(), Uuid::nil());

        sup.recover_adapter(&mut sessions, 16).await;

        assert_eq!(sessions[0].status, PeerStatus::Disconnected);
        assert_eq!(sessions[1].status, PeerStatus::Disconnected);
        assert_eq!(*peripheral.restart_calls.lock().unwrap(), 1);
    }
}
