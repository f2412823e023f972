use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, TickOutcome};
use crate::backend::{CentralBackend, PeripheralBackend};
use crate::config::Config;
use crate::publish::publish;
use crate::session::PeerSession;
use crate::supervisor::Supervisor;

/// Top-level cooperative scheduler: one task owns all peer state and
/// ticks the aggregator on a fixed interval, interleaving supervisor work and
/// a graceful shutdown path.
pub struct Scheduler {
    config: Arc<Config>,
    aggregator: Aggregator,
    supervisor: Supervisor,
    peripheral: Arc<dyn PeripheralBackend>,
    central: Arc<dyn CentralBackend>,
    sessions: Vec<PeerSession>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        central: Arc<dyn CentralBackend>,
        peripheral: Arc<dyn PeripheralBackend>,
        characteristic_uuid: Uuid,
    ) -> Self {
        let sessions = config
            .roster
            .iter()
            .cloned()
            .map(|spec| PeerSession::new(spec, config.data_validity_threshold()))
            .collect();

        let aggregator = Aggregator::new(config.max_mcu_time_difference(), config.max_consecutive_fail);
        let supervisor = Supervisor::new(central.clone(), peripheral.clone(), config.clone(), characteristic_uuid);

        Self {
            config,
            aggregator,
            supervisor,
            peripheral,
            central,
            sessions,
        }
    }

    /// Run until a shutdown signal (Ctrl-C / SIGTERM) is received, then
    /// disconnect every live session before returning.
    pub async fn run(&mut self) -> crate::error::Result<()> {
        let mut tick_interval = tokio::time::interval(self.config.main_loop_interval());
        let mut last_reconcile = Instant::now() - self.config.scan_check_interval();

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.run_one_tick(&mut last_reconcile).await;
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "failed to listen for shutdown signal, shutting down anyway");
                    } else {
                        info!("shutdown signal received");
                    }
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn run_one_tick(&mut self, last_reconcile: &mut Instant) {
        for session in &mut self.sessions {
            session.poll_link_lost();
        }

        let (outcome, frame) = self.aggregator.tick(&self.sessions);
        match outcome {
            TickOutcome::Frame => {
                if let Some(frame) = frame {
                    if let Err(e) = publish(self.peripheral.as_ref(), &frame, self.config.mtu_ceiling).await {
                        error!(error = %e, "publish failed");
                    }
                }
            }
            TickOutcome::AdapterRecoveryNeeded { consecutive_fails } => {
                self.supervisor.recover_adapter(&mut self.sessions, consecutive_fails).await;
            }
            TickOutcome::Skipped(_) => {}
        }

        if last_reconcile.elapsed() >= self.config.scan_check_interval() {
            self.supervisor.reconcile(&mut self.sessions).await;
            *last_reconcile = Instant::now();
        }
    }

    async fn shutdown(&mut self) {
        for session in &mut self.sessions {
            if let Some(handle) = session.handle.take() {
                if let Err(e) = self.central.disconnect(&handle).await {
                    warn!(peer = %session.short_name(), error = %e, "disconnect during shutdown failed");
                }
            }
        }
    }
}
