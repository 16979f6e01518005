//! The supervisor loop.
//!
//! # Responsibilities
//! - Reap terminated worker units and restart crashed listeners/scanners
//! - Aggregate per-client rates into ring-wide rates
//! - Evict idle clients and write transfer-log rows on rollover
//! - Re-read the configuration file when its mtime advances
//! - Orchestrate graceful shutdown with a deadlock valve
//!
//! # Design Decisions
//! - 250 ms base tick while serving; 100 ms ticks while draining so
//!   shutdown completes promptly
//! - A shutdown request interrupts the sleep immediately
//! - Join errors are logged and swallowed; spawn happens on the next pass

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::client::percent_lag;
use crate::config::{ConfigWatcher, Snapshot};
use crate::net::listener;
use crate::observability::metrics;
use crate::ring::AggregateRates;
use crate::scanner;
use crate::server::registry::{
    LifecycleCell, ServerPayload, ServerSlot, UnitHandle,
};
use crate::server::Shared;
use crate::transferlog::TransferLog;

/// Draining passes (100 ms each) before clean shutdown is abandoned.
const MAX_DRAIN_TICKS: u32 = 100;

pub struct Supervisor {
    shared: Arc<Shared>,
    slots: Vec<ServerSlot>,
    watcher: ConfigWatcher,
    transfer_log: Option<TransferLog>,
}

impl Supervisor {
    pub fn new(shared: Arc<Shared>, slots: Vec<ServerSlot>, watcher: ConfigWatcher) -> Self {
        let transfer_log =
            TransferLog::from_config(&shared.snapshot().config.transfer_log, Utc::now().timestamp());
        Self {
            shared,
            slots,
            watcher,
            transfer_log,
        }
    }

    /// Drive the server until shutdown completes (or the drain valve
    /// trips).
    pub async fn run(mut self) {
        let mut draining = false;
        let mut drain_ticks: u32 = 0;

        loop {
            let now = self.shared.clock.now_nanos();
            let wall_now = Utc::now().timestamp();

            if self.shared.shutdown.is_requested() && !draining {
                draining = true;
                tracing::info!("Shutdown requested, draining connections");
                self.begin_drain();
            }

            if draining {
                drain_ticks += 1;
                if drain_ticks >= MAX_DRAIN_TICKS {
                    tracing::error!("Shutdown did not complete cleanly after ~10 seconds");
                    break;
                }
            }

            // Transfer log rollover boundary
            let tlog_write = !draining
                && self
                    .transfer_log
                    .as_ref()
                    .map(|t| t.rollover_due(wall_now))
                    .unwrap_or(false);

            let server_count = self.pass_server_units(draining).await;
            self.pass_clients(now, tlog_write, draining).await;

            // Configuration re-read on mtime change
            let mut config_reset = false;
            if !draining {
                config_reset = self.poll_config();
            }

            // Reset the transfer-log window from the current time
            if !draining && (tlog_write || config_reset) {
                self.transfer_log = TransferLog::from_config(
                    &self.shared.snapshot().config.transfer_log,
                    Utc::now().timestamp(),
                );
            }

            let client_count = self.shared.clients.count();
            tracing::trace!(clients = client_count, servers = server_count, "Supervisor pass");

            if draining && client_count == 0 && server_count == 0 {
                break;
            }

            if draining {
                tokio::time::sleep(Duration::from_millis(100)).await;
            } else {
                tokio::select! {
                    biased;
                    _ = self.shared.shutdown.requested() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
        }
    }

    /// Start draining: close listener sockets (which unblocks the
    /// acceptors) and request close on every live unit.
    fn begin_drain(&self) {
        for slot in &self.slots {
            if let ServerPayload::Listener(listener) = &slot.payload {
                listener.close_socket();
            }
            if let Some(unit) = &slot.unit {
                if unit.lifecycle.request_close() {
                    tracing::debug!(kind = slot.kind_name(), "Requesting shutdown of server unit");
                }
            }
        }
        self.shared.clients.request_close_all();
    }

    /// Reap closed server units and respawn empty slots. Returns the
    /// number of units still running.
    async fn pass_server_units(&mut self, draining: bool) -> usize {
        let mut server_count = 0;

        for slot in self.slots.iter_mut() {
            let state = slot.unit.as_ref().map(|u| u.lifecycle.state());
            if let Some(state) = state {
                tracing::trace!(
                    kind = slot.kind_name(),
                    state = state.name(),
                    "Server unit state"
                );

                if state.is_terminal() {
                    let unit = slot.unit.take().expect("state observed above");
                    tracing::debug!(kind = slot.kind_name(), "Joining closed server unit");
                    if let Err(e) = unit.join.await {
                        tracing::error!(
                            kind = slot.kind_name(),
                            error = %e,
                            "Error joining closed server unit"
                        );
                    }
                } else {
                    server_count += 1;
                }
            }

            // Restart crashed workers; never while draining
            if slot.unit.is_none() && !draining {
                let lifecycle = Arc::new(LifecycleCell::new());
                let join = match &slot.payload {
                    ServerPayload::Listener(listener) => {
                        tracing::debug!(port = %listener.endpoint.port, "Starting listener unit");
                        tokio::spawn(listener::listen_task(
                            Arc::clone(&self.shared),
                            Arc::clone(listener),
                            Arc::clone(&lifecycle),
                        ))
                    }
                    ServerPayload::Scanner(job) => {
                        tracing::debug!(dir = %job.dir.display(), "Starting scanner unit");
                        tokio::spawn(scanner::scan_task(
                            Arc::clone(&self.shared),
                            Arc::clone(job),
                            Arc::clone(&lifecycle),
                        ))
                    }
                };
                slot.unit = Some(UnitHandle { lifecycle, join });
                server_count += 1;
            }
        }

        server_count
    }

    /// Reap closed clients; update statistics, transfer log and idle
    /// eviction for the live ones; publish aggregate rates.
    async fn pass_clients(&mut self, now: u64, tlog_write: bool, draining: bool) {
        for unit in self.shared.clients.take_closed() {
            tracing::debug!(client = unit.record.id, "Removing closed client unit");
            if let Err(e) = unit.join.await {
                tracing::error!(client = unit.record.id, error = %e, "Error joining closed client");
            }
        }

        let snapshot = self.shared.snapshot();
        let timeout_nanos = snapshot.config.server.client_timeout_secs as u64 * 1_000_000_000;
        let offsets = self.shared.ring.offsets();

        let mut totals = AggregateRates::default();
        for (record, lifecycle) in self.shared.clients.live() {
            let lag = percent_lag(record.reader_position(), offsets);
            let rates = record.stats.calc(now, lag);
            totals.tx_packet_rate += rates.tx_packet_rate;
            totals.tx_byte_rate += rates.tx_byte_rate;
            totals.rx_packet_rate += rates.rx_packet_rate;
            totals.rx_byte_rate += rates.rx_byte_rate;

            if tlog_write {
                if let Some(tlog) = &self.transfer_log {
                    if let Err(e) = tlog.write_row(&record) {
                        tracing::error!(error = %e, "Error writing transfer log");
                    }
                }
            }

            if !draining
                && timeout_nanos > 0
                && now.saturating_sub(record.last_exchange()) > timeout_nanos
                && lifecycle.request_close()
            {
                tracing::info!(client = %record.address(), "Closing idle client connection");
            }
        }

        self.shared.ring.set_rates(totals);
        metrics::record_server_stats(self.shared.clients.count(), &totals);
    }

    /// Returns true when a changed config file was re-read successfully.
    fn poll_config(&mut self) -> bool {
        let Some(result) = self.watcher.poll() else {
            return false;
        };
        match result {
            Ok(config) => match Snapshot::new(config) {
                Ok(snapshot) => {
                    tracing::info!("Re-read configuration parameters");
                    self.shared.install_snapshot(snapshot);
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Re-read configuration is unusable, keeping previous");
                    false
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Error re-reading configuration, keeping previous");
                false
            }
        }
    }
}
