// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background loop that times out runs whose worker lease expired.
//!
//! A run is reaped when it is `PROCESSING` and its `lease_expires_at` is in
//! the past. That covers workers that crashed, were killed, or hung long
//! enough to miss every heartbeat. Each candidate is finalized with the
//! timeout policy: `FAILED` / `TIMEOUT`, charging
//! `min(minimum_fee, reservation_max_cost)` and refunding the rest.
//!
//! Losing the claim is the common case (the worker finished between the scan
//! and the claim) and is logged at debug level. Any other failure leaves the
//! run for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runmeter_core::{Finalizer, RunStore};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan for expired leases.
    pub poll_interval: Duration,
    /// Maximum runs finalized per scan.
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// Counters for one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Candidates returned by the scan.
    pub scanned: usize,
    /// Runs this pass finalized.
    pub reaped: usize,
    /// Runs another process finalized first.
    pub lost: usize,
    /// Runs left for the next cycle after an error.
    pub failed: usize,
}

/// Background loop that finalizes runs with expired leases.
pub struct ReaperLoop {
    finalizer: Finalizer,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl ReaperLoop {
    /// Create a new reaper.
    pub fn new(finalizer: Finalizer, config: ReaperConfig) -> Self {
        Self {
            finalizer,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to scan for expired leases");
                    }
                }
            }
        }

        info!("Reaper stopped");
    }

    /// Scan once and time out every expired run found.
    pub async fn run_once(&self) -> Result<ReapStats> {
        let expired = self
            .finalizer
            .store()
            .list_expired_leases(Utc::now(), self.config.batch_size)
            .await?;

        let mut stats = ReapStats {
            scanned: expired.len(),
            ..Default::default()
        };
        if expired.is_empty() {
            debug!("No expired leases found");
            return Ok(stats);
        }

        info!(count = expired.len(), "Found runs with expired leases");

        for run in expired {
            match self
                .finalizer
                .finalize_timeout(&run.run_id, &run.tenant_id)
                .await
            {
                Ok(outcome) => {
                    stats.reaped += 1;
                    info!(
                        run_id = %run.run_id,
                        tenant_id = %run.tenant_id,
                        charged = outcome.charged,
                        refund = outcome.refund,
                        "Run timed out"
                    );
                }
                Err(e) if e.is_race_lost() => {
                    stats.lost += 1;
                    debug!(run_id = %run.run_id, reason = %e, "Run finalized before reaper");
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        run_id = %run.run_id,
                        tenant_id = %run.tenant_id,
                        error_code = e.error_code(),
                        error = %e,
                        "Failed to time out run"
                    );
                }
            }
        }

        Ok(stats)
    }
}
