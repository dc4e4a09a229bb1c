// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background loop that recovers runs stuck between claim and commit.
//!
//! A run stays `CLAIMED` when its finalizer died after the claim. The ledger
//! may or may not have settled before the crash, so the settlement receipt
//! decides how the run is finished:
//!
//! | Receipt | Intent    | Result object | Action                          | Final status          |
//! |---------|-----------|---------------|---------------------------------|-----------------------|
//! | present | COMPLETED | exists        | commit receipt's charge         | COMPLETED             |
//! | present | COMPLETED | missing       | commit receipt's charge         | FAILED/UPLOAD_MISSING |
//! | present | FAILED    | -             | commit receipt's charge         | FAILED/intent's code  |
//! | absent  | COMPLETED | exists        | settle `intended_charge`        | COMPLETED             |
//! | absent  | COMPLETED | missing       | settle minimum fee              | FAILED/UPLOAD_MISSING |
//! | absent  | FAILED    | -             | settle intent's charge          | FAILED/intent's code  |
//!
//! A present receipt is never settled again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runmeter_core::finalize::{
    Claim, CommitOutcome, CommitRequest, ERROR_JOB_FAILED, ERROR_UPLOAD_MISSING, Finalizer,
};
use runmeter_core::results::ResultStore;
use runmeter_core::store::{FinalizeStage, RunStatus, RunStore};
use runmeter_core::{BudgetLedger, FinalizeError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Result, chrono_duration};

/// Configuration for the reconcile loop.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How often to scan for stuck claims.
    pub poll_interval: Duration,
    /// Minimum age of a claim before it counts as stuck.
    pub threshold: Duration,
    /// Maximum runs recovered per scan.
    pub batch_size: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120),
            threshold: Duration::from_secs(300),
            batch_size: 50,
        }
    }
}

/// How a stuck run was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The run was already committed; nothing was done.
    AlreadyCommitted,
    /// The run was never claimed; nothing was done.
    NotClaimed,
    /// A receipt existed; its values were written without touching the ledger.
    ReplayedReceipt(CommitOutcome),
    /// No receipt existed; the run was settled and committed.
    Settled(CommitOutcome),
}

/// Counters for one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Candidates returned by the scan.
    pub scanned: usize,
    /// Runs committed from an existing receipt.
    pub replayed: usize,
    /// Runs settled and committed by this pass.
    pub settled: usize,
    /// Runs that needed nothing, or that another process finished first.
    pub skipped: usize,
    /// Runs left for the next cycle after an error.
    pub failed: usize,
}

/// Background loop that finishes runs stuck in `CLAIMED`.
pub struct ReconcileLoop {
    finalizer: Finalizer,
    results: Arc<dyn ResultStore>,
    config: ReconcileConfig,
    shutdown: Arc<Notify>,
}

impl ReconcileLoop {
    /// Create a new reconcile loop.
    pub fn new(finalizer: Finalizer, results: Arc<dyn ResultStore>, config: ReconcileConfig) -> Self {
        Self {
            finalizer,
            results,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconcile loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            threshold_secs = self.config.threshold.as_secs(),
            batch_size = self.config.batch_size,
            "Reconcile loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile loop received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to scan for stuck claims");
                    }
                }
            }
        }

        info!("Reconcile loop stopped");
    }

    /// Scan once and recover every stuck claim found.
    pub async fn run_once(&self) -> Result<ReconcileStats> {
        let claimed_before = Utc::now() - chrono_duration(self.config.threshold)?;
        let stuck = self
            .finalizer
            .store()
            .list_stuck_claims(claimed_before, self.config.batch_size)
            .await?;

        let mut stats = ReconcileStats {
            scanned: stuck.len(),
            ..Default::default()
        };
        if stuck.is_empty() {
            debug!("No stuck claims found");
            return Ok(stats);
        }

        info!(count = stuck.len(), "Found runs stuck in CLAIMED");

        for run in stuck {
            match self.reconcile_run(&run.run_id, &run.tenant_id).await {
                Ok(ReconcileAction::ReplayedReceipt(_)) => stats.replayed += 1,
                Ok(ReconcileAction::Settled(_)) => stats.settled += 1,
                Ok(ReconcileAction::AlreadyCommitted | ReconcileAction::NotClaimed) => {
                    stats.skipped += 1
                }
                Err(e) if e.is_race_lost() => {
                    stats.skipped += 1;
                    debug!(run_id = %run.run_id, reason = %e, "Stuck claim finished elsewhere");
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        run_id = %run.run_id,
                        tenant_id = %run.tenant_id,
                        error_code = e.error_code(),
                        error = %e,
                        "Failed to reconcile run"
                    );
                }
            }
        }

        Ok(stats)
    }

    /// Finish one claimed run from its durable state.
    ///
    /// Safe to call on any run: committed and unclaimed runs are left alone.
    pub async fn reconcile_run(
        &self,
        run_id: &str,
        tenant_id: &str,
    ) -> runmeter_core::Result<ReconcileAction> {
        let run = self
            .finalizer
            .store()
            .get_run(run_id)
            .await?
            .ok_or_else(|| FinalizeError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if run.tenant_id != tenant_id {
            return Err(FinalizeError::TenantMismatch {
                run_id: run_id.to_string(),
                expected: tenant_id.to_string(),
                actual: run.tenant_id,
            }
            .into());
        }

        match run.finalize_stage {
            Some(FinalizeStage::Committed) => {
                debug!(run_id = %run_id, "Run already committed, nothing to reconcile");
                return Ok(ReconcileAction::AlreadyCommitted);
            }
            None => {
                debug!(run_id = %run_id, "Run not claimed, nothing to reconcile");
                return Ok(ReconcileAction::NotClaimed);
            }
            Some(FinalizeStage::Claimed) => {}
        }

        let claim = Claim::resume(&run).ok_or_else(|| FinalizeError::InvalidRunState {
            run_id: run_id.to_string(),
            reason: "claimed run has no finalize token or intent".to_string(),
        })?;
        let request = self.recovery_request(&claim).await?;

        let receipt = self
            .finalizer
            .ledger()
            .get_receipt(tenant_id, run_id)
            .await?;

        match receipt {
            Some(receipt) => {
                info!(
                    run_id = %run_id,
                    tenant_id = %tenant_id,
                    charged = receipt.charged_amount,
                    status = %request.status,
                    "Rolling forward stuck claim from receipt"
                );
                let outcome = self
                    .finalizer
                    .commit_from_receipt(&claim, &receipt, request)
                    .await?;
                Ok(ReconcileAction::ReplayedReceipt(outcome))
            }
            None => {
                info!(
                    run_id = %run_id,
                    tenant_id = %tenant_id,
                    charge = request.charge,
                    status = %request.status,
                    "No receipt for stuck claim, settling"
                );
                let outcome = self.finalizer.commit(&claim, request).await?;
                Ok(ReconcileAction::Settled(outcome))
            }
        }
    }

    /// Terminal fields implied by the claim's recorded intent.
    async fn recovery_request(&self, claim: &Claim) -> runmeter_core::Result<CommitRequest> {
        let intent = &claim.intent;
        if intent.status == RunStatus::Completed {
            let location = match &intent.result_key {
                Some(key) => self.results.stat(key).await?,
                None => None,
            };
            return Ok(match location {
                Some(location) => CommitRequest::completed(intent.charge, location),
                None => {
                    warn!(
                        run_id = %claim.run_id,
                        result_key = ?intent.result_key,
                        "Result object missing for stuck success"
                    );
                    CommitRequest::failed(
                        claim.failure_fee(),
                        ERROR_UPLOAD_MISSING,
                        "result object missing after crash",
                    )
                }
            });
        }

        let code = intent.error_code.as_deref().unwrap_or(ERROR_JOB_FAILED);
        Ok(CommitRequest::failed(
            intent.charge,
            code,
            format!("recovered stuck claim ({})", code),
        ))
    }
}
