// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-phase finalize protocol.
//!
//! ```text
//!   finalize_stage:   NULL ──claim──▶ CLAIMED ──commit──▶ COMMITTED
//!                                        │
//!                                        └─ side effects happen here:
//!                                           result upload, ledger settle
//! ```
//!
//! [`Finalizer::claim`] decides, before any side effect, which of several
//! concurrent callers (worker, reaper, reconcile) may finalize a run. The
//! decision is a single compare-and-swap on the run's version; losers get a
//! [`ClaimError`] and must stop.
//!
//! [`Finalizer::commit`] then settles money in the ledger and writes the
//! terminal state with a second compare-and-swap keyed on the claim's token
//! and version. The ledger writes its settlement receipt atomically with the
//! money move, so a crash between the two steps leaves enough durable state
//! for [`Finalizer::commit_from_receipt`] to finish the job without settling
//! again.
//!
//! The policy helpers at the bottom of this module are the only ways the
//! drivers use the protocol; they differ only in claim condition, charge and
//! terminal fields.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClaimError, Error, FinalizeError, Result};
use crate::ledger::{BudgetLedger, Micros, SettleStatus, SettlementReceipt};
use crate::store::{
    ClaimCondition, ClaimUpdate, CommitUpdate, FinalizeIntent, FinalizeStage, MoneyState,
    ResultLocation, RunRecord, RunStatus, RunStore,
};

/// Error code written by the reaper.
pub const ERROR_TIMEOUT: &str = "TIMEOUT";
/// Error code for a success whose result object never reached the store.
pub const ERROR_UPLOAD_MISSING: &str = "UPLOAD_MISSING";
/// Error code for a result upload that failed after the claim.
pub const ERROR_UPLOAD_FAILED: &str = "UPLOAD_FAILED";
/// Error code for a job type with no registered handler.
pub const ERROR_UNKNOWN_JOB_TYPE: &str = "UNKNOWN_JOB_TYPE";
/// Default error code for a failing job body.
pub const ERROR_JOB_FAILED: &str = "JOB_FAILED";

/// Deterministic result object key for a run.
pub fn result_key(tenant_id: &str, run_id: &str) -> String {
    format!("{}/{}/result", tenant_id, run_id)
}

/// Exclusive finalize rights over one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Claimed run.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Token written by the claim; the commit must present it.
    pub finalize_token: String,
    /// Version after the claim.
    pub claimed_version: i64,
    /// Reserved maximum, for charge validation.
    pub reservation_max_cost: Micros,
    /// Floor charge on failure paths.
    pub minimum_fee: Micros,
    /// What the claimer recorded it would commit.
    pub intent: FinalizeIntent,
}

impl Claim {
    /// Rebuild a claim from a row left in `CLAIMED` by a crashed process.
    ///
    /// Returns `None` unless the row is claimed and carries a token and intent.
    pub fn resume(run: &RunRecord) -> Option<Self> {
        if run.finalize_stage != Some(FinalizeStage::Claimed) {
            return None;
        }
        let status = run.finalize_intent?;
        Some(Self {
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            finalize_token: run.finalize_token.clone()?,
            claimed_version: run.version,
            reservation_max_cost: run.reservation_max_cost,
            minimum_fee: run.minimum_fee,
            intent: FinalizeIntent {
                status,
                charge: run.intended_charge.unwrap_or(0),
                result_key: run.result_key.clone(),
                error_code: run.error_code.clone(),
            },
        })
    }

    /// `min(minimum_fee, reservation_max_cost)`.
    pub fn failure_fee(&self) -> Micros {
        self.minimum_fee.min(self.reservation_max_cost)
    }
}

/// Terminal fields for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    /// `COMPLETED` or `FAILED`.
    pub status: RunStatus,
    /// Charge to settle.
    pub charge: Micros,
    /// Result location, for successful runs.
    pub result: Option<ResultLocation>,
    /// Failure code.
    pub error_code: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
}

impl CommitRequest {
    /// A successful commit charging `charge`.
    pub fn completed(charge: Micros, result: ResultLocation) -> Self {
        Self {
            status: RunStatus::Completed,
            charge,
            result: Some(result),
            error_code: None,
            error_message: None,
        }
    }

    /// A failed commit charging `charge`.
    pub fn failed(charge: Micros, code: &str, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            charge,
            result: None,
            error_code: Some(code.to_string()),
            error_message: Some(message.into()),
        }
    }
}

/// What a commit moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Status written to the run.
    pub status: RunStatus,
    /// Amount charged to the tenant.
    pub charged: Micros,
    /// Amount returned to the balance.
    pub refund: Micros,
    /// Version after the commit.
    pub version: i64,
    /// True when the ledger was not called and receipt values were replayed.
    pub replayed: bool,
}

/// Runs the claim/commit protocol against injected store and ledger handles.
#[derive(Clone)]
pub struct Finalizer {
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn BudgetLedger>,
}

impl Finalizer {
    /// Create a finalizer.
    pub fn new(store: Arc<dyn RunStore>, ledger: Arc<dyn BudgetLedger>) -> Self {
        Self { store, ledger }
    }

    /// Run store handle.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Ledger handle.
    pub fn ledger(&self) -> &Arc<dyn BudgetLedger> {
        &self.ledger
    }

    async fn load(&self, run_id: &str, tenant_id: &str) -> Result<RunRecord> {
        let run = self
            .store
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
        Ok(run)
    }

    /// Phase one: acquire exclusive finalize rights.
    ///
    /// # Errors
    ///
    /// - [`ClaimError`] when the run is already claimed or committed, the
    ///   lease no longer matches, or the compare-and-swap lost.
    /// - [`FinalizeError`] when the run is missing, belongs to another
    ///   tenant, is not an in-flight reserved run, or the intended charge is
    ///   out of range.
    pub async fn claim(
        &self,
        run_id: &str,
        tenant_id: &str,
        condition: ClaimCondition,
        intent: FinalizeIntent,
    ) -> Result<Claim> {
        check_terminal(run_id, intent.status)?;
        let run = self.load(run_id, tenant_id).await?;

        if let Some(stage) = run.finalize_stage {
            return Err(ClaimError::new(run_id, format!("finalize_stage is {}", stage)).into());
        }
        if run.status != RunStatus::Processing {
            return Err(FinalizeError::InvalidRunState {
                run_id: run_id.to_string(),
                reason: format!("unclaimed run has status {}", run.status),
            }
            .into());
        }
        if run.money_state != MoneyState::Reserved {
            return Err(FinalizeError::InvalidRunState {
                run_id: run_id.to_string(),
                reason: format!("in-flight run has money_state {}", run.money_state),
            }
            .into());
        }
        if let ClaimCondition::LeaseMatch(token) = &condition {
            if run.lease_token.as_deref() != Some(token.as_str()) {
                return Err(ClaimError::new(run_id, "lease is held by another worker").into());
            }
        }
        check_charge(&run, intent.charge)?;

        let update = ClaimUpdate {
            token: Uuid::new_v4().to_string(),
            claimed_at: Utc::now(),
            intent,
        };
        if !self
            .store
            .try_claim(run_id, run.version, &condition, &update)
            .await?
        {
            return Err(ClaimError::new(
                run_id,
                format!("version {} changed before claim", run.version),
            )
            .into());
        }

        debug!(
            run_id = %run_id,
            tenant_id = %tenant_id,
            version = run.version + 1,
            intent = %update.intent.status,
            "Run claimed"
        );

        Ok(Claim {
            run_id: run.run_id,
            tenant_id: run.tenant_id,
            finalize_token: update.token,
            claimed_version: run.version + 1,
            reservation_max_cost: run.reservation_max_cost,
            minimum_fee: run.minimum_fee,
            intent: update.intent,
        })
    }

    /// Phase two: settle in the ledger, then write the terminal state.
    ///
    /// A zero charge releases the whole reservation through
    /// [`BudgetLedger::refund_full`]. If the ledger already holds a receipt
    /// for the run its values are reused and no money moves.
    ///
    /// # Errors
    ///
    /// - [`ClaimError`] when the run is already committed.
    /// - [`FinalizeError`] for an out-of-range charge, a claim whose token
    ///   or version no longer matches, or a ledger with neither reservation
    ///   nor receipt.
    pub async fn commit(&self, claim: &Claim, request: CommitRequest) -> Result<CommitOutcome> {
        check_terminal(&claim.run_id, request.status)?;
        let run = self.load(&claim.run_id, &claim.tenant_id).await?;
        check_charge(&run, request.charge)?;
        check_committable(&run, claim)?;

        let (status, charged, refund) = if request.charge == 0 {
            let outcome = self
                .ledger
                .refund_full(&claim.tenant_id, &claim.run_id)
                .await?;
            (outcome.status, 0, outcome.refund)
        } else {
            let outcome = self
                .ledger
                .settle(&claim.tenant_id, &claim.run_id, request.charge)
                .await?;
            (outcome.status, outcome.charged, outcome.refund)
        };

        let replayed = match status {
            SettleStatus::Settled => false,
            SettleStatus::AlreadySettled => {
                warn!(
                    run_id = %claim.run_id,
                    tenant_id = %claim.tenant_id,
                    charged = charged,
                    "Receipt already present at commit, reusing its values"
                );
                true
            }
            SettleStatus::NoReservation => {
                return Err(FinalizeError::ReservationMissing {
                    run_id: claim.run_id.clone(),
                }
                .into());
            }
        };

        let (charged, refund) = if replayed {
            // refund_full reports no charge; the receipt has the real one.
            match self
                .ledger
                .get_receipt(&claim.tenant_id, &claim.run_id)
                .await?
            {
                Some(receipt) => (receipt.charged_amount, receipt.refund_amount),
                None => (charged, refund),
            }
        } else {
            (charged, refund)
        };

        self.write_commit(claim, &request, charged).await?;

        info!(
            run_id = %claim.run_id,
            tenant_id = %claim.tenant_id,
            status = %request.status,
            charged = charged,
            refund = refund,
            "Run committed"
        );

        Ok(CommitOutcome {
            status: request.status,
            charged,
            refund,
            version: claim.claimed_version + 1,
            replayed,
        })
    }

    /// Write the terminal state using a receipt's values, without calling
    /// the ledger.
    ///
    /// This is the roll-forward path for runs whose money already moved.
    /// `request.charge` is ignored in favour of the receipt.
    pub async fn commit_from_receipt(
        &self,
        claim: &Claim,
        receipt: &SettlementReceipt,
        request: CommitRequest,
    ) -> Result<CommitOutcome> {
        check_terminal(&claim.run_id, request.status)?;
        let run = self.load(&claim.run_id, &claim.tenant_id).await?;
        check_committable(&run, claim)?;
        check_charge(&run, receipt.charged_amount)?;

        self.write_commit(claim, &request, receipt.charged_amount)
            .await?;

        info!(
            run_id = %claim.run_id,
            tenant_id = %claim.tenant_id,
            status = %request.status,
            charged = receipt.charged_amount,
            refund = receipt.refund_amount,
            "Run committed from settlement receipt"
        );

        Ok(CommitOutcome {
            status: request.status,
            charged: receipt.charged_amount,
            refund: receipt.refund_amount,
            version: claim.claimed_version + 1,
            replayed: true,
        })
    }

    async fn write_commit(
        &self,
        claim: &Claim,
        request: &CommitRequest,
        charged: Micros,
    ) -> Result<()> {
        let update = CommitUpdate {
            status: request.status,
            actual_cost: charged,
            result: request.result.clone(),
            error_code: request.error_code.clone(),
            error_message: request.error_message.clone(),
            finished_at: Utc::now(),
        };
        if !self
            .store
            .try_commit(
                &claim.run_id,
                claim.claimed_version,
                &claim.finalize_token,
                &update,
            )
            .await?
        {
            return Err(FinalizeError::CommitConflict {
                run_id: claim.run_id.clone(),
                version: claim.claimed_version,
                reason: "claimed row changed before commit".to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // Policies
    // ========================================================================

    /// Worker success, phase one: claim with the worker's lease and record
    /// the intended charge and result key.
    pub async fn claim_success(
        &self,
        run_id: &str,
        tenant_id: &str,
        lease_token: &str,
        actual_cost: Micros,
    ) -> Result<Claim> {
        self.claim(
            run_id,
            tenant_id,
            ClaimCondition::LeaseMatch(lease_token.to_string()),
            FinalizeIntent {
                status: RunStatus::Completed,
                charge: actual_cost,
                result_key: Some(result_key(tenant_id, run_id)),
                error_code: None,
            },
        )
        .await
    }

    /// Worker success, phase two: commit the uploaded result.
    pub async fn commit_success(
        &self,
        claim: &Claim,
        location: ResultLocation,
    ) -> Result<CommitOutcome> {
        self.commit(claim, CommitRequest::completed(claim.intent.charge, location))
            .await
    }

    /// Worker success whose upload failed after the claim: fail the run and
    /// charge the minimum fee.
    pub async fn commit_upload_failed(
        &self,
        claim: &Claim,
        message: impl Into<String>,
    ) -> Result<CommitOutcome> {
        self.commit(
            claim,
            CommitRequest::failed(claim.failure_fee(), ERROR_UPLOAD_FAILED, message),
        )
        .await
    }

    /// Worker failure: claim with the worker's lease, charge the minimum fee
    /// and record the error.
    pub async fn finalize_failure(
        &self,
        run_id: &str,
        tenant_id: &str,
        lease_token: &str,
        error_code: &str,
        error_message: impl Into<String>,
    ) -> Result<CommitOutcome> {
        let claim = self
            .claim(
                run_id,
                tenant_id,
                ClaimCondition::LeaseMatch(lease_token.to_string()),
                self.failure_intent(run_id, tenant_id, error_code).await?,
            )
            .await?;
        self.commit(
            &claim,
            CommitRequest::failed(claim.failure_fee(), error_code, error_message),
        )
        .await
    }

    /// Reaper timeout: claim without a lease predicate, charge
    /// `min(minimum_fee, reservation_max_cost)` and mark the run `TIMEOUT`.
    pub async fn finalize_timeout(&self, run_id: &str, tenant_id: &str) -> Result<CommitOutcome> {
        let claim = self
            .claim(
                run_id,
                tenant_id,
                ClaimCondition::AnyLease,
                self.failure_intent(run_id, tenant_id, ERROR_TIMEOUT)
                    .await?,
            )
            .await?;
        self.commit(
            &claim,
            CommitRequest::failed(claim.failure_fee(), ERROR_TIMEOUT, "lease expired"),
        )
        .await
    }

    async fn failure_intent(
        &self,
        run_id: &str,
        tenant_id: &str,
        error_code: &str,
    ) -> Result<FinalizeIntent> {
        let run = self.load(run_id, tenant_id).await?;
        Ok(FinalizeIntent {
            status: RunStatus::Failed,
            charge: run.minimum_fee.min(run.reservation_max_cost),
            result_key: None,
            error_code: Some(error_code.to_string()),
        })
    }
}

fn check_terminal(run_id: &str, status: RunStatus) -> Result<()> {
    if !status.is_terminal() {
        return Err(FinalizeError::InvalidRunState {
            run_id: run_id.to_string(),
            reason: format!("finalize target status {} is not terminal", status),
        }
        .into());
    }
    Ok(())
}

fn check_charge(run: &RunRecord, charge: Micros) -> Result<()> {
    if charge < 0 {
        return Err(FinalizeError::NegativeCharge {
            run_id: run.run_id.clone(),
            charge,
        }
        .into());
    }
    if charge > run.reservation_max_cost {
        return Err(FinalizeError::ChargeExceedsReservation {
            run_id: run.run_id.clone(),
            charge,
            reserved: run.reservation_max_cost,
        }
        .into());
    }
    Ok(())
}

fn check_committable(run: &RunRecord, claim: &Claim) -> Result<()> {
    if run.finalize_stage == Some(FinalizeStage::Committed) {
        return Err(ClaimError::new(&claim.run_id, "run is already committed").into());
    }
    let reason = if run.finalize_stage != Some(FinalizeStage::Claimed) {
        Some("run is not claimed".to_string())
    } else if run.finalize_token.as_deref() != Some(claim.finalize_token.as_str()) {
        Some("finalize token does not match".to_string())
    } else if run.version != claim.claimed_version {
        Some(format!("stored version is {}", run.version))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::from(FinalizeError::CommitConflict {
            run_id: claim.run_id.clone(),
            version: claim.claimed_version,
            reason,
        })),
        None => Ok(()),
    }
}
