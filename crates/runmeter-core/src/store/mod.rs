// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run store interfaces and backends.
//!
//! The run row is the only contested mutable resource in the system. Every
//! contested write is a single conditional update gated on the version that
//! the writer read; a write that matches no row tells the caller someone else
//! moved first.

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryRunStore;
pub use self::postgres::PostgresRunStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::Micros;

/// Error returned when a stored state string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStateError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(ParseStateError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

state_enum! {
    /// Lifecycle status of a run.
    RunStatus, "run status" {
        /// Accepted and waiting for a worker.
        Queued => "QUEUED",
        /// A worker holds the lease and is executing the job.
        Processing => "PROCESSING",
        /// Finished successfully.
        Completed => "COMPLETED",
        /// Finished unsuccessfully (job error, upload error or timeout).
        Failed => "FAILED",
    }
}

state_enum! {
    /// Where a run's funds currently sit.
    MoneyState, "money state" {
        /// No funds involved.
        None => "NONE",
        /// Funds are held in a ledger reservation.
        Reserved => "RESERVED",
        /// The reservation has been converted into a charge and refund.
        Settled => "SETTLED",
    }
}

state_enum! {
    /// Finalize progress; `None` on the record means unclaimed.
    FinalizeStage, "finalize stage" {
        /// One process holds exclusive finalize rights.
        Claimed => "CLAIMED",
        /// Money settled and terminal state written.
        Committed => "COMMITTED",
    }
}

impl RunStatus {
    /// True for COMPLETED and FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where a run's result object was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocation {
    /// Bucket (or root) the object lives in.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Hex SHA-256 of the object body.
    pub sha256: String,
}

/// A run as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Opaque unique run identifier.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Job type used to pick a handler.
    pub job_type: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Where the funds sit.
    pub money_state: MoneyState,
    /// Optimistic concurrency counter; every state change bumps it by one.
    pub version: i64,
    /// Upper bound reserved at acceptance. Immutable.
    pub reservation_max_cost: Micros,
    /// Amount actually charged, set at settlement.
    pub actual_cost: Option<Micros>,
    /// Floor charge on failure and timeout paths.
    pub minimum_fee: Micros,
    /// Token of the worker currently executing the run.
    pub lease_token: Option<String>,
    /// When the current lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Token issued by the winning claim.
    pub finalize_token: Option<String>,
    /// Finalize progress.
    pub finalize_stage: Option<FinalizeStage>,
    /// When the winning claim happened.
    pub finalize_claimed_at: Option<DateTime<Utc>>,
    /// Terminal status the claimer intended to commit.
    pub finalize_intent: Option<RunStatus>,
    /// Charge the claimer intended to settle.
    pub intended_charge: Option<Micros>,
    /// Result object bucket.
    pub result_bucket: Option<String>,
    /// Result object key (recorded at claim for successful runs).
    pub result_key: Option<String>,
    /// Result object digest.
    pub result_sha256: Option<String>,
    /// Machine-readable failure code.
    pub error_code: Option<String>,
    /// Human-readable failure message.
    pub error_message: Option<String>,
    /// When the run was accepted.
    pub created_at: DateTime<Utc>,
    /// When a worker took the first lease.
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal state was committed.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Values written by the acceptance path when it creates a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Opaque unique run identifier.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Job type.
    pub job_type: String,
    /// Amount already reserved in the ledger.
    pub reservation_max_cost: Micros,
    /// Floor charge on failure and timeout paths.
    pub minimum_fee: Micros,
}

/// Extra predicate a claim adds on top of the shared preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCondition {
    /// The caller must hold the run's current lease (worker paths).
    LeaseMatch(String),
    /// No lease predicate (reaper and reconcile paths).
    ///
    /// Lease expiry is established by the scan that selected the run, not
    /// re-checked here. A lease renewed between scan and claim can therefore
    /// still be reaped; `finalize_stage IS NULL` keeps the outcome exclusive.
    AnyLease,
}

/// What the claimer plans to commit, recorded with the claim so a crashed
/// finalize can be rolled forward or back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeIntent {
    /// Terminal status the claimer means to write.
    pub status: RunStatus,
    /// Charge the claimer means to settle.
    pub charge: Micros,
    /// Result object key, for successful runs.
    pub result_key: Option<String>,
    /// Failure code, for failed runs.
    pub error_code: Option<String>,
}

/// Fields written by a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimUpdate {
    /// Fresh finalize token.
    pub token: String,
    /// Claim timestamp.
    pub claimed_at: DateTime<Utc>,
    /// Recorded intent.
    pub intent: FinalizeIntent,
}

/// Fields written by a successful commit.
#[derive(Debug, Clone)]
pub struct CommitUpdate {
    /// Terminal status.
    pub status: RunStatus,
    /// Amount the ledger actually charged.
    pub actual_cost: Micros,
    /// Result object location, for successful runs.
    pub result: Option<ResultLocation>,
    /// Failure code.
    pub error_code: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
    /// Commit timestamp.
    pub finished_at: DateTime<Utc>,
}

/// Repository over run rows.
///
/// The `try_*` methods are compare-and-swap writes: `Ok(false)` means the
/// guarded row no longer matched, which is a normal concurrency outcome and
/// never an error at this layer.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in `QUEUED` / `RESERVED` at version 1.
    async fn insert_run(&self, run: &NewRun) -> Result<()>;

    /// Fetch a run.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// `QUEUED → PROCESSING` at `expected_version`, taking the lease.
    async fn start_processing(
        &self,
        run_id: &str,
        expected_version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend the lease held by `lease_token` while the run is unclaimed.
    ///
    /// Does not bump the version: lease renewal must never make an in-flight
    /// claim lose its compare-and-swap.
    async fn renew_lease(
        &self,
        run_id: &str,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Phase one: `finalize_stage NULL → CLAIMED` at `expected_version`.
    async fn try_claim(
        &self,
        run_id: &str,
        expected_version: i64,
        condition: &ClaimCondition,
        update: &ClaimUpdate,
    ) -> Result<bool>;

    /// Phase two: `CLAIMED → COMMITTED` at `claimed_version` for `finalize_token`.
    async fn try_commit(
        &self,
        run_id: &str,
        claimed_version: i64,
        finalize_token: &str,
        update: &CommitUpdate,
    ) -> Result<bool>;

    /// Unclaimed `PROCESSING` runs whose lease lapsed before `now`, oldest first.
    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RunRecord>>;

    /// Runs stuck in `CLAIMED` since before `claimed_before`, oldest first.
    async fn list_stuck_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_text_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Processing,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("SETTLED".parse::<MoneyState>().unwrap(), MoneyState::Settled);
        assert_eq!(
            "CLAIMED".parse::<FinalizeStage>().unwrap(),
            FinalizeStage::Claimed
        );
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let err = "RUNNING".parse::<RunStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown run status 'RUNNING'");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }
}
