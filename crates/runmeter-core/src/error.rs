// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runmeter-core.
//!
//! Three kinds of failure leave the finalize protocol:
//!
//! - [`ClaimError`]: another process got to the run first. Expected and
//!   frequent; the caller stops and does nothing else.
//! - [`FinalizeError`]: the state machine saw something that should be
//!   impossible (missing run, broken commit preconditions, charge above the
//!   reservation). Logged loudly and left for the next loop cycle.
//! - Infrastructure errors (database, ledger, object store, queue): the run
//!   is left untouched and retried by the next scheduled iteration.

use thiserror::Error;

use crate::ledger::Micros;

/// Result type using the crate-wide [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Lost the race to finalize a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lost finalize race for run '{run_id}': {reason}")]
pub struct ClaimError {
    /// Run whose claim was lost.
    pub run_id: String,
    /// What the claimer observed instead of an unclaimed in-flight run.
    pub reason: String,
}

impl ClaimError {
    pub(crate) fn new(run_id: &str, reason: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Hard violations of the finalize state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FinalizeError {
    /// The run does not exist.
    #[error("run '{run_id}' not found")]
    RunNotFound {
        /// The missing run.
        run_id: String,
    },

    /// The run exists but belongs to another tenant.
    #[error("run '{run_id}' belongs to tenant '{actual}', not '{expected}'")]
    TenantMismatch {
        /// The run.
        run_id: String,
        /// Tenant supplied by the caller.
        expected: String,
        /// Tenant stored on the run.
        actual: String,
    },

    /// The run's status or money state is inconsistent with an in-flight job.
    #[error("run '{run_id}' is in an invalid state: {reason}")]
    InvalidRunState {
        /// The run.
        run_id: String,
        /// Description of the inconsistency.
        reason: String,
    },

    /// The requested charge exceeds the run's reservation.
    #[error("charge {charge} exceeds reservation {reserved} for run '{run_id}'")]
    ChargeExceedsReservation {
        /// The run.
        run_id: String,
        /// Requested charge in micros.
        charge: Micros,
        /// Reserved maximum in micros.
        reserved: Micros,
    },

    /// A negative charge was requested.
    #[error("negative charge {charge} requested for run '{run_id}'")]
    NegativeCharge {
        /// The run.
        run_id: String,
        /// Requested charge in micros.
        charge: Micros,
    },

    /// The commit compare-and-swap matched no row even though a claim was held.
    #[error("commit conflict for run '{run_id}' at version {version}: {reason}")]
    CommitConflict {
        /// The run.
        run_id: String,
        /// Version the claim produced.
        version: i64,
        /// What no longer matched.
        reason: String,
    },

    /// The ledger holds neither a reservation nor a receipt for the run.
    #[error("no reservation or receipt in the ledger for run '{run_id}'")]
    ReservationMissing {
        /// The run.
        run_id: String,
    },
}

/// Errors that can occur in runmeter-core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Another process won the finalize race.
    #[error(transparent)]
    Claim(#[from] ClaimError),

    /// The finalize state machine was violated.
    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Ledger (Redis) operation failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] redis::RedisError),

    /// The ledger returned a reply the client could not interpret.
    #[error("Unexpected ledger reply: {0}")]
    LedgerReply(String),

    /// Object store operation failed.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Job queue operation failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },
}

impl Error {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Claim(_) => "CLAIM_LOST",
            Self::Finalize(FinalizeError::RunNotFound { .. }) => "RUN_NOT_FOUND",
            Self::Finalize(FinalizeError::TenantMismatch { .. }) => "TENANT_MISMATCH",
            Self::Finalize(FinalizeError::InvalidRunState { .. }) => "INVALID_RUN_STATE",
            Self::Finalize(FinalizeError::ChargeExceedsReservation { .. }) => {
                "CHARGE_EXCEEDS_RESERVATION"
            }
            Self::Finalize(FinalizeError::NegativeCharge { .. }) => "NEGATIVE_CHARGE",
            Self::Finalize(FinalizeError::CommitConflict { .. }) => "COMMIT_CONFLICT",
            Self::Finalize(FinalizeError::ReservationMissing { .. }) => "RESERVATION_MISSING",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Ledger(_) | Self::LedgerReply(_) => "LEDGER_ERROR",
            Self::ObjectStore(_) => "OBJECT_STORE_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
        }
    }

    /// True when another process already claimed or committed the run.
    pub fn is_race_lost(&self) -> bool {
        matches!(self, Self::Claim(_))
    }

    /// True for infrastructure failures that the next loop iteration may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Ledger(_)
                | Self::ObjectStore(_)
                | Self::Queue(_)
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                Error::from(ClaimError::new("run-1", "already claimed")),
                "CLAIM_LOST",
            ),
            (
                Error::from(FinalizeError::RunNotFound {
                    run_id: "run-1".to_string(),
                }),
                "RUN_NOT_FOUND",
            ),
            (
                Error::from(FinalizeError::ChargeExceedsReservation {
                    run_id: "run-1".to_string(),
                    charge: 11,
                    reserved: 10,
                }),
                "CHARGE_EXCEEDS_RESERVATION",
            ),
            (
                Error::from(FinalizeError::CommitConflict {
                    run_id: "run-1".to_string(),
                    version: 3,
                    reason: "token changed".to_string(),
                }),
                "COMMIT_CONFLICT",
            ),
            (Error::Queue("closed".to_string()), "QUEUE_ERROR"),
            (Error::validation("amount", "must be positive"), "VALIDATION_ERROR"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_race_lost_is_not_retryable() {
        let err = Error::from(ClaimError::new("run-1", "finalize_stage is CLAIMED"));
        assert!(err.is_race_lost());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_finalize_errors_are_not_retryable() {
        let err = Error::from(FinalizeError::ReservationMissing {
            run_id: "run-1".to_string(),
        });
        assert!(!err.is_race_lost());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        assert!(Error::ObjectStore("timeout".to_string()).is_retryable());
        assert!(Error::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::from(ClaimError::new("abc-123", "finalize_stage is COMMITTED"));
        assert_eq!(
            err.to_string(),
            "lost finalize race for run 'abc-123': finalize_stage is COMMITTED"
        );

        let err = Error::from(FinalizeError::ChargeExceedsReservation {
            run_id: "abc-123".to_string(),
            charge: 12,
            reserved: 10,
        });
        assert_eq!(
            err.to_string(),
            "charge 12 exceeds reservation 10 for run 'abc-123'"
        );

        let err = Error::validation("amount", "must be positive");
        assert_eq!(
            err.to_string(),
            "Validation error for 'amount': must be positive"
        );
    }
}
