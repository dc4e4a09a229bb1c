// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Budget ledger: tenant balances, per-run reservations and settlement receipts.
//!
//! Every mutation is a single atomic operation on the backing store. There is
//! no client-side read-modify-write anywhere in this module, so concurrent
//! reserves against one tenant can never drive its balance negative.
//!
//! Money conservation holds for every tenant after every operation:
//!
//! ```text
//! credited == balance + Σ active reservations + Σ settled charges
//! ```
//!
//! All amounts are [`Micros`]: fixed-point integers in millionths of the
//! currency unit.

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryLedger;
pub use self::redis::RedisLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Money amount in millionths of the currency unit.
pub type Micros = i64;

/// Micros in one whole currency unit.
pub const MICROS_PER_UNIT: Micros = 1_000_000;

/// Convert cents to micros (`$6.50` is `micros_from_cents(650)`).
pub const fn micros_from_cents(cents: i64) -> Micros {
    cents * (MICROS_PER_UNIT / 100)
}

/// Outcome of a reserve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReserveStatus {
    /// Funds were moved from the balance into a new reservation.
    Reserved,
    /// The balance is short; nothing changed.
    InsufficientFunds,
    /// The run already holds a reservation; nothing changed.
    AlreadyReserved,
    /// The run already has a settlement receipt; nothing changed.
    AlreadySettled,
}

/// Result of [`BudgetLedger::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// What happened.
    pub status: ReserveStatus,
    /// Tenant balance after the call.
    pub balance: Micros,
}

/// Outcome of a settle or full refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettleStatus {
    /// The reservation was converted into a charge and a refund just now.
    Settled,
    /// A receipt already existed; its values are returned and nothing moved.
    AlreadySettled,
    /// Neither a reservation nor a receipt exists for the run.
    NoReservation,
}

/// Result of [`BudgetLedger::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleOutcome {
    /// What happened.
    pub status: SettleStatus,
    /// Amount charged (from the receipt when already settled).
    pub charged: Micros,
    /// Amount returned to the balance (from the receipt when already settled).
    pub refund: Micros,
    /// Tenant balance after the call.
    pub balance: Micros,
}

/// Result of [`BudgetLedger::refund_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundOutcome {
    /// What happened.
    pub status: SettleStatus,
    /// Amount returned to the balance.
    pub refund: Micros,
    /// Tenant balance after the call.
    pub balance: Micros,
}

/// Funds held against a tenant balance for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reserved amount.
    pub amount: Micros,
    /// When the reservation was made.
    pub created_at: DateTime<Utc>,
}

/// Durable proof that a run's money-side work is done.
///
/// Written in the same atomic step that consumes the reservation and outlives
/// it. The reconcile loop treats it as the only source of truth for runs that
/// crashed between settlement and the database commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    /// Amount charged to the tenant.
    pub charged_amount: Micros,
    /// Amount that was reserved.
    pub reserved_amount: Micros,
    /// Amount returned to the balance.
    pub refund_amount: Micros,
    /// When the settlement happened.
    pub created_at: DateTime<Utc>,
}

/// Atomic per-tenant budget primitives.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Add funds to a tenant balance. Returns the new balance.
    async fn credit(&self, tenant_id: &str, amount: Micros) -> Result<Micros>;

    /// Move `amount` from the balance into a reservation for `run_id`.
    ///
    /// The balance check runs first: an unfundable request reports
    /// [`ReserveStatus::InsufficientFunds`] even when the run already holds a
    /// reservation. A run that already settled is never reserved again.
    async fn reserve(&self, tenant_id: &str, run_id: &str, amount: Micros)
    -> Result<ReserveOutcome>;

    /// Charge `min(charge_amount, reserved)`, refund the rest, drop the
    /// reservation and write the settlement receipt, all in one step.
    ///
    /// Calling it again after the reservation is consumed returns the
    /// receipt's values with [`SettleStatus::AlreadySettled`] and moves no
    /// money.
    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        charge_amount: Micros,
    ) -> Result<SettleOutcome>;

    /// Release the whole reservation back to the balance with no charge.
    ///
    /// Writes a receipt with a zero charge so crash recovery treats it like
    /// any other settlement.
    async fn refund_full(&self, tenant_id: &str, run_id: &str) -> Result<RefundOutcome> {
        let outcome = self.settle(tenant_id, run_id, 0).await?;
        Ok(RefundOutcome {
            status: outcome.status,
            refund: outcome.refund,
            balance: outcome.balance,
        })
    }

    /// Current tenant balance (zero for unknown tenants).
    async fn get_balance(&self, tenant_id: &str) -> Result<Micros>;

    /// Active reservation for a run, if any.
    async fn get_reservation(&self, tenant_id: &str, run_id: &str)
    -> Result<Option<Reservation>>;

    /// Settlement receipt for a run, if any.
    async fn get_receipt(&self, tenant_id: &str, run_id: &str)
    -> Result<Option<SettlementReceipt>>;

    /// Sum of every amount ever charged to the tenant.
    async fn get_settled_total(&self, tenant_id: &str) -> Result<Micros>;
}

pub(crate) fn ensure_positive(field: &str, amount: Micros) -> Result<()> {
    if amount <= 0 {
        return Err(Error::validation(field, format!("must be positive, got {}", amount)));
    }
    Ok(())
}

pub(crate) fn ensure_non_negative(field: &str, amount: Micros) -> Result<()> {
    if amount < 0 {
        return Err(Error::validation(
            field,
            format!("must not be negative, got {}", amount),
        ));
    }
    Ok(())
}
