// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process ledger backend.
//!
//! Holds all state behind one mutex, so every operation is atomic in the same
//! sense as the Redis scripts. Used for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    BudgetLedger, Micros, Reservation, ReserveOutcome, ReserveStatus, SettleOutcome,
    SettleStatus, SettlementReceipt, ensure_non_negative, ensure_positive,
};
use crate::error::{Error, Result};

type RunKey = (String, String);

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, Micros>,
    settled: HashMap<String, Micros>,
    reservations: HashMap<RunKey, Reservation>,
    receipts: HashMap<RunKey, SettlementReceipt>,
}

/// Ledger backed by process memory.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the ledger store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sum of a tenant's active reservations.
    pub fn reserved_total(&self, tenant_id: &str) -> Micros {
        let state = self.lock();
        state
            .reservations
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, r)| r.amount)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A poisoned lock only means a test thread panicked mid-assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Ledger(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "ledger unavailable",
            ))));
        }
        Ok(())
    }
}

fn run_key(tenant_id: &str, run_id: &str) -> RunKey {
    (tenant_id.to_string(), run_id.to_string())
}

#[async_trait]
impl BudgetLedger for InMemoryLedger {
    async fn credit(&self, tenant_id: &str, amount: Micros) -> Result<Micros> {
        ensure_positive("amount", amount)?;
        self.check_available()?;
        let mut state = self.lock();
        let balance = state.balances.entry(tenant_id.to_string()).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }

    async fn reserve(
        &self,
        tenant_id: &str,
        run_id: &str,
        amount: Micros,
    ) -> Result<ReserveOutcome> {
        ensure_positive("amount", amount)?;
        self.check_available()?;
        let mut state = self.lock();
        let balance = state.balances.get(tenant_id).copied().unwrap_or(0);

        if balance < amount {
            return Ok(ReserveOutcome {
                status: ReserveStatus::InsufficientFunds,
                balance,
            });
        }

        let key = run_key(tenant_id, run_id);
        if state.reservations.contains_key(&key) {
            return Ok(ReserveOutcome {
                status: ReserveStatus::AlreadyReserved,
                balance,
            });
        }
        if state.receipts.contains_key(&key) {
            return Ok(ReserveOutcome {
                status: ReserveStatus::AlreadySettled,
                balance,
            });
        }

        let new_balance = balance - amount;
        state.balances.insert(tenant_id.to_string(), new_balance);
        state.reservations.insert(
            key,
            Reservation {
                amount,
                created_at: Utc::now(),
            },
        );

        Ok(ReserveOutcome {
            status: ReserveStatus::Reserved,
            balance: new_balance,
        })
    }

    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        charge_amount: Micros,
    ) -> Result<SettleOutcome> {
        ensure_non_negative("charge_amount", charge_amount)?;
        self.check_available()?;
        let mut state = self.lock();
        let key = run_key(tenant_id, run_id);
        let balance = state.balances.get(tenant_id).copied().unwrap_or(0);

        if let Some(receipt) = state.receipts.get(&key) {
            return Ok(SettleOutcome {
                status: SettleStatus::AlreadySettled,
                charged: receipt.charged_amount,
                refund: receipt.refund_amount,
                balance,
            });
        }

        let Some(reservation) = state.reservations.remove(&key) else {
            return Ok(SettleOutcome {
                status: SettleStatus::NoReservation,
                charged: 0,
                refund: 0,
                balance,
            });
        };

        let charged = charge_amount.min(reservation.amount);
        let refund = reservation.amount - charged;
        let new_balance = balance + refund;
        state.balances.insert(tenant_id.to_string(), new_balance);
        *state.settled.entry(tenant_id.to_string()).or_insert(0) += charged;
        state.receipts.insert(
            key,
            SettlementReceipt {
                charged_amount: charged,
                reserved_amount: reservation.amount,
                refund_amount: refund,
                created_at: Utc::now(),
            },
        );

        Ok(SettleOutcome {
            status: SettleStatus::Settled,
            charged,
            refund,
            balance: new_balance,
        })
    }

    async fn get_balance(&self, tenant_id: &str) -> Result<Micros> {
        self.check_available()?;
        Ok(self.lock().balances.get(tenant_id).copied().unwrap_or(0))
    }

    async fn get_reservation(&self, tenant_id: &str, run_id: &str) -> Result<Option<Reservation>> {
        self.check_available()?;
        Ok(self
            .lock()
            .reservations
            .get(&run_key(tenant_id, run_id))
            .copied())
    }

    async fn get_receipt(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<SettlementReceipt>> {
        self.check_available()?;
        Ok(self.lock().receipts.get(&run_key(tenant_id, run_id)).copied())
    }

    async fn get_settled_total(&self, tenant_id: &str) -> Result<Micros> {
        self.check_available()?;
        Ok(self.lock().settled.get(tenant_id).copied().unwrap_or(0))
    }
}
