// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runmeter-core integration tests.
//!
//! Provides an in-memory harness for protocol tests and connection helpers
//! for the PostgreSQL and Redis backend tests.

#![allow(dead_code, unused_macros)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use runmeter_core::Result;
use runmeter_core::finalize::Finalizer;
use runmeter_core::ledger::{
    BudgetLedger, InMemoryLedger, Micros, Reservation, ReserveOutcome, ReserveStatus,
    SettleOutcome, SettlementReceipt,
};
use runmeter_core::store::{InMemoryRunStore, NewRun, RunStore};

pub const TENANT: &str = "tenant-a";

/// Ledger wrapper that counts money-moving calls.
pub struct CountingLedger {
    inner: InMemoryLedger,
    settles: AtomicUsize,
}

impl CountingLedger {
    pub fn new() -> Self {
        Self {
            inner: InMemoryLedger::new(),
            settles: AtomicUsize::new(0),
        }
    }

    pub fn settle_calls(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryLedger {
        &self.inner
    }
}

#[async_trait]
impl BudgetLedger for CountingLedger {
    async fn credit(&self, tenant_id: &str, amount: Micros) -> Result<Micros> {
        self.inner.credit(tenant_id, amount).await
    }

    async fn reserve(
        &self,
        tenant_id: &str,
        run_id: &str,
        amount: Micros,
    ) -> Result<ReserveOutcome> {
        self.inner.reserve(tenant_id, run_id, amount).await
    }

    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        charge_amount: Micros,
    ) -> Result<SettleOutcome> {
        self.settles.fetch_add(1, Ordering::SeqCst);
        self.inner.settle(tenant_id, run_id, charge_amount).await
    }

    async fn get_balance(&self, tenant_id: &str) -> Result<Micros> {
        self.inner.get_balance(tenant_id).await
    }

    async fn get_reservation(&self, tenant_id: &str, run_id: &str) -> Result<Option<Reservation>> {
        self.inner.get_reservation(tenant_id, run_id).await
    }

    async fn get_receipt(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<SettlementReceipt>> {
        self.inner.get_receipt(tenant_id, run_id).await
    }

    async fn get_settled_total(&self, tenant_id: &str) -> Result<Micros> {
        self.inner.get_settled_total(tenant_id).await
    }
}

/// In-memory store, counting ledger and a finalizer over both.
pub struct Harness {
    pub store: Arc<InMemoryRunStore>,
    pub ledger: Arc<CountingLedger>,
    pub finalizer: Finalizer,
}

impl Harness {
    pub async fn with_balance(balance: Micros) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let ledger = Arc::new(CountingLedger::new());
        ledger.credit(TENANT, balance).await.unwrap();
        let finalizer = Finalizer::new(store.clone(), ledger.clone());
        Self {
            store,
            ledger,
            finalizer,
        }
    }

    /// Reserve `max_cost` and insert the run, as the acceptance API would.
    pub async fn accept(&self, run_id: &str, max_cost: Micros, minimum_fee: Micros) {
        let outcome = self.ledger.reserve(TENANT, run_id, max_cost).await.unwrap();
        assert_eq!(outcome.status, ReserveStatus::Reserved);
        self.store
            .insert_run(&NewRun {
                run_id: run_id.to_string(),
                tenant_id: TENANT.to_string(),
                job_type: "echo".to_string(),
                reservation_max_cost: max_cost,
                minimum_fee,
            })
            .await
            .unwrap();
    }

    /// Move an accepted run into processing with `lease_token`.
    pub async fn start(&self, run_id: &str, lease_token: &str, expires_at: DateTime<Utc>) {
        let run = self.store.get_run(run_id).await.unwrap().unwrap();
        assert!(
            self.store
                .start_processing(run_id, run.version, lease_token, expires_at)
                .await
                .unwrap()
        );
    }

    /// Accept and start a run with a live lease.
    pub async fn running(&self, run_id: &str, max_cost: Micros, minimum_fee: Micros) {
        self.accept(run_id, max_cost, minimum_fee).await;
        self.start(run_id, "lease-1", Utc::now() + Duration::minutes(5))
            .await;
    }

    pub async fn balance(&self) -> Micros {
        self.ledger.get_balance(TENANT).await.unwrap()
    }
}

/// Connect to `TEST_DATABASE_URL` and apply migrations.
pub async fn pg_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    runmeter_core::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

/// Unique run id per test invocation.
pub fn unique_run_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Skip test if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Skip test if Redis URL is not set.
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        }
    };
}
