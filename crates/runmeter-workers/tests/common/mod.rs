// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runmeter-workers tests.
//!
//! Every backend is in-memory, so these tests need no external services.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use runmeter_core::Result;
use runmeter_core::finalize::Finalizer;
use runmeter_core::handler::{
    EchoHandler, HandlerRegistry, JobContext, JobFailure, JobHandler, JobOutput,
};
use runmeter_core::ledger::{
    BudgetLedger, InMemoryLedger, Micros, Reservation, ReserveOutcome, ReserveStatus,
    SettleOutcome, SettlementReceipt,
};
use runmeter_core::queue::{InMemoryJobQueue, JobMessage, JobQueue};
use runmeter_core::results::InMemoryResultStore;
use runmeter_core::store::{
    ClaimCondition, ClaimUpdate, CommitUpdate, InMemoryRunStore, NewRun, RunRecord, RunStore,
};
use runmeter_workers::reaper::{ReaperConfig, ReaperLoop};
use runmeter_workers::reconcile::{ReconcileConfig, ReconcileLoop};
use runmeter_workers::worker::{WorkerLoop, WorkerLoopConfig};

pub const TENANT: &str = "tenant-a";

/// Ledger wrapper that counts settle calls.
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

/// Run store whose expired-lease scan returns a fixed snapshot.
///
/// Lets a test finalize a run between the reaper's scan and its claim.
pub struct StaleScanStore {
    inner: Arc<InMemoryRunStore>,
    snapshot: Mutex<Vec<RunRecord>>,
}

impl StaleScanStore {
    pub fn new(inner: Arc<InMemoryRunStore>, snapshot: Vec<RunRecord>) -> Self {
        Self {
            inner,
            snapshot: Mutex::new(snapshot),
        }
    }
}

#[async_trait]
impl RunStore for StaleScanStore {
    async fn insert_run(&self, run: &NewRun) -> Result<()> {
        self.inner.insert_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.inner.get_run(run_id).await
    }

    async fn start_processing(
        &self,
        run_id: &str,
        expected_version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .start_processing(run_id, expected_version, lease_token, lease_expires_at)
            .await
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .renew_lease(run_id, lease_token, lease_expires_at)
            .await
    }

    async fn try_claim(
        &self,
        run_id: &str,
        expected_version: i64,
        condition: &ClaimCondition,
        update: &ClaimUpdate,
    ) -> Result<bool> {
        self.inner
            .try_claim(run_id, expected_version, condition, update)
            .await
    }

    async fn try_commit(
        &self,
        run_id: &str,
        expected_version: i64,
        finalize_token: &str,
        update: &CommitUpdate,
    ) -> Result<bool> {
        self.inner
            .try_commit(run_id, expected_version, finalize_token, update)
            .await
    }

    async fn list_expired_leases(
        &self,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<RunRecord>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn list_stuck_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>> {
        self.inner.list_stuck_claims(claimed_before, limit).await
    }
}

/// Handler that blocks until released, then succeeds with a fixed cost.
pub struct GateHandler {
    pub gate: Arc<Notify>,
    pub cost: Micros,
}

#[async_trait]
impl JobHandler for GateHandler {
    async fn execute(&self, _ctx: &JobContext) -> std::result::Result<JobOutput, JobFailure> {
        self.gate.notified().await;
        Ok(JobOutput {
            body: b"gated".to_vec(),
            actual_cost: self.cost,
        })
    }
}

/// Handler that sleeps, then succeeds with a fixed cost.
pub struct SleepHandler {
    pub duration: Duration,
    pub cost: Micros,
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, _ctx: &JobContext) -> std::result::Result<JobOutput, JobFailure> {
        tokio::time::sleep(self.duration).await;
        Ok(JobOutput {
            body: b"slept".to_vec(),
            actual_cost: self.cost,
        })
    }
}

/// In-memory backends and a finalizer over them.
pub struct Harness {
    pub store: Arc<InMemoryRunStore>,
    pub ledger: Arc<CountingLedger>,
    pub queue: Arc<InMemoryJobQueue>,
    pub results: Arc<InMemoryResultStore>,
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
            queue: Arc::new(InMemoryJobQueue::new()),
            results: Arc::new(InMemoryResultStore::new("results")),
            finalizer,
        }
    }

    /// Reserve `max_cost` and insert the run, as the acceptance API would.
    pub async fn accept(&self, run_id: &str, job_type: &str, max_cost: Micros, minimum_fee: Micros) {
        let outcome = self.ledger.reserve(TENANT, run_id, max_cost).await.unwrap();
        assert_eq!(outcome.status, ReserveStatus::Reserved);
        self.store
            .insert_run(&NewRun {
                run_id: run_id.to_string(),
                tenant_id: TENANT.to_string(),
                job_type: job_type.to_string(),
                reservation_max_cost: max_cost,
                minimum_fee,
            })
            .await
            .unwrap();
    }

    /// Accept a run and enqueue its message.
    pub async fn submit(
        &self,
        run_id: &str,
        job_type: &str,
        max_cost: Micros,
        minimum_fee: Micros,
        payload: serde_json::Value,
    ) {
        self.accept(run_id, job_type, max_cost, minimum_fee).await;
        self.queue.send(&message(run_id, job_type, payload)).await.unwrap();
    }

    /// Move an accepted run into processing with `lease_token`.
    pub async fn start(&self, run_id: &str, lease_token: &str, expires_at: DateTime<Utc>) {
        let run = self.run(run_id).await;
        assert!(
            self.store
                .start_processing(run_id, run.version, lease_token, expires_at)
                .await
                .unwrap()
        );
    }

    /// Push a run's lease into the past.
    pub async fn expire_lease(&self, run_id: &str) {
        let mut run = self.run(run_id).await;
        run.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        self.store.put_run(run);
    }

    /// Make a claim look `minutes` old.
    pub async fn age_claim(&self, run_id: &str, minutes: i64) {
        let mut run = self.run(run_id).await;
        run.finalize_claimed_at = Some(Utc::now() - chrono::Duration::minutes(minutes));
        self.store.put_run(run);
    }

    pub fn worker(&self, handlers: HandlerRegistry) -> WorkerLoop {
        self.worker_with_config(handlers, worker_config())
    }

    pub fn worker_with_config(&self, handlers: HandlerRegistry, config: WorkerLoopConfig) -> WorkerLoop {
        WorkerLoop::new(
            0,
            self.finalizer.clone(),
            self.queue.clone(),
            self.results.clone(),
            Arc::new(handlers),
            config,
        )
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(self.finalizer.clone(), ReaperConfig::default())
    }

    pub fn reconcile(&self) -> ReconcileLoop {
        ReconcileLoop::new(
            self.finalizer.clone(),
            self.results.clone(),
            ReconcileConfig {
                threshold: Duration::from_secs(60),
                ..Default::default()
            },
        )
    }

    pub async fn run(&self, run_id: &str) -> RunRecord {
        self.store.get_run(run_id).await.unwrap().unwrap()
    }

    pub async fn balance(&self) -> Micros {
        self.ledger.get_balance(TENANT).await.unwrap()
    }
}

pub fn message(run_id: &str, job_type: &str, payload: serde_json::Value) -> JobMessage {
    JobMessage {
        run_id: run_id.to_string(),
        tenant_id: TENANT.to_string(),
        job_type: job_type.to_string(),
        payload,
    }
}

pub fn worker_config() -> WorkerLoopConfig {
    WorkerLoopConfig {
        receive_wait: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Registry with `echo` charging `fee`.
pub fn echo_registry(fee: Micros) -> HandlerRegistry {
    HandlerRegistry::new().register("echo", Arc::new(EchoHandler { fee }))
}
