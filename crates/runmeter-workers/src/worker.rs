// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker loop: executes queued jobs and finalizes them.
//!
//! Per message:
//!
//! 1. Take the run's lease (`QUEUED → PROCESSING`). Redelivered messages for
//!    runs that already left `QUEUED` are acked and skipped.
//! 2. Execute the handler, renewing the lease every third of its length.
//! 3. Success: claim, upload the result, commit `COMPLETED`. An upload error
//!    after the claim commits `FAILED` / `UPLOAD_FAILED` instead.
//! 4. Failure: claim and commit `FAILED` with the minimum fee.
//!
//! A lost claim means the reaper already timed the run out; the worker
//! abandons it. Once the lease is taken the message is always acked: the run
//! is then the reaper's responsibility if this worker cannot finish it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runmeter_core::finalize::{Finalizer, result_key};
use runmeter_core::handler::{HandlerRegistry, JobContext, JobFailure, JobOutput};
use runmeter_core::queue::{Delivery, JobMessage, JobQueue};
use runmeter_core::results::ResultStore;
use runmeter_core::store::RunStatus;
use runmeter_core::{CommitOutcome, RunStore};
use tokio::sync::Notify;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, chrono_duration};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Messages taken per receive.
    pub batch_size: usize,
    /// How long one receive waits for a message.
    pub receive_wait: Duration,
    /// Lease length taken when a job starts.
    pub lease_duration: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            receive_wait: Duration::from_secs(5),
            lease_duration: Duration::from_secs(300),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerLoopConfig {
    /// Lease renewal period: a third of the lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The run was finalized by this worker.
    Committed(CommitOutcome),
    /// The run was not in `QUEUED` (redelivery) or does not exist.
    Skipped,
    /// Another process finalized the run first.
    Abandoned,
    /// Finalize failed hard; the run is left for the reaper or reconcile.
    FinalizeFailed,
    /// Infrastructure failure before the lease; the message was not acked.
    Retry,
}

/// Long-running consumer of the job queue.
pub struct WorkerLoop {
    id: usize,
    finalizer: Finalizer,
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultStore>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerLoopConfig,
    shutdown: Arc<Notify>,
}

impl WorkerLoop {
    /// Create a worker loop.
    pub fn new(
        id: usize,
        finalizer: Finalizer,
        queue: Arc<dyn JobQueue>,
        results: Arc<dyn ResultStore>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerLoopConfig,
    ) -> Self {
        Self {
            id,
            finalizer,
            queue,
            results,
            handlers,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    ///
    /// Shutdown only interrupts the wait for new messages; a batch that has
    /// been received is processed to the end.
    pub async fn run(&self) {
        info!(
            worker = self.id,
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_duration.as_secs(),
            "Worker loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(worker = self.id, "Worker loop received shutdown signal");
                    break;
                }

                received = self.queue.receive(self.config.batch_size, self.config.receive_wait) => {
                    match received {
                        Ok(batch) => {
                            for delivery in batch {
                                self.process(&delivery).await;
                            }
                        }
                        Err(e) => {
                            error!(worker = self.id, error = %e, "Failed to receive from job queue");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
            }
        }

        info!(worker = self.id, "Worker loop stopped");
    }

    /// Process one delivery and ack it unless it must be redelivered.
    pub async fn process(&self, delivery: &Delivery) -> ProcessOutcome {
        let message = &delivery.message;
        let outcome = match self.handle(message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    worker = self.id,
                    run_id = %message.run_id,
                    error = %e,
                    "Failed to start run, leaving message for redelivery"
                );
                return ProcessOutcome::Retry;
            }
        };

        if let Err(e) = self.queue.ack(delivery).await {
            warn!(
                worker = self.id,
                run_id = %message.run_id,
                error = %e,
                "Failed to ack message; redelivery will be skipped"
            );
        }
        outcome
    }

    async fn handle(&self, message: &JobMessage) -> Result<ProcessOutcome> {
        let store = self.finalizer.store();
        let Some(run) = store.get_run(&message.run_id).await? else {
            warn!(run_id = %message.run_id, "Message for unknown run, dropping");
            return Ok(ProcessOutcome::Skipped);
        };
        if run.tenant_id != message.tenant_id {
            warn!(
                run_id = %message.run_id,
                message_tenant = %message.tenant_id,
                run_tenant = %run.tenant_id,
                "Message tenant does not match run, dropping"
            );
            return Ok(ProcessOutcome::Skipped);
        }
        if run.status != RunStatus::Queued {
            debug!(
                run_id = %run.run_id,
                status = %run.status,
                "Run already picked up, skipping redelivered message"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let lease_token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + chrono_duration(self.config.lease_duration)?;
        if !store
            .start_processing(&run.run_id, run.version, &lease_token, expires_at)
            .await?
        {
            debug!(run_id = %run.run_id, "Lost race to start run");
            return Ok(ProcessOutcome::Skipped);
        }

        info!(
            worker = self.id,
            run_id = %run.run_id,
            tenant_id = %run.tenant_id,
            job_type = %run.job_type,
            "Run started"
        );

        let ctx = JobContext {
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            job_type: run.job_type.clone(),
            payload: message.payload.clone(),
            reservation_max_cost: run.reservation_max_cost,
        };
        let result = self.execute_with_heartbeat(&ctx, &lease_token).await;

        Ok(self.finalize(&ctx, &lease_token, result).await)
    }

    /// Run the handler while renewing the lease.
    async fn execute_with_heartbeat(
        &self,
        ctx: &JobContext,
        lease_token: &str,
    ) -> std::result::Result<JobOutput, JobFailure> {
        let period = self.config.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        let job = self.handlers.execute(ctx);
        tokio::pin!(job);

        loop {
            tokio::select! {
                result = &mut job => return result,
                _ = ticker.tick() => self.renew_lease(ctx, lease_token).await,
            }
        }
    }

    async fn renew_lease(&self, ctx: &JobContext, lease_token: &str) {
        let expires_at = match chrono_duration(self.config.lease_duration) {
            Ok(lease) => Utc::now() + lease,
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, "Invalid lease duration");
                return;
            }
        };
        match self
            .finalizer
            .store()
            .renew_lease(&ctx.run_id, lease_token, expires_at)
            .await
        {
            Ok(true) => debug!(run_id = %ctx.run_id, "Lease renewed"),
            Ok(false) => warn!(
                run_id = %ctx.run_id,
                "Lease renewal refused; run may already be timed out"
            ),
            Err(e) => warn!(run_id = %ctx.run_id, error = %e, "Lease renewal failed"),
        }
    }

    async fn finalize(
        &self,
        ctx: &JobContext,
        lease_token: &str,
        result: std::result::Result<JobOutput, JobFailure>,
    ) -> ProcessOutcome {
        let finalized = match result {
            Ok(output) => self.finalize_success(ctx, lease_token, output).await,
            Err(failure) => {
                info!(
                    run_id = %ctx.run_id,
                    code = %failure.code,
                    message = %failure.message,
                    "Job failed"
                );
                self.finalizer
                    .finalize_failure(
                        &ctx.run_id,
                        &ctx.tenant_id,
                        lease_token,
                        &failure.code,
                        failure.message,
                    )
                    .await
            }
        };

        match finalized {
            Ok(outcome) => ProcessOutcome::Committed(outcome),
            Err(e) if e.is_race_lost() => {
                info!(
                    run_id = %ctx.run_id,
                    reason = %e,
                    "Run finalized elsewhere, abandoning"
                );
                ProcessOutcome::Abandoned
            }
            Err(e) => {
                error!(
                    run_id = %ctx.run_id,
                    tenant_id = %ctx.tenant_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Failed to finalize run"
                );
                ProcessOutcome::FinalizeFailed
            }
        }
    }

    async fn finalize_success(
        &self,
        ctx: &JobContext,
        lease_token: &str,
        output: JobOutput,
    ) -> runmeter_core::Result<CommitOutcome> {
        let charge = output.actual_cost.clamp(0, ctx.reservation_max_cost);
        if charge != output.actual_cost {
            warn!(
                run_id = %ctx.run_id,
                reported = output.actual_cost,
                charged = charge,
                "Handler cost outside reservation, capping"
            );
        }
        let claim = self
            .finalizer
            .claim_success(&ctx.run_id, &ctx.tenant_id, lease_token, charge)
            .await?;

        let key = result_key(&ctx.tenant_id, &ctx.run_id);
        match self.results.put(&key, &output.body).await {
            Ok(location) => self.finalizer.commit_success(&claim, location).await,
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "Result upload failed after claim");
                self.finalizer
                    .commit_upload_failed(&claim, e.to_string())
                    .await
            }
        }
    }
}
