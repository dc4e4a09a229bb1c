// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job bodies.
//!
//! A [`JobHandler`] executes one job type and reports what it cost. It never
//! touches the ledger or the run store; the worker turns its output into a
//! success or failure finalize.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::finalize::{ERROR_JOB_FAILED, ERROR_UNKNOWN_JOB_TYPE};
use crate::ledger::Micros;

/// Input handed to a job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Run being executed.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Handler selector.
    pub job_type: String,
    /// Job input from the queue message.
    pub payload: serde_json::Value,
    /// Upper bound the job may charge.
    pub reservation_max_cost: Micros,
}

/// Output of a successful job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    /// Result object body.
    pub body: Vec<u8>,
    /// Amount to charge.
    pub actual_cost: Micros,
}

/// A job body's own failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct JobFailure {
    /// Machine-readable code written to the run.
    pub code: String,
    /// Human-readable message written to the run.
    pub message: String,
}

impl JobFailure {
    /// Failure with an explicit code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Failure with the default `JOB_FAILED` code.
    pub fn job_failed(message: impl Into<String>) -> Self {
        Self::new(ERROR_JOB_FAILED, message)
    }
}

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job body.
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobFailure>;
}

/// Handlers keyed by job type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Handler for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Dispatch to the handler for `ctx.job_type`.
    pub async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobFailure> {
        match self.get(&ctx.job_type) {
            Some(handler) => handler.execute(ctx).await,
            None => Err(JobFailure::new(
                ERROR_UNKNOWN_JOB_TYPE,
                format!("no handler registered for job type '{}'", ctx.job_type),
            )),
        }
    }
}

/// Returns its payload as the result and charges a flat fee.
///
/// A payload of `{"fail": "<message>"}` fails the job instead.
#[derive(Debug, Clone, Copy)]
pub struct EchoHandler {
    /// Fee charged per successful run, capped at the reservation.
    pub fee: Micros,
}

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobFailure> {
        if let Some(message) = ctx.payload.get("fail").and_then(|v| v.as_str()) {
            return Err(JobFailure::job_failed(message));
        }
        let body = serde_json::to_vec(&ctx.payload)
            .map_err(|e| JobFailure::job_failed(e.to_string()))?;
        Ok(JobOutput {
            body,
            actual_cost: self.fee.min(ctx.reservation_max_cost),
        })
    }
}
