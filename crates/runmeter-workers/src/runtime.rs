// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the runmeter loops.
//!
//! [`WorkerRuntime`] owns the worker, reaper and reconcile tasks so they can
//! run inside an existing tokio application instead of the standalone
//! binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runmeter_core::handler::{EchoHandler, HandlerRegistry};
//! use runmeter_workers::runtime::WorkerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WorkerRuntime::builder()
//!         .store(store)
//!         .ledger(ledger)
//!         .queue(queue)
//!         .results(results)
//!         .handlers(HandlerRegistry::new().register("echo", Arc::new(EchoHandler { fee: 10_000 })))
//!         .concurrency(4)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use runmeter_core::finalize::Finalizer;
use runmeter_core::handler::HandlerRegistry;
use runmeter_core::queue::JobQueue;
use runmeter_core::results::ResultStore;
use runmeter_core::{BudgetLedger, Config, RunStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::reaper::{ReaperConfig, ReaperLoop};
use crate::reconcile::{ReconcileConfig, ReconcileLoop};
use crate::worker::{WorkerLoop, WorkerLoopConfig};

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    store: Option<Arc<dyn RunStore>>,
    ledger: Option<Arc<dyn BudgetLedger>>,
    queue: Option<Arc<dyn JobQueue>>,
    results: Option<Arc<dyn ResultStore>>,
    handlers: HandlerRegistry,
    concurrency: usize,
    requeue_on_start: bool,
    worker_config: WorkerLoopConfig,
    reaper_config: ReaperConfig,
    reconcile_config: ReconcileConfig,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            ledger: None,
            queue: None,
            results: None,
            handlers: HandlerRegistry::new(),
            concurrency: 2,
            requeue_on_start: true,
            worker_config: WorkerLoopConfig::default(),
            reaper_config: ReaperConfig::default(),
            reconcile_config: ReconcileConfig::default(),
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run store (required).
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the budget ledger (required).
    pub fn ledger(mut self, ledger: Arc<dyn BudgetLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the job queue (required).
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the result store (required).
    pub fn results(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    /// Set the job handlers.
    ///
    /// Default: empty registry (every job fails with `UNKNOWN_JOB_TYPE`)
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the number of worker loops.
    ///
    /// Default: 2
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Whether to return in-flight queue messages to the queue on start.
    ///
    /// Default: true
    pub fn requeue_on_start(mut self, requeue: bool) -> Self {
        self.requeue_on_start = requeue;
        self
    }

    /// Set the worker loop configuration.
    pub fn worker_config(mut self, config: WorkerLoopConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Set the reaper configuration.
    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// Set the reconcile loop configuration.
    pub fn reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile_config = config;
        self
    }

    /// Take concurrency, lease and loop timings from a loaded [`Config`].
    pub fn with_config(mut self, config: &Config) -> Self {
        self.concurrency = config.worker_concurrency;
        self.worker_config.lease_duration = config.lease_duration;
        self.reaper_config = ReaperConfig {
            poll_interval: config.reaper_interval,
            batch_size: config.reaper_batch_size,
        };
        self.reconcile_config = ReconcileConfig {
            poll_interval: config.reconcile_interval,
            threshold: config.reconcile_threshold,
            batch_size: config.reconcile_batch_size,
        };
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let ledger = self
            .ledger
            .ok_or_else(|| anyhow::anyhow!("ledger is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let results = self
            .results
            .ok_or_else(|| anyhow::anyhow!("results is required"))?;
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.worker_config.lease_duration.is_zero() {
            anyhow::bail!("lease duration must be positive");
        }

        Ok(WorkerRuntimeConfig {
            finalizer: Finalizer::new(store, ledger),
            queue,
            results,
            handlers: Arc::new(self.handlers),
            concurrency: self.concurrency,
            requeue_on_start: self.requeue_on_start,
            worker_config: self.worker_config,
            reaper_config: self.reaper_config,
            reconcile_config: self.reconcile_config,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    finalizer: Finalizer,
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultStore>,
    handlers: Arc<HandlerRegistry>,
    concurrency: usize,
    requeue_on_start: bool,
    worker_config: WorkerLoopConfig,
    reaper_config: ReaperConfig,
    reconcile_config: ReconcileConfig,
}

impl WorkerRuntimeConfig {
    /// Start the runtime, spawning the worker, reaper and reconcile tasks.
    pub async fn start(self) -> Result<WorkerRuntime> {
        // Messages left in flight by a previous process would otherwise never
        // be delivered again.
        if self.requeue_on_start {
            match self.queue.requeue_in_flight().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Requeued in-flight messages from previous run"),
                Err(e) => warn!(error = %e, "Failed to requeue in-flight messages"),
            }
        }

        let mut worker_handles = Vec::with_capacity(self.concurrency);
        let mut worker_shutdowns = Vec::with_capacity(self.concurrency);
        for id in 0..self.concurrency {
            let worker = WorkerLoop::new(
                id,
                self.finalizer.clone(),
                self.queue.clone(),
                self.results.clone(),
                self.handlers.clone(),
                self.worker_config.clone(),
            );
            worker_shutdowns.push(worker.shutdown_handle());
            worker_handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }

        let reaper = ReaperLoop::new(self.finalizer.clone(), self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        let reconcile = ReconcileLoop::new(
            self.finalizer.clone(),
            self.results.clone(),
            self.reconcile_config,
        );
        let reconcile_shutdown = reconcile.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            reconcile.run().await;
        });

        info!(
            workers = self.concurrency,
            job_types = ?self.handlers.job_types(),
            "WorkerRuntime started"
        );

        Ok(WorkerRuntime {
            worker_handles,
            worker_shutdowns,
            reaper_handle,
            reaper_shutdown,
            reconcile_handle,
            reconcile_shutdown,
            finalizer: self.finalizer,
        })
    }
}

/// A running set of runmeter loops.
///
/// The runtime manages:
/// - `concurrency` worker loops consuming the job queue
/// - one reaper timing out expired leases
/// - one reconcile loop recovering stuck claims
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    worker_handles: Vec<JoinHandle<()>>,
    worker_shutdowns: Vec<Arc<Notify>>,
    reaper_handle: JoinHandle<()>,
    reaper_shutdown: Arc<Notify>,
    reconcile_handle: JoinHandle<()>,
    reconcile_shutdown: Arc<Notify>,
    finalizer: Finalizer,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// The finalizer shared by every loop.
    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    /// Number of worker loops.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every loop to stop, then waits for them. A loop that is in the
    /// middle of an iteration finishes it first, so no run is left between
    /// claim and commit by the shutdown itself.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");

        // notify_one stores a permit, so a loop that is not currently waiting
        // still sees the signal on its next select.
        for shutdown in &self.worker_shutdowns {
            shutdown.notify_one();
        }
        self.reaper_shutdown.notify_one();
        self.reconcile_shutdown.notify_one();

        let mut panicked = 0;
        for (id, handle) in self.worker_handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, "Worker loop task panicked: {}", e);
                panicked += 1;
            }
        }

        if let Err(e) = self.reaper_handle.await {
            error!("Reaper task panicked: {}", e);
            panicked += 1;
        }

        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile task panicked: {}", e);
            panicked += 1;
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{} loop task(s) panicked", panicked));
        }

        info!("WorkerRuntime shutdown complete");
        Ok(())
    }

    /// Check if every loop is still running.
    pub fn is_running(&self) -> bool {
        self.worker_handles.iter().all(|h| !h.is_finished())
            && !self.reaper_handle.is_finished()
            && !self.reconcile_handle.is_finished()
    }
}
