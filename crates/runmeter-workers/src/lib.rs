// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runmeter Workers - Run Lifecycle Drivers
//!
//! This crate runs the three loops that drive runs through the finalize
//! protocol in `runmeter-core`.
//!
//! # Architecture
//!
//! ```text
//!            job queue (Redis list)
//!                   │ receive / ack
//!                   ▼
//! ┌──────────────────────────────┐   ┌──────────────┐   ┌────────────────┐
//! │  WorkerLoop × concurrency    │   │  ReaperLoop  │   │ ReconcileLoop  │
//! │  lease → execute → claim →   │   │  expired     │   │ stuck CLAIMED  │
//! │  upload → commit             │   │  leases      │   │ + receipt      │
//! └──────────────┬───────────────┘   └──────┬───────┘   └───────┬────────┘
//!                │                          │                   │
//!                └─────────────┬────────────┴───────────────────┘
//!                              ▼
//!                     ┌─────────────────┐
//!                     │    Finalizer    │  RunStore (PostgreSQL)
//!                     │ claim / commit  │  BudgetLedger (Redis)
//!                     └─────────────────┘
//! ```
//!
//! # Loops
//!
//! | Loop | Wakes on | Finalizes with | Lost race logged at |
//! |------|----------|----------------|---------------------|
//! | Worker | queue message | success / failure policy | `info` |
//! | Reaper | `poll_interval` (30s) | timeout policy | `debug` |
//! | Reconcile | `poll_interval` (120s) | receipt replay or settle | `debug` |
//!
//! Every loop stops on its shutdown handle, but only between iterations: a
//! run that has been claimed is always committed (or left for reconcile by a
//! crash), never abandoned by shutdown.
//!
//! # Modules
//!
//! - [`worker`]: Queue consumer executing jobs under a lease
//! - [`reaper`]: Times out runs whose lease expired
//! - [`reconcile`]: Recovers runs stuck between claim and commit
//! - [`runtime`]: Embeddable runtime owning all loops

#![deny(missing_docs)]

/// Error types for the loops and runtime.
pub mod error;

/// Background loop timing out expired leases.
pub mod reaper;

/// Background loop recovering stuck claims.
pub mod reconcile;

/// Embeddable runtime for the runmeter loops.
pub mod runtime;

/// Queue consumer executing and finalizing jobs.
pub mod worker;

pub use error::Error;
pub use reaper::{ReaperConfig, ReaperLoop};
pub use reconcile::{ReconcileAction, ReconcileConfig, ReconcileLoop};
pub use runtime::WorkerRuntime;
pub use worker::{ProcessOutcome, WorkerLoop, WorkerLoopConfig};
