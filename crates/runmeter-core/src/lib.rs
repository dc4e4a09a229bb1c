// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runmeter Core - Metered Run Lifecycle
//!
//! This crate holds the money-safe core of a metered job system: tenant
//! budgets in Redis, run rows in PostgreSQL, and the two-phase finalize
//! protocol that keeps the two consistent without a distributed transaction.
//!
//! # Architecture
//!
//! ```text
//!   acceptance API (external)
//!        │ reserve(max_cost)          insert_run (QUEUED / RESERVED)
//!        ▼                                   ▼
//! ┌────────────────────┐          ┌────────────────────────┐
//! │   BudgetLedger     │          │        RunStore        │
//! │  Redis + Lua       │          │  PostgreSQL, CAS on    │
//! │  balance           │          │  (run_id, version)     │
//! │  reservation:<run> │          │                        │
//! │  receipt:<run>     │          │                        │
//! └────────────────────┘          └────────────────────────┘
//!        ▲   settle / refund_full          ▲  claim / commit
//!        └──────────────┐   ┌──────────────┘
//!                  ┌────┴───┴────┐
//!                  │  Finalizer  │◄── worker / reaper / reconcile
//!                  └─────────────┘    (runmeter-workers)
//! ```
//!
//! # Finalize protocol
//!
//! | Step | Store | Effect |
//! |------|-------|--------|
//! | claim | Postgres | `finalize_stage NULL → CLAIMED`, fresh token, `version + 1` |
//! | upload | object store | result object (success path only) |
//! | settle | Redis | charge, refund, drop reservation, write receipt (one script) |
//! | commit | Postgres | terminal status, `SETTLED`, `COMMITTED`, `version + 1` |
//!
//! A crash between settle and commit leaves the run `CLAIMED` with a receipt
//! in the ledger. Reconcile replays that receipt into the commit and never
//! settles a second time.
//!
//! # Money
//!
//! Amounts are [`ledger::Micros`], integer millionths of the currency unit.
//! For every tenant, at every point in time:
//!
//! ```text
//! credited == balance + Σ active reservations + Σ settled charges
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNMETER_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `RUNMETER_REDIS_URL` | No | `redis://127.0.0.1:6379` | Ledger and queue Redis |
//! | `RUNMETER_REDIS_PREFIX` | No | `runmeter` | Key namespace |
//! | `RUNMETER_QUEUE_NAME` | No | `runmeter:jobs` | Job queue list |
//! | `RUNMETER_DATA_DIR` | No | `.data` | Local result store root |
//! | `RUNMETER_RESULT_BUCKET` | No | `results` | Bucket recorded on runs |
//! | `RUNMETER_WORKER_CONCURRENCY` | No | `2` | Worker loop tasks |
//! | `RUNMETER_LEASE_SECS` | No | `300` | Worker lease length |
//! | `RUNMETER_REAPER_INTERVAL_SECS` | No | `30` | Reaper cycle |
//! | `RUNMETER_REAPER_BATCH_SIZE` | No | `100` | Reaper scan bound |
//! | `RUNMETER_RECONCILE_INTERVAL_SECS` | No | `120` | Reconcile cycle |
//! | `RUNMETER_RECONCILE_THRESHOLD_SECS` | No | `300` | Minimum age of a stuck claim |
//! | `RUNMETER_RECONCILE_BATCH_SIZE` | No | `50` | Reconcile scan bound |
//! | `RUNMETER_RECEIPT_TTL_SECS` | No | `2592000` | Receipt retention |
//!
//! # Modules
//!
//! - [`ledger`]: Budget ledger trait, Redis and in-memory backends
//! - [`store`]: Run store trait, PostgreSQL and in-memory backends
//! - [`finalize`]: Claim/commit protocol and its policies
//! - [`queue`], [`results`], [`handler`]: Collaborator seams used by workers
//! - [`error`]: Race-lost, finalize and infrastructure errors
//! - [`config`]: Environment configuration
//! - [`migrations`]: Embedded PostgreSQL schema

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for the finalize protocol and its backends.
pub mod error;

/// Two-phase claim/commit protocol.
pub mod finalize;

/// Job handler trait and registry.
pub mod handler;

/// Budget ledger: balances, reservations, settlement receipts.
pub mod ledger;

/// Embedded database migrations.
pub mod migrations;

/// Job queue trait and backends.
pub mod queue;

/// Result object store trait and backends.
pub mod results;

/// Run store: the run row and its compare-and-swap writes.
pub mod store;

pub use config::{Config, ConfigError};
pub use error::{ClaimError, Error, FinalizeError, Result};
pub use finalize::{Claim, CommitOutcome, CommitRequest, Finalizer};
pub use ledger::{BudgetLedger, Micros};
pub use store::{RunRecord, RunStatus, RunStore};
