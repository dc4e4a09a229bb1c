// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runmeter Workers - Run Lifecycle Service
//!
//! Runs the worker, reaper and reconcile loops against:
//! - PostgreSQL (run store)
//! - Redis (budget ledger and job queue)
//! - the local filesystem (result store)

use std::sync::Arc;

use tracing::{info, warn};

use runmeter_core::Config;
use runmeter_core::handler::{EchoHandler, HandlerRegistry};
use runmeter_core::ledger::{RedisLedger, micros_from_cents};
use runmeter_core::migrations;
use runmeter_core::queue::RedisJobQueue;
use runmeter_core::results::LocalResultStore;
use runmeter_core::store::PostgresRunStore;
use runmeter_workers::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runmeter_workers=info,runmeter_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        redis_prefix = %config.redis_prefix,
        queue = %config.queue_name,
        data_dir = %config.data_dir.display(),
        workers = config.worker_concurrency,
        "Starting Runmeter Workers"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database");

    migrations::run_postgres(&pool).await?;
    info!("Database schema verified");

    let ledger = RedisLedger::connect(
        &config.redis_url,
        config.redis_prefix.clone(),
        config.receipt_ttl,
    )
    .await?;
    let queue = RedisJobQueue::connect(&config.redis_url, config.queue_name.clone()).await?;
    info!("Connected to Redis");

    let results = LocalResultStore::new(&config.data_dir, config.result_bucket.clone());

    let handlers = HandlerRegistry::new().register(
        "echo",
        Arc::new(EchoHandler {
            fee: micros_from_cents(1),
        }),
    );

    let runtime = WorkerRuntime::builder()
        .store(Arc::new(PostgresRunStore::new(pool)))
        .ledger(Arc::new(ledger))
        .queue(Arc::new(queue))
        .results(Arc::new(results))
        .handlers(handlers)
        .with_config(&config)
        .build()?
        .start()
        .await?;

    info!("Runmeter Workers ready");

    wait_for_shutdown().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Runmeter Workers shut down");

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}
