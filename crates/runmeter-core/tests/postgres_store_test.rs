// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL run store tests.
//!
//! These tests require a running PostgreSQL database.
//! Set TEST_DATABASE_URL environment variable to run them.

#[macro_use]
mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{pg_pool, unique_run_id};
use runmeter_core::finalize::Finalizer;
use runmeter_core::ledger::{BudgetLedger, InMemoryLedger};
use runmeter_core::store::{
    ClaimCondition, ClaimUpdate, FinalizeIntent, FinalizeStage, MoneyState, NewRun,
    PostgresRunStore, RunStatus, RunStore,
};

fn new_run(run_id: &str, tenant_id: &str) -> NewRun {
    NewRun {
        run_id: run_id.to_string(),
        tenant_id: tenant_id.to_string(),
        job_type: "echo".to_string(),
        reservation_max_cost: 1_000,
        minimum_fee: 10,
    }
}

fn claim_update(token: &str) -> ClaimUpdate {
    ClaimUpdate {
        token: token.to_string(),
        claimed_at: Utc::now(),
        intent: FinalizeIntent {
            status: RunStatus::Failed,
            charge: 10,
            result_key: None,
            error_code: Some("TIMEOUT".to_string()),
        },
    }
}

#[tokio::test]
async fn test_insert_and_start_processing() {
    skip_if_no_db!();
    let store = PostgresRunStore::new(pg_pool().await.expect("database"));
    let run_id = unique_run_id("pg-start");

    store.insert_run(&new_run(&run_id, "t1")).await.unwrap();
    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.money_state, MoneyState::Reserved);
    assert_eq!(run.version, 1);

    let expires = Utc::now() + Duration::minutes(5);
    assert!(store.start_processing(&run_id, 1, "lease-a", expires).await.unwrap());
    assert!(!store.start_processing(&run_id, 1, "lease-b", expires).await.unwrap());

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Processing);
    assert_eq!(run.version, 2);
    assert_eq!(run.lease_token.as_deref(), Some("lease-a"));
    assert!(run.started_at.is_some());
}

#[tokio::test]
async fn test_claim_cas_and_lease_predicate() {
    skip_if_no_db!();
    let store = PostgresRunStore::new(pg_pool().await.expect("database"));
    let run_id = unique_run_id("pg-claim");
    store.insert_run(&new_run(&run_id, "t1")).await.unwrap();
    store
        .start_processing(&run_id, 1, "lease-a", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();

    let wrong = ClaimCondition::LeaseMatch("lease-b".to_string());
    assert!(!store.try_claim(&run_id, 2, &wrong, &claim_update("f1")).await.unwrap());
    assert!(!store
        .try_claim(&run_id, 1, &ClaimCondition::AnyLease, &claim_update("f1"))
        .await
        .unwrap());

    let right = ClaimCondition::LeaseMatch("lease-a".to_string());
    assert!(store.try_claim(&run_id, 2, &right, &claim_update("f1")).await.unwrap());
    assert!(!store
        .try_claim(&run_id, 3, &ClaimCondition::AnyLease, &claim_update("f2"))
        .await
        .unwrap());

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.finalize_stage, Some(FinalizeStage::Claimed));
    assert_eq!(run.finalize_token.as_deref(), Some("f1"));
    assert_eq!(run.finalize_intent, Some(RunStatus::Failed));
    assert_eq!(run.version, 3);
}

#[tokio::test]
async fn test_renew_lease_does_not_bump_version() {
    skip_if_no_db!();
    let store = PostgresRunStore::new(pg_pool().await.expect("database"));
    let run_id = unique_run_id("pg-renew");
    store.insert_run(&new_run(&run_id, "t1")).await.unwrap();
    store
        .start_processing(&run_id, 1, "lease-a", Utc::now() + Duration::minutes(1))
        .await
        .unwrap();

    let later = Utc::now() + Duration::minutes(10);
    assert!(store.renew_lease(&run_id, "lease-a", later).await.unwrap());
    assert!(!store.renew_lease(&run_id, "lease-x", later).await.unwrap());

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.version, 2);
}

#[tokio::test]
async fn test_full_protocol_against_postgres() {
    skip_if_no_db!();
    let store = Arc::new(PostgresRunStore::new(pg_pool().await.expect("database")));
    let ledger = Arc::new(InMemoryLedger::new());
    let tenant = unique_run_id("tenant");
    let run_id = unique_run_id("pg-protocol");

    ledger.credit(&tenant, 5_000).await.unwrap();
    ledger.reserve(&tenant, &run_id, 1_000).await.unwrap();
    store.insert_run(&new_run(&run_id, &tenant)).await.unwrap();
    store
        .start_processing(&run_id, 1, "lease-a", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    let expired = store
        .list_expired_leases(Utc::now(), 1_000)
        .await
        .unwrap();
    assert!(expired.iter().any(|r| r.run_id == run_id));

    let finalizer = Finalizer::new(store.clone(), ledger.clone());
    let outcome = finalizer.finalize_timeout(&run_id, &tenant).await.unwrap();
    assert_eq!(outcome.charged, 10);

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.money_state, MoneyState::Settled);
    assert_eq!(run.finalize_stage, Some(FinalizeStage::Committed));
    assert_eq!(run.actual_cost, Some(10));
    assert_eq!(run.version, 4);
    assert!(run.finished_at.is_some());

    let err = finalizer.finalize_timeout(&run_id, &tenant).await.unwrap_err();
    assert!(err.is_race_lost());
}

#[tokio::test]
async fn test_stuck_claim_scan() {
    skip_if_no_db!();
    let store = PostgresRunStore::new(pg_pool().await.expect("database"));
    let run_id = unique_run_id("pg-stuck");
    store.insert_run(&new_run(&run_id, "t1")).await.unwrap();
    store
        .start_processing(&run_id, 1, "lease-a", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    let mut update = claim_update("f1");
    update.claimed_at = Utc::now() - Duration::minutes(30);
    store
        .try_claim(&run_id, 2, &ClaimCondition::AnyLease, &update)
        .await
        .unwrap();

    let stuck = store
        .list_stuck_claims(Utc::now() - Duration::minutes(5), 1_000)
        .await
        .unwrap();
    assert!(stuck.iter().any(|r| r.run_id == run_id));

    let recent = store
        .list_stuck_claims(Utc::now() - Duration::hours(1), 1_000)
        .await
        .unwrap();
    assert!(!recent.iter().any(|r| r.run_id == run_id));
}

#[tokio::test]
async fn test_schema_rejects_settled_run_without_commit() {
    skip_if_no_db!();
    let pool = pg_pool().await.expect("database");
    let store = PostgresRunStore::new(pool.clone());
    let run_id = unique_run_id("pg-settled");
    store.insert_run(&new_run(&run_id, "t1")).await.unwrap();

    let err = sqlx::query("UPDATE runs SET money_state = 'SETTLED' WHERE run_id = $1")
        .bind(&run_id)
        .execute(&pool)
        .await
        .unwrap_err();
    let constraint = err
        .as_database_error()
        .and_then(|e| e.constraint())
        .map(str::to_string);
    assert_eq!(constraint.as_deref(), Some("runs_settled_is_committed"));

    let err = sqlx::query(
        "UPDATE runs SET finalize_stage = 'COMMITTED' WHERE run_id = $1",
    )
    .bind(&run_id)
    .execute(&pool)
    .await
    .unwrap_err();
    let constraint = err
        .as_database_error()
        .and_then(|e| e.constraint())
        .map(str::to_string);
    assert_eq!(constraint.as_deref(), Some("runs_committed_is_settled"));

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.money_state, MoneyState::Reserved);
    assert_eq!(run.finalize_stage, None);
}
