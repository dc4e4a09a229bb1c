// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL run store.
//!
//! Every contested write is a single `UPDATE ... WHERE version = $n AND ...`
//! whose `rows_affected()` decides the race. No explicit transactions or row
//! locks are taken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    ClaimCondition, ClaimUpdate, CommitUpdate, FinalizeStage, MoneyState, NewRun, RunRecord,
    RunStatus, RunStore,
};
use crate::error::Result;

/// PostgreSQL-backed run store.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RUN_COLUMNS: &str = r#"
    run_id, tenant_id, job_type, status, money_state, version,
    reservation_max_cost, actual_cost, minimum_fee,
    lease_token, lease_expires_at,
    finalize_token, finalize_stage, finalize_claimed_at, finalize_intent, intended_charge,
    result_bucket, result_key, result_sha256, error_code, error_message,
    created_at, started_at, finished_at
"#;

/// Raw row; state columns are stored as text.
#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    tenant_id: String,
    job_type: String,
    status: String,
    money_state: String,
    version: i64,
    reservation_max_cost: i64,
    actual_cost: Option<i64>,
    minimum_fee: i64,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    finalize_token: Option<String>,
    finalize_stage: Option<String>,
    finalize_claimed_at: Option<DateTime<Utc>>,
    finalize_intent: Option<String>,
    intended_charge: Option<i64>,
    result_bucket: Option<String>,
    result_key: Option<String>,
    result_sha256: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

fn decode<T>(value: &str) -> std::result::Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = super::ParseStateError>,
{
    value.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl TryFrom<RunRow> for RunRecord {
    type Error = sqlx::Error;

    fn try_from(row: RunRow) -> std::result::Result<Self, Self::Error> {
        Ok(RunRecord {
            status: decode::<RunStatus>(&row.status)?,
            money_state: decode::<MoneyState>(&row.money_state)?,
            finalize_stage: row
                .finalize_stage
                .as_deref()
                .map(decode::<FinalizeStage>)
                .transpose()?,
            finalize_intent: row
                .finalize_intent
                .as_deref()
                .map(decode::<RunStatus>)
                .transpose()?,
            run_id: row.run_id,
            tenant_id: row.tenant_id,
            job_type: row.job_type,
            version: row.version,
            reservation_max_cost: row.reservation_max_cost,
            actual_cost: row.actual_cost,
            minimum_fee: row.minimum_fee,
            lease_token: row.lease_token,
            lease_expires_at: row.lease_expires_at,
            finalize_token: row.finalize_token,
            finalize_claimed_at: row.finalize_claimed_at,
            intended_charge: row.intended_charge,
            result_bucket: row.result_bucket,
            result_key: row.result_key,
            result_sha256: row.result_sha256,
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn into_records(rows: Vec<RunRow>) -> Result<Vec<RunRecord>> {
    rows.into_iter()
        .map(|row| RunRecord::try_from(row).map_err(Into::into))
        .collect()
}

// ============================================================================
// Run Operations
// ============================================================================

/// Insert a new run in `QUEUED` / `RESERVED` at version 1.
pub async fn insert_run(pool: &PgPool, run: &NewRun) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, tenant_id, job_type, status, money_state, version,
                          reservation_max_cost, minimum_fee, created_at)
        VALUES ($1, $2, $3, 'QUEUED', 'RESERVED', 1, $4, $5, NOW())
        "#,
    )
    .bind(&run.run_id)
    .bind(&run.tenant_id)
    .bind(&run.job_type)
    .bind(run.reservation_max_cost)
    .bind(run.minimum_fee)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a run by ID.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<RunRecord>> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE run_id = $1",
        RUN_COLUMNS
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(RunRecord::try_from).transpose()?)
}

/// Move a queued run into processing and take its lease.
pub async fn start_processing(
    pool: &PgPool,
    run_id: &str,
    expected_version: i64,
    lease_token: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'PROCESSING',
            lease_token = $3,
            lease_expires_at = $4,
            started_at = COALESCE(started_at, NOW()),
            version = version + 1
        WHERE run_id = $1 AND version = $2 AND status = 'QUEUED'
        "#,
    )
    .bind(run_id)
    .bind(expected_version)
    .bind(lease_token)
    .bind(lease_expires_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Extend a held lease. Leaves `version` untouched.
pub async fn renew_lease(
    pool: &PgPool,
    run_id: &str,
    lease_token: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET lease_expires_at = $3
        WHERE run_id = $1
          AND lease_token = $2
          AND status = 'PROCESSING'
          AND finalize_stage IS NULL
        "#,
    )
    .bind(run_id)
    .bind(lease_token)
    .bind(lease_expires_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Claim finalize rights. `lease_token` is `None` for [`ClaimCondition::AnyLease`].
pub async fn try_claim(
    pool: &PgPool,
    run_id: &str,
    expected_version: i64,
    condition: &ClaimCondition,
    update: &ClaimUpdate,
) -> Result<bool> {
    let lease_token = match condition {
        ClaimCondition::LeaseMatch(token) => Some(token.as_str()),
        ClaimCondition::AnyLease => None,
    };

    let result = sqlx::query(
        r#"
        UPDATE runs
        SET finalize_stage = 'CLAIMED',
            finalize_token = $3,
            finalize_claimed_at = $4,
            finalize_intent = $5,
            intended_charge = $6,
            result_key = $7,
            error_code = $8,
            version = version + 1
        WHERE run_id = $1
          AND version = $2
          AND status = 'PROCESSING'
          AND money_state = 'RESERVED'
          AND finalize_stage IS NULL
          AND ($9::text IS NULL OR lease_token = $9)
        "#,
    )
    .bind(run_id)
    .bind(expected_version)
    .bind(&update.token)
    .bind(update.claimed_at)
    .bind(update.intent.status.as_str())
    .bind(update.intent.charge)
    .bind(update.intent.result_key.as_deref())
    .bind(update.intent.error_code.as_deref())
    .bind(lease_token)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Commit the terminal state for the holder of `finalize_token`.
pub async fn try_commit(
    pool: &PgPool,
    run_id: &str,
    claimed_version: i64,
    finalize_token: &str,
    update: &CommitUpdate,
) -> Result<bool> {
    let (bucket, key, sha256) = match &update.result {
        Some(r) => (
            Some(r.bucket.as_str()),
            Some(r.key.as_str()),
            Some(r.sha256.as_str()),
        ),
        None => (None, None, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $4,
            money_state = 'SETTLED',
            finalize_stage = 'COMMITTED',
            actual_cost = $5,
            result_bucket = COALESCE($6, result_bucket),
            result_key = COALESCE($7, result_key),
            result_sha256 = COALESCE($8, result_sha256),
            error_code = $9,
            error_message = $10,
            finished_at = $11,
            version = version + 1
        WHERE run_id = $1
          AND version = $2
          AND finalize_token = $3
          AND finalize_stage = 'CLAIMED'
        "#,
    )
    .bind(run_id)
    .bind(claimed_version)
    .bind(finalize_token)
    .bind(update.status.as_str())
    .bind(update.actual_cost)
    .bind(bucket)
    .bind(key)
    .bind(sha256)
    .bind(update.error_code.as_deref())
    .bind(update.error_message.as_deref())
    .bind(update.finished_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Unclaimed processing runs whose lease lapsed before `now`.
pub async fn list_expired_leases(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        r#"
        SELECT {}
        FROM runs
        WHERE status = 'PROCESSING'
          AND finalize_stage IS NULL
          AND lease_expires_at < $1
        ORDER BY lease_expires_at ASC
        LIMIT $2
        "#,
        RUN_COLUMNS
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_records(rows)
}

/// Runs claimed before `claimed_before` that never committed.
pub async fn list_stuck_claims(
    pool: &PgPool,
    claimed_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        r#"
        SELECT {}
        FROM runs
        WHERE finalize_stage = 'CLAIMED'
          AND finalize_claimed_at < $1
        ORDER BY finalize_claimed_at ASC
        LIMIT $2
        "#,
        RUN_COLUMNS
    ))
    .bind(claimed_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_records(rows)
}

// ============================================================================
// RunStore Trait Implementation
// ============================================================================

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn insert_run(&self, run: &NewRun) -> Result<()> {
        insert_run(&self.pool, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        get_run(&self.pool, run_id).await
    }

    async fn start_processing(
        &self,
        run_id: &str,
        expected_version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        start_processing(
            &self.pool,
            run_id,
            expected_version,
            lease_token,
            lease_expires_at,
        )
        .await
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        renew_lease(&self.pool, run_id, lease_token, lease_expires_at).await
    }

    async fn try_claim(
        &self,
        run_id: &str,
        expected_version: i64,
        condition: &ClaimCondition,
        update: &ClaimUpdate,
    ) -> Result<bool> {
        try_claim(&self.pool, run_id, expected_version, condition, update).await
    }

    async fn try_commit(
        &self,
        run_id: &str,
        claimed_version: i64,
        finalize_token: &str,
        update: &CommitUpdate,
    ) -> Result<bool> {
        try_commit(&self.pool, run_id, claimed_version, finalize_token, update).await
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RunRecord>> {
        list_expired_leases(&self.pool, now, limit).await
    }

    async fn list_stuck_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>> {
        list_stuck_claims(&self.pool, claimed_before, limit).await
    }
}
