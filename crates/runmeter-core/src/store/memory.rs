// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process run store.
//!
//! Mirrors the Postgres conditional updates under a single mutex so protocol
//! tests can run without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ClaimCondition, ClaimUpdate, CommitUpdate, FinalizeStage, MoneyState, NewRun, RunRecord,
    RunStatus, RunStore,
};
use crate::error::{Error, Result};

/// Run store backed by process memory.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record verbatim, bypassing every guard.
    pub fn put_run(&self, record: RunRecord) {
        self.lock().insert(record.run_id.clone(), record);
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no runs are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunRecord>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A fresh `QUEUED` / `RESERVED` record for `run`.
pub fn queued_record(run: &NewRun, created_at: DateTime<Utc>) -> RunRecord {
    RunRecord {
        run_id: run.run_id.clone(),
        tenant_id: run.tenant_id.clone(),
        job_type: run.job_type.clone(),
        status: RunStatus::Queued,
        money_state: MoneyState::Reserved,
        version: 1,
        reservation_max_cost: run.reservation_max_cost,
        actual_cost: None,
        minimum_fee: run.minimum_fee,
        lease_token: None,
        lease_expires_at: None,
        finalize_token: None,
        finalize_stage: None,
        finalize_claimed_at: None,
        finalize_intent: None,
        intended_charge: None,
        result_bucket: None,
        result_key: None,
        result_sha256: None,
        error_code: None,
        error_message: None,
        created_at,
        started_at: None,
        finished_at: None,
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &NewRun) -> Result<()> {
        let mut runs = self.lock();
        if runs.contains_key(&run.run_id) {
            return Err(Error::validation(
                "run_id",
                format!("run '{}' already exists", run.run_id),
            ));
        }
        runs.insert(run.run_id.clone(), queued_record(run, Utc::now()));
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.lock().get(run_id).cloned())
    }

    async fn start_processing(
        &self,
        run_id: &str,
        expected_version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut runs = self.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != expected_version || run.status != RunStatus::Queued {
            return Ok(false);
        }

        run.status = RunStatus::Processing;
        run.lease_token = Some(lease_token.to_string());
        run.lease_expires_at = Some(lease_expires_at);
        run.started_at.get_or_insert_with(Utc::now);
        run.version += 1;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut runs = self.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Processing
            || run.finalize_stage.is_some()
            || run.lease_token.as_deref() != Some(lease_token)
        {
            return Ok(false);
        }

        run.lease_expires_at = Some(lease_expires_at);
        Ok(true)
    }

    async fn try_claim(
        &self,
        run_id: &str,
        expected_version: i64,
        condition: &ClaimCondition,
        update: &ClaimUpdate,
    ) -> Result<bool> {
        let mut runs = self.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };

        let lease_ok = match condition {
            ClaimCondition::LeaseMatch(token) => run.lease_token.as_deref() == Some(token),
            ClaimCondition::AnyLease => true,
        };
        if run.version != expected_version
            || run.status != RunStatus::Processing
            || run.money_state != MoneyState::Reserved
            || run.finalize_stage.is_some()
            || !lease_ok
        {
            return Ok(false);
        }

        run.finalize_stage = Some(FinalizeStage::Claimed);
        run.finalize_token = Some(update.token.clone());
        run.finalize_claimed_at = Some(update.claimed_at);
        run.finalize_intent = Some(update.intent.status);
        run.intended_charge = Some(update.intent.charge);
        run.result_key = update.intent.result_key.clone();
        run.error_code = update.intent.error_code.clone();
        run.version += 1;
        Ok(true)
    }

    async fn try_commit(
        &self,
        run_id: &str,
        claimed_version: i64,
        finalize_token: &str,
        update: &CommitUpdate,
    ) -> Result<bool> {
        let mut runs = self.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != claimed_version
            || run.finalize_token.as_deref() != Some(finalize_token)
            || run.finalize_stage != Some(FinalizeStage::Claimed)
        {
            return Ok(false);
        }

        run.status = update.status;
        run.money_state = MoneyState::Settled;
        run.finalize_stage = Some(FinalizeStage::Committed);
        run.actual_cost = Some(update.actual_cost);
        if let Some(result) = &update.result {
            run.result_bucket = Some(result.bucket.clone());
            run.result_key = Some(result.key.clone());
            run.result_sha256 = Some(result.sha256.clone());
        }
        run.error_code = update.error_code.clone();
        run.error_message = update.error_message.clone();
        run.finished_at = Some(update.finished_at);
        run.version += 1;
        Ok(true)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RunRecord>> {
        let runs = self.lock();
        let mut expired: Vec<RunRecord> = runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Processing
                    && r.finalize_stage.is_none()
                    && r.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.lease_expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired)
    }

    async fn list_stuck_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunRecord>> {
        let runs = self.lock();
        let mut stuck: Vec<RunRecord> = runs
            .values()
            .filter(|r| {
                r.finalize_stage == Some(FinalizeStage::Claimed)
                    && r.finalize_claimed_at.is_some_and(|at| at < claimed_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.finalize_claimed_at);
        stuck.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FinalizeIntent;
    use chrono::Duration;

    fn new_run(run_id: &str) -> NewRun {
        NewRun {
            run_id: run_id.to_string(),
            tenant_id: "t1".to_string(),
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
    async fn test_insert_rejects_duplicates() {
        let store = InMemoryRunStore::new();
        store.insert_run(&new_run("run-1")).await.unwrap();
        assert!(store.insert_run(&new_run("run-1")).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_start_processing_is_version_guarded() {
        let store = InMemoryRunStore::new();
        store.insert_run(&new_run("run-1")).await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);

        assert!(!store.start_processing("run-1", 7, "lease-a", expires).await.unwrap());
        assert!(store.start_processing("run-1", 1, "lease-a", expires).await.unwrap());
        assert!(!store.start_processing("run-1", 2, "lease-b", expires).await.unwrap());

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Processing);
        assert_eq!(run.version, 2);
        assert_eq!(run.lease_token.as_deref(), Some("lease-a"));
    }

    #[tokio::test]
    async fn test_renew_lease_requires_holder_and_keeps_version() {
        let store = InMemoryRunStore::new();
        store.insert_run(&new_run("run-1")).await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);
        store.start_processing("run-1", 1, "lease-a", expires).await.unwrap();

        let later = expires + Duration::minutes(5);
        assert!(!store.renew_lease("run-1", "lease-b", later).await.unwrap());
        assert!(store.renew_lease("run-1", "lease-a", later).await.unwrap());

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.lease_expires_at, Some(later));
        assert_eq!(run.version, 2);
    }

    #[tokio::test]
    async fn test_claim_records_intent_and_blocks_second_claim() {
        let store = InMemoryRunStore::new();
        store.insert_run(&new_run("run-1")).await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);
        store.start_processing("run-1", 1, "lease-a", expires).await.unwrap();

        assert!(
            store
                .try_claim("run-1", 2, &ClaimCondition::AnyLease, &claim_update("f-1"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_claim("run-1", 3, &ClaimCondition::AnyLease, &claim_update("f-2"))
                .await
                .unwrap()
        );

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.finalize_stage, Some(FinalizeStage::Claimed));
        assert_eq!(run.finalize_token.as_deref(), Some("f-1"));
        assert_eq!(run.finalize_intent, Some(RunStatus::Failed));
        assert_eq!(run.intended_charge, Some(10));
        assert_eq!(run.version, 3);
    }

    #[tokio::test]
    async fn test_lease_match_condition() {
        let store = InMemoryRunStore::new();
        store.insert_run(&new_run("run-1")).await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);
        store.start_processing("run-1", 1, "lease-a", expires).await.unwrap();

        let wrong = ClaimCondition::LeaseMatch("lease-b".to_string());
        assert!(!store.try_claim("run-1", 2, &wrong, &claim_update("f-1")).await.unwrap());
        let right = ClaimCondition::LeaseMatch("lease-a".to_string());
        assert!(store.try_claim("run-1", 2, &right, &claim_update("f-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_scans() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        for (i, minutes_ago) in [30_i64, 10, 20].iter().enumerate() {
            let run_id = format!("run-{}", i);
            store.insert_run(&new_run(&run_id)).await.unwrap();
            store
                .start_processing(&run_id, 1, "lease", now - Duration::minutes(*minutes_ago))
                .await
                .unwrap();
        }
        store.insert_run(&new_run("live")).await.unwrap();
        store
            .start_processing("live", 1, "lease", now + Duration::minutes(5))
            .await
            .unwrap();

        let expired = store.list_expired_leases(now, 2).await.unwrap();
        let ids: Vec<_> = expired.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-0", "run-2"]);

        assert!(store.list_stuck_claims(now, 10).await.unwrap().is_empty());
        store
            .try_claim("run-1", 2, &ClaimCondition::AnyLease, &claim_update("f"))
            .await
            .unwrap();
        let stuck = store
            .list_stuck_claims(now + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].run_id, "run-1");
    }
}
