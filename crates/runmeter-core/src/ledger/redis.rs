// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed ledger.
//!
//! Each mutation is one Lua script executed server-side, so the check and the
//! write can never interleave with another client's. All keys of one tenant
//! share the `{tenant}` hash tag and land in the same cluster slot.
//!
//! Key layout:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `<prefix>:{<tenant>}:balance` | string | available balance |
//! | `<prefix>:{<tenant>}:settled` | string | running sum of charges |
//! | `<prefix>:{<tenant>}:reservation:<run>` | hash | `amount`, `created_at` |
//! | `<prefix>:{<tenant>}:receipt:<run>` | hash | `charged`, `reserved`, `refund`, `created_at` |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::{
    BudgetLedger, Micros, Reservation, ReserveOutcome, ReserveStatus, SettleOutcome,
    SettleStatus, SettlementReceipt, ensure_non_negative, ensure_positive,
};
use crate::error::{Error, Result};

// KEYS: balance, reservation, receipt
// ARGV: amount, now_ms
// Reply: {status, balance}; status 0 = insufficient, 1 = reserved,
// 2 = already reserved, 3 = already settled
const RESERVE_SCRIPT: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if balance < amount then
  return {0, balance}
end
if redis.call('EXISTS', KEYS[2]) == 1 then
  return {2, balance}
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {3, balance}
end
local new_balance = redis.call('DECRBY', KEYS[1], amount)
redis.call('HSET', KEYS[2], 'amount', amount, 'created_at', ARGV[2])
return {1, new_balance}
"#;

// KEYS: balance, reservation, receipt, settled
// ARGV: charge, now_ms, receipt_ttl_secs
// Reply: {status, charged, refund, balance}; status 0 = no reservation,
// 1 = settled, 2 = already settled
const SETTLE_SCRIPT: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
if redis.call('EXISTS', KEYS[3]) == 1 then
  local r = redis.call('HMGET', KEYS[3], 'charged', 'refund')
  return {2, tonumber(r[1]), tonumber(r[2]), balance}
end
local reserved = redis.call('HGET', KEYS[2], 'amount')
if not reserved then
  return {0, 0, 0, balance}
end
reserved = tonumber(reserved)
local charge = tonumber(ARGV[1])
if charge > reserved then
  charge = reserved
end
local refund = reserved - charge
local new_balance = redis.call('INCRBY', KEYS[1], refund)
redis.call('INCRBY', KEYS[4], charge)
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[3], 'charged', charge, 'reserved', reserved, 'refund', refund, 'created_at', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[3], ttl)
end
return {1, charge, refund, new_balance}
"#;

/// Key builder for one ledger namespace.
#[derive(Debug, Clone)]
pub struct LedgerKeys {
    prefix: String,
}

impl LedgerKeys {
    /// Create a key builder for `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Tenant balance key.
    pub fn balance(&self, tenant_id: &str) -> String {
        format!("{}:{{{}}}:balance", self.prefix, tenant_id)
    }

    /// Tenant settled-total key.
    pub fn settled(&self, tenant_id: &str) -> String {
        format!("{}:{{{}}}:settled", self.prefix, tenant_id)
    }

    /// Per-run reservation key.
    pub fn reservation(&self, tenant_id: &str, run_id: &str) -> String {
        format!("{}:{{{}}}:reservation:{}", self.prefix, tenant_id, run_id)
    }

    /// Per-run receipt key.
    pub fn receipt(&self, tenant_id: &str, run_id: &str) -> String {
        format!("{}:{{{}}}:receipt:{}", self.prefix, tenant_id, run_id)
    }
}

/// Ledger backed by a shared Redis connection.
///
/// The connection manager is cheap to clone and reconnects on its own, so one
/// `RedisLedger` can be shared by every loop in the process.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    keys: LedgerKeys,
    receipt_ttl: Duration,
    reserve_script: Script,
    settle_script: Script,
}

impl RedisLedger {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, receipt_ttl: Duration) -> Self {
        Self {
            conn,
            keys: LedgerKeys::new(prefix),
            receipt_ttl,
            reserve_script: Script::new(RESERVE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        }
    }

    /// Connect to `redis_url` and build a ledger.
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        receipt_ttl: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix, receipt_ttl))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::LedgerReply(format!("invalid timestamp {}", ms)))
}

fn expect_len(reply: &[i64], len: usize, script: &str) -> Result<()> {
    if reply.len() != len {
        return Err(Error::LedgerReply(format!(
            "{} script returned {} values, expected {}",
            script,
            reply.len(),
            len
        )));
    }
    Ok(())
}

fn field(map: &HashMap<String, i64>, name: &str) -> Result<i64> {
    map.get(name)
        .copied()
        .ok_or_else(|| Error::LedgerReply(format!("missing field '{}'", name)))
}

#[async_trait]
impl BudgetLedger for RedisLedger {
    async fn credit(&self, tenant_id: &str, amount: Micros) -> Result<Micros> {
        ensure_positive("amount", amount)?;
        let mut conn = self.conn.clone();
        let balance: i64 = conn.incr(self.keys.balance(tenant_id), amount).await?;
        Ok(balance)
    }

    async fn reserve(
        &self,
        tenant_id: &str,
        run_id: &str,
        amount: Micros,
    ) -> Result<ReserveOutcome> {
        ensure_positive("amount", amount)?;
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .reserve_script
            .key(self.keys.balance(tenant_id))
            .key(self.keys.reservation(tenant_id, run_id))
            .key(self.keys.receipt(tenant_id, run_id))
            .arg(amount)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        expect_len(&reply, 2, "reserve")?;

        let status = match reply[0] {
            0 => ReserveStatus::InsufficientFunds,
            1 => ReserveStatus::Reserved,
            2 => ReserveStatus::AlreadyReserved,
            3 => ReserveStatus::AlreadySettled,
            other => {
                return Err(Error::LedgerReply(format!(
                    "unknown reserve status {}",
                    other
                )));
            }
        };

        debug!(
            tenant_id = %tenant_id,
            run_id = %run_id,
            amount = amount,
            status = ?status,
            balance = reply[1],
            "Ledger reserve"
        );

        Ok(ReserveOutcome {
            status,
            balance: reply[1],
        })
    }

    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        charge_amount: Micros,
    ) -> Result<SettleOutcome> {
        ensure_non_negative("charge_amount", charge_amount)?;
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .settle_script
            .key(self.keys.balance(tenant_id))
            .key(self.keys.reservation(tenant_id, run_id))
            .key(self.keys.receipt(tenant_id, run_id))
            .key(self.keys.settled(tenant_id))
            .arg(charge_amount)
            .arg(now_ms())
            .arg(self.receipt_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        expect_len(&reply, 4, "settle")?;

        let status = match reply[0] {
            0 => SettleStatus::NoReservation,
            1 => SettleStatus::Settled,
            2 => SettleStatus::AlreadySettled,
            other => {
                return Err(Error::LedgerReply(format!(
                    "unknown settle status {}",
                    other
                )));
            }
        };

        debug!(
            tenant_id = %tenant_id,
            run_id = %run_id,
            requested = charge_amount,
            status = ?status,
            charged = reply[1],
            refund = reply[2],
            "Ledger settle"
        );

        Ok(SettleOutcome {
            status,
            charged: reply[1],
            refund: reply[2],
            balance: reply[3],
        })
    }

    async fn get_balance(&self, tenant_id: &str) -> Result<Micros> {
        let mut conn = self.conn.clone();
        let balance: Option<i64> = conn.get(self.keys.balance(tenant_id)).await?;
        Ok(balance.unwrap_or(0))
    }

    async fn get_reservation(&self, tenant_id: &str, run_id: &str) -> Result<Option<Reservation>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, i64> = conn
            .hgetall(self.keys.reservation(tenant_id, run_id))
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Reservation {
            amount: field(&map, "amount")?,
            created_at: timestamp(field(&map, "created_at")?)?,
        }))
    }

    async fn get_receipt(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<SettlementReceipt>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, i64> = conn.hgetall(self.keys.receipt(tenant_id, run_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(SettlementReceipt {
            charged_amount: field(&map, "charged")?,
            reserved_amount: field(&map, "reserved")?,
            refund_amount: field(&map, "refund")?,
            created_at: timestamp(field(&map, "created_at")?)?,
        }))
    }

    async fn get_settled_total(&self, tenant_id: &str) -> Result<Micros> {
        let mut conn = self.conn.clone();
        let total: Option<i64> = conn.get(self.keys.settled(tenant_id)).await?;
        Ok(total.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_tenant_hash_tag() {
        let keys = LedgerKeys::new("runmeter");
        assert_eq!(keys.balance("acme"), "runmeter:{acme}:balance");
        assert_eq!(keys.settled("acme"), "runmeter:{acme}:settled");
        assert_eq!(
            keys.reservation("acme", "run-1"),
            "runmeter:{acme}:reservation:run-1"
        );
        assert_eq!(keys.receipt("acme", "run-1"), "runmeter:{acme}:receipt:run-1");
    }

    #[test]
    fn test_expect_len() {
        assert!(expect_len(&[1, 2], 2, "reserve").is_ok());
        let err = expect_len(&[1], 2, "reserve").unwrap_err();
        assert!(err.to_string().contains("reserve script returned 1 values"));
    }

    #[test]
    fn test_missing_receipt_field() {
        let map = HashMap::from([("charged".to_string(), 5_i64)]);
        assert_eq!(field(&map, "charged").unwrap(), 5);
        assert!(field(&map, "refund").is_err());
    }
}
