//! Atomic Commit Engine
//!
//! The only component that mutates stock and per-user counters on the hot
//! path. All four preconditions are re-checked and the decrement/increment
//! pair applied inside one registered script.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::keystore::{keys, Keystore, ScriptId};
use crate::keystore::scripts::{
    CODE_ACTIVITY_NOT_ACTIVE, CODE_INSUFFICIENT_STOCK, CODE_INVALID_PARAMS, CODE_OK,
    CODE_USER_LIMIT_EXCEEDED,
};

/// Outcome codes of the atomic commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitCode {
    Ok,
    ActivityNotActive,
    InsufficientStock,
    UserLimitExceeded,
    InvalidParams,
    /// Keystore failure: commit state unknown. Callers must consult the
    /// idempotency layer or the synchronizer before acting.
    InternalError,
}

impl CommitCode {
    fn from_reply(code: i64) -> Self {
        match code {
            CODE_OK => CommitCode::Ok,
            CODE_ACTIVITY_NOT_ACTIVE => CommitCode::ActivityNotActive,
            CODE_INSUFFICIENT_STOCK => CommitCode::InsufficientStock,
            CODE_USER_LIMIT_EXCEEDED => CommitCode::UserLimitExceeded,
            CODE_INVALID_PARAMS => CommitCode::InvalidParams,
            _ => CommitCode::InternalError,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    pub code: CommitCode,
    pub remaining_stock: i64,
    pub user_purchased: i64,
    pub remaining_quota: i64,
}

impl CommitOutcome {
    fn internal_error() -> Self {
        Self {
            code: CommitCode::InternalError,
            remaining_stock: -1,
            user_purchased: -1,
            remaining_quota: -1,
        }
    }
}

pub struct CommitEngine {
    keystore: Arc<dyn Keystore>,
    /// Skew buffer applied before `start_time`, matching the validator's.
    start_buffer_ms: i64,
}

impl CommitEngine {
    pub fn new(keystore: Arc<dyn Keystore>, start_buffer_ms: i64) -> Self {
        Self {
            keystore,
            start_buffer_ms,
        }
    }

    /// Run the commit script. `user_key_ttl` is the per-user counter lifetime
    /// (activity end + grace).
    pub async fn commit(
        &self,
        activity_id: &str,
        user_id: &str,
        qty: i64,
        per_user_limit: i64,
        now_millis: i64,
        user_key_ttl: Duration,
    ) -> CommitOutcome {
        let commit_keys = vec![
            keys::activity(activity_id),
            keys::status(activity_id),
            keys::stock(activity_id),
            keys::user_limit(user_id, activity_id),
            keys::stock_version(activity_id),
        ];
        let args = vec![
            qty.to_string(),
            now_millis.to_string(),
            per_user_limit.to_string(),
            user_key_ttl.as_secs().max(1).to_string(),
            self.start_buffer_ms.to_string(),
        ];

        let mut reply = self.keystore.eval(ScriptId::Commit, &commit_keys, &args).await;
        if let Err(e) = &reply {
            // One retry, and only on connection refusal: refused means the
            // request provably never reached the server. A connection dropped
            // mid-exchange may have executed the non-idempotent decrement, so
            // it surfaces as internal_error (state unknown) instead.
            if is_connection_refused(e) {
                warn!(activity = activity_id, user = user_id, error = %e,
                      "commit script connection refused, retrying once");
                reply = self.keystore.eval(ScriptId::Commit, &commit_keys, &args).await;
            }
        }

        match reply {
            Ok(values) if values.len() >= 4 => CommitOutcome {
                code: CommitCode::from_reply(values[0]),
                remaining_stock: values[1],
                user_purchased: values[2],
                remaining_quota: values[3],
            },
            Ok(values) => {
                error!(activity = activity_id, ?values, "malformed commit script reply");
                CommitOutcome::internal_error()
            }
            Err(e) => {
                error!(activity = activity_id, user = user_id, error = %e,
                       "commit script failed");
                CommitOutcome::internal_error()
            }
        }
    }

    /// Reverse a commit: stock back (clamped at the activity ceiling), user
    /// counter down (clamped at zero). Returns (stock, user_purchased).
    pub async fn rollback(
        &self,
        activity_id: &str,
        user_id: &str,
        qty: i64,
    ) -> Result<(i64, i64)> {
        let rollback_keys = vec![
            keys::stock(activity_id),
            keys::user_limit(user_id, activity_id),
            keys::activity(activity_id),
            keys::stock_version(activity_id),
        ];
        let args = vec![qty.to_string()];
        let reply = self
            .keystore
            .eval(ScriptId::Rollback, &rollback_keys, &args)
            .await?;
        let stock = reply.first().copied().unwrap_or(-1);
        let purchased = reply.get(1).copied().unwrap_or(-1);
        Ok((stock, purchased))
    }
}

fn is_connection_refused(e: &anyhow::Error) -> bool {
    e.downcast_ref::<redis::RedisError>()
        .map(|re| re.is_connection_refusal())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;
    use crate::models::{Activity, ActivityStatus};
    use chrono::Utc;

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn activity(id: &str, total: i64, limit: i64) -> Activity {
        Activity {
            id: id.to_string(),
            name: "sale".into(),
            status: ActivityStatus::Active,
            start_time: now() - 1_000,
            end_time: now() + 3_600_000,
            total_stock: total,
            sold_count: 0,
            price: 1.0,
            per_user_limit: limit,
            version: 0,
            updated_at: now(),
        }
    }

    async fn seed(keystore: &MemoryKeystore, activity: &Activity) {
        keystore
            .set(
                &keys::activity(&activity.id),
                &serde_json::to_string(activity).unwrap(),
            )
            .await
            .unwrap();
        keystore
            .set(&keys::status(&activity.id), "active")
            .await
            .unwrap();
        keystore
            .set(&keys::stock(&activity.id), &activity.total_stock.to_string())
            .await
            .unwrap();
    }

    const TTL: Duration = Duration::from_secs(3600);
    const BUFFER_MS: i64 = 30_000;

    #[tokio::test]
    async fn test_commit_happy_path() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 5, 2)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        let outcome = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::Ok);
        assert_eq!(outcome.remaining_stock, 4);
        assert_eq!(outcome.user_purchased, 1);
        assert_eq!(outcome.remaining_quota, 1);
        assert_eq!(
            keystore.get("stock:a1").await.unwrap().as_deref(),
            Some("4")
        );
        assert_eq!(
            keystore.get("stockver:a1").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_commit_rechecks_status() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 5, 2)).await;
        keystore.set("status:a1", "paused").await.unwrap();
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        let outcome = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::ActivityNotActive);
        assert_eq!(
            keystore.get("stock:a1").await.unwrap().as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_commit_time_window_enforced_in_script() {
        let keystore = Arc::new(MemoryKeystore::new());
        let mut a = activity("a1", 5, 2);
        a.end_time = now() - 10;
        seed(&keystore, &a).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        let outcome = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::ActivityNotActive);
    }

    #[tokio::test]
    async fn test_user_limit_exceeded() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 100, 2)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        assert_eq!(
            engine.commit("a1", "u1", 1, 2, now(), TTL).await.code,
            CommitCode::Ok
        );
        let second = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(second.code, CommitCode::Ok);
        assert_eq!(second.remaining_quota, 0);

        let third = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(third.code, CommitCode::UserLimitExceeded);
        assert_eq!(
            keystore.get("stock:a1").await.unwrap().as_deref(),
            Some("98")
        );
    }

    #[tokio::test]
    async fn test_insufficient_stock() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 1, 5)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        assert_eq!(
            engine.commit("a1", "u1", 1, 5, now(), TTL).await.code,
            CommitCode::Ok
        );
        let outcome = engine.commit("a1", "u2", 1, 5, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::InsufficientStock);
        assert_eq!(outcome.remaining_stock, 0);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 5, 2)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);
        assert_eq!(
            engine.commit("a1", "u1", 0, 2, now(), TTL).await.code,
            CommitCode::InvalidParams
        );
        assert_eq!(
            engine.commit("a1", "u1", -3, 2, now(), TTL).await.code,
            CommitCode::InvalidParams
        );
    }

    #[tokio::test]
    async fn test_commit_then_rollback_restores_state() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 10, 5)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        let outcome = engine.commit("a1", "u1", 2, 5, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::Ok);
        assert_eq!(outcome.remaining_stock, 8);

        let (stock, purchased) = engine.rollback("a1", "u1", 2).await.unwrap();
        assert_eq!(stock, 10);
        assert_eq!(purchased, 0);
    }

    #[tokio::test]
    async fn test_rollback_clamps_at_ceiling() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("a1", 10, 5)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        // Duplicate rollback cannot push stock past total_stock.
        let (stock, purchased) = engine.rollback("a1", "u1", 4).await.unwrap();
        assert_eq!(stock, 10);
        assert_eq!(purchased, 0);
    }

    #[tokio::test]
    async fn test_concurrent_commits_never_oversell() {
        let keystore = Arc::new(MemoryKeystore::new());
        seed(&keystore, &activity("hot", 1, 1)).await;
        let engine = Arc::new(CommitEngine::new(keystore.clone(), BUFFER_MS));

        let mut handles = Vec::new();
        for k in 0..100 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .commit("hot", &format!("user{}", k), 1, 1, now(), TTL)
                    .await
                    .code
            }));
        }

        let mut ok = 0;
        let mut sold_out = 0;
        for handle in handles {
            match handle.await.unwrap() {
                CommitCode::Ok => ok += 1,
                CommitCode::InsufficientStock => sold_out += 1,
                other => panic!("unexpected code {:?}", other),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(sold_out, 99);
        assert_eq!(
            keystore.get("stock:hot").await.unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_commit_honors_start_buffer() {
        let keystore = Arc::new(MemoryKeystore::new());
        let mut a = activity("a1", 5, 2);
        let start = now() + 60_000;
        a.start_time = start;
        a.end_time = start + 3_600_000;
        seed(&keystore, &a).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        // One millisecond before the buffered window opens.
        let early = engine
            .commit("a1", "u1", 1, 2, start - BUFFER_MS - 1, TTL)
            .await;
        assert_eq!(early.code, CommitCode::ActivityNotActive);

        // At start_time - buffer the script agrees with the validator.
        let at_edge = engine
            .commit("a1", "u1", 1, 2, start - BUFFER_MS, TTL)
            .await;
        assert_eq!(at_edge.code, CommitCode::Ok);
        assert_eq!(at_edge.remaining_stock, 4);
    }

    /// Keystore wrapper that fails eval calls with injected I/O errors.
    struct FlakyKeystore {
        inner: MemoryKeystore,
        fail_evals: parking_lot::Mutex<Vec<std::io::ErrorKind>>,
        eval_calls: std::sync::atomic::AtomicU32,
    }

    impl FlakyKeystore {
        fn new() -> Self {
            Self {
                inner: MemoryKeystore::new(),
                fail_evals: parking_lot::Mutex::new(Vec::new()),
                eval_calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn fail_next(&self, kind: std::io::ErrorKind) {
            self.fail_evals.lock().push(kind);
        }

        fn eval_calls(&self) -> u32 {
            self.eval_calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Keystore for FlakyKeystore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_nx_ex(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> Result<bool> {
            self.inner.del(key).await
        }
        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            self.inner.incr_by(key, delta).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.inner.ttl(key).await
        }
        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
            self.inner.zadd(key, member, score).await
        }
        async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>> {
            self.inner.zrange_by_score(key, max, limit).await
        }
        async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.zrem(key, member).await
        }
        async fn zcard(&self, key: &str) -> Result<u64> {
            self.inner.zcard(key).await
        }
        async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
            self.inner.rpush(key, value).await
        }
        async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
            self.inner.lrange(key, start, stop).await
        }
        async fn publish(&self, channel: &str, message: &str) -> Result<()> {
            self.inner.publish(channel, message).await
        }
        async fn eval(
            &self,
            script: ScriptId,
            script_keys: &[String],
            args: &[String],
        ) -> Result<Vec<i64>> {
            self.eval_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let injected = {
                let mut pending = self.fail_evals.lock();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            if let Some(kind) = injected {
                let io_err = std::io::Error::from(kind);
                return Err(anyhow::Error::new(redis::RedisError::from(io_err)));
            }
            self.inner.eval(script, script_keys, args).await
        }
    }

    #[tokio::test]
    async fn test_refused_connection_retries_once() {
        let keystore = Arc::new(FlakyKeystore::new());
        seed(&keystore.inner, &activity("a1", 5, 2)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        // Refused means the script never reached the server: safe to retry.
        keystore.fail_next(std::io::ErrorKind::ConnectionRefused);
        let outcome = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::Ok);
        assert_eq!(outcome.remaining_stock, 4);
        assert_eq!(keystore.eval_calls(), 2);
        // Exactly one decrement happened.
        assert_eq!(
            keystore.inner.get("stock:a1").await.unwrap().as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_dropped_connection_is_never_retried() {
        let keystore = Arc::new(FlakyKeystore::new());
        seed(&keystore.inner, &activity("a1", 5, 2)).await;
        let engine = CommitEngine::new(keystore.clone(), BUFFER_MS);

        // Dropped mid-exchange: the decrement may already have run server-side,
        // so the engine must not re-run the script.
        keystore.fail_next(std::io::ErrorKind::BrokenPipe);
        let outcome = engine.commit("a1", "u1", 1, 2, now(), TTL).await;
        assert_eq!(outcome.code, CommitCode::InternalError);
        assert_eq!(keystore.eval_calls(), 1);
        assert_eq!(
            keystore.inner.get("stock:a1").await.unwrap().as_deref(),
            Some("5")
        );
    }
}
