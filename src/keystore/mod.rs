//! Coordination Keystore
//!
//! Typed wrapper over the Redis-compatible coordination store. All stock,
//! quota, outbox, and cache keys live here; the atomic commit path executes
//! as registered server-side scripts.

mod memory;
mod redis_store;
pub mod scripts;

pub use memory::MemoryKeystore;
pub use redis_store::RedisKeystore;
pub use scripts::{ScriptId, ScriptRegistry};

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Operations the engine needs from the coordination store.
///
/// Implementations must be safe to share across tasks; every call may suspend.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// SET NX EX; returns true when the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Remaining TTL; None when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Members with score <= max, ascending, at most `limit`.
    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Run a registered script as one unit of isolation. Both registered
    /// scripts reply with an integer array.
    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<Vec<i64>>;
}

/// Key layout. All keys use `:` as separator; integer values are base-10
/// ASCII so scripts and plain commands interoperate.
pub mod keys {
    pub fn activity(id: &str) -> String {
        format!("activity:{}", id)
    }

    pub fn status(id: &str) -> String {
        format!("status:{}", id)
    }

    pub fn stock(id: &str) -> String {
        format!("stock:{}", id)
    }

    /// Monotonic version counter for the stock record.
    pub fn stock_version(id: &str) -> String {
        format!("stockver:{}", id)
    }

    pub fn user_limit(user_id: &str, activity_id: &str) -> String {
        format!("userlimit:{}:{}", user_id, activity_id)
    }

    pub fn daily(user_id: &str, day: &str) -> String {
        format!("daily:{}:{}", user_id, day)
    }

    pub fn global_quota(user_id: &str) -> String {
        format!("global:{}", user_id)
    }

    pub fn status_history(id: &str) -> String {
        format!("statusHistory:{}", id)
    }

    pub fn outbox(id: &str) -> String {
        format!("outbox:{}", id)
    }

    pub const OUTBOX_DUE: &str = "outbox:due";
    pub const OUTBOX_IN_FLIGHT: &str = "outbox:inflight";
    pub const OUTBOX_DEAD: &str = "outbox:dead";

    pub fn outbox_claim(id: &str) -> String {
        format!("outboxclaim:{}", id)
    }

    pub fn dedup(user_id: &str, activity_id: &str, nonce: &str) -> String {
        format!("dedup:{}:{}:{}", user_id, activity_id, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::activity("a1"), "activity:a1");
        assert_eq!(keys::user_limit("u1", "a1"), "userlimit:u1:a1");
        assert_eq!(keys::daily("u1", "2026-08-01"), "daily:u1:2026-08-01");
        assert_eq!(keys::dedup("u1", "a1", "n1"), "dedup:u1:a1:n1");
    }
}
