//! Keystore-backed outbox storage.
//!
//! Message records live under `outbox:{id}`; dispatch scheduling goes through
//! two sorted sets: `outbox:due` (score = next_attempt_at) and
//! `outbox:inflight` (score = claim time). A SETNX lease per message keeps
//! dispatch single-owner across workers.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::OutboxConfig;
use crate::keystore::{keys, Keystore};

use super::{MessageStatus, ReliableMessage};

/// Upper bound on one recovery scan.
const RECOVERY_SCAN_LIMIT: usize = 10_000;

/// Error accounting surfaced to the metrics aggregator.
#[derive(Debug, Clone, Default)]
pub struct OutboxStats {
    pub total_errors: u64,
    pub permanent_failures: u64,
    pub retry_errors: u64,
    pub error_by_type: HashMap<String, u64>,
}

pub struct OutboxStore {
    keystore: Arc<dyn Keystore>,
    config: OutboxConfig,
    stats: Mutex<OutboxStats>,
}

impl OutboxStore {
    pub fn new(keystore: Arc<dyn Keystore>, config: OutboxConfig) -> Self {
        Self {
            keystore,
            config,
            stats: Mutex::new(OutboxStats::default()),
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Persist a message and index it for dispatch. Returns false when a
    /// message with this id already exists (idempotent enqueue).
    pub async fn enqueue(&self, message: &ReliableMessage) -> Result<bool> {
        let key = keys::outbox(&message.id);
        let json = serde_json::to_string(message).context("serialize outbox message")?;
        if !self
            .keystore
            .set_nx_ex(&key, &json, self.config.message_ttl)
            .await?
        {
            return Ok(false);
        }
        self.keystore
            .zadd(keys::OUTBOX_DUE, &message.id, message.next_attempt_at as f64)
            .await?;
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ReliableMessage>> {
        let Some(raw) = self.keystore.get(&keys::outbox(id)).await? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_str(&raw).context("parse outbox message")?,
        ))
    }

    async fn save(&self, message: &ReliableMessage) -> Result<()> {
        let json = serde_json::to_string(message).context("serialize outbox message")?;
        self.keystore
            .set_ex(&keys::outbox(&message.id), &json, self.config.message_ttl)
            .await
    }

    /// Ids due for dispatch at `now_millis`, oldest first.
    pub async fn due_ids(&self, now_millis: i64, limit: usize) -> Result<Vec<String>> {
        self.keystore
            .zrange_by_score(keys::OUTBOX_DUE, now_millis as f64, limit)
            .await
    }

    /// Take exclusive ownership of a due message and mark it in flight.
    /// Returns None when another worker holds the lease or the record is gone.
    pub async fn claim(&self, id: &str, now_millis: i64) -> Result<Option<ReliableMessage>> {
        let lease = keys::outbox_claim(id);
        if !self
            .keystore
            .set_nx_ex(&lease, "1", self.config.in_flight_timeout)
            .await?
        {
            return Ok(None);
        }

        let Some(mut message) = self.get(id).await? else {
            // Record expired out from under its index entry.
            self.keystore.zrem(keys::OUTBOX_DUE, id).await?;
            self.keystore.del(&lease).await?;
            return Ok(None);
        };
        if message.status.is_terminal() {
            self.keystore.zrem(keys::OUTBOX_DUE, id).await?;
            self.keystore.del(&lease).await?;
            return Ok(None);
        }

        message.status = MessageStatus::InFlight;
        message.updated_at = now_millis;
        self.save(&message).await?;
        self.keystore.zrem(keys::OUTBOX_DUE, id).await?;
        self.keystore
            .zadd(keys::OUTBOX_IN_FLIGHT, id, now_millis as f64)
            .await?;
        Ok(Some(message))
    }

    /// Terminal success. Duplicate acks are no-ops.
    pub async fn ack(&self, id: &str) -> Result<()> {
        self.keystore.zrem(keys::OUTBOX_IN_FLIGHT, id).await?;
        self.keystore.zrem(keys::OUTBOX_DUE, id).await?;
        self.keystore.del(&keys::outbox_claim(id)).await?;

        let Some(mut message) = self.get(id).await? else {
            return Ok(());
        };
        if message.status == MessageStatus::Ack {
            return Ok(());
        }
        message.status = MessageStatus::Ack;
        message.updated_at = Utc::now().timestamp_millis();
        self.save(&message).await
    }

    /// Failed dispatch: schedule a retry with exponential backoff, or move to
    /// the dead letter list when the attempt budget is spent or the failure
    /// is permanent.
    pub async fn fail(&self, id: &str, error: &str, permanent: bool) -> Result<()> {
        self.keystore.zrem(keys::OUTBOX_IN_FLIGHT, id).await?;
        self.keystore.del(&keys::outbox_claim(id)).await?;

        let Some(mut message) = self.get(id).await? else {
            return Ok(());
        };
        if message.status.is_terminal() {
            return Ok(());
        }

        message.attempts += 1;
        message.last_error = Some(error.to_string());
        message.updated_at = Utc::now().timestamp_millis();

        {
            let mut stats = self.stats.lock();
            stats.total_errors += 1;
            *stats
                .error_by_type
                .entry(classify_label(error, permanent).to_string())
                .or_insert(0) += 1;
            if permanent {
                stats.permanent_failures += 1;
            } else {
                stats.retry_errors += 1;
            }
        }

        if permanent || message.attempts >= self.config.max_retries {
            message.status = MessageStatus::Dead;
            self.save(&message).await?;
            let json = serde_json::to_string(&message)?;
            self.keystore.rpush(keys::OUTBOX_DEAD, &json).await?;
            self.keystore
                .expire(keys::OUTBOX_DEAD, self.config.dead_letter_ttl)
                .await?;
            warn!(
                message = id,
                attempts = message.attempts,
                error, "outbox message dead-lettered"
            );
            return Ok(());
        }

        message.status = MessageStatus::RetryPending;
        message.next_attempt_at =
            message.updated_at + self.backoff_delay(message.attempts).as_millis() as i64;
        self.save(&message).await?;
        self.keystore
            .zadd(keys::OUTBOX_DUE, id, message.next_attempt_at as f64)
            .await?;
        Ok(())
    }

    /// delay = base * backoff^attempts, with +/- jitter.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.config.retry_base.as_millis() as f64;
        let exp = base * self.config.backoff.powi(attempts.saturating_sub(1) as i32);
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
        Duration::from_millis((exp * jitter).max(1.0) as u64)
    }

    /// Reset in-flight messages whose lease is stale (crashed worker) back to
    /// retry_pending. Called on worker startup and periodically.
    pub async fn recover_in_flight(&self, now_millis: i64) -> Result<u64> {
        let stale_before = now_millis - self.config.in_flight_timeout.as_millis() as i64;
        let stale = self
            .keystore
            .zrange_by_score(keys::OUTBOX_IN_FLIGHT, stale_before as f64, RECOVERY_SCAN_LIMIT)
            .await?;
        let mut recovered = 0;
        for id in stale {
            self.keystore.zrem(keys::OUTBOX_IN_FLIGHT, &id).await?;
            self.keystore.del(&keys::outbox_claim(&id)).await?;
            let Some(mut message) = self.get(&id).await? else {
                continue;
            };
            if message.status != MessageStatus::InFlight {
                continue;
            }
            message.status = MessageStatus::RetryPending;
            message.next_attempt_at = now_millis;
            message.updated_at = now_millis;
            self.save(&message).await?;
            self.keystore
                .zadd(keys::OUTBOX_DUE, &id, now_millis as f64)
                .await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "reset stale in-flight outbox messages");
        }
        Ok(recovered)
    }

    /// Messages awaiting dispatch or in flight.
    pub async fn outstanding(&self) -> Result<u64> {
        let due = self.keystore.zcard(keys::OUTBOX_DUE).await?;
        let in_flight = self.keystore.zcard(keys::OUTBOX_IN_FLIGHT).await?;
        Ok(due + in_flight)
    }

    pub async fn dead_count(&self) -> Result<u64> {
        let dead = self.keystore.lrange(keys::OUTBOX_DEAD, 0, -1).await?;
        Ok(dead.len() as u64)
    }

    pub fn stats(&self) -> OutboxStats {
        self.stats.lock().clone()
    }
}

fn classify_label(error: &str, permanent: bool) -> &'static str {
    if permanent {
        "permanent"
    } else if error.contains("timeout") || error.contains("timed out") {
        "timeout"
    } else {
        "transient"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;
    use crate::models::CommitRecord;

    fn store() -> (OutboxStore, Arc<MemoryKeystore>) {
        let keystore = Arc::new(MemoryKeystore::new());
        let config = OutboxConfig {
            retry_base: Duration::from_millis(100),
            jitter: 0.0,
            max_retries: 3,
            ..OutboxConfig::default()
        };
        (OutboxStore::new(keystore.clone(), config), keystore)
    }

    fn order_message(id: &str) -> ReliableMessage {
        ReliableMessage::order(&CommitRecord {
            commit_token: id.to_string(),
            activity_id: "act1".into(),
            user_id: "u1".into(),
            qty: 1,
            ts: 1,
            price_snapshot: 2.0,
        })
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_id() {
        let (store, _) = store();
        assert!(store.enqueue(&order_message("m1")).await.unwrap());
        assert!(!store.enqueue(&order_message("m1")).await.unwrap());
        assert_eq!(store.outstanding().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_moves_to_in_flight_and_is_exclusive() {
        let (store, _) = store();
        store.enqueue(&order_message("m1")).await.unwrap();

        let due = store.due_ids(now(), 10).await.unwrap();
        assert_eq!(due, vec!["m1"]);

        let claimed = store.claim("m1", now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, MessageStatus::InFlight);
        // Second claim while the lease is live yields nothing.
        assert!(store.claim("m1", now()).await.unwrap().is_none());
        assert!(store.due_ids(now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_terminal_and_idempotent() {
        let (store, _) = store();
        store.enqueue(&order_message("m1")).await.unwrap();
        store.claim("m1", now()).await.unwrap().unwrap();

        store.ack("m1").await.unwrap();
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Ack);
        assert_eq!(store.outstanding().await.unwrap(), 0);

        // Duplicate ack and late fail are no-ops.
        store.ack("m1").await.unwrap();
        store.fail("m1", "late nack", false).await.unwrap();
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Ack);
    }

    #[tokio::test]
    async fn test_fail_schedules_backoff_then_dead_letters() {
        let (store, _) = store();
        store.enqueue(&order_message("m1")).await.unwrap();

        store.claim("m1", now()).await.unwrap().unwrap();
        store.fail("m1", "broker down", false).await.unwrap();
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::RetryPending);
        assert_eq!(message.attempts, 1);
        assert!(message.next_attempt_at > now() - 10);
        // Not due yet at the current time minus backoff.
        assert!(store.due_ids(message.next_attempt_at + 1, 10).await.unwrap().len() == 1);

        // Exhaust the budget.
        for _ in 0..2 {
            store
                .claim("m1", message.next_attempt_at + 1)
                .await
                .unwrap()
                .unwrap();
            store.fail("m1", "broker down", false).await.unwrap();
        }
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Dead);
        assert_eq!(store.dead_count().await.unwrap(), 1);
        assert_eq!(store.outstanding().await.unwrap(), 0);

        let stats = store.stats();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.retry_errors, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_straight_to_dead() {
        let (store, _) = store();
        store.enqueue(&order_message("m1")).await.unwrap();
        store.claim("m1", now()).await.unwrap().unwrap();

        store.fail("m1", "malformed payload", true).await.unwrap();
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Dead);
        assert_eq!(store.stats().permanent_failures, 1);
    }

    #[tokio::test]
    async fn test_recover_stale_in_flight() {
        let keystore = Arc::new(MemoryKeystore::new());
        let config = OutboxConfig {
            in_flight_timeout: Duration::from_secs(30),
            ..OutboxConfig::default()
        };
        let store = OutboxStore::new(keystore.clone(), config);

        store.enqueue(&order_message("m1")).await.unwrap();
        let t0 = now();
        store.claim("m1", t0).await.unwrap().unwrap();

        // Not stale yet.
        assert_eq!(store.recover_in_flight(t0 + 1_000).await.unwrap(), 0);
        // Past the in-flight timeout: reset to retry_pending and due now.
        let later = t0 + 31_000;
        assert_eq!(store.recover_in_flight(later).await.unwrap(), 1);
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::RetryPending);
        assert_eq!(store.due_ids(later, 10).await.unwrap(), vec!["m1"]);
    }
}
