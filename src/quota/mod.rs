//! User Quota Accounting
//!
//! Three counter scopes per user: per-activity (mutated only inside the
//! commit script), per-day (expires at next local midnight), and lifetime
//! (configurable window). Daily and lifetime ceilings are advisory
//! pre-checks; the per-activity ceiling is enforced atomically.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local};
use std::sync::Arc;
use std::time::Duration;

use crate::config::QuotaConfig;
use crate::keystore::{keys, Keystore};
use crate::models::UserStatusView;

pub struct QuotaAccountant {
    keystore: Arc<dyn Keystore>,
    config: QuotaConfig,
}

impl QuotaAccountant {
    pub fn new(keystore: Arc<dyn Keystore>, config: QuotaConfig) -> Self {
        Self { keystore, config }
    }

    /// Units this user has committed to this activity.
    pub async fn purchased(&self, user_id: &str, activity_id: &str) -> Result<i64> {
        self.read_counter(&keys::user_limit(user_id, activity_id))
            .await
    }

    pub async fn daily_purchased(&self, user_id: &str) -> Result<i64> {
        self.read_counter(&keys::daily(user_id, &today())).await
    }

    pub async fn lifetime_purchased(&self, user_id: &str) -> Result<i64> {
        self.read_counter(&keys::global_quota(user_id)).await
    }

    /// Advisory ceiling check for the day and lifetime scopes. Returns false
    /// when either ceiling would be exceeded by `qty` more units.
    pub async fn within_ceilings(&self, user_id: &str, qty: i64) -> Result<bool> {
        let daily = self.daily_purchased(user_id).await?;
        if daily + qty > self.config.daily_limit {
            return Ok(false);
        }
        let lifetime = self.lifetime_purchased(user_id).await?;
        if lifetime + qty > self.config.lifetime_limit {
            return Ok(false);
        }
        Ok(true)
    }

    /// Record a successful commit in the day and lifetime counters. The
    /// per-activity counter was already incremented inside the commit script.
    pub async fn record(&self, user_id: &str, qty: i64) -> Result<()> {
        let daily_key = keys::daily(user_id, &today());
        let after = self.keystore.incr_by(&daily_key, qty).await?;
        if after == qty {
            // First write today; expire at the next local midnight.
            self.keystore
                .expire(&daily_key, until_local_midnight())
                .await?;
        }

        let lifetime_key = keys::global_quota(user_id);
        let after = self.keystore.incr_by(&lifetime_key, qty).await?;
        if after == qty {
            self.keystore
                .expire(&lifetime_key, self.config.lifetime_ttl)
                .await?;
        }
        Ok(())
    }

    /// Reverse the day and lifetime counters after a rollback, clamped at zero.
    pub async fn unrecord(&self, user_id: &str, qty: i64) -> Result<()> {
        let daily_key = keys::daily(user_id, &today());
        let after = self.keystore.incr_by(&daily_key, -qty).await?;
        if after < 0 {
            self.keystore.set_ex(&daily_key, "0", until_local_midnight()).await?;
        }
        let lifetime_key = keys::global_quota(user_id);
        let after = self.keystore.incr_by(&lifetime_key, -qty).await?;
        if after < 0 {
            self.keystore
                .set_ex(&lifetime_key, "0", self.config.lifetime_ttl)
                .await?;
        }
        Ok(())
    }

    /// Purchase snapshot across all three scopes.
    pub async fn user_status(
        &self,
        user_id: &str,
        activity_id: &str,
        per_user_limit: i64,
    ) -> Result<UserStatusView> {
        let purchased = self.purchased(user_id, activity_id).await?;
        Ok(UserStatusView {
            user_id: user_id.to_string(),
            activity_id: activity_id.to_string(),
            purchased,
            remaining_quota: (per_user_limit - purchased).max(0),
            daily_purchased: self.daily_purchased(user_id).await?,
            global_purchased: self.lifetime_purchased(user_id).await?,
        })
    }

    async fn read_counter(&self, key: &str) -> Result<i64> {
        Ok(self
            .keystore
            .get(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Time remaining until the next local midnight.
fn until_local_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = (now.date_naive() + ChronoDuration::days(1)).and_hms_opt(0, 0, 0);
    match tomorrow {
        Some(midnight) => (midnight - now.naive_local())
            .to_std()
            .unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(24 * 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;

    fn accountant() -> (QuotaAccountant, Arc<MemoryKeystore>) {
        let keystore = Arc::new(MemoryKeystore::new());
        let config = QuotaConfig {
            daily_limit: 3,
            lifetime_limit: 5,
            lifetime_ttl: Duration::from_secs(3600),
        };
        (QuotaAccountant::new(keystore.clone(), config), keystore)
    }

    #[tokio::test]
    async fn test_counters_start_at_zero() {
        let (quota, _) = accountant();
        assert_eq!(quota.purchased("u1", "a1").await.unwrap(), 0);
        assert_eq!(quota.daily_purchased("u1").await.unwrap(), 0);
        assert_eq!(quota.lifetime_purchased("u1").await.unwrap(), 0);
        assert!(quota.within_ceilings("u1", 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_and_ceilings() {
        let (quota, _) = accountant();
        quota.record("u1", 2).await.unwrap();
        assert_eq!(quota.daily_purchased("u1").await.unwrap(), 2);
        assert_eq!(quota.lifetime_purchased("u1").await.unwrap(), 2);

        // Daily limit 3: one more unit fits, two do not.
        assert!(quota.within_ceilings("u1", 1).await.unwrap());
        assert!(!quota.within_ceilings("u1", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_lifetime_ceiling_independent_of_daily() {
        let (quota, keystore) = accountant();
        // Simulate purchases from a previous day counted only in lifetime.
        keystore.set("global:u1", "4").await.unwrap();
        assert!(quota.within_ceilings("u1", 1).await.unwrap());
        assert!(!quota.within_ceilings("u1", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrecord_clamps_at_zero() {
        let (quota, _) = accountant();
        quota.record("u1", 1).await.unwrap();
        quota.unrecord("u1", 3).await.unwrap();
        assert_eq!(quota.daily_purchased("u1").await.unwrap(), 0);
        assert_eq!(quota.lifetime_purchased("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_status_snapshot() {
        let (quota, keystore) = accountant();
        keystore.set("userlimit:u1:a1", "2").await.unwrap();
        quota.record("u1", 2).await.unwrap();

        let status = quota.user_status("u1", "a1", 5).await.unwrap();
        assert_eq!(status.purchased, 2);
        assert_eq!(status.remaining_quota, 3);
        assert_eq!(status.daily_purchased, 2);
        assert_eq!(status.global_purchased, 2);
    }
}
