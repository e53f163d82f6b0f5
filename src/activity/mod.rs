//! Activity Service & Validator
//!
//! Read-through cached activity records, the status transition machine with
//! its append-only history, and the cheap pre-commit validation pass. The
//! validator is advisory; the atomic commit script has the final say.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ValidatorConfig;
use crate::db::SaleDb;
use crate::keystore::{keys, Keystore};
use crate::metrics::MetricsRegistry;
use crate::models::{Activity, ActivityStatus, AdmitReason, StatusTransition};

/// Owns the cached activity records and the status machine.
pub struct ActivityService {
    keystore: Arc<dyn Keystore>,
    db: SaleDb,
    config: ValidatorConfig,
    metrics: Arc<MetricsRegistry>,
}

impl ActivityService {
    pub fn new(
        keystore: Arc<dyn Keystore>,
        db: SaleDb,
        config: ValidatorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            keystore,
            db,
            config,
            metrics,
        }
    }

    /// Read-through fetch: keystore cache first, database on miss. A database
    /// hit repopulates the cache for `cache_timeout`, which absorbs the burst
    /// of lookups a hot sale produces.
    pub async fn get(&self, id: &str) -> Result<Option<Activity>> {
        match self.keystore.get(&keys::activity(id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Activity>(&raw) {
                Ok(activity) => {
                    self.metrics.record_cache_hit();
                    return Ok(Some(activity));
                }
                Err(e) => {
                    warn!(activity = id, error = %e, "corrupt cached activity, refetching");
                    self.keystore.del(&keys::activity(id)).await.ok();
                }
            },
            Ok(None) => {}
            Err(e) => {
                self.metrics.record_cache_error();
                return Err(e);
            }
        }
        self.metrics.record_cache_miss();
        let Some(activity) = self.db.get_activity(id).await? else {
            return Ok(None);
        };
        self.cache_record(&activity).await?;
        Ok(Some(activity))
    }

    /// Write the record cache and status key for an activity.
    pub async fn cache_record(&self, activity: &Activity) -> Result<()> {
        let json = serde_json::to_string(activity).context("serialize activity")?;
        self.keystore
            .set_ex(&keys::activity(&activity.id), &json, self.config.cache_timeout)
            .await?;
        self.keystore
            .set_ex(
                &keys::status(&activity.id),
                activity.status.as_str(),
                self.key_lifetime(activity),
            )
            .await?;
        self.metrics.record_cache_set();
        Ok(())
    }

    /// TTL for per-activity keystore keys: remaining sale window plus grace.
    pub fn key_lifetime(&self, activity: &Activity) -> Duration {
        let now = Utc::now().timestamp_millis();
        let remaining_ms = (activity.end_time - now).max(0) as u64;
        Duration::from_millis(remaining_ms) + self.config.grace
    }

    /// Apply a status transition. Database first (source of truth), then the
    /// keystore status key, cache, and the append-only history. Activation
    /// from `scheduled` warms the live stock counter.
    pub async fn transition_status(
        &self,
        id: &str,
        to: ActivityStatus,
        operator: &str,
        reason: &str,
    ) -> Result<Activity> {
        let Some(activity) = self.db.get_activity(id).await? else {
            bail!("activity {} not found", id);
        };
        let from = activity.status;
        if !from.can_transition_to(to) {
            bail!(
                "illegal status transition {} -> {} for {}",
                from.as_str(),
                to.as_str(),
                id
            );
        }

        let ts = Utc::now().timestamp_millis();
        self.db.update_status(id, to, ts).await?;
        let Some(updated) = self.db.get_activity(id).await? else {
            bail!("activity {} vanished during transition", id);
        };

        if from == ActivityStatus::Scheduled && to == ActivityStatus::Active {
            self.warm_stock(&updated).await?;
        }
        self.cache_record(&updated).await?;

        let transition = StatusTransition {
            from,
            to,
            reason: reason.to_string(),
            ts,
            operator: operator.to_string(),
        };
        self.db.record_status_transition(id, &transition).await?;
        let history_key = keys::status_history(id);
        self.keystore
            .rpush(&history_key, &serde_json::to_string(&transition)?)
            .await?;
        let history_ttl = {
            let remaining_ms = (updated.end_time - ts).max(0) as u64;
            Duration::from_millis(remaining_ms) + self.config.retention
        };
        self.keystore.expire(&history_key, history_ttl).await?;

        info!(
            activity = id,
            from = from.as_str(),
            to = to.as_str(),
            operator,
            "activity status transition"
        );
        Ok(updated)
    }

    /// Initialize the live stock counter from the database record. Runs once
    /// per activation; reactivation from `paused` keeps the live counter.
    async fn warm_stock(&self, activity: &Activity) -> Result<()> {
        let lifetime = self.key_lifetime(activity);
        self.keystore
            .set_ex(
                &keys::stock(&activity.id),
                &activity.remaining_stock().to_string(),
                lifetime,
            )
            .await?;
        self.keystore
            .set_ex(&keys::stock_version(&activity.id), "1", lifetime)
            .await?;
        info!(
            activity = %activity.id,
            stock = activity.remaining_stock(),
            "stock warmed for activation"
        );
        Ok(())
    }

    /// Append-only transition log, oldest first.
    pub async fn status_history(&self, id: &str) -> Result<Vec<StatusTransition>> {
        let raw = self.keystore.lrange(&keys::status_history(id), 0, -1).await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            out.push(serde_json::from_str(&item).context("parse status transition")?);
        }
        Ok(out)
    }
}

/// Result of the pre-commit validation pass.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<AdmitReason>,
    pub activity: Option<Activity>,
}

impl Validation {
    fn reject(reason: AdmitReason, activity: Option<Activity>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            activity,
        }
    }
}

/// Cheap pre-filter in front of the atomic commit. Never the last word.
pub struct ActivityValidator {
    service: Arc<ActivityService>,
    config: ValidatorConfig,
}

impl ActivityValidator {
    pub fn new(service: Arc<ActivityService>, config: ValidatorConfig) -> Self {
        Self { service, config }
    }

    pub async fn validate(&self, activity_id: &str, now_millis: i64) -> Result<Validation> {
        let Some(activity) = self.service.get(activity_id).await? else {
            return Ok(Validation::reject(AdmitReason::ActivityNotFound, None));
        };

        match activity.status {
            ActivityStatus::Ended => {
                return Ok(Validation::reject(
                    AdmitReason::ActivityEnded,
                    Some(activity),
                ));
            }
            ActivityStatus::Cancelled => {
                return Ok(Validation::reject(
                    AdmitReason::ActivityNotActive,
                    Some(activity),
                ));
            }
            _ => {}
        }

        // Window check with skew buffer before the start.
        if now_millis < activity.start_time - self.config.time_buffer_ms {
            return Ok(Validation::reject(
                AdmitReason::ActivityNotStarted,
                Some(activity),
            ));
        }
        if now_millis > activity.end_time {
            return Ok(Validation::reject(
                AdmitReason::ActivityEnded,
                Some(activity),
            ));
        }

        if activity.status != ActivityStatus::Active {
            return Ok(Validation::reject(
                AdmitReason::ActivityNotActive,
                Some(activity),
            ));
        }

        // Advisory: the script re-checks against the live counter.
        if activity.remaining_stock() <= 0 {
            return Ok(Validation::reject(
                AdmitReason::InsufficientStock,
                Some(activity),
            ));
        }

        Ok(Validation {
            valid: true,
            reason: None,
            activity: Some(activity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn sample(id: &str, status: ActivityStatus) -> Activity {
        Activity {
            id: id.to_string(),
            name: "sale".into(),
            status,
            start_time: now() - 1_000,
            end_time: now() + 3_600_000,
            total_stock: 10,
            sold_count: 0,
            price: 5.0,
            per_user_limit: 2,
            version: 0,
            updated_at: now(),
        }
    }

    async fn service() -> (Arc<ActivityService>, Arc<MemoryKeystore>, SaleDb) {
        let keystore = Arc::new(MemoryKeystore::new());
        let db = SaleDb::open_in_memory().unwrap();
        let service = Arc::new(ActivityService::new(
            keystore.clone(),
            db.clone(),
            ValidatorConfig::default(),
            Arc::new(MetricsRegistry::new()),
        ));
        (service, keystore, db)
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let (service, keystore, db) = service().await;
        db.upsert_activity(&sample("act1", ActivityStatus::Active))
            .await
            .unwrap();

        assert!(keystore.get("activity:act1").await.unwrap().is_none());
        let loaded = service.get("act1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "act1");
        assert!(keystore.get("activity:act1").await.unwrap().is_some());
        assert_eq!(
            keystore.get("status:act1").await.unwrap().as_deref(),
            Some("active")
        );
    }

    #[tokio::test]
    async fn test_activation_warms_stock() {
        let (service, keystore, db) = service().await;
        let mut activity = sample("act1", ActivityStatus::Scheduled);
        activity.sold_count = 3;
        db.upsert_activity(&activity).await.unwrap();

        service
            .transition_status("act1", ActivityStatus::Active, "admin", "go live")
            .await
            .unwrap();

        assert_eq!(
            keystore.get("stock:act1").await.unwrap().as_deref(),
            Some("7")
        );
        assert_eq!(
            keystore.get("stockver:act1").await.unwrap().as_deref(),
            Some("1")
        );

        let history = service.status_history("act1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, ActivityStatus::Scheduled);
        assert_eq!(history[0].to, ActivityStatus::Active);
        assert_eq!(history[0].operator, "admin");
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_live_stock() {
        let (service, keystore, db) = service().await;
        db.upsert_activity(&sample("act1", ActivityStatus::Scheduled))
            .await
            .unwrap();
        service
            .transition_status("act1", ActivityStatus::Active, "admin", "go")
            .await
            .unwrap();
        keystore.set("stock:act1", "4").await.unwrap();

        service
            .transition_status("act1", ActivityStatus::Paused, "admin", "hold")
            .await
            .unwrap();
        service
            .transition_status("act1", ActivityStatus::Active, "admin", "resume")
            .await
            .unwrap();

        // Resume must not re-warm from the database.
        assert_eq!(
            keystore.get("stock:act1").await.unwrap().as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let (service, _keystore, db) = service().await;
        db.upsert_activity(&sample("act1", ActivityStatus::Draft))
            .await
            .unwrap();
        assert!(service
            .transition_status("act1", ActivityStatus::Active, "admin", "skip")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_validator_reasons() {
        let (service, _keystore, db) = service().await;
        let validator = ActivityValidator::new(service.clone(), ValidatorConfig::default());

        let missing = validator.validate("ghost", now()).await.unwrap();
        assert_eq!(missing.reason, Some(AdmitReason::ActivityNotFound));

        let mut early = sample("early", ActivityStatus::Active);
        early.start_time = now() + 3_600_000;
        early.end_time = now() + 7_200_000;
        db.upsert_activity(&early).await.unwrap();
        let v = validator.validate("early", now()).await.unwrap();
        assert_eq!(v.reason, Some(AdmitReason::ActivityNotStarted));

        let mut over = sample("over", ActivityStatus::Active);
        over.end_time = now() - 1_000;
        db.upsert_activity(&over).await.unwrap();
        let v = validator.validate("over", now()).await.unwrap();
        assert_eq!(v.reason, Some(AdmitReason::ActivityEnded));

        let mut sold_out = sample("soldout", ActivityStatus::Active);
        sold_out.sold_count = sold_out.total_stock;
        db.upsert_activity(&sold_out).await.unwrap();
        let v = validator.validate("soldout", now()).await.unwrap();
        assert_eq!(v.reason, Some(AdmitReason::InsufficientStock));

        db.upsert_activity(&sample("ok", ActivityStatus::Active))
            .await
            .unwrap();
        let v = validator.validate("ok", now()).await.unwrap();
        assert!(v.valid);
        assert_eq!(v.activity.unwrap().per_user_limit, 2);
    }

    #[tokio::test]
    async fn test_validator_start_boundary_with_buffer() {
        let (service, _keystore, db) = service().await;
        let validator = ActivityValidator::new(service.clone(), ValidatorConfig::default());
        let buffer = ValidatorConfig::default().time_buffer_ms;

        let mut activity = sample("edge", ActivityStatus::Active);
        activity.start_time = now() + 60_000;
        activity.end_time = now() + 7_200_000;
        db.upsert_activity(&activity).await.unwrap();

        let v = validator
            .validate("edge", activity.start_time - buffer - 1)
            .await
            .unwrap();
        assert_eq!(v.reason, Some(AdmitReason::ActivityNotStarted));

        let v = validator
            .validate("edge", activity.start_time - buffer)
            .await
            .unwrap();
        assert!(v.valid);
    }
}
