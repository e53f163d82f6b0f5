//! Background consistency validation.
//!
//! Samples active activities every check interval, compares the keystore
//! view against the database, and repairs per key-family authority: activity
//! records are rewritten from the database, stock counters go through the
//! synchronizer's conflict policy.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::CacheConfig;
use crate::db::SaleDb;
use crate::keystore::{keys, Keystore};
use crate::metrics::{alert_notification, Alert, AlertKind, AlertLevel, MetricsRegistry};
use crate::models::Activity;
use crate::outbox::{OutboxStore, ReliableMessage};
use crate::sync::StockSynchronizer;

/// One key comparison.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub key: String,
    pub is_consistent: bool,
    pub cache_value: Option<String>,
    pub source_value: String,
    pub difference: Option<String>,
    pub repair_action: Option<String>,
}

/// Aggregate of one validation pass.
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub total_checked: usize,
    pub consistent_count: usize,
    pub inconsistent_keys: Vec<String>,
    pub validation_results: Vec<ValidationResult>,
    pub consistency_rate: f64,
    pub check_time: i64,
    pub duration_ms: f64,
}

pub struct ConsistencyValidator {
    keystore: Arc<dyn Keystore>,
    db: SaleDb,
    config: CacheConfig,
    synchronizer: Arc<StockSynchronizer>,
    outbox: Arc<OutboxStore>,
    metrics: Arc<MetricsRegistry>,
    /// Repair attempts per key, bounded by max_repair_retries.
    repair_attempts: Mutex<HashMap<String, u32>>,
}

impl ConsistencyValidator {
    pub fn new(
        keystore: Arc<dyn Keystore>,
        db: SaleDb,
        config: CacheConfig,
        synchronizer: Arc<StockSynchronizer>,
        outbox: Arc<OutboxStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            keystore,
            db,
            config,
            synchronizer,
            outbox,
            metrics,
            repair_attempts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.check_interval);
        info!("consistency validator started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.validate_once().await {
                        Ok(report) => {
                            if report.consistency_rate < self.config.alert_threshold {
                                self.raise_alert(&report).await;
                            }
                        }
                        Err(e) => error!(error = %e, "consistency pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("consistency validator stopped");
    }

    /// One sampling pass over active activities.
    pub async fn validate_once(&self) -> Result<ConsistencyReport> {
        let started = Instant::now();
        let sample = self.db.list_active(self.config.sample_size, 0).await?;

        let mut results = Vec::new();
        for activity in &sample {
            results.push(self.check_record(activity).await);
            results.push(self.check_stock(activity).await);
        }

        let total_checked = results.len();
        let consistent_count = results.iter().filter(|r| r.is_consistent).count();
        let inconsistent_keys: Vec<String> = results
            .iter()
            .filter(|r| !r.is_consistent)
            .map(|r| r.key.clone())
            .collect();
        let consistency_rate = if total_checked == 0 {
            1.0
        } else {
            consistent_count as f64 / total_checked as f64
        };
        self.metrics.set_consistency_rate(consistency_rate);

        let report = ConsistencyReport {
            total_checked,
            consistent_count,
            inconsistent_keys,
            validation_results: results,
            consistency_rate,
            check_time: Utc::now().timestamp_millis(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        if report.consistent_count < report.total_checked {
            warn!(
                checked = report.total_checked,
                inconsistent = report.total_checked - report.consistent_count,
                rate = report.consistency_rate,
                "consistency drift detected"
            );
        }
        Ok(report)
    }

    /// Activity record family: the database is authoritative.
    async fn check_record(&self, activity: &Activity) -> ValidationResult {
        let key = keys::activity(&activity.id);
        let source_value = serde_json::to_string(activity).unwrap_or_default();

        let cached = match self.keystore.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.metrics.record_cache_error();
                return ValidationResult {
                    key,
                    is_consistent: false,
                    cache_value: None,
                    source_value,
                    difference: Some(format!("cache read failed: {}", e)),
                    repair_action: None,
                };
            }
        };

        let difference = match &cached {
            // An absent cache entry is a cold cache, not an inconsistency.
            None => None,
            Some(raw) => match serde_json::from_str::<Activity>(raw) {
                Ok(c) => diff_records(&c, activity),
                Err(_) => Some("unparseable cache record".to_string()),
            },
        };

        match difference {
            None => ValidationResult {
                key,
                is_consistent: true,
                cache_value: cached,
                source_value,
                difference: None,
                repair_action: None,
            },
            Some(diff) => {
                let repair_action = if self.may_repair(&key) {
                    match self.rewrite_record(activity).await {
                        Ok(()) => Some("rewritten_from_db".to_string()),
                        Err(e) => Some(format!("repair_failed: {}", e)),
                    }
                } else {
                    None
                };
                ValidationResult {
                    key,
                    is_consistent: false,
                    cache_value: cached,
                    source_value,
                    difference: Some(diff),
                    repair_action,
                }
            }
        }
    }

    /// Stock family: resolved through the synchronizer's policy.
    async fn check_stock(&self, activity: &Activity) -> ValidationResult {
        let key = keys::stock(&activity.id);
        let source_value = activity.remaining_stock().to_string();

        let cached = match self.keystore.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.metrics.record_cache_error();
                return ValidationResult {
                    key,
                    is_consistent: false,
                    cache_value: None,
                    source_value,
                    difference: Some(format!("cache read failed: {}", e)),
                    repair_action: None,
                };
            }
        };

        let consistent = cached.as_deref() == Some(source_value.as_str());
        if consistent {
            return ValidationResult {
                key,
                is_consistent: true,
                cache_value: cached,
                source_value,
                difference: None,
                repair_action: None,
            };
        }

        let difference = Some(format!(
            "live={} db={}",
            cached.as_deref().unwrap_or("<missing>"),
            source_value
        ));
        let repair_action = if self.may_repair(&key) {
            match self.synchronizer.sync_one(&activity.id).await {
                Ok(outcome) => Some(format!("synced_{}", outcome.conflict.as_str())),
                Err(e) => Some(format!("repair_failed: {}", e)),
            }
        } else {
            None
        };

        ValidationResult {
            key,
            is_consistent: false,
            cache_value: cached,
            source_value,
            difference,
            repair_action,
        }
    }

    async fn rewrite_record(&self, activity: &Activity) -> Result<()> {
        let json = serde_json::to_string(activity)?;
        self.keystore
            .set_ex(&keys::activity(&activity.id), &json, self.config.default_ttl)
            .await?;
        self.keystore
            .set_ex(
                &keys::status(&activity.id),
                activity.status.as_str(),
                self.config.default_ttl,
            )
            .await?;
        self.metrics.record_cache_set();
        Ok(())
    }

    fn may_repair(&self, key: &str) -> bool {
        if !self.config.repair_enabled {
            return false;
        }
        let mut attempts = self.repair_attempts.lock();
        let n = attempts.entry(key.to_string()).or_insert(0);
        if *n >= self.config.max_repair_retries {
            return false;
        }
        *n += 1;
        true
    }

    async fn raise_alert(&self, report: &ConsistencyReport) {
        let alert = Alert {
            kind: AlertKind::LowConsistency,
            level: AlertLevel::Error,
            message: format!(
                "consistency rate {:.3} below {:.2} ({} of {} keys inconsistent)",
                report.consistency_rate,
                self.config.alert_threshold,
                report.total_checked - report.consistent_count,
                report.total_checked
            ),
            value: report.consistency_rate,
            threshold: self.config.alert_threshold,
            ts: report.check_time,
        };
        warn!(message = %alert.message, "raising consistency alert");
        let email = ReliableMessage::email(alert_notification(&alert));
        if let Err(e) = self.outbox.enqueue(&email).await {
            error!(error = %e, "alert enqueue failed");
        }
    }
}

fn diff_records(cached: &Activity, source: &Activity) -> Option<String> {
    if cached.version != source.version {
        return Some(format!(
            "version {} != {}",
            cached.version, source.version
        ));
    }
    if cached.status != source.status {
        return Some(format!(
            "status {} != {}",
            cached.status.as_str(),
            source.status.as_str()
        ));
    }
    if cached.sold_count != source.sold_count {
        return Some(format!(
            "sold_count {} != {}",
            cached.sold_count, source.sold_count
        ));
    }
    if cached.total_stock != source.total_stock {
        return Some(format!(
            "total_stock {} != {}",
            cached.total_stock, source.total_stock
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutboxConfig, SyncConfig};
    use crate::keystore::MemoryKeystore;
    use crate::models::ActivityStatus;
    use std::time::Duration;

    fn activity(id: &str, sold: i64) -> Activity {
        let now = Utc::now().timestamp_millis();
        Activity {
            id: id.to_string(),
            name: "sale".into(),
            status: ActivityStatus::Active,
            start_time: now - 1_000,
            end_time: now + 3_600_000,
            total_stock: 10,
            sold_count: sold,
            price: 1.0,
            per_user_limit: 2,
            version: 0,
            updated_at: now,
        }
    }

    async fn validator() -> (Arc<ConsistencyValidator>, Arc<MemoryKeystore>, SaleDb) {
        let keystore: Arc<MemoryKeystore> = Arc::new(MemoryKeystore::new());
        let db = SaleDb::open_in_memory().unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let outbox = Arc::new(OutboxStore::new(keystore.clone(), OutboxConfig::default()));
        let synchronizer = Arc::new(StockSynchronizer::new(
            keystore.clone(),
            db.clone(),
            SyncConfig::default(),
            Duration::from_secs(3600),
            outbox.clone(),
            metrics.clone(),
        ));
        let validator = Arc::new(ConsistencyValidator::new(
            keystore.clone(),
            db.clone(),
            CacheConfig::default(),
            synchronizer,
            outbox,
            metrics,
        ));
        (validator, keystore, db)
    }

    #[tokio::test]
    async fn test_consistent_state_reports_full_rate() {
        let (validator, keystore, db) = validator().await;
        let a = activity("a1", 4);
        db.upsert_activity(&a).await.unwrap();
        keystore
            .set("activity:a1", &serde_json::to_string(&a).unwrap())
            .await
            .unwrap();
        keystore.set("stock:a1", "6").await.unwrap();

        let report = validator.validate_once().await.unwrap();
        assert_eq!(report.total_checked, 2);
        assert_eq!(report.consistent_count, 2);
        assert!((report.consistency_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stale_record_repaired_from_db() {
        let (validator, keystore, db) = validator().await;
        let a = activity("a1", 4);
        db.upsert_activity(&a).await.unwrap();

        let mut stale = a.clone();
        stale.sold_count = 1;
        keystore
            .set("activity:a1", &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();
        keystore.set("stock:a1", "6").await.unwrap();

        let report = validator.validate_once().await.unwrap();
        assert_eq!(report.consistent_count, 1);
        assert!(report
            .inconsistent_keys
            .contains(&"activity:a1".to_string()));

        // Repaired in place from the authoritative row.
        let cached: Activity =
            serde_json::from_str(&keystore.get("activity:a1").await.unwrap().unwrap()).unwrap();
        assert_eq!(cached.sold_count, 4);
    }

    #[tokio::test]
    async fn test_stock_mismatch_routed_through_synchronizer() {
        let (validator, keystore, db) = validator().await;
        db.upsert_activity(&activity("a1", 2)).await.unwrap();
        keystore.set("stock:a1", "5").await.unwrap();

        let report = validator.validate_once().await.unwrap();
        let stock_result = report
            .validation_results
            .iter()
            .find(|r| r.key == "stock:a1")
            .unwrap();
        assert!(!stock_result.is_consistent);
        assert_eq!(stock_result.repair_action.as_deref(), Some("synced_drift"));

        // Merge policy: min(5, 8) stays 5, database catches down to it.
        let reloaded = db.get_activity("a1").await.unwrap().unwrap();
        assert_eq!(reloaded.sold_count, 5);
    }

    #[tokio::test]
    async fn test_repair_budget_exhausts() {
        let (validator, keystore, db) = validator().await;
        db.upsert_activity(&activity("a1", 4)).await.unwrap();
        keystore.set("stock:a1", "6").await.unwrap();

        let max = CacheConfig::default().max_repair_retries;
        for _ in 0..max {
            let mut stale = activity("a1", 4);
            stale.sold_count = 0;
            keystore
                .set("activity:a1", &serde_json::to_string(&stale).unwrap())
                .await
                .unwrap();
            let report = validator.validate_once().await.unwrap();
            let record = report
                .validation_results
                .iter()
                .find(|r| r.key == "activity:a1")
                .unwrap();
            assert!(record.repair_action.is_some());
        }

        // Budget spent: still flagged, no longer repaired.
        let mut stale = activity("a1", 4);
        stale.sold_count = 0;
        keystore
            .set("activity:a1", &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();
        let report = validator.validate_once().await.unwrap();
        let record = report
            .validation_results
            .iter()
            .find(|r| r.key == "activity:a1")
            .unwrap();
        assert!(record.repair_action.is_none());
    }
}
