//! Stock Synchronizer
//!
//! Background reconciliation between the live keystore counter and the
//! database. Divergence resolves by the configured policy; lost updates are
//! detected through the monotonic stock version and retried on the next
//! pass rather than overwritten.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{SyncConfig, SyncPolicy};
use crate::db::SaleDb;
use crate::keystore::{keys, Keystore};
use crate::metrics::MetricsRegistry;
use crate::models::Activity;
use crate::outbox::{OutboxStore, ReliableMessage, StockChanged, StockOperation};

/// What a single reconciliation found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Stores agreed.
    None,
    /// Values diverged and were resolved by policy.
    Drift,
    /// The version moved between read and write; nothing was written.
    VersionLost,
    /// The live counter was missing and re-warmed from the database.
    MissingLive,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::None => "none",
            ConflictKind::Drift => "drift",
            ConflictKind::VersionLost => "version_lost",
            ConflictKind::MissingLive => "missing_live",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub activity_id: String,
    pub old_stock: i64,
    pub new_stock: i64,
    pub conflict: ConflictKind,
    pub ts: i64,
}

/// Aggregate counters surfaced to metrics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total_synced: u64,
    pub success: u64,
    pub errors: u64,
    pub conflicts: u64,
    pub conflicts_by_type: HashMap<String, u64>,
    pub last_duration_ms: f64,
    pub avg_duration_ms: f64,
    runs: u64,
    total_duration_ms: f64,
}

pub struct StockSynchronizer {
    keystore: Arc<dyn Keystore>,
    db: SaleDb,
    config: SyncConfig,
    /// Keystore key lifetime past activity end.
    grace: Duration,
    outbox: Arc<OutboxStore>,
    metrics: Arc<MetricsRegistry>,
    stats: Mutex<SyncStats>,
}

impl StockSynchronizer {
    pub fn new(
        keystore: Arc<dyn Keystore>,
        db: SaleDb,
        config: SyncConfig,
        grace: Duration,
        outbox: Arc<OutboxStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            keystore,
            db,
            config,
            grace,
            outbox,
            metrics,
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Periodic loop. A full pass runs once before the schedule starts so a
    /// restart converges immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.sync_all().await {
            error!(error = %e, "startup stock sync failed");
        }
        let mut ticker = interval(self.config.interval);
        info!(policy = self.config.policy.as_str(), "stock synchronizer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        error!(error = %e, "stock sync pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("stock synchronizer stopped");
    }

    /// Reconcile every active activity in batches.
    pub async fn sync_all(&self) -> Result<()> {
        let started = Instant::now();
        let mut offset = 0;
        loop {
            let batch = self.db.list_active(self.config.batch_size, offset).await?;
            if batch.is_empty() {
                break;
            }
            let len = batch.len();
            for activity in &batch {
                match self.sync_activity(activity).await {
                    Ok(outcome) => self.record_outcome(&outcome),
                    Err(e) => {
                        // Fail open: keep prior values, try again next pass.
                        error!(activity = %activity.id, error = %e, "sync failed");
                        self.stats.lock().errors += 1;
                    }
                }
            }
            if len < self.config.batch_size {
                break;
            }
            offset += len;
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.last_duration_ms = elapsed_ms;
        stats.total_duration_ms += elapsed_ms;
        stats.avg_duration_ms = stats.total_duration_ms / stats.runs as f64;
        Ok(())
    }

    /// On-demand reconciliation of one activity.
    pub async fn sync_one(&self, activity_id: &str) -> Result<SyncOutcome> {
        let Some(activity) = self.db.get_activity(activity_id).await? else {
            anyhow::bail!("activity {} not found", activity_id);
        };
        let outcome = self.sync_activity(&activity).await?;
        self.record_outcome(&outcome);
        Ok(outcome)
    }

    async fn sync_activity(&self, activity: &Activity) -> Result<SyncOutcome> {
        let ts = Utc::now().timestamp_millis();
        let stock_key = keys::stock(&activity.id);
        let db_stock = activity.remaining_stock();

        let version_before = self.read_int(&keys::stock_version(&activity.id)).await?;
        let live = match self.keystore.get(&stock_key).await? {
            Some(raw) => raw.parse::<i64>().ok(),
            None => None,
        };

        let outcome = match live {
            None => {
                // Live counter gone (expiry or flush): re-warm from the DB.
                self.write_live_stock(activity, db_stock, version_before)
                    .await?;
                self.emit_stock_event(activity, db_stock, db_stock, StockOperation::Reset)
                    .await;
                SyncOutcome {
                    activity_id: activity.id.clone(),
                    old_stock: -1,
                    new_stock: db_stock,
                    conflict: ConflictKind::MissingLive,
                    ts,
                }
            }
            Some(ks_stock) if ks_stock == db_stock => SyncOutcome {
                activity_id: activity.id.clone(),
                old_stock: ks_stock,
                new_stock: ks_stock,
                conflict: ConflictKind::None,
                ts,
            },
            Some(ks_stock) => {
                self.resolve_drift(activity, ks_stock, db_stock, version_before, ts)
                    .await?
            }
        };

        self.db
            .record_sync(
                &activity.id,
                outcome.old_stock,
                outcome.new_stock,
                outcome.conflict.as_str(),
                self.config.policy.as_str(),
                ts,
            )
            .await?;
        self.metrics.set_activity_stock(
            &activity.id,
            outcome.new_stock,
            activity.total_stock - outcome.new_stock,
        );
        Ok(outcome)
    }

    async fn resolve_drift(
        &self,
        activity: &Activity,
        ks_stock: i64,
        db_stock: i64,
        version_before: i64,
        ts: i64,
    ) -> Result<SyncOutcome> {
        let resolved = match self.config.policy {
            SyncPolicy::RedisPriority => ks_stock,
            SyncPolicy::DbPriority => db_stock,
            SyncPolicy::Merge => ks_stock.min(db_stock),
        };

        // Keystore write goes through the optimistic version check; commits
        // racing this pass win and the divergence is retried next tick.
        if resolved != ks_stock {
            let written = self
                .write_live_stock(activity, resolved, version_before)
                .await?;
            if !written {
                warn!(
                    activity = %activity.id,
                    "stock version moved during sync, keeping live value"
                );
                return Ok(SyncOutcome {
                    activity_id: activity.id.clone(),
                    old_stock: ks_stock,
                    new_stock: ks_stock,
                    conflict: ConflictKind::VersionLost,
                    ts,
                });
            }
            let operation = if resolved > ks_stock {
                StockOperation::Increase
            } else {
                StockOperation::Decrease
            };
            self.emit_stock_event(activity, resolved - ks_stock, resolved, operation)
                .await;
        }

        if resolved != db_stock {
            let sold = (activity.total_stock - resolved).max(0);
            self.db.update_sold_count(&activity.id, sold, ts).await?;
        }

        Ok(SyncOutcome {
            activity_id: activity.id.clone(),
            old_stock: ks_stock,
            new_stock: resolved,
            conflict: ConflictKind::Drift,
            ts,
        })
    }

    /// Versioned live-stock write: re-reads the version and refuses to write
    /// when it no longer matches `expected_version`.
    async fn write_live_stock(
        &self,
        activity: &Activity,
        value: i64,
        expected_version: i64,
    ) -> Result<bool> {
        let version_now = self.read_int(&keys::stock_version(&activity.id)).await?;
        if version_now != expected_version {
            return Ok(false);
        }
        let lifetime = self.key_lifetime(activity);
        self.keystore
            .set_ex(&keys::stock(&activity.id), &value.to_string(), lifetime)
            .await?;
        self.keystore
            .set_ex(
                &keys::stock_version(&activity.id),
                &(version_now + 1).to_string(),
                lifetime,
            )
            .await?;
        Ok(true)
    }

    async fn emit_stock_event(
        &self,
        activity: &Activity,
        stock_change: i64,
        current_stock: i64,
        operation: StockOperation,
    ) {
        let message = ReliableMessage::stock_changed(StockChanged {
            activity_id: activity.id.clone(),
            stock_change,
            current_stock,
            operation,
            source: "sync".to_string(),
            ts: Utc::now().timestamp_millis(),
        });
        if let Err(e) = self.outbox.enqueue(&message).await {
            error!(activity = %activity.id, error = %e, "stock event enqueue failed");
        }
        let update = serde_json::json!({
            "activity_id": activity.id,
            "current_stock": current_stock,
        });
        if let Err(e) = self
            .keystore
            .publish(crate::admission::STOCK_CHANNEL, &update.to_string())
            .await
        {
            warn!(activity = %activity.id, error = %e, "stock publish failed");
        }
    }

    fn key_lifetime(&self, activity: &Activity) -> Duration {
        let now = Utc::now().timestamp_millis();
        Duration::from_millis((activity.end_time - now).max(0) as u64) + self.grace
    }

    async fn read_int(&self, key: &str) -> Result<i64> {
        Ok(self
            .keystore
            .get(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    fn record_outcome(&self, outcome: &SyncOutcome) {
        let mut stats = self.stats.lock();
        stats.total_synced += 1;
        stats.success += 1;
        if outcome.conflict != ConflictKind::None {
            stats.conflicts += 1;
            *stats
                .conflicts_by_type
                .entry(outcome.conflict.as_str().to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }
}
