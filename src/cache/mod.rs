//! Cache Update Strategies
//!
//! Write-through, write-behind, and refresh-ahead paths for the activity
//! record cache, with bounded retries. The background consistency validator
//! lives in the `consistency` submodule.

pub mod consistency;

pub use consistency::{ConsistencyReport, ConsistencyValidator, ValidationResult};

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{CacheConfig, CacheStrategy};
use crate::db::SaleDb;
use crate::keystore::{keys, Keystore};
use crate::metrics::MetricsRegistry;
use crate::models::Activity;
use crate::outbox::{OutboxStore, ReliableMessage, StockChanged, StockOperation};

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::WriteThrough => "write_through",
            CacheStrategy::WriteBehind => "write_behind",
            CacheStrategy::RefreshAhead => "refresh_ahead",
        }
    }
}

/// Outcome of one cache update operation.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub strategy: CacheStrategy,
    pub ts: i64,
}

pub struct CacheUpdater {
    keystore: Arc<dyn Keystore>,
    db: SaleDb,
    config: CacheConfig,
    outbox: Arc<OutboxStore>,
    metrics: Arc<MetricsRegistry>,
}

impl CacheUpdater {
    pub fn new(
        keystore: Arc<dyn Keystore>,
        db: SaleDb,
        config: CacheConfig,
        outbox: Arc<OutboxStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            keystore,
            db,
            config,
            outbox,
            metrics,
        }
    }

    /// Apply an activity record update under the given strategy.
    pub async fn update_activity(
        &self,
        activity: &Activity,
        strategy: CacheStrategy,
    ) -> UpdateResult {
        let started = Instant::now();
        let key = keys::activity(&activity.id);

        let outcome = match strategy {
            CacheStrategy::WriteThrough => self.write_through(activity).await,
            CacheStrategy::WriteBehind => self.write_behind(activity).await,
            // Refresh-ahead is a read-side policy; an explicit update under it
            // behaves like write-through.
            CacheStrategy::RefreshAhead => self.write_through(activity).await,
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(()) => {
                self.metrics.record_cache_set();
                UpdateResult {
                    key,
                    success: true,
                    error: None,
                    duration_ms,
                    strategy,
                    ts: Utc::now().timestamp_millis(),
                }
            }
            Err(e) => {
                self.metrics.record_cache_error();
                error!(key = %key, error = %e, strategy = strategy.as_str(), "cache update failed");
                UpdateResult {
                    key,
                    success: false,
                    error: Some(e.to_string()),
                    duration_ms,
                    strategy,
                    ts: Utc::now().timestamp_millis(),
                }
            }
        }
    }

    /// Database and cache written synchronously; either failure fails the
    /// operation after the retry budget.
    async fn write_through(&self, activity: &Activity) -> Result<()> {
        self.with_retries(|| async {
            self.db.upsert_activity(activity).await?;
            self.write_cache(activity).await
        })
        .await
    }

    /// Cache first; the database write may fail and is then re-driven by the
    /// synchronizer, announced through a stock event.
    async fn write_behind(&self, activity: &Activity) -> Result<()> {
        self.with_retries(|| async { self.write_cache(activity).await })
            .await?;

        if let Err(e) = self.db.upsert_activity(activity).await {
            warn!(
                activity = %activity.id,
                error = %e,
                "deferred database write failed, leaving re-drive marker"
            );
            let message = ReliableMessage::stock_changed(StockChanged {
                activity_id: activity.id.clone(),
                stock_change: 0,
                current_stock: activity.remaining_stock(),
                operation: StockOperation::Reset,
                source: "write_behind".to_string(),
                ts: Utc::now().timestamp_millis(),
            });
            self.outbox.enqueue(&message).await?;
        }
        Ok(())
    }

    async fn write_cache(&self, activity: &Activity) -> Result<()> {
        let json = serde_json::to_string(activity).context("serialize activity")?;
        self.keystore
            .set_ex(&keys::activity(&activity.id), &json, self.config.default_ttl)
            .await?;
        self.keystore
            .set_ex(
                &keys::status(&activity.id),
                activity.status.as_str(),
                self.config.default_ttl,
            )
            .await
    }

    async fn with_retries<F, Fut>(&self, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retries exhausted")))
    }

    /// Refresh-ahead check for one activity record: when the cached record's
    /// remaining TTL drops below `refresh_threshold * default_ttl`, reload it
    /// from the database. Readers keep seeing the old value until the
    /// refresh lands.
    pub async fn maybe_refresh(&self, activity_id: &str) -> Result<bool> {
        let key = keys::activity(activity_id);
        let threshold = self.config.default_ttl.mul_f64(self.config.refresh_threshold);
        match self.keystore.ttl(&key).await? {
            Some(remaining) if remaining > threshold => return Ok(false),
            _ => {}
        }
        let Some(activity) = self.db.get_activity(activity_id).await? else {
            return Ok(false);
        };
        self.write_cache(&activity).await?;
        self.metrics.record_cache_set();
        Ok(true)
    }

    /// Background refresh-ahead loop over active activities.
    pub async fn run_refresh_ahead(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self
            .config
            .default_ttl
            .mul_f64((self.config.refresh_threshold / 2.0).max(0.05));
        let mut ticker = interval(period);
        info!("refresh-ahead loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.db.list_active(self.config.sample_size, 0).await {
                        Ok(active) => {
                            for activity in active {
                                if let Err(e) = self.maybe_refresh(&activity.id).await {
                                    error!(activity = %activity.id, error = %e, "refresh failed");
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "active scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("refresh-ahead loop stopped");
    }
}
