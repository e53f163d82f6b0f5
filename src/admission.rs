//! Admission Facade
//!
//! The public entry point of the engine. One admission runs rate limiting,
//! the cheap validator pass, the atomic commit script, and durable outbox
//! emission, in that order; the result is a populated `AdmitResult`, never a
//! raw error.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::activity::{ActivityService, ActivityValidator};
use crate::commit::{CommitCode, CommitEngine};
use crate::config::EngineConfig;
use crate::keystore::{keys, Keystore};
use crate::limiter::{LimitDecision, LimitLevel, MultiLevelRateLimiter};
use crate::metrics::MetricsRegistry;
use crate::db::SaleDb;
use crate::models::{
    new_commit_token, Activity, ActivityStatus, AdmitReason, AdmitResult, CommitRecord, StockView,
    UserStatusView,
};
use crate::outbox::{
    OutboxPayload, OutboxStore, ReliableMessage, StockChanged, StockOperation,
};
use crate::quota::QuotaAccountant;

/// One buy request.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub activity_id: String,
    pub user_id: String,
    pub ip: String,
    pub qty: i64,
    /// Client retry token; admissions with the same nonce inside the dedup
    /// window replay the original result.
    pub client_nonce: Option<String>,
}

/// Pub/sub channel carrying live stock updates for push consumers.
pub const STOCK_CHANNEL: &str = "stock.updates";

/// Outcome of a rollback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    RolledBack,
    NotFound,
    AlreadyRolledBack,
}

pub struct AdmissionService {
    keystore: Arc<dyn Keystore>,
    limiter: Arc<MultiLevelRateLimiter>,
    activities: Arc<ActivityService>,
    validator: ActivityValidator,
    quota: QuotaAccountant,
    commit: CommitEngine,
    outbox: Arc<OutboxStore>,
    metrics: Arc<MetricsRegistry>,
    config: EngineConfig,
}

impl AdmissionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keystore: Arc<dyn Keystore>,
        limiter: Arc<MultiLevelRateLimiter>,
        activities: Arc<ActivityService>,
        validator: ActivityValidator,
        quota: QuotaAccountant,
        commit: CommitEngine,
        outbox: Arc<OutboxStore>,
        metrics: Arc<MetricsRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            keystore,
            limiter,
            activities,
            validator,
            quota,
            commit,
            outbox,
            metrics,
            config,
        }
    }

    /// Admit one buy request.
    pub async fn admit(&self, request: &AdmitRequest) -> AdmitResult {
        let started = Instant::now();

        // Replay window for client retries; replays count as duplicates, not
        // as fresh admissions.
        if let Some(prior) = self.dedup_lookup(request).await {
            self.metrics
                .record_admission(&request.activity_id, AdmitReason::Duplicate);
            return prior;
        }

        let result = self.admit_inner(request, started).await;
        self.metrics
            .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics
            .record_admission(&request.activity_id, result.reason);
        result
    }

    async fn admit_inner(&self, request: &AdmitRequest, started: Instant) -> AdmitResult {
        if request.qty <= 0 || request.activity_id.is_empty() || request.user_id.is_empty() {
            warn!(?request, "malformed admission request");
            return AdmitResult::rejected(AdmitReason::InternalError);
        }

        // Backpressure: clamp the global family while the outbox backlog is
        // above threshold. The worker keeps the backlog gauge fresh.
        let threshold =
            self.config.outbox.backpressure_factor * self.config.outbox.batch_size as u64;
        self.limiter
            .set_pressure(self.metrics.outbox_outstanding() > threshold);

        match self
            .limiter
            .allow(&request.activity_id, &request.ip, &request.user_id)
        {
            LimitDecision::Allowed => {}
            LimitDecision::Rejected(level) => {
                let reason = match level {
                    LimitLevel::Global => AdmitReason::RateLimitGlobal,
                    LimitLevel::Ip => AdmitReason::RateLimitIp,
                    LimitLevel::User => AdmitReason::RateLimitUser,
                };
                return AdmitResult::rejected(reason);
            }
        }

        let now_millis = Utc::now().timestamp_millis();
        let validation = match self.validator.validate(&request.activity_id, now_millis).await {
            Ok(v) => v,
            Err(e) => {
                error!(activity = %request.activity_id, error = %e, "validation failed");
                return AdmitResult::rejected(AdmitReason::InternalError);
            }
        };
        if !validation.valid {
            let reason = validation.reason.unwrap_or(AdmitReason::InternalError);
            return self.finish(request, AdmitResult::rejected(reason)).await;
        }
        let Some(activity) = validation.activity else {
            return AdmitResult::rejected(AdmitReason::InternalError);
        };

        // Advisory day/lifetime ceilings; the per-activity cap is enforced
        // inside the script.
        match self.quota.within_ceilings(&request.user_id, request.qty).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .finish(request, AdmitResult::rejected(AdmitReason::UserLimitExceeded))
                    .await;
            }
            Err(e) => {
                error!(user = %request.user_id, error = %e, "quota read failed");
                return AdmitResult::rejected(AdmitReason::InternalError);
            }
        }

        // The atomic step runs under the remaining admission deadline.
        let Some(remaining) = self.config.admission.deadline.checked_sub(started.elapsed())
        else {
            return AdmitResult::rejected(AdmitReason::InternalError);
        };
        let outcome = match timeout(
            remaining,
            self.commit.commit(
                &request.activity_id,
                &request.user_id,
                request.qty,
                activity.per_user_limit,
                now_millis,
                self.activities.key_lifetime(&activity),
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(activity = %request.activity_id, "admission deadline exceeded in commit");
                return AdmitResult::rejected(AdmitReason::InternalError);
            }
        };

        let reason = match outcome.code {
            CommitCode::Ok => AdmitReason::Ok,
            CommitCode::ActivityNotActive => AdmitReason::ActivityNotActive,
            CommitCode::InsufficientStock => AdmitReason::InsufficientStock,
            CommitCode::UserLimitExceeded => AdmitReason::UserLimitExceeded,
            CommitCode::InvalidParams | CommitCode::InternalError => AdmitReason::InternalError,
        };
        if reason != AdmitReason::Ok {
            let mut result = AdmitResult::rejected(reason);
            result.remaining_stock = outcome.remaining_stock;
            result.remaining_user_quota = outcome.remaining_quota;
            return self.finish(request, result).await;
        }

        // Commit landed: the order event must be durable before we answer.
        let record = CommitRecord {
            commit_token: new_commit_token(),
            activity_id: request.activity_id.clone(),
            user_id: request.user_id.clone(),
            qty: request.qty,
            ts: now_millis,
            price_snapshot: activity.price,
        };
        if let Err(e) = self.outbox.enqueue(&ReliableMessage::order(&record)).await {
            error!(
                activity = %request.activity_id,
                token = %record.commit_token,
                error = %e,
                "outbox persist failed, rolling back commit"
            );
            if let Err(e) = self
                .commit
                .rollback(&request.activity_id, &request.user_id, request.qty)
                .await
            {
                // Reconciliation will repair; the synchronizer owns drift.
                error!(activity = %request.activity_id, error = %e, "rollback failed");
            }
            return AdmitResult::rejected(AdmitReason::InternalError);
        }
        self.metrics.record_emitted();

        if let Err(e) = self.quota.record(&request.user_id, request.qty).await {
            warn!(user = %request.user_id, error = %e, "day/lifetime counters not updated");
        }
        self.metrics.set_activity_stock(
            &request.activity_id,
            outcome.remaining_stock,
            activity.total_stock - outcome.remaining_stock,
        );
        // Push the live counter to keystore subscribers (dashboards, pollers).
        let update = serde_json::json!({
            "activity_id": request.activity_id,
            "current_stock": outcome.remaining_stock,
        });
        if let Err(e) = self.keystore.publish(STOCK_CHANNEL, &update.to_string()).await {
            warn!(error = %e, "stock publish failed");
        }

        info!(
            activity = %request.activity_id,
            user = %request.user_id,
            token = %record.commit_token,
            qty = request.qty,
            remaining = outcome.remaining_stock,
            "admission committed"
        );

        let result = AdmitResult {
            allowed: true,
            reason: AdmitReason::Ok,
            commit_token: Some(record.commit_token),
            remaining_stock: outcome.remaining_stock,
            remaining_user_quota: outcome.remaining_quota,
        };
        self.finish(request, result).await
    }

    /// Persist the result into the nonce dedup window, then return it.
    async fn finish(&self, request: &AdmitRequest, result: AdmitResult) -> AdmitResult {
        if let Some(nonce) = &request.client_nonce {
            let key = keys::dedup(&request.user_id, &request.activity_id, nonce);
            match serde_json::to_string(&result) {
                Ok(json) => {
                    if let Err(e) = self
                        .keystore
                        .set_ex(&key, &json, self.config.admission.dedup_ttl)
                        .await
                    {
                        warn!(key = %key, error = %e, "dedup record not stored");
                    }
                }
                Err(e) => warn!(error = %e, "dedup result not serializable"),
            }
        }
        result
    }

    async fn dedup_lookup(&self, request: &AdmitRequest) -> Option<AdmitResult> {
        let nonce = request.client_nonce.as_ref()?;
        let key = keys::dedup(&request.user_id, &request.activity_id, nonce);
        match self.keystore.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<AdmitResult>(&raw) {
                Ok(prior) => Some(prior),
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt dedup record");
                    Some(AdmitResult::rejected(AdmitReason::Duplicate))
                }
            },
            Ok(None) => None,
            Err(e) => {
                // Fail open: a dedup miss is safer than refusing admission.
                warn!(key = %key, error = %e, "dedup lookup failed");
                None
            }
        }
    }

    /// Reverse a committed admission on downstream cancellation.
    pub async fn rollback_commit(&self, commit_token: &str, reason: &str) -> Result<RollbackStatus> {
        let Some(message) = self.outbox.get(commit_token).await? else {
            return Ok(RollbackStatus::NotFound);
        };
        let OutboxPayload::Order(order) = &message.payload else {
            return Ok(RollbackStatus::NotFound);
        };

        // One reversal per token.
        let marker = format!("rollback:{}", commit_token);
        if !self
            .keystore
            .set_nx_ex(&marker, reason, self.config.outbox.message_ttl)
            .await?
        {
            return Ok(RollbackStatus::AlreadyRolledBack);
        }

        let (stock, _purchased) = self
            .commit
            .rollback(&order.activity_id, &order.user_id, order.qty)
            .await?;
        self.quota.unrecord(&order.user_id, order.qty).await?;

        let event = ReliableMessage::stock_changed(StockChanged {
            activity_id: order.activity_id.clone(),
            stock_change: order.qty,
            current_stock: stock,
            operation: StockOperation::Increase,
            source: "rollback".to_string(),
            ts: Utc::now().timestamp_millis(),
        });
        self.outbox.enqueue(&event).await?;

        info!(
            token = commit_token,
            activity = %order.activity_id,
            user = %order.user_id,
            qty = order.qty,
            reason,
            "commit rolled back"
        );
        Ok(RollbackStatus::RolledBack)
    }

    /// Stock snapshot; live counter first, database view as fallback.
    pub async fn get_stock(&self, activity_id: &str) -> Result<Option<StockView>> {
        let Some(activity) = self.activities.get(activity_id).await? else {
            return Ok(None);
        };
        let live = self
            .keystore
            .get(&keys::stock(activity_id))
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        let current_stock = live.unwrap_or_else(|| activity.remaining_stock());
        Ok(Some(StockView {
            activity_id: activity_id.to_string(),
            current_stock,
            status: activity.status,
            sold_count: (activity.total_stock - current_stock).max(0),
            total_stock: activity.total_stock,
            last_updated: activity.updated_at,
        }))
    }

    /// Dashboard view over several activities; missing ids are omitted.
    pub async fn get_batch_stock(
        &self,
        activity_ids: &[String],
    ) -> Result<HashMap<String, StockView>> {
        let mut out = HashMap::with_capacity(activity_ids.len());
        for id in activity_ids {
            if let Some(view) = self.get_stock(id).await? {
                out.insert(id.clone(), view);
            }
        }
        Ok(out)
    }

    pub async fn get_user_status(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<Option<UserStatusView>> {
        let Some(activity) = self.activities.get(activity_id).await? else {
            return Ok(None);
        };
        Ok(Some(
            self.quota
                .user_status(user_id, activity_id, activity.per_user_limit)
                .await?,
        ))
    }

    /// Prometheus text for the adapter's scrape endpoint.
    pub fn render_metrics(&self) -> String {
        self.metrics.to_prometheus()
    }
}

/// Seed an activity in both stores and activate it, the way the admin path
/// does: draft row first, then scheduled, then active (which warms stock).
pub async fn provision_activity(
    activities: &ActivityService,
    db: &SaleDb,
    mut activity: Activity,
) -> Result<Activity> {
    activity.status = ActivityStatus::Draft;
    db.upsert_activity(&activity).await?;
    activities
        .transition_status(&activity.id, ActivityStatus::Scheduled, "system", "provisioned")
        .await?;
    let activity = activities
        .transition_status(&activity.id, ActivityStatus::Active, "system", "window open")
        .await?;
    Ok(activity)
}
