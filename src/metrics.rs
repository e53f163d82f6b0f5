//! Metrics Aggregator
//!
//! Process-wide counters, per-activity gauges, and rolling latency stats,
//! plus the threshold-driven alert evaluation. Exact counters use atomic
//! adds; gauge maps may be read slightly stale.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::AlertThresholds;
use crate::models::AdmitReason;
use crate::outbox::{EmailNotification, OutboxStore, ReliableMessage};

/// Decay factor for the "recent" latency mean.
const RECENT_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct LatencyStats {
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
    /// Exponentially decaying mean of recent observations.
    recent_ms: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub recent_ms: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ActivityGauges {
    current_stock: i64,
    sold_count: i64,
    request_rate: f64,
}

#[derive(Default)]
pub struct MetricsRegistry {
    // Cache family.
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_sets: AtomicU64,
    pub cache_deletes: AtomicU64,
    pub cache_errors: AtomicU64,

    // Admission family.
    admitted: AtomicU64,
    committed: AtomicU64,
    emitted: AtomicU64,
    rejected: RwLock<HashMap<&'static str, u64>>,

    // Per-activity gauges.
    activities: RwLock<HashMap<String, ActivityGauges>>,
    /// Cumulative per-activity request counts; the collector turns deltas
    /// into the request_rate gauge.
    requests: RwLock<HashMap<String, u64>>,

    // Outbox.
    outbox_outstanding: AtomicU64,
    outbox_dead: AtomicU64,

    latency: Mutex<LatencyStats>,
    consistency_rate: Mutex<f64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        *registry.consistency_rate.lock() = 1.0;
        registry
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_set(&self) {
        self.cache_sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_delete(&self) {
        self.cache_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one admission.
    pub fn record_admission(&self, activity_id: &str, reason: AdmitReason) {
        *self
            .requests
            .write()
            .entry(activity_id.to_string())
            .or_insert(0) += 1;
        if reason == AdmitReason::Ok {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            *self.rejected.write().entry(reason.as_str()).or_insert(0) += 1;
        }
    }

    /// Commit made it into the outbox.
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, ms: f64) {
        let mut stats = self.latency.lock();
        stats.count += 1;
        stats.sum_ms += ms;
        if stats.count == 1 {
            stats.min_ms = ms;
            stats.max_ms = ms;
            stats.recent_ms = ms;
        } else {
            stats.min_ms = stats.min_ms.min(ms);
            stats.max_ms = stats.max_ms.max(ms);
            stats.recent_ms = stats.recent_ms * (1.0 - RECENT_ALPHA) + ms * RECENT_ALPHA;
        }
    }

    pub fn latency(&self) -> LatencySnapshot {
        let stats = self.latency.lock();
        LatencySnapshot {
            count: stats.count,
            avg_ms: if stats.count > 0 {
                stats.sum_ms / stats.count as f64
            } else {
                0.0
            },
            min_ms: stats.min_ms,
            max_ms: stats.max_ms,
            recent_ms: stats.recent_ms,
        }
    }

    pub fn set_activity_stock(&self, activity_id: &str, current_stock: i64, sold_count: i64) {
        let mut map = self.activities.write();
        let gauges = map.entry(activity_id.to_string()).or_default();
        gauges.current_stock = current_stock;
        gauges.sold_count = sold_count;
    }

    pub fn set_request_rate(&self, activity_id: &str, rate: f64) {
        let mut map = self.activities.write();
        map.entry(activity_id.to_string()).or_default().request_rate = rate;
    }

    /// Cumulative request count for an activity, for rate computation.
    pub fn request_count(&self, activity_id: &str) -> u64 {
        self.requests.read().get(activity_id).copied().unwrap_or(0)
    }

    /// Snapshot of all cumulative request counters.
    pub fn request_counts(&self) -> HashMap<String, u64> {
        self.requests.read().clone()
    }

    pub fn set_outbox_depth(&self, outstanding: u64, dead: u64) {
        self.outbox_outstanding.store(outstanding, Ordering::Relaxed);
        self.outbox_dead.store(dead, Ordering::Relaxed);
    }

    pub fn outbox_outstanding(&self) -> u64 {
        self.outbox_outstanding.load(Ordering::Relaxed)
    }

    pub fn set_consistency_rate(&self, rate: f64) {
        *self.consistency_rate.lock() = rate;
    }

    pub fn rejected_count(&self, reason: AdmitReason) -> u64 {
        self.rejected
            .read()
            .get(reason.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Evaluate alert thresholds against current readings.
    pub fn evaluate_alerts(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let ts = Utc::now().timestamp_millis();

        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        if lookups >= 100 {
            let hit_rate = hits as f64 / lookups as f64;
            if hit_rate < thresholds.low_hit_rate {
                alerts.push(Alert {
                    kind: AlertKind::LowHitRate,
                    level: AlertLevel::Warning,
                    message: format!("cache hit rate {:.2} below threshold", hit_rate),
                    value: hit_rate,
                    threshold: thresholds.low_hit_rate,
                    ts,
                });
            }
        }

        let errors = self.cache_errors.load(Ordering::Relaxed);
        let ops = lookups
            + self.cache_sets.load(Ordering::Relaxed)
            + self.cache_deletes.load(Ordering::Relaxed);
        if ops >= 100 {
            let error_rate = errors as f64 / ops as f64;
            if error_rate > thresholds.high_error_rate {
                alerts.push(Alert {
                    kind: AlertKind::HighErrorRate,
                    level: AlertLevel::Error,
                    message: format!("operation error rate {:.3} above threshold", error_rate),
                    value: error_rate,
                    threshold: thresholds.high_error_rate,
                    ts,
                });
            }
        }

        let latency = self.latency();
        if latency.count > 0 && latency.recent_ms > thresholds.high_latency_ms {
            alerts.push(Alert {
                kind: AlertKind::HighLatency,
                level: AlertLevel::Warning,
                message: format!("recent admission latency {:.1}ms above threshold", latency.recent_ms),
                value: latency.recent_ms,
                threshold: thresholds.high_latency_ms,
                ts,
            });
        }

        for (activity_id, gauges) in self.activities.read().iter() {
            if gauges.current_stock >= 0 && gauges.current_stock <= thresholds.low_stock {
                alerts.push(Alert {
                    kind: AlertKind::LowStock,
                    level: AlertLevel::Warning,
                    message: format!(
                        "activity {} stock down to {}",
                        activity_id, gauges.current_stock
                    ),
                    value: gauges.current_stock as f64,
                    threshold: thresholds.low_stock as f64,
                    ts,
                });
            }
        }

        alerts
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP flashsale_cache_ops_total Cache operations by kind\n");
        output.push_str("# TYPE flashsale_cache_ops_total counter\n");
        for (kind, counter) in [
            ("hit", &self.cache_hits),
            ("miss", &self.cache_misses),
            ("set", &self.cache_sets),
            ("delete", &self.cache_deletes),
            ("error", &self.cache_errors),
        ] {
            output.push_str(&format!(
                "flashsale_cache_ops_total{{kind=\"{}\"}} {}\n",
                kind,
                counter.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP flashsale_admitted_total Admissions allowed\n");
        output.push_str("# TYPE flashsale_admitted_total counter\n");
        output.push_str(&format!(
            "flashsale_admitted_total {}\n",
            self.admitted.load(Ordering::Relaxed)
        ));
        output.push_str("\n# HELP flashsale_emitted_total Commits persisted to the outbox\n");
        output.push_str("# TYPE flashsale_emitted_total counter\n");
        output.push_str(&format!(
            "flashsale_emitted_total {}\n",
            self.emitted.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP flashsale_rejected_total Admissions rejected by reason\n");
        output.push_str("# TYPE flashsale_rejected_total counter\n");
        for (reason, count) in self.rejected.read().iter() {
            output.push_str(&format!(
                "flashsale_rejected_total{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }

        output.push_str("\n# HELP flashsale_activity_stock Current live stock\n");
        output.push_str("# TYPE flashsale_activity_stock gauge\n");
        for (activity_id, gauges) in self.activities.read().iter() {
            output.push_str(&format!(
                "flashsale_activity_stock{{activity=\"{}\"}} {}\n",
                activity_id, gauges.current_stock
            ));
            output.push_str(&format!(
                "flashsale_activity_sold{{activity=\"{}\"}} {}\n",
                activity_id, gauges.sold_count
            ));
            output.push_str(&format!(
                "flashsale_activity_request_rate{{activity=\"{}\"}} {:.2}\n",
                activity_id, gauges.request_rate
            ));
        }

        output.push_str("\n# HELP flashsale_outbox_outstanding Messages pending or in flight\n");
        output.push_str("# TYPE flashsale_outbox_outstanding gauge\n");
        output.push_str(&format!(
            "flashsale_outbox_outstanding {}\n",
            self.outbox_outstanding.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "flashsale_outbox_dead {}\n",
            self.outbox_dead.load(Ordering::Relaxed)
        ));

        let latency = self.latency();
        output.push_str("\n# HELP flashsale_admit_latency_ms Admission latency\n");
        output.push_str("# TYPE flashsale_admit_latency_ms gauge\n");
        output.push_str(&format!(
            "flashsale_admit_latency_ms{{stat=\"avg\"}} {:.3}\n",
            latency.avg_ms
        ));
        output.push_str(&format!(
            "flashsale_admit_latency_ms{{stat=\"min\"}} {:.3}\n",
            latency.min_ms
        ));
        output.push_str(&format!(
            "flashsale_admit_latency_ms{{stat=\"max\"}} {:.3}\n",
            latency.max_ms
        ));
        output.push_str(&format!(
            "flashsale_admit_latency_ms{{stat=\"recent\"}} {:.3}\n",
            latency.recent_ms
        ));

        output.push_str(&format!(
            "\nflashsale_consistency_rate {:.4}\n",
            *self.consistency_rate.lock()
        ));

        output
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowHitRate,
    HighErrorRate,
    HighLatency,
    LowStock,
    LowConsistency,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LowHitRate => "low_hit_rate",
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::HighLatency => "high_latency",
            AlertKind::LowStock => "low_stock",
            AlertKind::LowConsistency => "low_consistency",
        }
    }
}

/// A threshold crossing, emitted through the notification outbox family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub ts: i64,
}

/// Render an alert as a payload for the notification outbox family.
pub fn alert_notification(alert: &Alert) -> EmailNotification {
    let mut data = HashMap::new();
    data.insert("kind".to_string(), alert.kind.as_str().to_string());
    data.insert("message".to_string(), alert.message.clone());
    data.insert("value".to_string(), format!("{:.4}", alert.value));
    data.insert("threshold".to_string(), format!("{:.4}", alert.threshold));
    EmailNotification {
        recipients: vec!["ops".to_string()],
        template_id: "engine_alert".to_string(),
        data,
        priority: match alert.level {
            AlertLevel::Warning => "normal".to_string(),
            AlertLevel::Error | AlertLevel::Critical => "high".to_string(),
        },
        ts: alert.ts,
    }
}

/// Periodic collector: refreshes per-activity request-rate gauges and emits
/// threshold alerts through the outbox, with a per-kind cooldown so a
/// persistent condition does not flood the notification topic.
pub async fn run_collector(
    registry: Arc<MetricsRegistry>,
    thresholds: AlertThresholds,
    collect_interval: Duration,
    outbox: Arc<OutboxStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    const ALERT_COOLDOWN: Duration = Duration::from_secs(300);

    let mut previous_counts: HashMap<String, u64> = HashMap::new();
    let mut last_alert: HashMap<&'static str, Instant> = HashMap::new();
    let mut ticker = interval(collect_interval);
    info!("metrics collector started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let counts = registry.request_counts();
                let secs = collect_interval.as_secs_f64().max(1e-9);
                for (activity_id, count) in &counts {
                    let prev = previous_counts.get(activity_id).copied().unwrap_or(0);
                    registry.set_request_rate(activity_id, (count - prev) as f64 / secs);
                }
                previous_counts = counts;

                for alert in registry.evaluate_alerts(&thresholds) {
                    let due = last_alert
                        .get(alert.kind.as_str())
                        .map(|at| at.elapsed() >= ALERT_COOLDOWN)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    last_alert.insert(alert.kind.as_str(), Instant::now());
                    warn!(kind = alert.kind.as_str(), message = %alert.message, "alert raised");
                    let message = ReliableMessage::email(alert_notification(&alert));
                    if let Err(e) = outbox.enqueue(&message).await {
                        error!(error = %e, "alert enqueue failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("metrics collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_rolling_stats() {
        let registry = MetricsRegistry::new();
        registry.record_latency_ms(10.0);
        registry.record_latency_ms(30.0);
        registry.record_latency_ms(20.0);

        let snapshot = registry.latency();
        assert_eq!(snapshot.count, 3);
        assert!((snapshot.avg_ms - 20.0).abs() < 1e-9);
        assert!((snapshot.min_ms - 10.0).abs() < 1e-9);
        assert!((snapshot.max_ms - 30.0).abs() < 1e-9);
        assert!(snapshot.recent_ms > 10.0 && snapshot.recent_ms < 30.0);
    }

    #[test]
    fn test_low_stock_alert() {
        let registry = MetricsRegistry::new();
        registry.set_activity_stock("act1", 5, 95);
        registry.set_activity_stock("act2", 500, 0);

        let alerts = registry.evaluate_alerts(&AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowStock);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert!(alerts[0].message.contains("act1"));
    }

    #[test]
    fn test_hit_rate_alert_needs_volume() {
        let registry = MetricsRegistry::new();
        // Below the volume floor: no alert even at 0% hit rate.
        for _ in 0..50 {
            registry.record_cache_miss();
        }
        assert!(registry
            .evaluate_alerts(&AlertThresholds::default())
            .is_empty());

        for _ in 0..50 {
            registry.record_cache_miss();
        }
        let alerts = registry.evaluate_alerts(&AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowHitRate);
    }

    #[test]
    fn test_admission_counters() {
        let registry = MetricsRegistry::new();
        registry.record_admission("act1", AdmitReason::Ok);
        registry.record_admission("act1", AdmitReason::InsufficientStock);
        registry.record_admission("act1", AdmitReason::RateLimitIp);

        assert_eq!(registry.admitted_count(), 1);
        assert_eq!(registry.rejected_count(AdmitReason::InsufficientStock), 1);
        assert_eq!(registry.rejected_count(AdmitReason::RateLimitIp), 1);
        assert_eq!(registry.request_count("act1"), 3);
    }

    #[test]
    fn test_prometheus_render() {
        let registry = MetricsRegistry::new();
        registry.record_cache_hit();
        registry.record_admission("act1", AdmitReason::Ok);
        registry.set_activity_stock("act1", 42, 8);
        registry.set_outbox_depth(3, 1);

        let output = registry.to_prometheus();
        assert!(output.contains("flashsale_cache_ops_total{kind=\"hit\"} 1"));
        assert!(output.contains("flashsale_admitted_total 1"));
        assert!(output.contains("flashsale_activity_stock{activity=\"act1\"} 42"));
        assert!(output.contains("flashsale_outbox_outstanding 3"));
    }
}
