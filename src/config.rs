//! Engine Configuration
//!
//! Nested per-component config structs with production defaults, plus
//! environment overrides applied by `EngineConfig::from_env()`.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level configuration for the flash-sale engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Coordination keystore URL (redis://...).
    pub keystore_url: String,
    /// Source-of-truth database path.
    pub db_path: String,
    /// Downstream event broker URL.
    pub broker_url: String,

    pub rate_limit: RateLimitConfig,
    pub validator: ValidatorConfig,
    pub quota: QuotaConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub outbox: OutboxConfig,
    pub breaker: BreakerConfig,
    pub metrics: MetricsConfig,
    pub alerts: AlertThresholds,
    pub admission: AdmissionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keystore_url: "redis://127.0.0.1:6379".into(),
            db_path: "./flashsale.db".into(),
            broker_url: "http://127.0.0.1:15680/publish".into(),
            rate_limit: RateLimitConfig::default(),
            validator: ValidatorConfig::default(),
            quota: QuotaConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
            outbox: OutboxConfig::default(),
            breaker: BreakerConfig::default(),
            metrics: MetricsConfig::default(),
            alerts: AlertThresholds::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build from defaults with environment overrides. `.env` is loaded by the
    /// binary before this runs.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("KEYSTORE_URL") {
            cfg.keystore_url = v;
        }
        if let Ok(v) = env::var("DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("BROKER_URL") {
            cfg.broker_url = v;
        }

        if let Some(v) = env_u64("GLOBAL_BUCKET_CAPACITY") {
            cfg.rate_limit.global.capacity = v;
        }
        if let Some(v) = env_f64("GLOBAL_BUCKET_REFILL") {
            cfg.rate_limit.global.refill_per_second = v;
        }
        if let Some(v) = env_u64("IP_BUCKET_CAPACITY") {
            cfg.rate_limit.ip.capacity = v;
        }
        if let Some(v) = env_f64("IP_BUCKET_REFILL") {
            cfg.rate_limit.ip.refill_per_second = v;
        }
        if let Some(v) = env_u64("USER_BUCKET_CAPACITY") {
            cfg.rate_limit.user.capacity = v;
        }
        if let Some(v) = env_f64("USER_BUCKET_REFILL") {
            cfg.rate_limit.user.refill_per_second = v;
        }

        if let Some(v) = env_u64("SYNC_INTERVAL_SECS") {
            cfg.sync.interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SYNC_BATCH_SIZE") {
            cfg.sync.batch_size = v as usize;
        }
        if let Ok(v) = env::var("SYNC_POLICY") {
            if let Some(p) = SyncPolicy::parse(&v) {
                cfg.sync.policy = p;
            }
        }

        if let Some(v) = env_u64("OUTBOX_MAX_RETRIES") {
            cfg.outbox.max_retries = v as u32;
        }
        if let Some(v) = env_u64("OUTBOX_BATCH_SIZE") {
            cfg.outbox.batch_size = v as usize;
        }

        if let Some(v) = env_u64("ADMIT_DEADLINE_MS") {
            cfg.admission.deadline = Duration::from_millis(v);
        }

        cfg
    }
}

fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_f64(var: &str) -> Option<f64> {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
}

/// A single token bucket's shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u64,
    pub refill_per_second: f64,
}

/// Rate limiter configuration across the three levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global bucket, one per activity.
    pub global: BucketConfig,
    /// Per client IP.
    pub ip: BucketConfig,
    /// Per user id.
    pub user: BucketConfig,
    /// Buckets unreferenced for this long are evicted.
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig {
                capacity: 1000,
                refill_per_second: 1000.0,
            },
            ip: BucketConfig {
                capacity: 10,
                refill_per_second: 1.0,
            },
            user: BucketConfig {
                capacity: 1,
                refill_per_second: 1.0,
            },
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Activity validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Cached activity record TTL.
    pub cache_timeout: Duration,
    /// Clock-skew absorption before `start_time`.
    pub time_buffer_ms: i64,
    /// Keystore key lifetime past activity end (status, stock, user limits).
    pub grace: Duration,
    /// Status history retention past activity end.
    pub retention: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_secs(300),
            time_buffer_ms: 30_000,
            grace: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// User quota ceilings beyond the per-activity limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Units a user may commit per calendar day, all activities combined.
    pub daily_limit: i64,
    /// Units a user may commit over the lifetime counter's window.
    pub lifetime_limit: i64,
    /// Lifetime counter TTL.
    pub lifetime_ttl: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10,
            lifetime_limit: 100,
            lifetime_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Conflict resolution for stock reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Keystore is authoritative; write its value to the database.
    RedisPriority,
    /// Database is authoritative; overwrite the keystore.
    DbPriority,
    /// Take min(keystore, database) and write both. Never over-sells.
    Merge,
}

impl SyncPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redis_priority" => Some(SyncPolicy::RedisPriority),
            "db_priority" => Some(SyncPolicy::DbPriority),
            "merge" => Some(SyncPolicy::Merge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::RedisPriority => "redis_priority",
            SyncPolicy::DbPriority => "db_priority",
            SyncPolicy::Merge => "merge",
        }
    }
}

/// Stock synchronizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub policy: SyncPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 50,
            policy: SyncPolicy::Merge,
        }
    }
}

/// Cache update strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Synchronous database + cache write; either failure fails the operation.
    WriteThrough,
    /// Cache immediately, database write deferred; failures re-driven.
    WriteBehind,
    /// Background refresh when remaining TTL drops below the threshold.
    RefreshAhead,
}

/// Cache updater and consistency validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Refresh when remaining TTL < threshold * default_ttl.
    pub refresh_threshold: f64,
    pub default_ttl: Duration,
    /// Consistency validation cadence.
    pub check_interval: Duration,
    /// Keys sampled per validation pass.
    pub sample_size: usize,
    pub repair_enabled: bool,
    pub max_repair_retries: u32,
    /// Alert when consistency rate falls below this.
    pub alert_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::WriteThrough,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            refresh_threshold: 0.2,
            default_ttl: Duration::from_secs(300),
            check_interval: Duration::from_secs(300),
            sample_size: 50,
            repair_enabled: true,
            max_repair_retries: 3,
            alert_threshold: 0.95,
        }
    }
}

/// Reliable outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Message record TTL in the keystore.
    pub message_ttl: Duration,
    /// First retry delay.
    pub retry_base: Duration,
    /// Exponential backoff multiplier.
    pub backoff: f64,
    /// Jitter fraction applied to each delay (+/-).
    pub jitter: f64,
    pub max_retries: u32,
    pub batch_size: usize,
    pub process_interval: Duration,
    /// In-flight messages older than this are reset to retry_pending.
    pub in_flight_timeout: Duration,
    pub dead_letter_ttl: Duration,
    /// Backlog above backpressure_factor * batch_size tightens admission.
    pub backpressure_factor: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(7 * 24 * 3600),
            retry_base: Duration::from_secs(1),
            backoff: 2.0,
            jitter: 0.2,
            max_retries: 3,
            batch_size: 100,
            process_interval: Duration::from_secs(1),
            in_flight_timeout: Duration::from_secs(30),
            dead_letter_ttl: Duration::from_secs(7 * 24 * 3600),
            backpressure_factor: 10,
        }
    }
}

/// Circuit breaker around broker dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Open duration before a half-open trial.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(5),
        }
    }
}

/// Metrics collection cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub collect_interval: Duration,
    pub retention: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Threshold-driven alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Warn when cache hit rate drops below this.
    pub low_hit_rate: f64,
    /// Error when operation error rate exceeds this.
    pub high_error_rate: f64,
    /// Warn when a tracked activity's stock falls to this or below.
    pub low_stock: i64,
    /// Warn when average operation latency exceeds this.
    pub high_latency_ms: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            low_hit_rate: 0.80,
            high_error_rate: 0.05,
            low_stock: 10,
            high_latency_ms: 100.0,
        }
    }
}

/// Admission facade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Wall-clock budget for one admission.
    pub deadline: Duration,
    /// Client nonce dedup window.
    pub dedup_ttl: Duration,
    /// Drain budget for worker loops on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(500),
            dedup_ttl: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rate_limit.global.capacity, 1000);
        assert_eq!(cfg.rate_limit.ip.capacity, 10);
        assert_eq!(cfg.rate_limit.user.capacity, 1);
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.policy, SyncPolicy::Merge);
        assert_eq!(cfg.outbox.max_retries, 3);
        assert_eq!(cfg.outbox.batch_size, 100);
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.admission.deadline, Duration::from_millis(500));
        assert!((cfg.alerts.low_hit_rate - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sync_policy_parse() {
        assert_eq!(SyncPolicy::parse("merge"), Some(SyncPolicy::Merge));
        assert_eq!(
            SyncPolicy::parse("redis_priority"),
            Some(SyncPolicy::RedisPriority)
        );
        assert_eq!(SyncPolicy::parse("bogus"), None);
    }
}
