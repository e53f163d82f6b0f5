//! Multi-Level Rate Limiter
//!
//! Composes three bucket families (per-activity global, per-IP, per-user) and
//! reports the first level that rejects. Tokens are only spent when every
//! level allows; a rejection refunds the levels already charged.

mod bucket;

pub use bucket::TokenBucket;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BucketConfig, RateLimitConfig};

/// The level at which a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLevel {
    Global,
    Ip,
    User,
}

impl LimitLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLevel::Global => "global",
            LimitLevel::Ip => "ip",
            LimitLevel::User => "user",
        }
    }
}

/// Outcome of a limiter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Rejected(LimitLevel),
}

impl LimitDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

pub struct MultiLevelRateLimiter {
    config: RwLock<RateLimitConfig>,
    global: RwLock<HashMap<String, Arc<TokenBucket>>>,
    ip: RwLock<HashMap<String, Arc<TokenBucket>>>,
    user: RwLock<HashMap<String, Arc<TokenBucket>>>,
    /// Backpressure flag: halves global capacity while set.
    pressured: AtomicBool,
}

impl MultiLevelRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            global: RwLock::new(HashMap::new()),
            ip: RwLock::new(HashMap::new()),
            user: RwLock::new(HashMap::new()),
            pressured: AtomicBool::new(false),
        }
    }

    /// Evaluate global -> IP -> user; deduct one token from each only when
    /// all three allow.
    pub fn allow(&self, activity_id: &str, ip: &str, user_id: &str) -> LimitDecision {
        let global = self.bucket(LimitLevel::Global, activity_id);
        if !global.allow(1) {
            return LimitDecision::Rejected(LimitLevel::Global);
        }
        let ip_bucket = self.bucket(LimitLevel::Ip, ip);
        if !ip_bucket.allow(1) {
            global.refund(1);
            return LimitDecision::Rejected(LimitLevel::Ip);
        }
        let user_bucket = self.bucket(LimitLevel::User, user_id);
        if !user_bucket.allow(1) {
            global.refund(1);
            ip_bucket.refund(1);
            return LimitDecision::Rejected(LimitLevel::User);
        }
        LimitDecision::Allowed
    }

    /// Control-plane reconfiguration; existing buckets adopt the new shape
    /// immediately, with truncation on capacity decrease.
    pub fn update_config(&self, level: LimitLevel, config: BucketConfig) {
        {
            let mut cfg = self.config.write();
            match level {
                LimitLevel::Global => cfg.global = config,
                LimitLevel::Ip => cfg.ip = config,
                LimitLevel::User => cfg.user = config,
            }
        }
        let effective = match level {
            LimitLevel::Global => self.effective_global(),
            _ => config,
        };
        for bucket in self.family(level).read().values() {
            bucket.reconfigure(effective);
        }
        info!(
            level = level.as_str(),
            capacity = config.capacity,
            refill = config.refill_per_second,
            "rate limit reconfigured"
        );
    }

    /// Engage or release the backpressure clamp on the global family.
    pub fn set_pressure(&self, on: bool) {
        if self.pressured.swap(on, Ordering::SeqCst) == on {
            return;
        }
        let effective = self.effective_global();
        for bucket in self.global.read().values() {
            bucket.reconfigure(effective);
        }
        info!(pressured = on, "global rate limit pressure changed");
    }

    pub fn is_pressured(&self) -> bool {
        self.pressured.load(Ordering::SeqCst)
    }

    /// Evict buckets idle past the configured timeout. Re-created buckets
    /// start full.
    pub fn gc(&self) {
        let idle_timeout = self.config.read().idle_timeout;
        let mut evicted = 0usize;
        for level in [LimitLevel::Global, LimitLevel::Ip, LimitLevel::User] {
            let mut family = self.family(level).write();
            let before = family.len();
            family.retain(|_, bucket| bucket.idle_for() < idle_timeout);
            evicted += before - family.len();
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit buckets");
        }
    }

    /// Live bucket count across all families.
    pub fn bucket_count(&self) -> usize {
        self.global.read().len() + self.ip.read().len() + self.user.read().len()
    }

    fn family(&self, level: LimitLevel) -> &RwLock<HashMap<String, Arc<TokenBucket>>> {
        match level {
            LimitLevel::Global => &self.global,
            LimitLevel::Ip => &self.ip,
            LimitLevel::User => &self.user,
        }
    }

    fn level_config(&self, level: LimitLevel) -> BucketConfig {
        match level {
            LimitLevel::Global => self.effective_global(),
            LimitLevel::Ip => self.config.read().ip,
            LimitLevel::User => self.config.read().user,
        }
    }

    fn effective_global(&self) -> BucketConfig {
        let mut cfg = self.config.read().global;
        if self.pressured.load(Ordering::SeqCst) {
            cfg.capacity = (cfg.capacity / 2).max(1);
        }
        cfg
    }

    fn bucket(&self, level: LimitLevel, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.family(level).read().get(key) {
            return bucket.clone();
        }
        let config = self.level_config(level);
        let mut family = self.family(level).write();
        family
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(config)))
            .clone()
    }
}
