use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a flash-sale activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Ended,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Draft => "draft",
            ActivityStatus::Scheduled => "scheduled",
            ActivityStatus::Active => "active",
            ActivityStatus::Paused => "paused",
            ActivityStatus::Ended => "ended",
            ActivityStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ActivityStatus::Draft),
            "scheduled" => Some(ActivityStatus::Scheduled),
            "active" => Some(ActivityStatus::Active),
            "paused" => Some(ActivityStatus::Paused),
            "ended" => Some(ActivityStatus::Ended),
            "cancelled" => Some(ActivityStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivityStatus::Ended | ActivityStatus::Cancelled)
    }

    /// Permitted transitions: draft -> scheduled -> active -> (paused <-> active)
    /// -> ended; any non-terminal state -> cancelled.
    pub fn can_transition_to(&self, to: ActivityStatus) -> bool {
        use ActivityStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Cancelled) => true,
            (Draft, Scheduled) => true,
            (Scheduled, Active) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            (Active, Ended) | (Paused, Ended) => true,
            _ => false,
        }
    }
}

/// A time-boxed sale of a product with bounded inventory.
///
/// The database row is the source of truth; the keystore holds a cached copy
/// plus the live stock counter derived from `total_stock - sold_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    pub status: ActivityStatus,
    /// Sale window, unix millis.
    pub start_time: i64,
    pub end_time: i64,
    pub total_stock: i64,
    pub sold_count: i64,
    pub price: f64,
    pub per_user_limit: i64,
    /// Bumped on every database write; used by the synchronizer.
    pub version: i64,
    pub updated_at: i64,
}

impl Activity {
    pub fn remaining_stock(&self) -> i64 {
        (self.total_stock - self.sold_count).max(0)
    }
}

/// Why an admission was (or was not) allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitReason {
    Ok,
    RateLimitGlobal,
    RateLimitIp,
    RateLimitUser,
    ActivityNotFound,
    ActivityNotActive,
    ActivityNotStarted,
    ActivityEnded,
    InsufficientStock,
    UserLimitExceeded,
    Duplicate,
    InternalError,
}

impl AdmitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmitReason::Ok => "ok",
            AdmitReason::RateLimitGlobal => "rate_limit_global",
            AdmitReason::RateLimitIp => "rate_limit_ip",
            AdmitReason::RateLimitUser => "rate_limit_user",
            AdmitReason::ActivityNotFound => "activity_not_found",
            AdmitReason::ActivityNotActive => "activity_not_active",
            AdmitReason::ActivityNotStarted => "activity_not_started",
            AdmitReason::ActivityEnded => "activity_ended",
            AdmitReason::InsufficientStock => "insufficient_stock",
            AdmitReason::UserLimitExceeded => "user_limit_exceeded",
            AdmitReason::Duplicate => "duplicate",
            AdmitReason::InternalError => "internal_error",
        }
    }
}

/// Outcome of a single admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitResult {
    pub allowed: bool,
    pub reason: AdmitReason,
    /// Present only when `allowed`.
    pub commit_token: Option<String>,
    pub remaining_stock: i64,
    pub remaining_user_quota: i64,
}

impl AdmitResult {
    pub fn rejected(reason: AdmitReason) -> Self {
        Self {
            allowed: false,
            reason,
            commit_token: None,
            remaining_stock: -1,
            remaining_user_quota: -1,
        }
    }
}

/// Durable record of a successful commit, persisted to the outbox before the
/// admission call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_token: String,
    pub activity_id: String,
    pub user_id: String,
    pub qty: i64,
    pub ts: i64,
    pub price_snapshot: f64,
}

/// Generate a sortable, unique commit token: millisecond timestamp prefix
/// (12 hex digits) followed by a random v4 suffix. Lexicographic order equals
/// commit-time order at millisecond granularity.
pub fn new_commit_token() -> String {
    let ts = Utc::now().timestamp_millis().max(0) as u64;
    format!("{:012x}{}", ts, Uuid::new_v4().simple())
}

/// Stock snapshot returned by the read API; may be briefly stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockView {
    pub activity_id: String,
    pub current_stock: i64,
    pub status: ActivityStatus,
    pub sold_count: i64,
    pub total_stock: i64,
    pub last_updated: i64,
}

/// Per-user purchase snapshot across the three quota scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatusView {
    pub user_id: String,
    pub activity_id: String,
    pub purchased: i64,
    pub remaining_quota: i64,
    pub daily_purchased: i64,
    pub global_purchased: i64,
}

/// One entry in an activity's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ActivityStatus,
    pub to: ActivityStatus,
    pub reason: String,
    pub ts: i64,
    pub operator: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ActivityStatus::*;
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Ended));
        assert!(Paused.can_transition_to(Cancelled));

        // No skipping ahead, no leaving terminal states.
        assert!(!Draft.can_transition_to(Active));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Scheduled));
        assert!(!Ended.can_transition_to(Cancelled));
    }

    #[test]
    fn test_commit_tokens_sort_by_time() {
        let a = new_commit_token();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let b = new_commit_token();
        assert!(a < b);
        assert_eq!(a.len(), 12 + 32);
    }

    #[test]
    fn test_reason_round_trip() {
        let json = serde_json::to_string(&AdmitReason::RateLimitIp).unwrap();
        assert_eq!(json, "\"rate_limit_ip\"");
        let back: AdmitReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AdmitReason::RateLimitIp);
    }
}
