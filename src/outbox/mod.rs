//! Reliable Outbox
//!
//! Durable, retrying emitter of downstream events. Messages survive emitter
//! crashes: they are persisted to the keystore before the producing call
//! returns and re-driven by the worker until acked or dead-lettered.

mod dispatcher;
mod store;
mod worker;

pub use dispatcher::{
    ChannelBroker, CircuitState, DefaultClassifier, Dispatcher, ErrorClass, ErrorClassifier,
    EventBroker, HttpBroker, PublishError, PublishedEvent,
};
pub use store::{OutboxStats, OutboxStore};
pub use worker::OutboxWorker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::CommitRecord;

pub const TOPIC_ORDER: &str = "seckill.order";
pub const ROUTING_ORDER_COMMITTED: &str = "order.committed";
pub const TOPIC_STOCK: &str = "seckill.stock";
pub const ROUTING_STOCK_CHANGED: &str = "stock.changed";
pub const TOPIC_EMAIL: &str = "seckill.email";
pub const ROUTING_EMAIL_SEND: &str = "email.send";

/// Direction of a stock change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockOperation {
    Decrease,
    Increase,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCommitted {
    pub commit_token: String,
    pub activity_id: String,
    pub user_id: String,
    pub qty: i64,
    pub price_snapshot: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockChanged {
    pub activity_id: String,
    pub stock_change: i64,
    pub current_stock: i64,
    pub operation: StockOperation,
    pub source: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotification {
    pub recipients: Vec<String>,
    pub template_id: String,
    pub data: HashMap<String, String>,
    pub priority: String,
    pub ts: i64,
}

/// The heterogeneous message content, tagged per event family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxPayload {
    Order(OrderCommitted),
    StockSync(StockChanged),
    Email(EmailNotification),
}

/// Outbox message lifecycle.
///
/// pending -> in_flight -> ack, or back through retry_pending until the
/// attempt budget runs out and the message goes dead. Terminal states never
/// revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InFlight,
    Ack,
    RetryPending,
    Dead,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Ack | MessageStatus::Dead)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableMessage {
    pub id: String,
    pub topic: String,
    pub routing_key: String,
    pub payload: OutboxPayload,
    pub status: MessageStatus,
    pub attempts: u32,
    /// Unix millis when the message is next due for dispatch.
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_error: Option<String>,
}

impl ReliableMessage {
    fn new(id: String, topic: &str, routing_key: &str, payload: OutboxPayload) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            status: MessageStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Order message: the commit token is the message id, so a retried
    /// admission cannot enqueue the same commit twice.
    pub fn order(record: &CommitRecord) -> Self {
        Self::new(
            record.commit_token.clone(),
            TOPIC_ORDER,
            ROUTING_ORDER_COMMITTED,
            OutboxPayload::Order(OrderCommitted {
                commit_token: record.commit_token.clone(),
                activity_id: record.activity_id.clone(),
                user_id: record.user_id.clone(),
                qty: record.qty,
                price_snapshot: record.price_snapshot,
                ts: record.ts,
            }),
        )
    }

    pub fn stock_changed(event: StockChanged) -> Self {
        Self::new(
            Uuid::new_v4().simple().to_string(),
            TOPIC_STOCK,
            ROUTING_STOCK_CHANGED,
            OutboxPayload::StockSync(event),
        )
    }

    pub fn email(notification: EmailNotification) -> Self {
        Self::new(
            Uuid::new_v4().simple().to_string(),
            TOPIC_EMAIL,
            ROUTING_EMAIL_SEND,
            OutboxPayload::Email(notification),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_message_id_is_commit_token() {
        let record = CommitRecord {
            commit_token: "tok123".into(),
            activity_id: "act1".into(),
            user_id: "u1".into(),
            qty: 1,
            ts: 1,
            price_snapshot: 9.9,
        };
        let message = ReliableMessage::order(&record);
        assert_eq!(message.id, "tok123");
        assert_eq!(message.topic, TOPIC_ORDER);
        assert_eq!(message.routing_key, ROUTING_ORDER_COMMITTED);
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[test]
    fn test_payload_tagged_serialization() {
        let message = ReliableMessage::stock_changed(StockChanged {
            activity_id: "act1".into(),
            stock_change: -2,
            current_stock: 8,
            operation: StockOperation::Decrease,
            source: "commit".into(),
            ts: 5,
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"kind\":\"stock_sync\""));
        assert!(json.contains("\"operation\":\"decrease\""));

        let back: ReliableMessage = serde_json::from_str(&json).unwrap();
        match back.payload {
            OutboxPayload::StockSync(event) => assert_eq!(event.current_stock, 8),
            other => panic!("wrong payload {:?}", other),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(MessageStatus::Ack.is_terminal());
        assert!(MessageStatus::Dead.is_terminal());
        assert!(!MessageStatus::RetryPending.is_terminal());
    }
}
