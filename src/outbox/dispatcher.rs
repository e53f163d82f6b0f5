//! Broker dispatch with error classification and a circuit breaker.
//!
//! The breaker opens after consecutive failures and half-opens after the
//! reset timeout; while open, dispatch fails fast with a transient error and
//! the retry queue absorbs the load.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

use super::ReliableMessage;

/// Broker publish failure. `status` carries the broker's response code when
/// one was received.
#[derive(Debug, Clone)]
pub struct PublishError {
    pub status: Option<u16>,
    pub message: String,
}

impl PublishError {
    pub fn io(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "broker rejected ({}): {}", code, self.message),
            None => write!(f, "broker unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Policy deciding whether a failed dispatch is retryable.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &PublishError) -> ErrorClass;
}

/// Default policy: a 4xx broker response is a terminal rejection, anything
/// else (I/O, timeout, 5xx) is transient.
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &PublishError) -> ErrorClass {
        match error.status {
            Some(code) if (400..500).contains(&code) => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }
}

/// Downstream event broker seam.
#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), PublishError>;
}

/// HTTP broker adapter: JSON POST per event.
pub struct HttpBroker {
    client: reqwest::Client,
    url: String,
}

impl HttpBroker {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl EventBroker for HttpBroker {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), PublishError> {
        let body = json!({
            "topic": topic,
            "routing_key": routing_key,
            "payload": payload,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::io(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(PublishError::rejected(status.as_u16(), detail))
    }
}

/// A published event as seen by an in-process consumer.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub topic: String,
    pub routing_key: String,
    pub payload: String,
}

/// In-process broker over an mpsc channel. Tests can arm it to fail the next
/// N publishes.
pub struct ChannelBroker {
    tx: mpsc::UnboundedSender<PublishedEvent>,
    fail_next: AtomicU32,
}

impl ChannelBroker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                fail_next: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBroker for ChannelBroker {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), PublishError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PublishError::io("injected failure"));
        }
        self.tx
            .send(PublishedEvent {
                topic: topic.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_string(),
            })
            .map_err(|_| PublishError::io("consumer dropped"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Acked,
    Failed { error: String, class: ErrorClass },
}

pub struct Dispatcher {
    broker: Arc<dyn EventBroker>,
    classifier: Arc<dyn ErrorClassifier>,
    breaker: Mutex<CircuitBreaker>,
    config: BreakerConfig,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn EventBroker>,
        classifier: Arc<dyn ErrorClassifier>,
        config: BreakerConfig,
    ) -> Self {
        Self {
            broker,
            classifier,
            breaker: Mutex::new(CircuitBreaker::new()),
            config,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state
    }

    /// Publish one message through the breaker.
    pub async fn dispatch(&self, message: &ReliableMessage) -> DispatchOutcome {
        if !self.allow_request() {
            debug!(message = %message.id, "dispatch short-circuited, breaker open");
            return DispatchOutcome::Failed {
                error: "circuit breaker open".to_string(),
                class: ErrorClass::Transient,
            };
        }

        let payload = match serde_json::to_string(&message.payload) {
            Ok(p) => p,
            Err(e) => {
                // Unserializable payload can never succeed.
                return DispatchOutcome::Failed {
                    error: format!("serialize payload: {}", e),
                    class: ErrorClass::Permanent,
                };
            }
        };

        match self
            .broker
            .publish(&message.topic, &message.routing_key, &payload)
            .await
        {
            Ok(()) => {
                self.on_success();
                DispatchOutcome::Acked
            }
            Err(e) => {
                let class = self.classifier.classify(&e);
                // Permanent rejections say nothing about broker health.
                if class == ErrorClass::Transient {
                    self.on_failure();
                }
                warn!(message = %message.id, error = %e, ?class, "dispatch failed");
                DispatchOutcome::Failed {
                    error: e.to_string(),
                    class,
                }
            }
        }
    }

    fn allow_request(&self) -> bool {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    breaker.state = CircuitState::HalfOpen;
                    info!("circuit breaker half-open, allowing trial dispatch");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.state == CircuitState::HalfOpen {
            info!("circuit breaker closed after successful trial");
        }
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    fn on_failure(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;
        let tripped = breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= self.config.failure_threshold;
        if tripped && breaker.state != CircuitState::Open {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            warn!(
                failures = breaker.consecutive_failures,
                "circuit breaker opened"
            );
        } else if breaker.state == CircuitState::Open {
            breaker.opened_at = Some(Instant::now());
        }
    }
}
