//! Outbox processing loop.
//!
//! Polls the due index, claims messages, dispatches them through the
//! circuit-broken dispatcher, and updates message state from the outcome.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::metrics::MetricsRegistry;

use super::dispatcher::{DispatchOutcome, Dispatcher, ErrorClass};
use super::store::OutboxStore;

pub struct OutboxWorker {
    store: Arc<OutboxStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsRegistry>,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<OutboxStore>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
        }
    }

    /// Run until shutdown. On startup, stale in-flight messages from a
    /// previous run are reset before the periodic schedule begins.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.recover_in_flight(now).await {
            error!(error = %e, "in-flight recovery failed on startup");
        }

        let mut ticker = interval(self.store.config().process_interval);
        info!("outbox worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now().timestamp_millis()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Drain one final batch so accepted commits are not stranded.
        self.tick(Utc::now().timestamp_millis()).await;
        info!("outbox worker stopped");
    }

    /// One processing pass at `now_millis`.
    pub async fn tick(&self, now_millis: i64) {
        if let Err(e) = self.store.recover_in_flight(now_millis).await {
            error!(error = %e, "in-flight recovery failed");
        }

        let batch = self.store.config().batch_size;
        let due = match self.store.due_ids(now_millis, batch).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "due scan failed");
                return;
            }
        };

        for id in due {
            let message = match self.store.claim(&id, now_millis).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!(message = %id, error = %e, "claim failed");
                    continue;
                }
            };

            let result = match self.dispatcher.dispatch(&message).await {
                DispatchOutcome::Acked => self.store.ack(&id).await,
                DispatchOutcome::Failed { error, class } => {
                    self.store
                        .fail(&id, &error, class == ErrorClass::Permanent)
                        .await
                }
            };
            if let Err(e) = result {
                error!(message = %id, error = %e, "state update failed");
            }
        }

        let outstanding = self.store.outstanding().await.unwrap_or(0);
        let dead = self.store.dead_count().await.unwrap_or(0);
        self.metrics.set_outbox_depth(outstanding, dead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, OutboxConfig};
    use crate::keystore::MemoryKeystore;
    use crate::models::CommitRecord;
    use crate::outbox::{
        ChannelBroker, DefaultClassifier, MessageStatus, ReliableMessage,
    };
    use std::time::Duration;

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn order_message(id: &str) -> ReliableMessage {
        ReliableMessage::order(&CommitRecord {
            commit_token: id.to_string(),
            activity_id: "act1".into(),
            user_id: "u1".into(),
            qty: 1,
            ts: 1,
            price_snapshot: 1.0,
        })
    }

    fn worker(broker: Arc<ChannelBroker>) -> OutboxWorker {
        let keystore = Arc::new(MemoryKeystore::new());
        let config = OutboxConfig {
            retry_base: Duration::from_millis(100),
            jitter: 0.0,
            ..OutboxConfig::default()
        };
        let store = Arc::new(OutboxStore::new(keystore, config));
        let dispatcher = Arc::new(Dispatcher::new(
            broker,
            Arc::new(DefaultClassifier),
            BreakerConfig {
                failure_threshold: 10,
                reset_timeout: Duration::from_millis(10),
            },
        ));
        OutboxWorker::new(store, dispatcher, Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_acks() {
        let (broker, mut rx) = ChannelBroker::new();
        let worker = worker(Arc::new(broker));

        worker.store.enqueue(&order_message("m1")).await.unwrap();
        worker.tick(now()).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.routing_key, "order.committed");
        let message = worker.store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Ack);
        assert_eq!(worker.store.outstanding().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broker_outage_then_recovery_delivers_once() {
        let (broker, mut rx) = ChannelBroker::new();
        let broker = Arc::new(broker);
        let worker = worker(broker.clone());

        worker.store.enqueue(&order_message("m1")).await.unwrap();

        // Broker down on the first dispatch.
        broker.fail_next(1);
        let t0 = now();
        worker.tick(t0).await;
        let message = worker.store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::RetryPending);
        assert!(rx.try_recv().is_err());

        // Not due before the backoff elapses.
        worker.tick(t0 + 10).await;
        assert!(rx.try_recv().is_err());

        // Broker recovered: next due tick delivers exactly once.
        worker.tick(message.next_attempt_at + 1).await;
        assert_eq!(rx.recv().await.unwrap().routing_key, "order.committed");
        assert!(rx.try_recv().is_err());
        let message = worker.store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Ack);
    }

    #[tokio::test]
    async fn test_permanent_rejection_dead_letters_without_retry() {
        let keystore = Arc::new(MemoryKeystore::new());
        let store = Arc::new(OutboxStore::new(keystore, OutboxConfig::default()));

        struct RejectingBroker;
        #[async_trait::async_trait]
        impl crate::outbox::EventBroker for RejectingBroker {
            async fn publish(
                &self,
                _topic: &str,
                _routing_key: &str,
                _payload: &str,
            ) -> Result<(), crate::outbox::PublishError> {
                Err(crate::outbox::PublishError::rejected(400, "bad payload"))
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(RejectingBroker),
            Arc::new(DefaultClassifier),
            BreakerConfig::default(),
        ));
        let worker = OutboxWorker::new(store.clone(), dispatcher, Arc::new(MetricsRegistry::new()));

        store.enqueue(&order_message("m1")).await.unwrap();
        worker.tick(now()).await;

        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Dead);
        assert_eq!(message.attempts, 1);
        assert_eq!(store.stats().permanent_failures, 1);
    }

    #[tokio::test]
    async fn test_metrics_track_backlog() {
        let (broker, _rx) = ChannelBroker::new();
        let broker = Arc::new(broker);
        let worker = worker(broker.clone());

        for i in 0..3 {
            worker
                .store
                .enqueue(&order_message(&format!("m{}", i)))
                .await
                .unwrap();
        }
        broker.fail_next(3);
        worker.tick(now()).await;
        assert_eq!(worker.metrics.outbox_outstanding(), 3);
    }
}
