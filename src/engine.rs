//! Engine wiring.
//!
//! Builds the component graph in dependency order and owns the background
//! worker spawn points. Everything is injected explicitly; the only shared
//! singletons are the keystore pool and the metrics registry, both held by
//! this context.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::activity::{ActivityService, ActivityValidator};
use crate::admission::AdmissionService;
use crate::cache::{CacheUpdater, ConsistencyValidator};
use crate::commit::CommitEngine;
use crate::config::EngineConfig;
use crate::db::SaleDb;
use crate::keystore::Keystore;
use crate::limiter::MultiLevelRateLimiter;
use crate::metrics::{run_collector, MetricsRegistry};
use crate::outbox::{DefaultClassifier, Dispatcher, EventBroker, OutboxStore, OutboxWorker};
use crate::quota::QuotaAccountant;
use crate::sync::StockSynchronizer;

pub struct Engine {
    pub config: EngineConfig,
    pub keystore: Arc<dyn Keystore>,
    pub db: SaleDb,
    pub metrics: Arc<MetricsRegistry>,
    pub limiter: Arc<MultiLevelRateLimiter>,
    pub activities: Arc<ActivityService>,
    pub admission: Arc<AdmissionService>,
    pub outbox: Arc<OutboxStore>,
    pub synchronizer: Arc<StockSynchronizer>,
    pub consistency: Arc<ConsistencyValidator>,
    pub cache_updater: Arc<CacheUpdater>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Wire the full component graph against the given stores and broker.
    pub fn build(
        config: EngineConfig,
        keystore: Arc<dyn Keystore>,
        db: SaleDb,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = Arc::new(MultiLevelRateLimiter::new(config.rate_limit.clone()));
        let activities = Arc::new(ActivityService::new(
            keystore.clone(),
            db.clone(),
            config.validator.clone(),
            metrics.clone(),
        ));
        let validator = ActivityValidator::new(activities.clone(), config.validator.clone());
        let quota = QuotaAccountant::new(keystore.clone(), config.quota.clone());
        let commit = CommitEngine::new(keystore.clone(), config.validator.time_buffer_ms);
        let outbox = Arc::new(OutboxStore::new(keystore.clone(), config.outbox.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            broker,
            Arc::new(DefaultClassifier),
            config.breaker.clone(),
        ));
        let synchronizer = Arc::new(StockSynchronizer::new(
            keystore.clone(),
            db.clone(),
            config.sync.clone(),
            config.validator.grace,
            outbox.clone(),
            metrics.clone(),
        ));
        let cache_updater = Arc::new(CacheUpdater::new(
            keystore.clone(),
            db.clone(),
            config.cache.clone(),
            outbox.clone(),
            metrics.clone(),
        ));
        let consistency = Arc::new(ConsistencyValidator::new(
            keystore.clone(),
            db.clone(),
            config.cache.clone(),
            synchronizer.clone(),
            outbox.clone(),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionService::new(
            keystore.clone(),
            limiter.clone(),
            activities.clone(),
            validator,
            quota,
            commit,
            outbox.clone(),
            metrics.clone(),
            config.clone(),
        ));

        Self {
            config,
            keystore,
            db,
            metrics,
            limiter,
            activities,
            admission,
            outbox,
            synchronizer,
            consistency,
            cache_updater,
            dispatcher,
        }
    }

    /// Spawn every background loop. All of them drain on the shutdown signal.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker = OutboxWorker::new(
            self.outbox.clone(),
            self.dispatcher.clone(),
            self.metrics.clone(),
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));

        handles.push(tokio::spawn(
            self.synchronizer.clone().run(shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.consistency.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(
            self.cache_updater.clone().run_refresh_ahead(shutdown.clone()),
        ));
        handles.push(tokio::spawn(run_collector(
            self.metrics.clone(),
            self.config.alerts.clone(),
            self.config.metrics.collect_interval,
            self.outbox.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(bucket_gc_loop(
            self.limiter.clone(),
            shutdown,
        )));
        handles
    }
}

/// Evict idle rate-limit buckets once a minute.
async fn bucket_gc_loop(
    limiter: Arc<MultiLevelRateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.gc(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("bucket gc stopped");
}
