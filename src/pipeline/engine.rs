//! Detection engine: ingest workers wired over the shared components.
//!
//! ```text
//! submit → [bounded queue per worker] → preprocess → (rules ∥ model)
//!        → fuse/decide → publish detection.result → alert manager
//! ```
//!
//! Samples are routed to workers by location hash, so one worker owns each
//! location's preprocessor rings and hysteresis counters and per-location
//! ordering needs no locks. The rule engine is mutex-guarded (short calls),
//! the model is an atomic-swap read, and the alert manager serializes
//! internally.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actuator::{SimulatedActuator, ValveActuator};
use crate::alerts::{AlertManager, Notifier};
use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::{DetectionConfig, OverflowPolicy};
use crate::fanout::{FanoutHub, Topic};
use crate::forest::{IsolationForest, ModelError, SharedModel, TrainingReport, TrainingSet};
use crate::fusion::FusionDecider;
use crate::preprocess::{validate_bounds, Preprocessor, ValidationError};
use crate::rules::RuleEngine;
use crate::store::SampleStore;
use crate::types::RawSample;

/// Process-wide ingest/detection counters.
#[derive(Default)]
struct EngineCounters {
    ingested: AtomicU64,
    rejected: AtomicU64,
    ingest_dropped: AtomicU64,
    detections: AtomicU64,
    leaks: AtomicU64,
    alerts_created: AtomicU64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    pub samples_ingested: u64,
    pub samples_rejected: u64,
    /// Samples dropped at the ingest boundary under the `drop` overflow policy.
    pub ingest_dropped: u64,
    pub detections: u64,
    /// Detections whose fused verdict was a leak.
    pub leaks: u64,
    pub alerts_created: u64,
    /// Fan-out messages discarded for slow subscribers.
    pub fanout_drops: u64,
    /// Model queries that imputed a missing schema feature.
    pub unknown_features: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine: {} ingested ({} rejected, {} dropped), {} detections ({} leaks), {} alerts",
            self.samples_ingested,
            self.samples_rejected,
            self.ingest_dropped,
            self.detections,
            self.leaks,
            self.alerts_created
        )
    }
}

/// Builder for a wired detection engine.
pub struct EngineBuilder {
    cfg: DetectionConfig,
    clock: Arc<dyn Clock>,
    actuator: Arc<dyn ValveActuator>,
    notifiers: Vec<Arc<dyn Notifier>>,
    store: Option<Arc<dyn SampleStore>>,
}

impl EngineBuilder {
    pub fn new(cfg: DetectionConfig) -> Self {
        Self {
            cfg,
            clock: Arc::new(SystemClock),
            actuator: Arc::new(SimulatedActuator::new()),
            notifiers: vec![Arc::new(crate::alerts::InAppNotifier::new())],
            store: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn actuator(mut self, actuator: Arc<dyn ValveActuator>) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn store(mut self, store: Arc<dyn SampleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire the components and spawn the ingest workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> DetectionEngine {
        DetectionEngine::start(self)
    }
}

struct WorkerContext {
    worker_id: usize,
    preprocessor: Preprocessor,
    decider: FusionDecider,
    rules: Arc<Mutex<RuleEngine>>,
    model: Arc<SharedModel>,
    alerts: Arc<AlertManager>,
    hub: Arc<FanoutHub>,
    store: Option<Arc<dyn SampleStore>>,
    counters: Arc<EngineCounters>,
}

/// The wired pipeline. Owns the ingest workers; shared components are
/// reachable through accessors for queries and lifecycle calls.
pub struct DetectionEngine {
    cfg: DetectionConfig,
    senders: Vec<mpsc::Sender<RawSample>>,
    worker_tasks: Vec<JoinHandle<()>>,
    rules: Arc<Mutex<RuleEngine>>,
    model: Arc<SharedModel>,
    alerts: Arc<AlertManager>,
    audit: Arc<AuditLog>,
    hub: Arc<FanoutHub>,
    counters: Arc<EngineCounters>,
    cancel: CancellationToken,
}

impl DetectionEngine {
    /// Engine with default wiring (system clock, simulated actuator, in-app
    /// notifier only).
    pub fn new(cfg: DetectionConfig) -> Self {
        EngineBuilder::new(cfg).start()
    }

    /// Convenience builder entry point.
    pub fn builder(cfg: DetectionConfig) -> EngineBuilder {
        EngineBuilder::new(cfg)
    }

    fn start(builder: EngineBuilder) -> Self {
        let EngineBuilder {
            cfg,
            clock,
            actuator,
            notifiers,
            store,
        } = builder;

        let audit = Arc::new(AuditLog::new());
        let hub = Arc::new(FanoutHub::new(cfg.pipeline.fanout_queue_cap));
        let rules = Arc::new(Mutex::new(RuleEngine::new(cfg.rules.clone())));
        let model = Arc::new(SharedModel::new());
        let alerts = AlertManager::new(
            cfg.alerts.clone(),
            clock.clone(),
            audit.clone(),
            hub.clone(),
            actuator,
            notifiers,
        );
        let counters = Arc::new(EngineCounters::default());
        let cancel = CancellationToken::new();
        let detection_seq = Arc::new(AtomicU64::new(0));

        let worker_count = cfg.pipeline.ingest_workers.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut worker_tasks = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<RawSample>(cfg.pipeline.ingest_queue_cap);
            senders.push(tx);
            let ctx = WorkerContext {
                worker_id,
                preprocessor: Preprocessor::new(cfg.preprocess.clone(), clock.clone()),
                decider: FusionDecider::new(cfg.fusion.clone(), detection_seq.clone()),
                rules: rules.clone(),
                model: model.clone(),
                alerts: alerts.clone(),
                hub: hub.clone(),
                store: store.clone(),
                counters: counters.clone(),
            };
            let cancel = cancel.clone();
            worker_tasks.push(tokio::spawn(worker_loop(ctx, rx, cancel)));
        }

        info!(
            workers = worker_count,
            queue_cap = cfg.pipeline.ingest_queue_cap,
            fanout_cap = cfg.pipeline.fanout_queue_cap,
            "Detection engine started"
        );

        Self {
            cfg,
            senders,
            worker_tasks,
            rules,
            model,
            alerts,
            audit,
            hub,
            counters,
            cancel,
        }
    }

    /// Submit a raw sample for processing.
    ///
    /// Structural validation (finiteness, hard bounds) happens synchronously;
    /// an `Ok` means the sample was accepted into the pipeline. Temporal
    /// validation (stale timestamps) happens on the owning worker and is
    /// surfaced through the rejected counter. The `detection.result` for an
    /// accepted sample is published asynchronously.
    pub async fn submit(&self, sample: RawSample) -> Result<(), ValidationError> {
        validate_bounds(&sample)?;
        let index = worker_index(sample.location_key(), self.senders.len());
        match self.cfg.pipeline.ingest_overflow {
            OverflowPolicy::Block => {
                if self.senders[index].send(sample).await.is_err() {
                    warn!("Ingest rejected: engine shutting down");
                }
            }
            OverflowPolicy::Drop => {
                if let Err(e) = self.senders[index].try_send(sample) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            self.counters.ingest_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            warn!("Ingest rejected: engine shutting down");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Train the anomaly model and swap it in atomically. Scoring continues
    /// lock-free on the old model until the swap.
    pub fn train_model(&self, dataset: &TrainingSet) -> Result<TrainingReport, ModelError> {
        let (forest, report) = IsolationForest::train(dataset, &self.cfg.model)?;
        self.model.install(forest);
        Ok(report)
    }

    /// Restore a previously saved model blob.
    pub fn load_model(&self, json: &str) -> Result<(), ModelError> {
        let forest = IsolationForest::from_json(json)?;
        self.model.install(forest);
        Ok(())
    }

    /// Serialize the active model, if trained.
    pub fn save_model(&self) -> Result<String, ModelError> {
        self.model
            .current()
            .ok_or(ModelError::ModelNotReady)?
            .to_json()
    }

    /// Install the rule engine's (pressure, flow) baseline.
    pub fn set_baseline(&self, pressure: f64, flow: f64) {
        match self.rules.lock() {
            Ok(mut rules) => rules.set_baseline(pressure, flow),
            Err(poisoned) => poisoned.into_inner().set_baseline(pressure, flow),
        }
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn model(&self) -> &Arc<SharedModel> {
        &self.model
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            samples_ingested: self.counters.ingested.load(Ordering::Relaxed),
            samples_rejected: self.counters.rejected.load(Ordering::Relaxed),
            ingest_dropped: self.counters.ingest_dropped.load(Ordering::Relaxed),
            detections: self.counters.detections.load(Ordering::Relaxed),
            leaks: self.counters.leaks.load(Ordering::Relaxed),
            alerts_created: self.counters.alerts_created.load(Ordering::Relaxed),
            fanout_drops: self.hub.dropped_count(),
            unknown_features: self.model.unknown_feature_hits(),
        }
    }

    /// Drain ingest queues up to the grace period, then stop workers.
    /// In-flight notification sends are abandoned.
    pub async fn shutdown(mut self) -> EngineStats {
        info!("Detection engine shutting down");
        // Closing the channels lets workers drain what is already queued.
        self.senders.clear();

        let grace = Duration::from_millis(self.cfg.pipeline.shutdown_grace_ms);
        let drained = tokio::time::timeout(
            grace,
            futures::future::join_all(self.worker_tasks.drain(..)),
        )
        .await;
        if drained.is_err() {
            warn!(
                grace_ms = self.cfg.pipeline.shutdown_grace_ms,
                "Grace period elapsed, forcing worker stop"
            );
            self.cancel.cancel();
        }

        let stats = self.stats();
        info!(%stats, "Detection engine stopped");
        stats
    }
}

/// Stable location → worker routing.
fn worker_index(location_key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    location_key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn worker_loop(
    mut ctx: WorkerContext,
    mut rx: mpsc::Receiver<RawSample>,
    cancel: CancellationToken,
) {
    debug!(worker = ctx.worker_id, "Ingest worker started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                warn!(worker = ctx.worker_id, "Ingest worker force-stopped");
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(sample) => process_sample(&mut ctx, sample).await,
                None => break,
            },
        }
    }
    debug!(worker = ctx.worker_id, "Ingest worker stopped");
}

async fn process_sample(ctx: &mut WorkerContext, sample: RawSample) {
    ctx.counters.ingested.fetch_add(1, Ordering::Relaxed);

    let features = match ctx.preprocessor.process(sample) {
        Ok(features) => features,
        Err(e) => {
            ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Sample rejected in pipeline");
            return;
        }
    };

    if let Some(store) = &ctx.store {
        store.append(&features.sample).await;
    }
    ctx.hub.publish(Topic::SensorUpdate, &features);

    // Both detectors see the same features and neither sees the other's
    // output; the rule call is a short guarded section, the model read is
    // lock-free.
    let rule = match ctx.rules.lock() {
        Ok(mut rules) => rules.evaluate(&features),
        Err(poisoned) => poisoned.into_inner().evaluate(&features),
    };
    let ml = ctx.model.predict(&features).ok();

    let decision = ctx.decider.decide(features, rule, ml);
    ctx.counters.detections.fetch_add(1, Ordering::Relaxed);
    if decision.result.is_leak {
        ctx.counters.leaks.fetch_add(1, Ordering::Relaxed);
    }
    ctx.hub.publish(Topic::DetectionResult, &decision.result);

    if decision.emit_alert {
        let alert = ctx.alerts.create(&decision.result).await;
        ctx.counters.alerts_created.fetch_add(1, Ordering::Relaxed);
        debug!(
            worker = ctx.worker_id,
            alert = %alert.id,
            detection = %decision.result.id,
            "Alert created from detection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{FusionConfig, PipelineConfig};
    use crate::types::ValvePosition;

    fn sample(ts_ms: u64, pressure: f64, flow: f64, location: &str) -> RawSample {
        RawSample {
            timestamp: Some(ts_ms),
            pressure,
            flow,
            valve_state: ValvePosition::Open,
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    async fn drain(engine: &DetectionEngine, expected: u64) {
        // Samples flow through a worker task; poll until processed.
        for _ in 0..200 {
            if engine.stats().detections + engine.stats().samples_rejected >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_bounds_rejected_synchronously() {
        let engine = DetectionEngine::new(DetectionConfig::default());
        let err = engine
            .submit(sample(1_000, 500.0, 10.0, "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pipeline_processes_and_publishes() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let engine = DetectionEngine::builder(DetectionConfig::default())
            .clock(clock)
            .start();
        let sub = engine
            .hub()
            .subscribe(&[Topic::SensorUpdate, Topic::DetectionResult]);

        let base = 1_700_000_000_000_u64;
        for i in 0..5_u64 {
            engine
                .submit(sample(base + i * 1_000, 50.0, 10.0, "main"))
                .await
                .unwrap();
        }
        drain(&engine, 5).await;

        let stats = engine.stats();
        assert_eq!(stats.samples_ingested, 5);
        assert_eq!(stats.detections, 5);
        assert_eq!(stats.alerts_created, 0);

        let mut sensor_updates = 0;
        let mut detections = 0;
        while let Some(envelope) = sub.try_recv() {
            match envelope.topic {
                Topic::SensorUpdate => sensor_updates += 1,
                Topic::DetectionResult => detections += 1,
                _ => {}
            }
        }
        assert_eq!(sensor_updates, 5);
        assert_eq!(detections, 5);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_sample_counted_not_fatal() {
        let engine = DetectionEngine::new(DetectionConfig::default());
        let base = 1_700_000_000_000_u64;
        engine.submit(sample(base, 50.0, 10.0, "main")).await.unwrap();
        engine
            .submit(sample(base - 5_000, 50.0, 10.0, "main"))
            .await
            .unwrap();
        engine
            .submit(sample(base + 1_000, 50.0, 10.0, "main"))
            .await
            .unwrap();
        drain(&engine, 3).await;

        let stats = engine.stats();
        assert_eq!(stats.samples_ingested, 3);
        assert_eq!(stats.samples_rejected, 1);
        assert_eq!(stats.detections, 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_location_order_survives_multiple_workers() {
        let cfg = DetectionConfig {
            pipeline: PipelineConfig {
                ingest_workers: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = DetectionEngine::new(cfg);
        let sub = engine.hub().subscribe(&[Topic::DetectionResult]);

        let base = 1_700_000_000_000_u64;
        let locations = ["main", "east", "west"];
        for i in 0..30_u64 {
            let loc = locations[(i % 3) as usize];
            engine
                .submit(sample(base + i * 1_000, 50.0, 10.0, loc))
                .await
                .unwrap();
        }
        drain(&engine, 30).await;

        // Per-location timestamps must arrive in ingest order.
        let mut last_ts: std::collections::HashMap<String, u64> = Default::default();
        while let Some(envelope) = sub.try_recv() {
            let loc = envelope.payload["sample"]["location"]
                .as_str()
                .unwrap()
                .to_string();
            let ts = envelope.payload["timestamp"].as_u64().unwrap();
            if let Some(prev) = last_ts.get(&loc) {
                assert!(ts >= *prev, "detections out of order for {loc}");
            }
            last_ts.insert(loc, ts);
        }
        assert_eq!(last_ts.len(), 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_policy_counts_overflow() {
        let cfg = DetectionConfig {
            pipeline: PipelineConfig {
                ingest_workers: 1,
                ingest_queue_cap: 1,
                ingest_overflow: OverflowPolicy::Drop,
                ..Default::default()
            },
            fusion: FusionConfig::default(),
            ..Default::default()
        };
        let engine = DetectionEngine::new(cfg);
        // Flood far faster than the worker drains a 1-slot queue.
        for i in 0..200_u64 {
            engine
                .submit(sample(1_700_000_000_000 + i, 50.0, 10.0, "main"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = engine.stats();
        assert!(stats.ingest_dropped > 0, "flood should overflow the queue");
        assert!(stats.samples_ingested < 200);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_receives_accepted_samples_only() {
        let store = Arc::new(crate::store::MemorySampleStore::default());
        let engine = DetectionEngine::builder(DetectionConfig::default())
            .store(store.clone())
            .start();
        let base = 1_700_000_000_000_u64;
        engine.submit(sample(base, 50.0, 10.0, "main")).await.unwrap();
        engine.submit(sample(base + 1_000, 50.0, 10.0, "main")).await.unwrap();
        // Stale: rejected in the worker, must not reach the store.
        engine.submit(sample(base, 50.0, 10.0, "main")).await.unwrap();
        drain(&engine, 3).await;

        assert_eq!(store.total_count(), 2);
        let kept = store.range("main", 0, u64::MAX).await;
        assert_eq!(kept.len(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let engine = DetectionEngine::new(DetectionConfig::default());
        let base = 1_700_000_000_000_u64;
        for i in 0..50_u64 {
            engine
                .submit(sample(base + i * 1_000, 50.0, 10.0, "main"))
                .await
                .unwrap();
        }
        let stats = engine.shutdown().await;
        assert_eq!(stats.detections, 50, "queued samples drain before stop");
    }
}
