//! IngestionOrchestrator: lifecycle, strategy selection and health surface
//!
//! Owns the store, the ingestion core and every background task. Consumers
//! get the store by handle (`store()`) and query it under a read lock.
//!
//! ```text
//! STOPPED → STARTING → RUNNING ⇄ DEGRADED → STOPPING → STOPPED
//!               └──→ FAILED (missing topic configuration)
//! ```

use super::config::PipelineConfig;
use super::decoder::MessageDecoder;
use super::ingestion::{run_ingestion, IngestCore, IngestMessage, IngestStats, ReclassifyReport, TopicStats, Watermark};
use super::metrics::{LogMetrics, MetricsSink};
use super::scheduler::{poll_topic_task, reclassify_task, Clock, SystemClock};
use super::store::{SignalStore, StoreSummary};
use super::sync_state::{HealthStatus, SyncState};
use super::types::DeliverySource;
use crate::streamer_core::config::ConfigError;
use crate::streamer_core::mirror_client::{ConsensusTime, HttpMirrorSource, MirrorSource};
use crate::streamer_core::stream_subscriber::{StreamSource, StreamSubscriber, SubscriberOptions, WsStreamSource};
use crate::streamer_core::topic_reader::TopicReader;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
    Failed,
}

impl OrchestratorState {
    pub fn is_active(&self) -> bool {
        matches!(self, OrchestratorState::Running | OrchestratorState::Degraded)
    }
}

#[derive(Debug)]
pub enum OrchestratorError {
    Configuration(ConfigError),
    AlreadyRunning,
    NotRunning,
    Join(String),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::Configuration(e) => write!(f, "Configuration error: {}", e),
            OrchestratorError::AlreadyRunning => write!(f, "Ingestion is already running"),
            OrchestratorError::NotRunning => write!(f, "Ingestion is not running"),
            OrchestratorError::Join(msg) => write!(f, "Background task failed: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::Configuration(err)
    }
}

/// Per-topic slice of the health surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicHealth {
    pub processed: u64,
    pub backfilled: u64,
    pub streamed: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub streaming: bool,
    pub last_activity_ms: Option<i64>,
    pub cursor: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: OrchestratorState,
    pub running: bool,
    pub healthy: bool,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub connection_count: usize,
    pub last_activity_ms: Option<i64>,
    pub last_sync: String,
    pub topics: BTreeMap<String, TopicHealth>,
}

/// Handles for one started run
struct Runtime {
    tx: mpsc::Sender<IngestMessage>,
    shutdown: watch::Sender<bool>,
    pollers: Vec<JoinHandle<()>>,
    subscribers: Vec<StreamSubscriber>,
    reclassifier: JoinHandle<()>,
    ingestion: JoinHandle<()>,
}

type Cleanup = Box<dyn FnOnce() + Send>;

pub struct IngestionOrchestrator {
    config: PipelineConfig,
    mirror: Arc<dyn MirrorSource>,
    stream: Option<Arc<dyn StreamSource>>,
    reader: Arc<TopicReader>,
    store: Arc<RwLock<SignalStore>>,
    core: Arc<Mutex<IngestCore>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    runtime: Mutex<Option<Runtime>>,
    state: StdMutex<OrchestratorState>,
    restarting: AtomicBool,
    cleanups: StdMutex<Vec<Cleanup>>,
}

fn build_core(config: &PipelineConfig, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> IngestCore {
    let decoder = MessageDecoder::new(config.topic_kinds(), clock.clone());
    let sync_state = SyncState::new(config.error_log_capacity, config.stale_after());
    IngestCore::new(decoder, sync_state, metrics, clock)
}

impl IngestionOrchestrator {
    /// Poll-only orchestrator over `mirror`; add a push source with `with_stream`
    pub fn new(config: PipelineConfig, mirror: Arc<dyn MirrorSource>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics: Arc<dyn MetricsSink> = Arc::new(LogMetrics);
        let reader = Arc::new(TopicReader::new(
            mirror.clone(),
            config.topic_ids(),
            config.mirror.page_size,
        ));

        Self {
            core: Arc::new(Mutex::new(build_core(&config, clock.clone(), metrics.clone()))),
            store: Arc::new(RwLock::new(SignalStore::new(config.quarantine_capacity))),
            config,
            mirror,
            stream: None,
            reader,
            clock,
            metrics,
            runtime: Mutex::new(None),
            state: StdMutex::new(OrchestratorState::Stopped),
            restarting: AtomicBool::new(false),
            cleanups: StdMutex::new(Vec::new()),
        }
    }

    /// Production wiring: REST mirror plus WebSocket stream when configured
    pub fn from_config(config: PipelineConfig) -> Result<Self, OrchestratorError> {
        let mirror = HttpMirrorSource::new(&config.mirror)
            .map_err(|e| OrchestratorError::Configuration(ConfigError::InvalidValue(e.to_string())))?;
        let ws_url = config.mirror.ws_url.clone();
        let mut orchestrator = Self::new(config, Arc::new(mirror));
        if let Some(ws_url) = ws_url {
            orchestrator = orchestrator.with_stream(Arc::new(WsStreamSource::new(&ws_url)));
        }
        Ok(orchestrator)
    }

    pub fn with_stream(mut self, stream: Arc<dyn StreamSource>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.core = Arc::new(Mutex::new(build_core(&self.config, self.clock.clone(), self.metrics.clone())));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self.core = Arc::new(Mutex::new(build_core(&self.config, self.clock.clone(), self.metrics.clone())));
        self
    }

    /// Shared handle for query callers
    pub fn store(&self) -> Arc<RwLock<SignalStore>> {
        self.store.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mirror(&self) -> Arc<dyn MirrorSource> {
        self.mirror.clone()
    }

    fn state_guard(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: OrchestratorState) {
        let mut state = self.state_guard();
        if *state != next {
            log::info!("🔄 Orchestrator {:?} → {:?}", *state, next);
            *state = next;
        }
    }

    /// Current state; RUNNING and DEGRADED follow per-topic failure streaks
    pub async fn state(&self) -> OrchestratorState {
        let current = *self.state_guard();
        if !current.is_active() {
            return current;
        }
        let degraded = self
            .core
            .lock()
            .await
            .is_degraded(self.config.degraded_after_failures);
        let next = if degraded {
            OrchestratorState::Degraded
        } else {
            OrchestratorState::Running
        };
        self.set_state(next);
        next
    }

    /// Validate topics, backfill, then begin live delivery
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        self.set_state(OrchestratorState::Starting);
        if let Err(e) = self.config.validate() {
            log::error!("❌ Cannot start ingestion: {}", e);
            self.set_state(OrchestratorState::Failed);
            return Err(e.into());
        }

        let topics = self.config.topic_ids();
        log::info!("🚀 Starting ingestion for {} topics", topics.len());
        for topic in &self.config.topics {
            log::info!("   ├─ {:?}: {}", topic.kind, topic.topic_id);
        }
        log::info!(
            "   └─ Strategy: {}",
            if self.stream.is_some() { "stream with poll fallback" } else { "poll" }
        );

        // Resume from committed positions
        let mut since: HashMap<String, ConsensusTime> = HashMap::new();
        {
            let core = self.core.lock().await;
            for topic in &topics {
                if let Some(mark) = core.watermark(topic) {
                    if let Some(seq) = mark.sequence {
                        self.reader.seed(topic, seq);
                    }
                    if let Some(at) = mark.consensus {
                        since.insert(topic.clone(), at);
                    }
                }
            }
        }

        let (tx, rx) = mpsc::channel::<IngestMessage>(self.config.channel_buffer);
        let ingestion = tokio::spawn(run_ingestion(rx, self.core.clone(), self.store.clone()));

        // Resumed topics replay everything past their watermark; fresh
        // topics get the bounded backfill window
        let batch = self.reader.resume(&since, self.config.backfill_limit).await;
        log::info!(
            "📥 Backfill: {} messages, {} malformed, {} failed topics",
            batch.messages.len(),
            batch.malformed.len(),
            batch.failures.len()
        );
        let failed: Vec<String> = batch.failures.iter().map(|(topic, _)| topic.clone()).collect();
        let mut backlog = Vec::new();
        for message in batch.messages {
            if let Some(at) = message.consensus() {
                let entry = since.entry(message.topic_id().to_string()).or_insert(at);
                *entry = (*entry).max(at);
            }
            backlog.push(IngestMessage::Message {
                message,
                source: DeliverySource::Backfill,
            });
        }
        backlog.extend(
            batch
                .malformed
                .into_iter()
                .map(|(topic_id, error)| IngestMessage::Malformed { topic_id, error }),
        );
        backlog.extend(
            batch
                .failures
                .into_iter()
                .map(|(topic_id, error)| IngestMessage::FetchFailed { topic_id, error }),
        );
        backlog.extend(
            topics
                .iter()
                .filter(|t| !failed.contains(t))
                .map(|t| IngestMessage::FetchSucceeded { topic_id: t.clone() }),
        );
        for message in backlog {
            if tx.send(message).await.is_err() {
                log::error!("❌ Ingestion loop exited during backfill");
                break;
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut pollers = Vec::new();
        let mut subscribers = Vec::new();

        match &self.stream {
            Some(source) => {
                let options = SubscriberOptions::from_mirror(&self.config.mirror, self.config.backfill_limit);
                for topic in &topics {
                    subscribers.push(StreamSubscriber::spawn(
                        topic,
                        source.clone(),
                        Some(self.reader.clone()),
                        since.get(topic).copied(),
                        options.clone(),
                        tx.clone(),
                    ));
                }
            }
            None => {
                let mut core = self.core.lock().await;
                for topic in &topics {
                    core.sync_state_mut().connection_opened();
                    pollers.push(tokio::spawn(poll_topic_task(
                        topic.clone(),
                        self.reader.clone(),
                        self.core.clone(),
                        tx.clone(),
                        self.config.cadence(),
                        self.config.backfill_limit,
                        shutdown_rx.clone(),
                    )));
                }
            }
        }

        let reclassifier = tokio::spawn(reclassify_task(
            self.core.clone(),
            self.store.clone(),
            self.config.reclassify_interval(),
            shutdown_rx,
        ));

        {
            let mut core = self.core.lock().await;
            let now = self.clock.now_millis();
            core.sync_state_mut().set_live(true);
            core.sync_state_mut().touch(now);
        }

        *runtime = Some(Runtime {
            tx,
            shutdown,
            pollers,
            subscribers,
            reclassifier,
            ingestion,
        });
        self.set_state(OrchestratorState::Running);
        log::info!("✅ Ingestion running");
        Ok(())
    }

    /// Stop every producer, drain the channel and wait for the ingestion loop
    ///
    /// No `add()` happens after this returns.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let mut runtime = self.runtime.lock().await;
        let Some(run) = runtime.take() else {
            return Err(OrchestratorError::NotRunning);
        };
        self.set_state(OrchestratorState::Stopping);
        log::info!("⏳ Stopping ingestion...");

        let _ = run.shutdown.send(true);
        for subscriber in &run.subscribers {
            subscriber.stop().await;
        }
        for poller in run.pollers {
            let _ = poller.await;
        }
        run.reclassifier.abort();
        let _ = run.reclassifier.await;

        drop(run.tx);
        let joined = run.ingestion.await;

        {
            let mut core = self.core.lock().await;
            core.sync_state_mut().set_live(false);
            core.sync_state_mut().close_all_connections();
        }
        self.set_state(OrchestratorState::Stopped);
        log::info!("✅ Ingestion stopped");

        joined.map_err(|e| OrchestratorError::Join(e.to_string()))
    }

    /// Stop, drop transient state, start again from the watermarks
    ///
    /// A second call while one is in flight returns immediately.
    pub async fn restart(&self) -> Result<(), OrchestratorError> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            log::debug!("Restart already in progress");
            return Ok(());
        }
        let result = self.restart_inner().await;
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_inner(&self) -> Result<(), OrchestratorError> {
        log::info!("🔄 Restarting ingestion");
        match self.stop().await {
            Ok(()) | Err(OrchestratorError::NotRunning) => {}
            Err(e) => log::warn!("⚠️  Stop during restart: {}", e),
        }
        self.core.lock().await.sync_state_mut().clear_errors();
        self.start().await
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Run `cleanup` once during `shutdown()`
    pub fn register_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(cleanup));
    }

    /// Run cleanups (a panicking one does not stop the rest), then stop
    ///
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let cleanups: Vec<Cleanup> = std::mem::take(
            &mut *self
                .cleanups
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for cleanup in cleanups {
            if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
                log::error!("❌ Cleanup callback panicked");
            }
        }

        match self.stop().await {
            Ok(()) | Err(OrchestratorError::NotRunning) => {}
            Err(e) => log::error!("❌ Shutdown: {}", e),
        }
        let mut state = self.state_guard();
        if *state != OrchestratorState::Failed {
            *state = OrchestratorState::Stopped;
        }
    }

    /// Wipe the store, quarantine, watermarks and stats, then resync every
    /// topic from scratch when ingestion was running
    ///
    /// Runs as stop, wipe, start so subscribers and pollers reconnect with no
    /// position and a fresh backfill.
    pub async fn clear_caches(&self) -> Result<(), OrchestratorError> {
        let was_running = match self.stop().await {
            Ok(()) => true,
            Err(OrchestratorError::NotRunning) => false,
            Err(e) => {
                log::warn!("⚠️  Stop during cache clear: {}", e);
                true
            }
        };

        {
            let mut core = self.core.lock().await;
            let mut store = self.store.write().await;
            store.clear();
            core.reset();
            self.reader.reset();
        }
        log::info!("🔄 Caches cleared; topics will resync from the beginning");

        if was_running {
            self.start().await
        } else {
            Ok(())
        }
    }

    pub async fn reclassify_quarantine(&self) -> ReclassifyReport {
        let mut core = self.core.lock().await;
        let mut store = self.store.write().await;
        core.reclassify(&mut store)
    }

    pub async fn health(&self) -> HealthSnapshot {
        let state = self.state().await;
        let core = self.core.lock().await;
        let now = self.clock.now_millis();
        let report = core.sync_state().health_with(now, core.topic_issues());
        let stats = core.stats();
        let sync = core.sync_state().snapshot();

        let topics = self
            .config
            .topic_ids()
            .into_iter()
            .map(|topic| {
                let s: TopicStats = stats.topics.get(&topic).cloned().unwrap_or_default();
                let health = TopicHealth {
                    processed: s.processed(),
                    backfilled: s.backfilled,
                    streamed: s.streamed,
                    failed: s.failed,
                    consecutive_failures: s.consecutive_failures,
                    streaming: s.streaming,
                    last_activity_ms: s.last_activity_ms,
                    cursor: core.watermark(&topic).unwrap_or_default(),
                };
                (topic, health)
            })
            .collect();

        HealthSnapshot {
            state,
            running: state.is_active(),
            healthy: report.healthy,
            status: report.status,
            issues: report.issues,
            connection_count: sync.connection_count,
            last_activity_ms: sync.last_activity_ms,
            last_sync: core.sync_state().time_since_last_sync(now),
            topics,
        }
    }

    pub async fn stats(&self) -> IngestStats {
        self.core.lock().await.stats()
    }

    pub async fn watermarks(&self) -> BTreeMap<String, Watermark> {
        self.core.lock().await.watermarks()
    }

    pub async fn summary(&self) -> StoreSummary {
        self.store.read().await.summary()
    }
}
