//! Single ingestion point
//!
//! Every reader, poller and subscriber sends `IngestMessage`s into one mpsc
//! channel. `run_ingestion` drains it and applies each message through
//! `IngestCore`, which owns watermarks, per-topic stats and health
//! bookkeeping. The store is only ever mutated from here (and from the
//! re-classification pass, which takes the same locks in the same order).

use super::decoder::{synthetic_id, DecodeError, DecodeOutcome, MessageDecoder, UnknownPayload};
use super::metrics::{MetricEvent, MetricsSink};
use super::recognition::CatalogChange;
use super::scheduler::Clock;
use super::store::{AddOutcome, QuarantinePush, SignalStore};
use super::sync_state::SyncState;
use super::types::{DeliverySource, SignalEvent, SignalType};
use crate::streamer_core::mirror_client::{ConsensusTime, FetchError};
use crate::streamer_core::topic_reader::TopicMessage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Everything producers can tell the ingestion loop
#[derive(Debug)]
pub enum IngestMessage {
    Message {
        message: TopicMessage,
        source: DeliverySource,
    },
    /// Payload that could not even be decoded to JSON
    Malformed {
        topic_id: String,
        error: DecodeError,
    },
    FetchFailed {
        topic_id: String,
        error: FetchError,
    },
    FetchSucceeded {
        topic_id: String,
    },
    StreamConnected {
        topic_id: String,
    },
    StreamDisconnected {
        topic_id: String,
        reason: String,
    },
}

/// Last processed position of a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub sequence: Option<u64>,
    pub consensus: Option<ConsensusTime>,
}

impl Watermark {
    /// Whether a message sits strictly behind this watermark
    fn is_behind(&self, sequence: Option<u64>, consensus: Option<ConsensusTime>) -> bool {
        match (sequence, self.sequence) {
            (Some(seq), Some(mark)) => seq < mark,
            _ => matches!((consensus, self.consensus), (Some(at), Some(mark)) if at < mark),
        }
    }

    fn advance(&mut self, sequence: Option<u64>, consensus: Option<ConsensusTime>) {
        if let Some(seq) = sequence {
            self.sequence = Some(self.sequence.map_or(seq, |s| s.max(seq)));
        }
        if let Some(at) = consensus {
            self.consensus = Some(self.consensus.map_or(at, |c| c.max(at)));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub backfilled: u64,
    pub streamed: u64,
    pub duplicates: u64,
    /// Payloads that did not become events (malformed or unclassified)
    pub failed: u64,
    pub anomalies: u64,
    pub fetch_failures: u64,
    pub consecutive_failures: u32,
    pub recognition_definitions: u64,
    pub recognition_instances: u64,
    /// Instances that arrived before their definition
    pub recognition_pending: u64,
    pub last_consensus: Option<ConsensusTime>,
    pub last_activity_ms: Option<i64>,
    pub last_error: Option<String>,
    pub streaming: bool,
}

impl TopicStats {
    pub fn processed(&self) -> u64 {
        self.backfilled + self.streamed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestTotals {
    pub processed: u64,
    pub backfilled: u64,
    pub streamed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub anomalies: u64,
    pub fetch_failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub topics: BTreeMap<String, TopicStats>,
    pub totals: IngestTotals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclassifyReport {
    pub recovered: usize,
    pub remaining: usize,
}

pub struct IngestCore {
    decoder: MessageDecoder,
    watermarks: BTreeMap<String, Watermark>,
    stats: BTreeMap<String, TopicStats>,
    sync_state: SyncState,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl IngestCore {
    pub fn new(
        decoder: MessageDecoder,
        sync_state: SyncState,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            decoder,
            watermarks: BTreeMap::new(),
            stats: BTreeMap::new(),
            sync_state,
            metrics,
            clock,
        }
    }

    pub fn decoder(&self) -> &MessageDecoder {
        &self.decoder
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync_state
    }

    pub fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync_state
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    fn emit(&mut self, event: MetricEvent) {
        self.metrics.record(&event);
        let now = self.clock.now_millis();
        self.sync_state.observe(&event, now);
    }

    fn topic(&mut self, topic_id: &str) -> &mut TopicStats {
        self.stats.entry(topic_id.to_string()).or_default()
    }

    /// Apply one message from the channel
    pub fn apply(&mut self, message: IngestMessage, store: &mut SignalStore) {
        match message {
            IngestMessage::Message { message, source } => self.apply_message(message, source, store),
            IngestMessage::Malformed { topic_id, error } => {
                log::debug!("Malformed payload on {}: {}", topic_id, error);
                self.topic(&topic_id).failed += 1;
                self.emit(MetricEvent::DecodeFailed {
                    topic_id,
                    reason: error.to_string(),
                });
            }
            IngestMessage::FetchFailed { topic_id, error } => {
                let stats = self.topic(&topic_id);
                stats.fetch_failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(error.to_string());
                self.emit(MetricEvent::FetchFailed {
                    topic_id,
                    error: error.to_string(),
                });
            }
            IngestMessage::FetchSucceeded { topic_id } => {
                let recovered = {
                    let stats = self.topic(&topic_id);
                    let recovered = stats.consecutive_failures > 0;
                    stats.consecutive_failures = 0;
                    stats.last_error = None;
                    recovered
                };
                let now = self.clock.now_millis();
                self.sync_state.mark_synced(now);
                if recovered {
                    log::info!("✅ Topic {} recovered", topic_id);
                    self.emit(MetricEvent::FetchRecovered { topic_id });
                }
            }
            IngestMessage::StreamConnected { topic_id } => {
                let stats = self.topic(&topic_id);
                stats.streaming = true;
                stats.consecutive_failures = 0;
                self.emit(MetricEvent::StreamConnected { topic_id });
            }
            IngestMessage::StreamDisconnected { topic_id, reason } => {
                let stats = self.topic(&topic_id);
                stats.streaming = false;
                stats.consecutive_failures += 1;
                stats.last_error = Some(reason.clone());
                self.emit(MetricEvent::StreamDisconnected { topic_id, reason });
            }
        }
    }

    fn apply_message(&mut self, message: TopicMessage, source: DeliverySource, store: &mut SignalStore) {
        let topic_id = message.topic_id().to_string();
        let sequence = message.sequence_number();
        let consensus = message.consensus();
        let watermark = self.watermarks.get(&topic_id).copied().unwrap_or_default();

        // Redelivery of something already stored: skip the decode entirely
        if sequence.is_some() && watermark.sequence >= sequence {
            let id = synthetic_id(&topic_id, sequence, &message.raw.consensus_timestamp, &message.raw.message);
            if store.contains(&id) {
                self.topic(&topic_id).duplicates += 1;
                self.emit(MetricEvent::Duplicate { topic_id });
                return;
            }
        }

        let behind = watermark.is_behind(sequence, consensus);
        let now = self.clock.now_millis();
        {
            let stats = self.topic(&topic_id);
            stats.last_activity_ms = Some(now);
            if let Some(at) = consensus {
                stats.last_consensus = Some(stats.last_consensus.map_or(at, |c| c.max(at)));
            }
        }

        match self.decoder.decode(&message, source) {
            DecodeOutcome::Event(event) => {
                if behind {
                    self.topic(&topic_id).anomalies += 1;
                    let position = match sequence {
                        Some(seq) => format!("#{}", seq),
                        None => consensus.map(|c| c.to_string()).unwrap_or_default(),
                    };
                    let mark = match watermark.sequence {
                        Some(seq) => format!("#{}", seq),
                        None => watermark.consensus.map(|c| c.to_string()).unwrap_or_default(),
                    };
                    self.emit(MetricEvent::OrderAnomaly {
                        topic_id: topic_id.clone(),
                        position,
                        watermark: mark,
                    });
                }
                self.ingest_event(event, store);
            }
            DecodeOutcome::Unknown(unknown) => self.quarantine(unknown, store),
        }

        self.watermarks
            .entry(topic_id)
            .or_default()
            .advance(sequence, consensus);
    }

    /// Hand a decoded event to the store and account for the outcome
    fn ingest_event(&mut self, event: SignalEvent, store: &mut SignalStore) -> bool {
        let topic_id = event.topic_id.clone();
        let source = event.source;
        let actor = event.actor.clone();
        let signal_type = event.signal_type.clone();

        match store.add(event) {
            AddOutcome::Duplicate => {
                self.topic(&topic_id).duplicates += 1;
                self.emit(MetricEvent::Duplicate { topic_id });
                false
            }
            AddOutcome::Replaced => {
                self.count_processed(&topic_id, source);
                self.emit(MetricEvent::Replaced { topic_id: topic_id.clone() });
                self.emit(MetricEvent::Ingested { topic_id, source });
                true
            }
            AddOutcome::Inserted { catalog, newly_excluded } => {
                self.count_processed(&topic_id, source);
                match signal_type {
                    SignalType::RecognitionDefinition => self.topic(&topic_id).recognition_definitions += 1,
                    SignalType::RecognitionMint => self.topic(&topic_id).recognition_instances += 1,
                    _ => {}
                }
                match catalog {
                    CatalogChange::InstancePending { recognition_id } => {
                        self.topic(&topic_id).recognition_pending += 1;
                        self.emit(MetricEvent::PendingRecognition { recognition_id });
                    }
                    CatalogChange::DefinitionPublished { id, unblocked } if unblocked > 0 => {
                        log::debug!("Definition {} resolved {} pending recognition(s)", id, unblocked);
                    }
                    _ => {}
                }
                if newly_excluded > 0 {
                    self.emit(MetricEvent::CapacityViolation {
                        actor,
                        excluded: newly_excluded,
                    });
                }
                self.emit(MetricEvent::Ingested { topic_id, source });
                true
            }
        }
    }

    fn count_processed(&mut self, topic_id: &str, source: DeliverySource) {
        let stats = self.topic(topic_id);
        match source {
            DeliverySource::Backfill => stats.backfilled += 1,
            DeliverySource::Stream => stats.streamed += 1,
        }
    }

    fn quarantine(&mut self, unknown: UnknownPayload, store: &mut SignalStore) {
        let topic_id = unknown.message.topic_id().to_string();
        log::debug!("Quarantined payload on {}: {}", topic_id, unknown.reason);
        self.topic(&topic_id).failed += 1;
        self.emit(MetricEvent::DecodeFailed {
            topic_id: topic_id.clone(),
            reason: unknown.reason.clone(),
        });

        match store.quarantine_mut().push(unknown) {
            QuarantinePush::AlreadyQueued => {}
            QuarantinePush::Queued => self.emit(MetricEvent::Quarantined { topic_id }),
            QuarantinePush::Evicted(oldest) => {
                self.emit(MetricEvent::Quarantined { topic_id });
                self.emit(MetricEvent::QuarantineEvicted {
                    topic_id: oldest.message.topic_id().to_string(),
                });
            }
        }
    }

    /// Retry every quarantined payload against the current decoder
    pub fn reclassify(&mut self, store: &mut SignalStore) -> ReclassifyReport {
        let entries = store.quarantine_mut().take_all();
        if entries.is_empty() {
            return ReclassifyReport::default();
        }

        let mut recovered = 0;
        for entry in entries {
            match self.decoder.decode(&entry.message, entry.source) {
                DecodeOutcome::Event(event) => {
                    if self.ingest_event(event, store) {
                        recovered += 1;
                    }
                }
                DecodeOutcome::Unknown(unknown) => {
                    store.quarantine_mut().push(unknown);
                }
            }
        }

        if recovered > 0 {
            self.emit(MetricEvent::Reclassified { recovered });
        }
        ReclassifyReport {
            recovered,
            remaining: store.quarantine().len(),
        }
    }

    pub fn watermark(&self, topic_id: &str) -> Option<Watermark> {
        self.watermarks.get(topic_id).copied()
    }

    /// Consensus position to resume a topic from
    pub fn watermark_position(&self, topic_id: &str) -> Option<ConsensusTime> {
        self.watermarks.get(topic_id).and_then(|w| w.consensus)
    }

    pub fn watermarks(&self) -> BTreeMap<String, Watermark> {
        self.watermarks.clone()
    }

    pub fn topic_stats(&self, topic_id: &str) -> TopicStats {
        self.stats.get(topic_id).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> IngestStats {
        let mut totals = IngestTotals::default();
        for stats in self.stats.values() {
            totals.processed += stats.processed();
            totals.backfilled += stats.backfilled;
            totals.streamed += stats.streamed;
            totals.duplicates += stats.duplicates;
            totals.failed += stats.failed;
            totals.anomalies += stats.anomalies;
            totals.fetch_failures += stats.fetch_failures;
        }
        IngestStats {
            topics: self.stats.clone(),
            totals,
        }
    }

    /// Topics currently failing, as health issues
    pub fn topic_issues(&self) -> Vec<String> {
        self.stats
            .iter()
            .filter(|(_, stats)| stats.consecutive_failures > 0)
            .map(|(topic_id, stats)| {
                format!(
                    "topic {}: {} consecutive failure(s), last: {}",
                    topic_id,
                    stats.consecutive_failures,
                    stats.last_error.as_deref().unwrap_or("unknown")
                )
            })
            .collect()
    }

    /// Whether any topic has failed at least `threshold` times in a row
    pub fn is_degraded(&self, threshold: u32) -> bool {
        self.stats
            .values()
            .any(|stats| stats.consecutive_failures >= threshold.max(1))
    }

    /// Forget watermarks and stats (explicit resync)
    pub fn reset(&mut self) {
        self.watermarks.clear();
        self.stats.clear();
        self.sync_state.reset();
    }
}

/// Drain the ingestion channel until every sender is gone
///
/// Lock order is core, then store, everywhere.
pub async fn run_ingestion(
    mut rx: mpsc::Receiver<IngestMessage>,
    core: Arc<Mutex<IngestCore>>,
    store: Arc<RwLock<SignalStore>>,
) {
    let channel_capacity = rx.max_capacity();
    log::info!("🚀 Starting ingestion loop");
    log::info!("   └─ Channel capacity: {}", channel_capacity);

    let mut stats_timer = interval(Duration::from_secs(10));
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_timer.tick().await;
    let mut message_count = 0u64;
    let mut last_log_time = tokio::time::Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(message) = received else {
                    break;
                };
                {
                    let mut core = core.lock().await;
                    let mut store = store.write().await;
                    core.apply(message, &mut store);
                }
                message_count += 1;
            }

            _ = stats_timer.tick() => {
                let elapsed = last_log_time.elapsed().as_secs_f64().max(f64::EPSILON);
                let channel_usage = rx.len();
                log::info!(
                    "📊 Ingestion rate: {:.1} msg/sec (last 10s: {}) | channel: {}/{}",
                    message_count as f64 / elapsed,
                    message_count,
                    channel_usage,
                    channel_capacity
                );
                if channel_usage > channel_capacity / 2 {
                    log::warn!(
                        "⚠️  Channel usage high: {}/{} ({}%)",
                        channel_usage,
                        channel_capacity,
                        (channel_usage * 100) / channel_capacity.max(1)
                    );
                }
                message_count = 0;
                last_log_time = tokio::time::Instant::now();
            }
        }
    }

    log::info!("✅ Ingestion loop stopped");
}
