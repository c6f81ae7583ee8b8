//! Clocks, poll cadence and the background tasks owned by the orchestrator
//!
//! Timers go through `tokio::time`, so tests run these tasks under a paused
//! runtime and advance virtual time instead of waiting.

use super::ingestion::{IngestCore, IngestMessage};
use super::store::SignalStore;
use super::types::DeliverySource;
use crate::streamer_core::topic_reader::TopicReader;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

/// Wall clock used for activity and staleness bookkeeping
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Fixed inter-poll delay that backs off while the ingestion queue is deep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    pub base: Duration,
    pub max: Duration,
    pub backlog_threshold: usize,
}

impl PollCadence {
    /// Base delay at or below the threshold; doubled for every further
    /// threshold's worth of queued messages, capped at `max`
    pub fn delay_for(&self, backlog: usize) -> Duration {
        if self.backlog_threshold == 0 || backlog <= self.backlog_threshold {
            return self.base;
        }
        let steps = (backlog / self.backlog_threshold).min(16) as u32;
        self.base
            .checked_mul(2_u32.saturating_pow(steps))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Messages queued but not yet applied by the ingestion loop
pub fn backlog<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity().saturating_sub(tx.capacity())
}

/// Poll one topic from its watermark until shut down
///
/// Each topic gets its own task, so a slow or failing topic never delays the
/// others.
pub async fn poll_topic_task(
    topic_id: String,
    reader: Arc<TopicReader>,
    core: Arc<Mutex<IngestCore>>,
    tx: mpsc::Sender<IngestMessage>,
    cadence: PollCadence,
    limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("⏰ Polling {} every {}ms", topic_id, cadence.base.as_millis());

    loop {
        if *shutdown.borrow() {
            break;
        }

        let since = core.lock().await.watermark_position(&topic_id);
        let fetched = tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.catch_up(&topic_id, since, limit) => result,
        };

        let mut outgoing = Vec::new();
        match fetched {
            Ok(batch) => {
                if !batch.messages.is_empty() {
                    log::debug!("📥 Poll {} → {} new messages", topic_id, batch.messages.len());
                }
                outgoing.extend(batch.messages.into_iter().map(|message| IngestMessage::Message {
                    message,
                    source: DeliverySource::Backfill,
                }));
                outgoing.extend(
                    batch
                        .malformed
                        .into_iter()
                        .map(|(topic_id, error)| IngestMessage::Malformed { topic_id, error }),
                );
                outgoing.push(IngestMessage::FetchSucceeded {
                    topic_id: topic_id.clone(),
                });
            }
            Err(error) => {
                log::warn!("⚠️  Poll {} failed: {}", topic_id, error);
                outgoing.push(IngestMessage::FetchFailed {
                    topic_id: topic_id.clone(),
                    error,
                });
            }
        }

        for message in outgoing {
            if *shutdown.borrow() || tx.send(message).await.is_err() {
                return;
            }
        }

        let delay = cadence.delay_for(backlog(&tx));
        if delay > cadence.base {
            log::warn!(
                "⚠️  Ingestion backlog {} on {}: slowing poll to {}ms",
                backlog(&tx),
                topic_id,
                delay.as_millis()
            );
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(delay) => {}
        }
    }

    log::info!("✅ Poll task for {} stopped", topic_id);
}

/// Periodically retry quarantined payloads against the current classifier
pub async fn reclassify_task(
    core: Arc<Mutex<IngestCore>>,
    store: Arc<RwLock<SignalStore>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let report = {
                    let mut core = core.lock().await;
                    let mut store = store.write().await;
                    core.reclassify(&mut store)
                };
                if report.recovered > 0 {
                    log::info!(
                        "🔄 Re-classified {} quarantined payloads ({} still unknown)",
                        report.recovered,
                        report.remaining
                    );
                }
            }
        }
    }
}
