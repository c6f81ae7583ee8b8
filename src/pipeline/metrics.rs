//! Structured pipeline events
//!
//! Decision logic emits `MetricEvent`s; sinks decide what to do with them.
//! `SyncState` consumes the same stream to derive health.

use super::types::DeliverySource;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Ingested { topic_id: String, source: DeliverySource },
    Duplicate { topic_id: String },
    Replaced { topic_id: String },
    DecodeFailed { topic_id: String, reason: String },
    Quarantined { topic_id: String },
    QuarantineEvicted { topic_id: String },
    Reclassified { recovered: usize },
    FetchFailed { topic_id: String, error: String },
    FetchRecovered { topic_id: String },
    OrderAnomaly { topic_id: String, position: String, watermark: String },
    CapacityViolation { actor: String, excluded: usize },
    PendingRecognition { recognition_id: String },
    StreamConnected { topic_id: String },
    StreamDisconnected { topic_id: String, reason: String },
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricEvent::Ingested { .. } => "ingested",
            MetricEvent::Duplicate { .. } => "duplicate",
            MetricEvent::Replaced { .. } => "replaced",
            MetricEvent::DecodeFailed { .. } => "decode_failed",
            MetricEvent::Quarantined { .. } => "quarantined",
            MetricEvent::QuarantineEvicted { .. } => "quarantine_evicted",
            MetricEvent::Reclassified { .. } => "reclassified",
            MetricEvent::FetchFailed { .. } => "fetch_failed",
            MetricEvent::FetchRecovered { .. } => "fetch_recovered",
            MetricEvent::OrderAnomaly { .. } => "order_anomaly",
            MetricEvent::CapacityViolation { .. } => "capacity_violation",
            MetricEvent::PendingRecognition { .. } => "pending_recognition",
            MetricEvent::StreamConnected { .. } => "stream_connected",
            MetricEvent::StreamDisconnected { .. } => "stream_disconnected",
        }
    }

    /// Message worth surfacing as a health error, if any
    pub fn error_message(&self) -> Option<String> {
        match self {
            MetricEvent::FetchFailed { topic_id, error } => {
                Some(format!("topic {} fetch failed: {}", topic_id, error))
            }
            MetricEvent::OrderAnomaly { topic_id, position, watermark } => Some(format!(
                "topic {} delivered {} behind watermark {}",
                topic_id, position, watermark
            )),
            MetricEvent::StreamDisconnected { topic_id, reason } => {
                Some(format!("topic {} stream lost: {}", topic_id, reason))
            }
            _ => None,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Writes events to the `log` facade
#[derive(Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record(&self, event: &MetricEvent) {
        match event {
            MetricEvent::CapacityViolation { actor, excluded } => {
                log::warn!("⚠️  Trust cap exceeded by {}: {} allocation(s) excluded", actor, excluded);
            }
            MetricEvent::OrderAnomaly { .. } | MetricEvent::FetchFailed { .. } => {
                if let Some(message) = event.error_message() {
                    log::warn!("⚠️  {}", message);
                }
            }
            MetricEvent::DecodeFailed { topic_id, reason } => {
                log::debug!("Decode failed on {}: {}", topic_id, reason);
            }
            other => log::trace!("metric {:?}", other),
        }
    }
}

/// Counts events by name
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl CountingMetrics {
    pub fn count(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for CountingMetrics {
    fn record(&self, event: &MetricEvent) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(event.name()).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_metrics() {
        let metrics = CountingMetrics::default();
        metrics.record(&MetricEvent::Duplicate { topic_id: "0.0.1".into() });
        metrics.record(&MetricEvent::Duplicate { topic_id: "0.0.2".into() });
        metrics.record(&MetricEvent::CapacityViolation { actor: "a".into(), excluded: 1 });

        assert_eq!(metrics.count("duplicate"), 2);
        assert_eq!(metrics.count("capacity_violation"), 1);
        assert_eq!(metrics.count("ingested"), 0);
        assert_eq!(metrics.snapshot().len(), 2);
    }

    #[test]
    fn test_error_messages_name_the_topic() {
        let event = MetricEvent::FetchFailed {
            topic_id: "0.0.7".into(),
            error: "503".into(),
        };
        assert_eq!(event.error_message().unwrap(), "topic 0.0.7 fetch failed: 503");
        assert!(MetricEvent::Reclassified { recovered: 1 }.error_message().is_none());
    }
}
