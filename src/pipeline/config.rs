//! Pipeline configuration from environment variables

use super::decoder::TopicKind;
use super::scheduler::PollCadence;
use crate::streamer_core::config::{parse_or, ConfigError, MirrorConfig};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// One configured ledger topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub kind: TopicKind,
    pub topic_id: String,
}

impl TopicConfig {
    pub fn new(kind: TopicKind, topic_id: impl Into<String>) -> Self {
        Self {
            kind,
            topic_id: topic_id.into(),
        }
    }
}

/// Environment key and whether the topic must be present
const TOPIC_KEYS: &[(TopicKind, &str, bool)] = &[
    (TopicKind::Contacts, "TOPIC_CONTACTS", true),
    (TopicKind::Trust, "TOPIC_TRUST", true),
    (TopicKind::Recognition, "TOPIC_RECOGNITION", true),
    (TopicKind::Profile, "TOPIC_PROFILE", false),
    (TopicKind::Signal, "TOPIC_SIGNAL", false),
    (TopicKind::System, "TOPIC_SYSTEM", false),
];

/// Configuration for the ingestion runtime
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mirror: MirrorConfig,

    /// Topics that passed id validation, in declaration order
    pub topics: Vec<TopicConfig>,

    /// Backfill window when a topic has no watermark yet
    pub backfill_limit: usize,

    /// Fixed inter-poll delay in milliseconds
    pub poll_interval_ms: u64,

    /// Ceiling for the poll delay while the ingestion queue is backed up
    pub poll_max_interval_ms: u64,

    /// Capacity of the single ingestion channel
    pub channel_buffer: usize,

    /// Queue depth above which poll cadence slows
    pub backlog_threshold: usize,

    /// Consecutive failures on one topic before the orchestrator reports DEGRADED
    pub degraded_after_failures: u32,

    pub stale_after_secs: u64,
    pub error_log_capacity: usize,
    pub quarantine_capacity: usize,
    pub reclassify_interval_ms: u64,
}

impl PipelineConfig {
    /// Config with default tuning for an explicit topic set
    pub fn new(mirror: MirrorConfig, topics: Vec<TopicConfig>) -> Self {
        Self {
            mirror,
            topics,
            backfill_limit: 1_000,
            poll_interval_ms: 5_000,
            poll_max_interval_ms: 60_000,
            channel_buffer: 10_000,
            backlog_threshold: 5_000,
            degraded_after_failures: 3,
            stale_after_secs: 300,
            error_log_capacity: 10,
            quarantine_capacity: 1_000,
            reclassify_interval_ms: 60_000,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`
    ///
    /// Topic variables:
    /// - `TOPIC_CONTACTS`, `TOPIC_TRUST`, `TOPIC_RECOGNITION` (required at start)
    /// - `TOPIC_PROFILE`, `TOPIC_SIGNAL`, `TOPIC_SYSTEM` (optional)
    ///
    /// Tuning:
    /// - `BACKFILL_LIMIT` (default: 1000)
    /// - `POLL_INTERVAL_MS` / `POLL_MAX_INTERVAL_MS` (default: 5000 / 60000)
    /// - `INGEST_CHANNEL_BUFFER` (default: 10000)
    /// - `INGEST_BACKLOG_THRESHOLD` (default: 5000)
    /// - `DEGRADED_AFTER_FAILURES` (default: 3)
    /// - `STALE_AFTER_SECS` (default: 300)
    /// - `ERROR_LOG_CAPACITY` (default: 10)
    /// - `QUARANTINE_CAPACITY` (default: 1000)
    /// - `RECLASSIFY_INTERVAL_MS` (default: 60000)
    ///
    /// Invalid topic ids are skipped with a warning; required topics are only
    /// checked by `validate()`, so a missing one fails `start()` rather than
    /// the load.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mirror = MirrorConfig::from_lookup(&lookup)?;

        let mut topics = Vec::new();
        for (kind, key, _) in TOPIC_KEYS {
            let Some(raw) = lookup(key) else {
                continue;
            };
            let topic_id = raw.trim();
            if is_valid_topic_id(topic_id) {
                topics.push(TopicConfig::new(*kind, topic_id));
            } else {
                log::warn!("⚠️  Ignoring {}: '{}' is not a topic id", key, raw);
            }
        }

        let defaults = Self::new(mirror.clone(), Vec::new());
        Ok(Self {
            mirror,
            topics,
            backfill_limit: parse_or(&lookup, "BACKFILL_LIMIT", defaults.backfill_limit),
            poll_interval_ms: parse_or(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval_ms),
            poll_max_interval_ms: parse_or(&lookup, "POLL_MAX_INTERVAL_MS", defaults.poll_max_interval_ms),
            channel_buffer: parse_or(&lookup, "INGEST_CHANNEL_BUFFER", defaults.channel_buffer),
            backlog_threshold: parse_or(&lookup, "INGEST_BACKLOG_THRESHOLD", defaults.backlog_threshold),
            degraded_after_failures: parse_or(
                &lookup,
                "DEGRADED_AFTER_FAILURES",
                defaults.degraded_after_failures,
            ),
            stale_after_secs: parse_or(&lookup, "STALE_AFTER_SECS", defaults.stale_after_secs),
            error_log_capacity: parse_or(&lookup, "ERROR_LOG_CAPACITY", defaults.error_log_capacity),
            quarantine_capacity: parse_or(&lookup, "QUARANTINE_CAPACITY", defaults.quarantine_capacity),
            reclassify_interval_ms: parse_or(
                &lookup,
                "RECLASSIFY_INTERVAL_MS",
                defaults.reclassify_interval_ms,
            ),
        })
    }

    /// Checks run before a boot attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, key, required) in TOPIC_KEYS {
            if *required && !self.topics.iter().any(|t| t.kind == *kind) {
                return Err(ConfigError::MissingVariable(key.to_string()));
            }
        }
        if let Some(bad) = self.topics.iter().find(|t| !is_valid_topic_id(&t.topic_id)) {
            return Err(ConfigError::InvalidValue(format!(
                "'{}' is not a topic id",
                bad.topic_id
            )));
        }
        if self.channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "INGEST_CHANNEL_BUFFER must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > self.poll_max_interval_ms {
            return Err(ConfigError::InvalidValue(format!(
                "poll interval must satisfy 0 < base ({}) <= max ({})",
                self.poll_interval_ms, self.poll_max_interval_ms
            )));
        }
        self.mirror.validate()
    }

    pub fn topic_ids(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.topic_id.clone()).collect()
    }

    pub fn topic_kinds(&self) -> HashMap<String, TopicKind> {
        self.topics
            .iter()
            .map(|t| (t.topic_id.clone(), t.kind))
            .collect()
    }

    pub fn cadence(&self) -> PollCadence {
        PollCadence {
            base: Duration::from_millis(self.poll_interval_ms),
            max: Duration::from_millis(self.poll_max_interval_ms),
            backlog_threshold: self.backlog_threshold,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reclassify_interval(&self) -> Duration {
        Duration::from_millis(self.reclassify_interval_ms.max(1))
    }
}

/// `shard.realm.num`, all decimal
pub fn is_valid_topic_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}
