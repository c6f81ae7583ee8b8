//! Liveness and health tracking for operational tooling

use super::metrics::MetricEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

const MAX_ERROR_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncError {
    pub at_ms: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub live: bool,
    pub last_synced_ms: Option<i64>,
    pub last_activity_ms: Option<i64>,
    pub connection_count: usize,
    pub errors: Vec<SyncError>,
}

#[derive(Debug)]
pub struct SyncState {
    live: bool,
    last_synced_ms: Option<i64>,
    last_activity_ms: Option<i64>,
    connection_count: usize,
    errors: VecDeque<SyncError>,
    error_capacity: usize,
    stale_after: Duration,
}

impl SyncState {
    pub fn new(error_capacity: usize, stale_after: Duration) -> Self {
        Self {
            live: false,
            last_synced_ms: None,
            last_activity_ms: None,
            connection_count: 0,
            errors: VecDeque::with_capacity(error_capacity),
            error_capacity: error_capacity.max(1),
            stale_after,
        }
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn mark_synced(&mut self, now_ms: i64) {
        self.last_synced_ms = Some(now_ms);
        self.touch(now_ms);
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_ms = Some(self.last_activity_ms.map_or(now_ms, |t| t.max(now_ms)));
    }

    pub fn connection_opened(&mut self) {
        self.connection_count += 1;
    }

    pub fn connection_closed(&mut self) {
        self.connection_count = self.connection_count.saturating_sub(1);
    }

    pub fn close_all_connections(&mut self) {
        self.connection_count = 0;
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count
    }

    /// Append to the ring buffer, truncating long messages
    pub fn record_error(&mut self, message: &str, now_ms: i64) {
        let message: String = if message.chars().count() > MAX_ERROR_LEN {
            message.chars().take(MAX_ERROR_LEN).collect()
        } else {
            message.to_string()
        };
        if self.errors.len() == self.error_capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(SyncError { at_ms: now_ms, message });
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn errors(&self) -> impl Iterator<Item = &SyncError> {
        self.errors.iter()
    }

    /// Feed a pipeline event into the tracker
    pub fn observe(&mut self, event: &MetricEvent, now_ms: i64) {
        if let Some(message) = event.error_message() {
            self.record_error(&message, now_ms);
        }
        match event {
            MetricEvent::Ingested { .. } | MetricEvent::Duplicate { .. } | MetricEvent::Replaced { .. } => {
                self.touch(now_ms)
            }
            MetricEvent::FetchRecovered { .. } => self.mark_synced(now_ms),
            MetricEvent::StreamConnected { .. } => self.connection_opened(),
            MetricEvent::StreamDisconnected { .. } => self.connection_closed(),
            _ => {}
        }
    }

    fn recent_errors(&self, now_ms: i64) -> Vec<&SyncError> {
        let window = self.stale_after.as_millis() as i64;
        self.errors
            .iter()
            .filter(|e| now_ms.saturating_sub(e.at_ms) <= window)
            .collect()
    }

    pub fn issues(&self, now_ms: i64) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.live {
            issues.push("Not connected to live stream".to_string());
        }
        if self.connection_count == 0 {
            issues.push("No active connections".to_string());
        }
        let stale = match self.last_activity_ms {
            Some(at) => now_ms.saturating_sub(at) > self.stale_after.as_millis() as i64,
            None => self.live,
        };
        if stale {
            issues.push("No recent activity".to_string());
        }
        let recent = self.recent_errors(now_ms);
        if let Some(latest) = recent.last() {
            issues.push(format!("{} error(s), latest: {}", recent.len(), latest.message));
        }
        issues
    }

    pub fn health(&self, now_ms: i64) -> HealthReport {
        self.health_with(now_ms, Vec::new())
    }

    /// Health including issues raised outside the tracker (per-topic failures)
    pub fn health_with(&self, now_ms: i64, extra_issues: Vec<String>) -> HealthReport {
        let mut issues = self.issues(now_ms);
        issues.extend(extra_issues);

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else if !self.live && self.connection_count == 0 {
            HealthStatus::Down
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            healthy: status == HealthStatus::Healthy,
            status,
            issues,
        }
    }

    pub fn time_since_last_sync(&self, now_ms: i64) -> String {
        match self.last_synced_ms {
            Some(at) => format_elapsed(now_ms.saturating_sub(at).max(0) / 1000),
            None => "never".to_string(),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            live: self.live,
            last_synced_ms: self.last_synced_ms,
            last_activity_ms: self.last_activity_ms,
            connection_count: self.connection_count,
            errors: self.errors.iter().cloned().collect(),
        }
    }

    pub fn reset(&mut self) {
        self.live = false;
        self.last_synced_ms = None;
        self.last_activity_ms = None;
        self.connection_count = 0;
        self.errors.clear();
    }
}

pub fn format_elapsed(secs: i64) -> String {
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}
