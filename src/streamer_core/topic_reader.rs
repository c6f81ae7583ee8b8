//! Pull-based page fetcher over every configured topic
//!
//! Keeps a seen-set keyed by (topic, sequence) plus the highest sequence
//! returned per topic, so repeated reads only yield strictly newer entries.
//! Payloads that do not decode to JSON are skipped and counted, never fatal.

use crate::pipeline::decoder::{decode_payload, DecodeError};
use crate::streamer_core::mirror_client::{
    ConsensusTime, FetchError, MirrorSource, Order, PageRequest, RawMessage,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Seen entries older than this many sequence numbers below the watermark are pruned
const SEEN_WINDOW: u64 = 10_000;

/// A raw ledger message whose payload has already been decoded to JSON
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub raw: RawMessage,
    pub payload: serde_json::Value,
}

impl TopicMessage {
    pub fn from_raw(raw: RawMessage) -> Result<Self, DecodeError> {
        let payload = decode_payload(&raw.message)?;
        Ok(Self { raw, payload })
    }

    pub fn topic_id(&self) -> &str {
        &self.raw.topic_id
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.raw.sequence_number
    }

    pub fn consensus(&self) -> Option<ConsensusTime> {
        self.raw.consensus()
    }
}

/// Result of one read across topics: partial results plus per-topic failures
#[derive(Debug, Default)]
pub struct TopicBatch {
    /// Ascending per topic; no cross-topic order
    pub messages: Vec<TopicMessage>,
    pub failures: Vec<(String, FetchError)>,
    pub malformed: Vec<(String, DecodeError)>,
}

#[derive(Debug, Default)]
struct DedupState {
    seen: HashSet<(String, u64)>,
    max_seq: HashMap<String, u64>,
}

impl DedupState {
    /// Returns true when the message is new and records it
    fn admit(&mut self, raw: &RawMessage) -> bool {
        let Some(seq) = raw.sequence_number else {
            return true;
        };
        let key = (raw.topic_id.clone(), seq);
        let max = self.max_seq.get(&raw.topic_id).copied().unwrap_or(0);
        if seq <= max || self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key);
        self.max_seq.insert(raw.topic_id.clone(), seq);
        true
    }

    fn prune(&mut self) {
        let max_seq = &self.max_seq;
        self.seen.retain(|(topic, seq)| {
            let max = max_seq.get(topic).copied().unwrap_or(0);
            seq.saturating_add(SEEN_WINDOW) > max
        });
    }
}

pub struct TopicReader {
    source: Arc<dyn MirrorSource>,
    topics: Vec<String>,
    page_size: usize,
    state: Mutex<DedupState>,
}

impl TopicReader {
    pub fn new(source: Arc<dyn MirrorSource>, topics: Vec<String>, page_size: usize) -> Self {
        Self {
            source,
            topics: topics.into_iter().filter(|t| !t.is_empty()).collect(),
            page_size: page_size.max(1),
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    fn state(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Highest sequence number returned for a topic so far
    pub fn last_sequence(&self, topic_id: &str) -> Option<u64> {
        self.state().max_seq.get(topic_id).copied()
    }

    /// Start a topic from a committed watermark (everything at or below is skipped)
    pub fn seed(&self, topic_id: &str, sequence: u64) {
        let mut state = self.state();
        let entry = state.max_seq.entry(topic_id.to_string()).or_insert(0);
        *entry = (*entry).max(sequence);
    }

    /// Forget all dedup state (explicit resync)
    pub fn reset(&self) {
        let mut state = self.state();
        state.seen.clear();
        state.max_seq.clear();
    }

    /// Newest `limit_per_topic` entries of every topic, fetched in parallel
    pub async fn read_recent(&self, limit_per_topic: usize) -> TopicBatch {
        self.resume(&HashMap::new(), limit_per_topic).await
    }

    /// Startup read: topics with a committed position are paged ascending
    /// from it until the source is exhausted; the rest get the bounded
    /// newest-first window of `limit_per_topic`
    pub async fn resume(
        &self,
        positions: &HashMap<String, ConsensusTime>,
        limit_per_topic: usize,
    ) -> TopicBatch {
        let fetches = self.topics.iter().map(|topic| async move {
            match positions.get(topic) {
                Some(since) => self.fetch_ascending(topic, Some(*since), usize::MAX).await,
                None => self.fetch_newest(topic, limit_per_topic).await,
            }
        });
        let results = join_all(fetches).await;

        let mut batch = TopicBatch::default();
        for (topic, result) in self.topics.iter().zip(results) {
            match result {
                Ok(raws) => self.admit_into(&mut batch, raws),
                Err(e) => {
                    log::warn!("⚠️  Topic {} fetch failed: {}", topic, e);
                    batch.failures.push((topic.clone(), e));
                }
            }
        }
        self.state().prune();
        batch
    }

    /// Every entry after `since` for one topic, ascending, up to `limit`
    pub async fn catch_up(
        &self,
        topic_id: &str,
        since: Option<ConsensusTime>,
        limit: usize,
    ) -> Result<TopicBatch, FetchError> {
        let raws = self.fetch_ascending(topic_id, since, limit).await?;
        let mut batch = TopicBatch::default();
        self.admit_into(&mut batch, raws);
        self.state().prune();
        Ok(batch)
    }

    async fn fetch_ascending(
        &self,
        topic_id: &str,
        since: Option<ConsensusTime>,
        limit: usize,
    ) -> Result<Vec<RawMessage>, FetchError> {
        let page_size = self.page_size.min(limit.max(1));
        let mut request = PageRequest::first(topic_id, page_size, Order::Asc, since);
        let mut raws = Vec::new();

        loop {
            let page = self.source.fetch_page(&request).await?;
            let exhausted = page.messages.is_empty();
            raws.extend(page.messages);

            if raws.len() >= limit || exhausted {
                break;
            }
            match page.next {
                Some(next) => request = request.continuation(next),
                None => break,
            }
        }
        raws.truncate(limit);
        Ok(raws)
    }

    async fn fetch_newest(&self, topic_id: &str, limit: usize) -> Result<Vec<RawMessage>, FetchError> {
        let watermark = self.last_sequence(topic_id);
        let page_size = self.page_size.min(limit.max(1));
        let mut request = PageRequest::first(topic_id, page_size, Order::Desc, None);
        let mut newest_first = Vec::new();

        'pages: loop {
            let page = self.source.fetch_page(&request).await?;
            if page.messages.is_empty() {
                break;
            }
            for raw in page.messages {
                let reached_seen = matches!(
                    (raw.sequence_number, watermark),
                    (Some(seq), Some(mark)) if seq <= mark
                );
                if reached_seen {
                    break 'pages;
                }
                newest_first.push(raw);
                if newest_first.len() >= limit {
                    break 'pages;
                }
            }
            match page.next {
                Some(next) => request = request.continuation(next),
                None => break,
            }
        }

        newest_first.reverse();
        Ok(newest_first)
    }

    fn admit_into(&self, batch: &mut TopicBatch, raws: Vec<RawMessage>) {
        for raw in raws {
            if !self.state().admit(&raw) {
                continue;
            }
            let topic = raw.topic_id.clone();
            match TopicMessage::from_raw(raw) {
                Ok(message) => batch.messages.push(message),
                Err(e) => {
                    log::debug!("Skipping malformed payload on {}: {}", topic, e);
                    batch.malformed.push((topic, e));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::streamer_core::mirror_client::MessagePage;
    use async_trait::async_trait;
    use base64::Engine;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    pub(crate) fn raw(topic: &str, seq: u64, json: &str) -> RawMessage {
        RawMessage {
            topic_id: topic.to_string(),
            sequence_number: Some(seq),
            consensus_timestamp: format!("{}.000000000", 1_700_000_000 + seq),
            message: base64::engine::general_purpose::STANDARD.encode(json),
            running_hash: None,
        }
    }

    /// In-memory mirror: messages per topic, paged by sequence number
    #[derive(Default)]
    struct FakeMirror {
        topics: StdMutex<HashMap<String, Vec<RawMessage>>>,
        failing: StdMutex<HashSet<String>>,
    }

    impl FakeMirror {
        fn push(&self, message: RawMessage) {
            self.topics
                .lock()
                .unwrap()
                .entry(message.topic_id.clone())
                .or_default()
                .push(message);
        }
    }

    #[async_trait]
    impl MirrorSource for FakeMirror {
        async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, FetchError> {
            if self.failing.lock().unwrap().contains(&request.topic_id) {
                return Err(FetchError::Status {
                    topic_id: request.topic_id.clone(),
                    status: 503,
                });
            }
            let mut all = self
                .topics
                .lock()
                .unwrap()
                .get(&request.topic_id)
                .cloned()
                .unwrap_or_default();
            if let Some(after) = request.after {
                all.retain(|m| m.consensus().map(|c| c > after).unwrap_or(false));
            }
            if request.order == Order::Desc {
                all.reverse();
            }
            let offset: usize = request
                .next
                .as_deref()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let page: Vec<RawMessage> = all.iter().skip(offset).take(request.limit).cloned().collect();
            let consumed = offset + page.len();
            Ok(MessagePage {
                next: (consumed < all.len()).then(|| consumed.to_string()),
                messages: page,
            })
        }
    }

    fn reader_with(mirror: Arc<FakeMirror>, topics: &[&str], page_size: usize) -> TopicReader {
        TopicReader::new(
            mirror,
            topics.iter().map(|t| t.to_string()).collect(),
            page_size,
        )
    }

    #[tokio::test]
    async fn test_read_recent_paginates_and_orders_ascending() {
        let mirror = Arc::new(FakeMirror::default());
        for seq in 1..=7 {
            mirror.push(raw("0.0.1", seq, r#"{"type":"PROFILE_UPDATE","actor":"a"}"#));
        }
        let reader = reader_with(mirror, &["0.0.1"], 2);

        let batch = reader.read_recent(5).await;
        let seqs: Vec<u64> = batch.messages.iter().filter_map(|m| m.sequence_number()).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7]);
        assert_eq!(reader.last_sequence("0.0.1"), Some(7));
    }

    #[tokio::test]
    async fn test_repeated_reads_return_only_newer_entries() {
        let mirror = Arc::new(FakeMirror::default());
        mirror.push(raw("0.0.1", 1, r#"{"a":1}"#));
        mirror.push(raw("0.0.1", 2, r#"{"a":2}"#));
        let reader = reader_with(mirror.clone(), &["0.0.1"], 10);

        assert_eq!(reader.read_recent(10).await.messages.len(), 2);
        assert!(reader.read_recent(10).await.messages.is_empty());

        mirror.push(raw("0.0.1", 3, r#"{"a":3}"#));
        let batch = reader.read_recent(10).await;
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].sequence_number(), Some(3));
    }

    #[tokio::test]
    async fn test_failing_topic_is_isolated() {
        let mirror = Arc::new(FakeMirror::default());
        mirror.push(raw("0.0.1", 1, r#"{"a":1}"#));
        mirror.push(raw("0.0.2", 1, r#"{"b":1}"#));
        mirror.failing.lock().unwrap().insert("0.0.3".to_string());
        let reader = reader_with(mirror, &["0.0.1", "0.0.2", "0.0.3"], 10);

        let batch = reader.read_recent(10).await;
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, "0.0.3");
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped_without_aborting() {
        let mirror = Arc::new(FakeMirror::default());
        mirror.push(raw("0.0.1", 1, "not json at all"));
        mirror.push(raw("0.0.1", 2, r#"{"ok":true}"#));
        let reader = reader_with(mirror, &["0.0.1"], 10);

        let batch = reader.read_recent(10).await;
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.malformed.len(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_from_watermark() {
        let mirror = Arc::new(FakeMirror::default());
        for seq in 1..=6 {
            mirror.push(raw("0.0.1", seq, r#"{"n":1}"#));
        }
        let reader = reader_with(mirror, &["0.0.1"], 2);
        reader.seed("0.0.1", 4);

        let since = ConsensusTime::new(1_700_000_004, 0);
        let batch = reader.catch_up("0.0.1", Some(since), 100).await.unwrap();
        let seqs: Vec<u64> = batch.messages.iter().filter_map(|m| m.sequence_number()).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_resume_reads_everything_past_the_position() {
        let mirror = Arc::new(FakeMirror::default());
        for seq in 1..=9 {
            mirror.push(raw("0.0.1", seq, r#"{"n":1}"#));
            mirror.push(raw("0.0.2", seq, r#"{"n":2}"#));
        }
        let reader = reader_with(mirror, &["0.0.1", "0.0.2"], 2);
        reader.seed("0.0.1", 3);

        let mut positions = HashMap::new();
        positions.insert("0.0.1".to_string(), ConsensusTime::new(1_700_000_003, 0));
        let batch = reader.resume(&positions, 2).await;

        let seqs = |topic: &str| -> Vec<u64> {
            batch
                .messages
                .iter()
                .filter(|m| m.topic_id() == topic)
                .filter_map(|m| m.sequence_number())
                .collect()
        };
        // Positioned topic ignores the window; the other stays bounded
        assert_eq!(seqs("0.0.1"), vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(seqs("0.0.2"), vec![8, 9]);
    }

    #[test]
    fn test_seen_set_pruned_below_window() {
        let mut state = DedupState::default();
        assert!(state.admit(&raw("0.0.1", 1, "{}")));
        assert!(state.admit(&raw("0.0.1", SEEN_WINDOW + 5, "{}")));
        state.prune();
        assert_eq!(state.seen.len(), 1);
        assert!(!state.admit(&raw("0.0.1", 1, "{}")));
    }
}
