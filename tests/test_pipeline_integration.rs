//! End-to-end tests for the ingestion runtime
//!
//! An in-memory mirror stands in for the network. Each test boots an
//! `IngestionOrchestrator` against it and checks the materialized views and
//! the health surface.
//!
//! Key integration points tested:
//! - Bounded backfill fan-in from several topics through one channel
//! - Poll delivery of messages published after start
//! - Partial topic failure surfacing as DEGRADED health
//! - Watermark resumability across stop/start, including gaps wider than the backfill window
//! - Cache clear with a full resync in poll and stream mode
//! - Push stream delivery

#[cfg(test)]
mod pipeline_integration_tests {
    use async_trait::async_trait;
    use base64::Engine;
    use futures::stream::{self, StreamExt};
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use trustflow::pipeline::config::{PipelineConfig, TopicConfig};
    use trustflow::pipeline::decoder::TopicKind;
    use trustflow::pipeline::orchestrator::{IngestionOrchestrator, OrchestratorState};
    use trustflow::pipeline::sync_state::HealthStatus;
    use trustflow::pipeline::types::{DeliverySource, SignalType};
    use trustflow::streamer_core::config::MirrorConfig;
    use trustflow::streamer_core::mirror_client::{
        ConsensusTime, FetchError, MessagePage, MirrorSource, Order, PageRequest, RawMessage,
    };
    use trustflow::streamer_core::stream_subscriber::{MessageStream, StreamSource};

    const CONTACTS: &str = "0.0.101";
    const TRUST: &str = "0.0.102";
    const RECOGNITION: &str = "0.0.103";

    fn raw(topic: &str, seq: u64, json: &str) -> RawMessage {
        RawMessage {
            topic_id: topic.to_string(),
            sequence_number: Some(seq),
            consensus_timestamp: format!("{}.000000000", 1_700_000_000 + seq),
            message: base64::engine::general_purpose::STANDARD.encode(json),
            running_hash: None,
        }
    }

    /// Messages per topic, paged with numeric offset tokens
    #[derive(Default)]
    struct MemoryMirror {
        topics: Mutex<HashMap<String, Vec<RawMessage>>>,
        failing: Mutex<HashSet<String>>,
    }

    impl MemoryMirror {
        fn publish(&self, topic: &str, json: &str) {
            let mut topics = self.topics.lock().unwrap();
            let messages = topics.entry(topic.to_string()).or_default();
            let seq = messages.len() as u64 + 1;
            messages.push(raw(topic, seq, json));
        }

        fn fail(&self, topic: &str) {
            self.failing.lock().unwrap().insert(topic.to_string());
        }
    }

    #[async_trait]
    impl MirrorSource for MemoryMirror {
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

    /// Push source that delivers a fixed set of frames and then stays open
    struct OneShotStream {
        frames: Mutex<HashMap<String, Vec<RawMessage>>>,
    }

    #[async_trait]
    impl StreamSource for OneShotStream {
        async fn connect(
            &self,
            topic_id: &str,
            _since: Option<ConsensusTime>,
        ) -> Result<MessageStream, FetchError> {
            let frames = self
                .frames
                .lock()
                .unwrap()
                .remove(topic_id)
                .unwrap_or_default();
            Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed())
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new(
            MirrorConfig::default(),
            vec![
                TopicConfig::new(TopicKind::Contacts, CONTACTS),
                TopicConfig::new(TopicKind::Trust, TRUST),
                TopicConfig::new(TopicKind::Recognition, RECOGNITION),
            ],
        );
        config.poll_interval_ms = 20;
        config.poll_max_interval_ms = 200;
        config.mirror.page_size = 2;
        config
    }

    fn seeded_mirror() -> Arc<MemoryMirror> {
        let mirror = Arc::new(MemoryMirror::default());
        mirror.publish(CONTACTS, r#"{"type":"CONTACT_REQUEST","actor":"alice","target":"bob"}"#);
        mirror.publish(CONTACTS, r#"{"type":"CONTACT_ACCEPT","actor":"bob","target":"alice"}"#);
        mirror.publish(TRUST, r#"{"type":"TRUST_ALLOCATE","actor":"alice","target":"bob"}"#);
        mirror.publish(RECOGNITION, r#"{"owner":"tm-alex-chen","recognitionId":"chad","actor":"issuer-1"}"#);
        mirror.publish(RECOGNITION, r#"{"slug":"chad","title":"Chad","description":"alpha vibes"}"#);
        mirror
    }

    /// Poll `check` until it holds or two seconds pass
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_backfill_builds_materialized_views() {
        let orchestrator = IngestionOrchestrator::new(config(), seeded_mirror());
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);

        {
            let store = store.read().await;
            let bonded = store.get_bonded_contacts("alice");
            assert_eq!(bonded.len(), 1);
            assert_eq!(bonded[0].peer_id, "bob");
            assert_eq!(bonded[0].trust_level, Some(25));
            assert_eq!(store.get_bonded_contacts("bob")[0].peer_id, "alice");

            assert_eq!(store.get_trust_stats("alice").allocated_out, 25);
            assert_eq!(store.get_trust_stats("bob").received_in, 25);

            // Instance arrived before its definition and was joined late
            let recognitions = store.get_recognitions_for("tm-alex-chen");
            assert_eq!(recognitions.len(), 1);
            assert_eq!(recognitions[0].definition.title, "Chad");
            assert!(store.pending_recognitions().is_empty());
        }

        let health = orchestrator.health().await;
        assert_eq!(health.state, OrchestratorState::Running);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.topics[CONTACTS].processed, 2);
        assert_eq!(health.topics[RECOGNITION].cursor.sequence, Some(2));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_picks_up_new_messages() {
        let mirror = seeded_mirror();
        let orchestrator = IngestionOrchestrator::new(config(), mirror.clone());
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);

        mirror.publish(TRUST, r#"{"type":"TRUST_ALLOCATE","actor":"alice","target":"carol"}"#);
        assert!(eventually(|| async { store.read().await.len() == 6 }).await);

        let store = store.read().await;
        assert_eq!(store.get_trust_stats("alice").slots_used, 2);
        let allocations = store.get_by_type(&SignalType::TrustAllocate);
        assert!(allocations.iter().all(|e| e.source == DeliverySource::Backfill));
        drop(store);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_topic_failure_reports_degraded() {
        let mirror = seeded_mirror();
        mirror.fail(TRUST);
        let mut config = config();
        config.degraded_after_failures = 2;
        let orchestrator = IngestionOrchestrator::new(config, mirror);
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 4 }).await);
        assert!(eventually(|| async { orchestrator.state().await == OrchestratorState::Degraded }).await);

        let health = orchestrator.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.healthy);
        assert!(health.issues.iter().any(|issue| issue.contains(TRUST)));

        // Healthy topics stay queryable
        assert_eq!(store.read().await.get_bonded_contacts("alice").len(), 1);
        assert!(health.topics[TRUST].consecutive_failures >= 2);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_resumes_from_watermark() {
        let mirror = seeded_mirror();
        let orchestrator = IngestionOrchestrator::new(config(), mirror.clone());
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);
        orchestrator.stop().await.unwrap();
        let before = orchestrator.watermarks().await;
        assert_eq!(before[CONTACTS].sequence, Some(2));

        mirror.publish(CONTACTS, r#"{"type":"CONTACT_REQUEST","actor":"carol","target":"alice"}"#);
        orchestrator.start().await.unwrap();
        assert!(eventually(|| async { store.read().await.len() == 6 }).await);

        let stats = orchestrator.stats().await;
        assert_eq!(stats.totals.processed, 6);
        assert_eq!(stats.topics[CONTACTS].processed(), 3);
        assert_eq!(orchestrator.watermarks().await[CONTACTS].sequence, Some(3));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_replays_gap_larger_than_backfill_window() {
        let mirror = seeded_mirror();
        let mut config = config();
        config.backfill_limit = 2;
        let orchestrator = IngestionOrchestrator::new(config, mirror.clone());
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);
        orchestrator.stop().await.unwrap();

        for i in 0..5 {
            let json = format!(r#"{{"type":"CONTACT_REQUEST","actor":"user-{}","target":"alice"}}"#, i);
            mirror.publish(CONTACTS, &json);
        }
        orchestrator.start().await.unwrap();
        assert!(eventually(|| async { store.read().await.len() == 10 }).await);

        let seqs: Vec<Option<u64>> = store
            .read()
            .await
            .get_all()
            .iter()
            .filter(|e| e.topic_id == CONTACTS)
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, (1..=7u64).map(Some).collect::<Vec<_>>());

        let stats = orchestrator.stats().await;
        assert_eq!(stats.topics[CONTACTS].processed(), 7);
        assert_eq!(stats.topics[CONTACTS].duplicates, 0);
        assert_eq!(orchestrator.watermarks().await[CONTACTS].sequence, Some(7));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_caches_resyncs_stream_mode() {
        let orchestrator = IngestionOrchestrator::new(config(), seeded_mirror())
            .with_stream(Arc::new(OneShotStream { frames: Mutex::new(HashMap::new()) }));
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);
        assert!(eventually(|| async { orchestrator.health().await.connection_count == 3 }).await);

        orchestrator.clear_caches().await.unwrap();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);
        assert!(eventually(|| async { orchestrator.health().await.connection_count == 3 }).await);

        let health = orchestrator.health().await;
        assert_eq!(health.state, OrchestratorState::Running);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
        assert_eq!(store.read().await.get_bonded_contacts("alice").len(), 1);
        assert_eq!(orchestrator.stats().await.totals.processed, 5);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_caches_resyncs_from_ledger() {
        let orchestrator = IngestionOrchestrator::new(config(), seeded_mirror());
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);

        orchestrator.clear_caches().await.unwrap();
        assert!(eventually(|| async { store.read().await.len() == 5 }).await);
        assert_eq!(store.read().await.get_trust_stats("alice").allocated_out, 25);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_delivery_counts_as_streamed() {
        let mirror = Arc::new(MemoryMirror::default());
        let mut frames = HashMap::new();
        frames.insert(
            CONTACTS.to_string(),
            vec![raw(CONTACTS, 1, r#"{"type":"CONTACT_REQUEST","actor":"dana","target":"erin"}"#)],
        );
        let orchestrator = IngestionOrchestrator::new(config(), mirror)
            .with_stream(Arc::new(OneShotStream { frames: Mutex::new(frames) }));
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        assert!(eventually(|| async { store.read().await.len() == 1 }).await);
        assert!(eventually(|| async { orchestrator.health().await.connection_count == 3 }).await);

        let stats = orchestrator.stats().await;
        assert_eq!(stats.topics[CONTACTS].streamed, 1);
        assert!(stats.topics[CONTACTS].streaming);
        assert_eq!(store.read().await.get_all()[0].source, DeliverySource::Stream);

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.health().await.connection_count, 0);
    }
}
