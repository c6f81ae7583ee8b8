//! Push-based live delivery per topic
//!
//! Each subscriber owns one reconnecting task. On connection loss it bridges
//! the gap by polling the topic from the last delivered consensus position,
//! then reconnects with jittered exponential backoff.

use crate::pipeline::ingestion::IngestMessage;
use crate::pipeline::types::DeliverySource;
use crate::streamer_core::config::MirrorConfig;
use crate::streamer_core::error_handler::ExponentialBackoff;
use crate::streamer_core::mirror_client::{ConsensusTime, FetchError, RawMessage};
use crate::streamer_core::topic_reader::{TopicMessage, TopicReader};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub type MessageStream = BoxStream<'static, Result<RawMessage, FetchError>>;

/// Live push subscription for one topic
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(
        &self,
        topic_id: &str,
        since: Option<ConsensusTime>,
    ) -> Result<MessageStream, FetchError>;
}

/// WebSocket subscription against the mirror's streaming endpoint
pub struct WsStreamSource {
    ws_url: String,
}

impl WsStreamSource {
    pub fn new(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn topic_url(&self, topic_id: &str, since: Option<ConsensusTime>) -> String {
        let mut url = format!("{}/topics/{}/messages", self.ws_url, topic_id);
        if let Some(since) = since {
            url.push_str(&format!("?timestamp=gt:{}", since));
        }
        url
    }
}

#[async_trait]
impl StreamSource for WsStreamSource {
    async fn connect(
        &self,
        topic_id: &str,
        since: Option<ConsensusTime>,
    ) -> Result<MessageStream, FetchError> {
        let url = self.topic_url(topic_id, since);
        log::info!("🔌 Connecting stream {}", url);

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let topic = topic_id.to_string();
        let stream = ws
            .filter_map(move |frame| {
                let topic = topic.clone();
                async move {
                    match frame {
                        Ok(Message::Text(text)) => parse_frame(&topic, &text).transpose(),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => parse_frame(&topic, &text).transpose(),
                            Err(_) => None,
                        },
                        Ok(Message::Close(_)) => Some(Err(FetchError::Closed)),
                        Ok(_) => None,
                        Err(e) => Some(Err(FetchError::Connection(e.to_string()))),
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}

/// Normalize one push frame into a `RawMessage`
///
/// Frames usually carry the REST message shape; bare payloads are wrapped so
/// the decoder can still read them. Blank frames yield `None`.
pub fn parse_frame(topic_id: &str, text: &str) -> Result<Option<RawMessage>, FetchError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let json: Value =
        serde_json::from_str(text).map_err(|e| FetchError::Decode(format!("frame: {}", e)))?;

    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| json.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };

    let message = match json.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => text.to_string(),
    };
    let sequence_number = ["sequence_number", "sequenceNumber"]
        .iter()
        .find_map(|k| json.get(*k).and_then(Value::as_u64));

    Ok(Some(RawMessage {
        topic_id: str_field(&["topic_id", "topicId"]).unwrap_or_else(|| topic_id.to_string()),
        sequence_number,
        consensus_timestamp: str_field(&["consensus_timestamp", "consensusTimestamp"])
            .unwrap_or_default(),
        message,
        running_hash: str_field(&["running_hash", "runningHash"]),
    }))
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    /// Max entries pulled per gap-bridging poll
    pub fallback_limit: usize,
}

impl SubscriberOptions {
    pub fn from_mirror(config: &MirrorConfig, fallback_limit: usize) -> Self {
        Self {
            initial_backoff_ms: config.reconnect_initial_ms,
            max_backoff_ms: config.reconnect_max_ms,
            jitter_ms: config.jitter_ms,
            fallback_limit,
        }
    }
}

pub struct StreamSubscriber {
    topic_id: String,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSubscriber {
    /// Spawn the subscription task; delivery starts after `since`
    pub fn spawn(
        topic_id: &str,
        source: Arc<dyn StreamSource>,
        fallback: Option<Arc<TopicReader>>,
        since: Option<ConsensusTime>,
        options: SubscriberOptions,
        tx: mpsc::Sender<IngestMessage>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = SubscriptionTask {
            topic_id: topic_id.to_string(),
            source,
            fallback,
            since,
            options,
            tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            topic_id: topic_id.to_string(),
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Release the connection; nothing is delivered after this returns
    ///
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            log::info!("🔌 Stream for {} stopped", self.topic_id);
        }
    }

    pub async fn is_stopped(&self) -> bool {
        self.handle.lock().await.is_none()
    }
}

struct SubscriptionTask {
    topic_id: String,
    source: Arc<dyn StreamSource>,
    fallback: Option<Arc<TopicReader>>,
    since: Option<ConsensusTime>,
    options: SubscriberOptions,
    tx: mpsc::Sender<IngestMessage>,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionTask {
    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(
            self.options.initial_backoff_ms,
            self.options.max_backoff_ms,
            self.options.jitter_ms,
            None,
        );

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let connected = tokio::select! {
                _ = self.shutdown.changed() => return,
                result = self.source.connect(&self.topic_id, self.since) => result,
            };

            match connected {
                Ok(stream) => {
                    backoff.reset();
                    log::info!("✅ Stream connected for {}", self.topic_id);
                    if !self.forward(IngestMessage::StreamConnected { topic_id: self.topic_id.clone() }).await {
                        return;
                    }

                    let reason = match self.pump(stream).await {
                        Some(reason) => reason,
                        None => return,
                    };

                    log::warn!("🔁 Stream for {} dropped: {}", self.topic_id, reason);
                    let disconnected = IngestMessage::StreamDisconnected {
                        topic_id: self.topic_id.clone(),
                        reason: reason.to_string(),
                    };
                    if !self.forward(disconnected).await {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("❌ Stream connect failed for {}: {}", self.topic_id, e);
                    let failed = IngestMessage::FetchFailed {
                        topic_id: self.topic_id.clone(),
                        error: e,
                    };
                    if !self.forward(failed).await {
                        return;
                    }
                }
            }

            if !self.bridge_gap().await {
                return;
            }

            let delay = backoff
                .next_delay()
                .unwrap_or_else(|_| Duration::from_millis(self.options.max_backoff_ms));
            tokio::select! {
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward frames until the stream ends; `None` means shut down
    async fn pump(&mut self, mut stream: MessageStream) -> Option<FetchError> {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => return None,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(raw)) => {
                    self.advance(raw.consensus());
                    let topic_id = raw.topic_id.clone();
                    let delivered = match TopicMessage::from_raw(raw) {
                        Ok(message) => IngestMessage::Message {
                            message,
                            source: DeliverySource::Stream,
                        },
                        Err(error) => IngestMessage::Malformed { topic_id, error },
                    };
                    if !self.forward(delivered).await {
                        return None;
                    }
                }
                Some(Err(e)) => return Some(e),
                None => return Some(FetchError::Closed),
            }
        }
    }

    /// Poll the topic from the last delivered position while disconnected
    async fn bridge_gap(&mut self) -> bool {
        let Some(reader) = self.fallback.clone() else {
            return true;
        };

        match reader
            .catch_up(&self.topic_id, self.since, self.options.fallback_limit)
            .await
        {
            Ok(batch) => {
                if !batch.messages.is_empty() {
                    log::info!(
                        "📥 Fallback poll bridged {} messages for {}",
                        batch.messages.len(),
                        self.topic_id
                    );
                }
                for message in batch.messages {
                    self.advance(message.consensus());
                    let delivered = IngestMessage::Message {
                        message,
                        source: DeliverySource::Backfill,
                    };
                    if !self.forward(delivered).await {
                        return false;
                    }
                }
                for (topic_id, error) in batch.malformed {
                    if !self.forward(IngestMessage::Malformed { topic_id, error }).await {
                        return false;
                    }
                }
                self.forward(IngestMessage::FetchSucceeded { topic_id: self.topic_id.clone() })
                    .await
            }
            Err(error) => {
                log::warn!("⚠️  Fallback poll failed for {}: {}", self.topic_id, error);
                self.forward(IngestMessage::FetchFailed {
                    topic_id: self.topic_id.clone(),
                    error,
                })
                .await
            }
        }
    }

    fn advance(&mut self, position: Option<ConsensusTime>) {
        if let Some(position) = position {
            self.since = Some(self.since.map_or(position, |s| s.max(position)));
        }
    }

    async fn forward(&self, message: IngestMessage) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        self.tx.send(message).await.is_ok()
    }
}
