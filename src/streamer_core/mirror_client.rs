use crate::streamer_core::config::MirrorConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Consensus position of a ledger message (`seconds.nanoseconds`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ConsensusTime {
    pub secs: i64,
    pub nanos: u32,
}

impl ConsensusTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self {
            secs: secs + i64::from(nanos / 1_000_000_000),
            nanos: nanos % 1_000_000_000,
        }
    }

    pub fn from_millis(ms: i64) -> Self {
        Self::new(ms.div_euclid(1000), (ms.rem_euclid(1000) as u32) * 1_000_000)
    }

    pub fn as_millis(&self) -> i64 {
        self.secs * 1000 + i64::from(self.nanos / 1_000_000)
    }
}

impl fmt::Display for ConsensusTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

impl FromStr for ConsensusTime {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FetchError::Decode(format!("invalid consensus timestamp '{}'", s));
        let s = s.trim();
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        let secs: i64 = secs.parse().map_err(|_| bad())?;
        if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let nanos = if frac.is_empty() {
            0
        } else {
            format!("{:0<9}", frac).parse::<u32>().map_err(|_| bad())?
        };
        Ok(Self::new(secs, nanos))
    }
}

/// One message as delivered by the mirror (REST page entry or push frame)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub topic_id: String,
    #[serde(default)]
    pub sequence_number: Option<u64>,
    pub consensus_timestamp: String,
    /// base64 payload (raw JSON tolerated)
    pub message: String,
    #[serde(default)]
    pub running_hash: Option<String>,
}

impl RawMessage {
    pub fn consensus(&self) -> Option<ConsensusTime> {
        self.consensus_timestamp.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub topic_id: String,
    pub limit: usize,
    pub order: Order,
    /// Only messages strictly after this consensus position
    pub after: Option<ConsensusTime>,
    /// Opaque continuation from a previous page; overrides the other fields
    pub next: Option<String>,
}

impl PageRequest {
    pub fn first(topic_id: &str, limit: usize, order: Order, after: Option<ConsensusTime>) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            limit,
            order,
            after,
            next: None,
        }
    }

    pub fn continuation(&self, next: String) -> Self {
        Self {
            next: Some(next),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<RawMessage>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Http(String),
    Status { topic_id: String, status: u16 },
    Decode(String),
    Connection(String),
    Closed,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http(msg) => write!(f, "HTTP error: {}", msg),
            FetchError::Status { topic_id, status } => {
                write!(f, "Mirror returned status {} for topic {}", status, topic_id)
            }
            FetchError::Decode(msg) => write!(f, "Malformed mirror response: {}", msg),
            FetchError::Connection(msg) => write!(f, "Connection error: {}", msg),
            FetchError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

/// Pageable message retrieval for one logical topic at a time
#[async_trait]
pub trait MirrorSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, FetchError>;
}

#[derive(Debug, Deserialize)]
struct MirrorResponse {
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    links: Option<MirrorLinks>,
}

#[derive(Debug, Deserialize)]
struct MirrorLinks {
    next: Option<String>,
}

/// REST mirror backed by reqwest
pub struct HttpMirrorSource {
    client: reqwest::Client,
    rest_url: String,
}

impl HttpMirrorSource {
    pub fn new(config: &MirrorConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            rest_url: config.rest_url.clone(),
        })
    }

    pub fn page_url(&self, request: &PageRequest) -> Result<String, FetchError> {
        build_page_url(&self.rest_url, request)
    }
}

/// Resolve the URL for a page request against the REST base
///
/// Continuation links are host-relative (`/api/v1/topics/..`) and are joined
/// with the origin of the base rather than its path.
pub fn build_page_url(rest_url: &str, request: &PageRequest) -> Result<String, FetchError> {
    if let Some(next) = &request.next {
        if next.starts_with("http://") || next.starts_with("https://") {
            return Ok(next.clone());
        }
        let base = reqwest::Url::parse(rest_url)
            .map_err(|e| FetchError::Http(format!("invalid base url {}: {}", rest_url, e)))?;
        let joined = base
            .join(next)
            .map_err(|e| FetchError::Http(format!("invalid next link {}: {}", next, e)))?;
        return Ok(joined.to_string());
    }

    let mut url = format!(
        "{}/topics/{}/messages?limit={}&order={}",
        rest_url.trim_end_matches('/'),
        request.topic_id,
        request.limit,
        request.order.as_str()
    );
    if let Some(after) = request.after {
        url.push_str(&format!("&timestamp=gt:{}", after));
    }
    Ok(url)
}

#[async_trait]
impl MirrorSource for HttpMirrorSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, FetchError> {
        let url = self.page_url(request)?;
        log::debug!("🔗 GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        // Topics that were never written to answer 404
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(MessagePage::default());
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                topic_id: request.topic_id.clone(),
                status: status.as_u16(),
            });
        }

        let body: MirrorResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        Ok(MessagePage {
            messages: body.messages,
            next: body.links.and_then(|links| links.next).filter(|n| !n.is_empty()),
        })
    }
}
