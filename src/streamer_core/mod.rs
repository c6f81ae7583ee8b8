pub mod config;
pub mod error_handler;
pub mod mirror_client;
pub mod stream_subscriber;
pub mod topic_reader;

pub use config::{ConfigError, MirrorConfig};
pub use mirror_client::{ConsensusTime, FetchError, HttpMirrorSource, MirrorSource, RawMessage};
pub use stream_subscriber::{StreamSource, StreamSubscriber, WsStreamSource};
pub use topic_reader::{TopicBatch, TopicMessage, TopicReader};
