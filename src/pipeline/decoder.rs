//! Message decoder: raw ledger payload → typed `SignalEvent`
//!
//! Decoding never fails outward. Anything that cannot be turned into an
//! event comes back as `DecodeOutcome::Unknown` with the original message
//! retained, so it can be quarantined and re-classified later.
//!
//! Accepted payload shapes:
//! - flat JSON (`{type, actor, target, ..}`)
//! - legacy envelope (`{type, from, nonce, ts, payload: {..}}`)
//! - HCS-21 envelope (`{hcs: "21", type: <number>, from, payload: {..}}`)

use super::classifier::{Classification, RecognitionClassifier, RecognitionKind};
use super::scheduler::Clock;
use super::types::{DeliverySource, Direction, SignalEvent, SignalStatus, SignalType};
use crate::streamer_core::mirror_client::ConsensusTime;
use crate::streamer_core::topic_reader::TopicMessage;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Ordered candidates for one canonical field; the first non-empty wins
#[derive(Debug, Clone, Copy)]
pub struct AliasRule {
    pub canonical: &'static str,
    pub candidates: &'static [&'static str],
}

pub const ACTOR: AliasRule = AliasRule {
    canonical: "actor",
    candidates: &["actor", "from", "issuer", "sender"],
};

pub const TARGET: AliasRule = AliasRule {
    canonical: "target",
    candidates: &["target", "to", "recipient", "owner", "contactId"],
};

pub const DEFINITION_ID: AliasRule = AliasRule {
    canonical: "id",
    candidates: &["id", "recognitionId", "slug"],
};

pub const DEFINITION_TITLE: AliasRule = AliasRule {
    canonical: "title",
    candidates: &["title", "name", "slug"],
};

pub const DEFINITION_ICON: AliasRule = AliasRule {
    canonical: "icon",
    candidates: &["icon", "emoji"],
};

pub const DEFINITION_DESCRIPTION: AliasRule = AliasRule {
    canonical: "description",
    candidates: &["description", "desc"],
};

pub const INSTANCE_OWNER: AliasRule = AliasRule {
    canonical: "owner",
    candidates: &["owner", "target", "to", "recipient"],
};

/// Issuer of a recognition instance; `issuer` outranks `from` here
pub const INSTANCE_ISSUER: AliasRule = AliasRule {
    canonical: "actor",
    candidates: &["actor", "issuer", "from", "sender"],
};

pub const INSTANCE_RECOGNITION_ID: AliasRule = AliasRule {
    canonical: "recognitionId",
    candidates: &["recognitionId", "slug", "id"],
};

pub const INSTANCE_NOTE: AliasRule = AliasRule {
    canonical: "note",
    candidates: &["note", "reason", "message"],
};

pub const INSTANCE_TIMESTAMP: AliasRule = AliasRule {
    canonical: "timestamp",
    candidates: &["timestamp", "issuedAt"],
};

impl AliasRule {
    /// First candidate holding a non-empty string or a number, as a string
    pub fn resolve(&self, payload: &Value) -> Option<String> {
        self.candidates
            .iter()
            .find_map(|key| scalar_string(payload.get(*key)?))
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    EmptyPayload,
    InvalidBase64(String),
    InvalidUtf8,
    InvalidJson(String),
    MissingField(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::EmptyPayload => write!(f, "Empty payload"),
            DecodeError::InvalidBase64(msg) => write!(f, "Invalid base64: {}", msg),
            DecodeError::InvalidUtf8 => write!(f, "Payload is not valid UTF-8"),
            DecodeError::InvalidJson(msg) => write!(f, "Invalid JSON: {}", msg),
            DecodeError::MissingField(field) => write!(f, "Missing required field: {}", field),
        }
    }
}

impl std::error::Error for DecodeError {}

/// base64 → UTF-8 → JSON, tolerating payloads that are already raw JSON
pub fn decode_payload(message: &str) -> Result<Value, DecodeError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| DecodeError::InvalidJson(e.to_string()));
    }

    match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(bytes) => {
            let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
            serde_json::from_str(&text).map_err(|e| DecodeError::InvalidJson(e.to_string()))
        }
        Err(b64_err) => serde_json::from_str(trimmed)
            .map_err(|_| DecodeError::InvalidBase64(b64_err.to_string())),
    }
}

static EMPTY_BODY: Value = Value::Null;

/// Envelope layer around the signal body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Hcs21,
    Legacy,
    Flat,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Hcs21 => "hcs21",
            EnvelopeKind::Legacy => "legacy",
            EnvelopeKind::Flat => "flat",
        }
    }
}

/// Opened view of a decoded payload
#[derive(Debug)]
pub struct Envelope<'a> {
    pub kind: EnvelopeKind,
    pub outer: &'a Value,
    /// Inner payload for envelopes, the whole document otherwise
    pub body: &'a Value,
    pub type_code: Option<u64>,
    pub from: Option<String>,
}

impl<'a> Envelope<'a> {
    pub fn open(outer: &'a Value) -> Self {
        let hcs = outer.get("hcs").and_then(|v| match v {
            Value::String(s) => Some(s.as_str() == "21"),
            Value::Number(n) => Some(n.as_u64() == Some(21)),
            _ => None,
        });
        let type_code = outer.get("type").and_then(Value::as_u64);
        let inner = outer.get("payload").filter(|p| p.is_object());
        let from = outer.get("from").and_then(scalar_string);

        if hcs == Some(true) && type_code.is_some() {
            return Self {
                kind: EnvelopeKind::Hcs21,
                outer,
                body: inner.unwrap_or(&EMPTY_BODY),
                type_code,
                from,
            };
        }

        let legacy = inner.is_some()
            && outer.get("type").map(Value::is_string).unwrap_or(false)
            && from.is_some();
        if let (true, Some(body)) = (legacy, inner) {
            return Self {
                kind: EnvelopeKind::Legacy,
                outer,
                body,
                type_code: None,
                from,
            };
        }

        Self {
            kind: EnvelopeKind::Flat,
            outer,
            body: outer,
            type_code: None,
            from: None,
        }
    }

    pub fn actor(&self) -> Option<String> {
        self.from
            .clone()
            .or_else(|| ACTOR.resolve(self.body))
            .or_else(|| ACTOR.resolve(self.outer))
    }

    pub fn target(&self) -> Option<String> {
        match self.kind {
            EnvelopeKind::Hcs21 => TARGET.resolve(self.body),
            EnvelopeKind::Legacy => TARGET
                .resolve_excluding(self.outer, &["from"])
                .or_else(|| TARGET.resolve(self.body)),
            EnvelopeKind::Flat => TARGET.resolve(self.body),
        }
    }

    /// Envelope or body timestamp in epoch milliseconds
    pub fn timestamp_millis(&self) -> Option<i64> {
        ["ts", "timestamp"]
            .iter()
            .find_map(|key| self.outer.get(*key).or_else(|| self.body.get(*key)))
            .and_then(millis_from_value)
    }
}

impl AliasRule {
    fn resolve_excluding(&self, payload: &Value, skip: &[&str]) -> Option<String> {
        self.candidates
            .iter()
            .filter(|key| !skip.contains(key))
            .find_map(|key| scalar_string(payload.get(*key)?))
    }
}

fn millis_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }),
        _ => None,
    }
}

/// HCS-21 numeric type codes
pub fn hcs21_type(code: u64) -> SignalType {
    match code {
        0 => SignalType::ContactRequest,
        1 => SignalType::ContactAccept,
        2 => SignalType::ContactRevoke,
        3 => SignalType::TrustAllocate,
        4 => SignalType::TrustRevoke,
        5 => SignalType::RecognitionDefinition,
        6 => SignalType::RecognitionMint,
        7 => SignalType::ProfileUpdate,
        8 => SignalType::SystemUpdate,
        _ => SignalType::Unknown,
    }
}

/// Signal type cascade: envelope code, explicit type, kind, field patterns,
/// HCS-11 schema names, then field-set inference
pub fn infer_signal_type(envelope: &Envelope<'_>) -> Option<SignalType> {
    if let Some(code) = envelope.type_code {
        return Some(hcs21_type(code));
    }

    let outer = envelope.outer;
    let body = envelope.body;

    if let Some(name) = outer.get("type").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        return Some(SignalType::parse(name));
    }
    if let Some(kind) = body.get("kind").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        return Some(SignalType::parse(kind));
    }

    let present = |key: &str| {
        body.get(key)
            .map(|v| !v.is_null() && v != &Value::Bool(false) && v.as_str() != Some(""))
            .unwrap_or(false)
    };

    if present("recognitionId") || present("owner") {
        return Some(SignalType::RecognitionMint);
    }
    if present("profile") || present("displayName") {
        return Some(SignalType::ProfileUpdate);
    }
    if present("amount") && present("to") {
        return Some(SignalType::TrustAllocate);
    }
    if present("from") && present("to") && present("status") {
        return Some(SignalType::ContactRequest);
    }

    match body.get("schema").and_then(Value::as_str) {
        Some("hcs-11-recognition-definition") => return Some(SignalType::RecognitionDefinition),
        Some("hcs-11-recognition-instance") => return Some(SignalType::RecognitionMint),
        Some("hcs-11-contact-request") => return Some(SignalType::ContactRequest),
        Some("hcs-11-trust-allocation") => return Some(SignalType::TrustAllocate),
        _ => {}
    }

    infer_from_fields(body)
}

fn infer_from_fields(body: &Value) -> Option<SignalType> {
    let fields = body.as_object()?;
    let has = |key: &str| fields.contains_key(key);

    if has("recognitionId") && has("owner") {
        return Some(SignalType::RecognitionMint);
    }
    if has("slug") && has("title") {
        return Some(SignalType::RecognitionDefinition);
    }
    if has("from") && has("to") && !has("amount") {
        return Some(SignalType::ContactRequest);
    }
    if has("amount") && has("to") {
        return Some(SignalType::TrustAllocate);
    }
    if has("displayName") || has("avatar") || has("profile") {
        return Some(SignalType::ProfileUpdate);
    }
    None
}

/// Deterministic event id: `topic/sequence`, or a payload hash when the
/// sequence number is absent
pub fn synthetic_id(topic_id: &str, sequence: Option<u64>, consensus: &str, message: &str) -> String {
    match sequence {
        Some(seq) => format!("{}/{}", topic_id, seq),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(topic_id.as_bytes());
            hasher.update([0u8]);
            hasher.update(consensus.as_bytes());
            hasher.update([0u8]);
            hasher.update(message.as_bytes());
            let digest = hasher.finalize();
            format!("{}/h{}", topic_id, hex::encode(&digest[..8]))
        }
    }
}

/// What a topic is used for; recognition topics route every message through
/// the recognition classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Contacts,
    Trust,
    Recognition,
    Profile,
    Signal,
    System,
}

/// Payload the decoder could not turn into an event, kept for re-classification
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownPayload {
    pub message: TopicMessage,
    pub source: DeliverySource,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Event(SignalEvent),
    Unknown(UnknownPayload),
}

pub struct MessageDecoder {
    classifier: RecognitionClassifier,
    topic_kinds: HashMap<String, TopicKind>,
    clock: Arc<dyn Clock>,
}

impl MessageDecoder {
    pub fn new(topic_kinds: HashMap<String, TopicKind>, clock: Arc<dyn Clock>) -> Self {
        Self {
            classifier: RecognitionClassifier::default(),
            topic_kinds,
            clock,
        }
    }

    pub fn with_classifier(mut self, classifier: RecognitionClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &RecognitionClassifier {
        &self.classifier
    }

    pub fn topic_kind(&self, topic_id: &str) -> Option<TopicKind> {
        self.topic_kinds.get(topic_id).copied()
    }

    pub fn decode(&self, message: &TopicMessage, source: DeliverySource) -> DecodeOutcome {
        match self.try_decode(message, source) {
            Ok(event) => DecodeOutcome::Event(event),
            Err(reason) => DecodeOutcome::Unknown(UnknownPayload {
                message: message.clone(),
                source,
                reason,
            }),
        }
    }

    fn try_decode(&self, message: &TopicMessage, source: DeliverySource) -> Result<SignalEvent, String> {
        if !message.payload.is_object() {
            return Err(DecodeError::InvalidJson("payload is not an object".to_string()).to_string());
        }

        let envelope = Envelope::open(&message.payload);
        let inferred = infer_signal_type(&envelope);
        let recognition_topic = self.topic_kind(message.topic_id()) == Some(TopicKind::Recognition);

        let mut metadata = BTreeMap::new();
        metadata.insert("envelope".to_string(), envelope.kind.as_str().to_string());
        match message.payload.get("type") {
            Some(Value::String(name)) => {
                metadata.insert("originalType".to_string(), name.clone());
            }
            Some(Value::Number(code)) => {
                metadata.insert("originalType".to_string(), code.to_string());
            }
            _ => {}
        }

        let hint = match inferred {
            Some(SignalType::RecognitionDefinition) => Some(RecognitionKind::Definition),
            Some(SignalType::RecognitionMint) => Some(RecognitionKind::Instance),
            _ => None,
        };
        let wants_recognition = hint.is_some()
            || (recognition_topic && matches!(inferred, None | Some(SignalType::Unknown) | Some(SignalType::Other(_))));

        let (signal_type, body, actor, target) = if wants_recognition {
            let classified = self.classifier.classify(envelope.body, hint, &self.payload_digest(message));
            match classified {
                Classification::Definition(def, strategy) => {
                    metadata.insert("classifiedBy".to_string(), strategy.to_string());
                    let actor = envelope.actor().unwrap_or_else(|| "system".to_string());
                    let body = serde_json::to_value(&def).map_err(|e| e.to_string())?;
                    (SignalType::RecognitionDefinition, body, actor, None)
                }
                Classification::Instance(inst, strategy) => {
                    metadata.insert("classifiedBy".to_string(), strategy.to_string());
                    let actor = envelope
                        .from
                        .clone()
                        .or_else(|| inst.actor.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let target = Some(inst.owner.clone());
                    let body = serde_json::to_value(&inst).map_err(|e| e.to_string())?;
                    (SignalType::RecognitionMint, body, actor, target)
                }
                Classification::Unknown(reason) => {
                    return Err(format!("unclassified recognition payload: {}", reason));
                }
            }
        } else {
            let signal_type = inferred.ok_or_else(|| DecodeError::MissingField("type").to_string())?;
            let actor = envelope
                .actor()
                .ok_or_else(|| DecodeError::MissingField("actor").to_string())?;
            let target = envelope.target().filter(|t| t != &actor);
            (signal_type, envelope.body.clone(), actor, target)
        };

        let timestamp = message
            .consensus()
            .or_else(|| envelope.timestamp_millis().map(ConsensusTime::from_millis))
            .unwrap_or_else(|| ConsensusTime::from_millis(self.clock.now_millis()));

        let direction = match message.payload.get("direction").and_then(Value::as_str) {
            Some("outbound") => Direction::Outbound,
            _ => Direction::Inbound,
        };

        if let Some(seq) = message.sequence_number() {
            metadata.insert("sequenceNumber".to_string(), seq.to_string());
        }

        Ok(SignalEvent {
            id: synthetic_id(
                message.topic_id(),
                message.sequence_number(),
                &message.raw.consensus_timestamp,
                &message.raw.message,
            ),
            class: signal_type.class(),
            signal_type,
            actor,
            target,
            timestamp,
            topic_id: message.topic_id().to_string(),
            sequence_number: message.sequence_number(),
            status: SignalStatus::Onchain,
            direction,
            source,
            payload: body,
            metadata,
        })
    }

    fn payload_digest(&self, message: &TopicMessage) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message.raw.message.as_bytes());
        hex::encode(&hasher.finalize()[..6])
    }
}
