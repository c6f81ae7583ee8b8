//! Core event model shared by the decoder, the store and the query surface

use crate::streamer_core::mirror_client::ConsensusTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of ledger signal
///
/// Unrecognized names are kept verbatim in `Other` so they remain queryable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    ContactRequest,
    ContactAccept,
    ContactRevoke,
    TrustAllocate,
    TrustRevoke,
    RecognitionDefinition,
    RecognitionMint,
    ProfileUpdate,
    SystemUpdate,
    Unknown,
    Other(String),
}

impl SignalType {
    pub fn as_str(&self) -> &str {
        match self {
            SignalType::ContactRequest => "CONTACT_REQUEST",
            SignalType::ContactAccept => "CONTACT_ACCEPT",
            SignalType::ContactRevoke => "CONTACT_REVOKE",
            SignalType::TrustAllocate => "TRUST_ALLOCATE",
            SignalType::TrustRevoke => "TRUST_REVOKE",
            SignalType::RecognitionDefinition => "RECOGNITION_DEFINITION",
            SignalType::RecognitionMint => "RECOGNITION_MINT",
            SignalType::ProfileUpdate => "PROFILE_UPDATE",
            SignalType::SystemUpdate => "SYSTEM_UPDATE",
            SignalType::Unknown => "UNKNOWN",
            SignalType::Other(name) => name,
        }
    }

    /// Parse a type name, tolerating legacy lowercase and dotted spellings
    /// (`contact_request`, `trust.allocate`, `recognition-mint`, `nft_mint`)
    pub fn parse(name: &str) -> Self {
        let canonical = name.trim().to_ascii_uppercase().replace(['.', '-', ' '], "_");
        match canonical.as_str() {
            "CONTACT_REQUEST" => return SignalType::ContactRequest,
            "CONTACT_ACCEPT" => return SignalType::ContactAccept,
            "CONTACT_REVOKE" => return SignalType::ContactRevoke,
            "TRUST_ALLOCATE" => return SignalType::TrustAllocate,
            "TRUST_REVOKE" => return SignalType::TrustRevoke,
            "RECOGNITION_DEFINITION" | "HCS11_DEF" => return SignalType::RecognitionDefinition,
            "RECOGNITION_MINT" | "HCS11_INSTANCE" => return SignalType::RecognitionMint,
            "PROFILE_UPDATE" => return SignalType::ProfileUpdate,
            "SYSTEM_UPDATE" => return SignalType::SystemUpdate,
            "UNKNOWN" => return SignalType::Unknown,
            _ => {}
        }

        let has = |needle: &str| canonical.contains(needle);
        if has("CONTACT") {
            if has("REQUEST") {
                return SignalType::ContactRequest;
            }
            if has("ACCEPT") {
                return SignalType::ContactAccept;
            }
            if has("REVOKE") {
                return SignalType::ContactRevoke;
            }
        } else if has("TRUST") {
            if has("ALLOCATE") {
                return SignalType::TrustAllocate;
            }
            if has("REVOKE") {
                return SignalType::TrustRevoke;
            }
        } else if has("RECOGNITION") || has("NFT") {
            if has("MINT") {
                return SignalType::RecognitionMint;
            }
            if has("DEFINITION") {
                return SignalType::RecognitionDefinition;
            }
        } else if has("PROFILE") {
            return SignalType::ProfileUpdate;
        }

        SignalType::Other(canonical)
    }

    pub fn class(&self) -> SignalClass {
        match self {
            SignalType::ContactRequest | SignalType::ContactAccept | SignalType::ContactRevoke => {
                SignalClass::Contact
            }
            SignalType::TrustAllocate | SignalType::TrustRevoke => SignalClass::Trust,
            SignalType::RecognitionDefinition | SignalType::RecognitionMint => SignalClass::Recognition,
            SignalType::ProfileUpdate => SignalClass::Profile,
            _ => SignalClass::System,
        }
    }

    /// Records whose newer version replaces the older one under the same key
    pub fn is_versioned(&self) -> bool {
        matches!(self, SignalType::ProfileUpdate)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SignalType {
    fn from(value: String) -> Self {
        SignalType::parse(&value)
    }
}

impl From<SignalType> for String {
    fn from(value: SignalType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalClass {
    Contact,
    Trust,
    Recognition,
    Profile,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    /// Committed on the ledger (everything the pipeline ingests)
    Onchain,
    Local,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which delivery path produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverySource {
    /// REST pages: bounded backfill, catch-up and poll
    Backfill,
    /// Live push subscription
    Stream,
}

/// Restricts a scoped query to one actor's activity or the full ingested set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    My,
    Global,
}

/// Total order used by every query: logical timestamp, then id
pub type OrderKey = (ConsensusTime, String);

/// Normalized, immutable ledger fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub class: SignalClass,
    pub actor: String,
    pub target: Option<String>,
    /// Consensus time when known, payload time otherwise
    pub timestamp: ConsensusTime,
    pub topic_id: String,
    pub sequence_number: Option<u64>,
    pub status: SignalStatus,
    pub direction: Direction,
    pub source: DeliverySource,
    pub payload: Value,
    pub metadata: BTreeMap<String, String>,
}

impl SignalEvent {
    pub fn order_key(&self) -> OrderKey {
        (self.timestamp, self.id.clone())
    }

    /// Whether `party` is the actor or the target
    pub fn involves(&self, party: &str) -> bool {
        self.actor == party || self.target.as_deref() == Some(party)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_and_legacy_names() {
        assert_eq!(SignalType::parse("CONTACT_REQUEST"), SignalType::ContactRequest);
        assert_eq!(SignalType::parse("contact_accept"), SignalType::ContactAccept);
        assert_eq!(SignalType::parse("trust.allocate"), SignalType::TrustAllocate);
        assert_eq!(SignalType::parse("TRUST_REVOKE"), SignalType::TrustRevoke);
        assert_eq!(SignalType::parse("nft_mint"), SignalType::RecognitionMint);
        assert_eq!(SignalType::parse("HCS11_DEF"), SignalType::RecognitionDefinition);
        assert_eq!(SignalType::parse("profile"), SignalType::ProfileUpdate);
        assert_eq!(SignalType::parse("heartbeat"), SignalType::Other("HEARTBEAT".to_string()));
    }

    #[test]
    fn test_class_mapping() {
        assert_eq!(SignalType::ContactRevoke.class(), SignalClass::Contact);
        assert_eq!(SignalType::TrustAllocate.class(), SignalClass::Trust);
        assert_eq!(SignalType::RecognitionMint.class(), SignalClass::Recognition);
        assert_eq!(SignalType::SystemUpdate.class(), SignalClass::System);
    }

    #[test]
    fn test_signal_type_serializes_as_string() {
        let json = serde_json::to_string(&SignalType::TrustAllocate).unwrap();
        assert_eq!(json, "\"TRUST_ALLOCATE\"");
        let back: SignalType = serde_json::from_str("\"recognition_mint\"").unwrap();
        assert_eq!(back, SignalType::RecognitionMint);
    }
}
