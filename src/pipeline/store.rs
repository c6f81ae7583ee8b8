//! SignalStore: the append-only materialized view
//!
//! Every mutation goes through `add()`. Events are keyed by (timestamp, id),
//! so reads come back in the same order no matter how the events arrived.
//! Derived views (trust, contacts, recognitions, profiles) are folded in on
//! ingest and are themselves order independent.

use super::contacts::{BondedContact, ContactGraph};
use super::decoder::{synthetic_id, UnknownPayload};
use super::recognition::{
    CatalogChange, RecognitionCatalog, RecognitionDefinition, RecognitionInstance,
    ResolvedRecognition,
};
use super::trust::{CapacityViolation, ContactTrust, TrustLedger, TrustStats};
use super::types::{DeliverySource, OrderKey, Scope, SignalClass, SignalEvent, SignalType};
use crate::streamer_core::mirror_client::ConsensusTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

pub const DEFAULT_QUARANTINE_CAPACITY: usize = 1000;

/// Result of `SignalStore::add`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted {
        catalog: CatalogChange,
        /// Allocations pushed over the actor's cap by this event
        newly_excluded: usize,
    },
    /// A versioned record superseded the actor's previous version
    Replaced,
    /// Canonical id already stored; nothing changed
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub latest: Option<ConsensusTime>,
    pub quarantined: usize,
    pub quarantine_evicted: u64,
    pub pending_recognitions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuarantinePush {
    Queued,
    AlreadyQueued,
    /// Queued after dropping the oldest entry
    Evicted(Box<UnknownPayload>),
}

/// Bounded FIFO of payloads no decoder strategy could place
#[derive(Debug)]
pub struct Quarantine {
    entries: VecDeque<(String, UnknownPayload)>,
    keys: HashSet<String>,
    capacity: usize,
    evicted: u64,
}

fn quarantine_key(entry: &UnknownPayload) -> String {
    let raw = &entry.message.raw;
    synthetic_id(&raw.topic_id, raw.sequence_number, &raw.consensus_timestamp, &raw.message)
}

impl Quarantine {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push(&mut self, entry: UnknownPayload) -> QuarantinePush {
        let key = quarantine_key(&entry);
        if !self.keys.insert(key.clone()) {
            return QuarantinePush::AlreadyQueued;
        }
        self.entries.push_back((key, entry));

        if self.entries.len() > self.capacity {
            if let Some((old_key, oldest)) = self.entries.pop_front() {
                self.keys.remove(&old_key);
                self.evicted += 1;
                return QuarantinePush::Evicted(Box::new(oldest));
            }
        }
        QuarantinePush::Queued
    }

    /// Drain everything for a re-classification pass
    pub fn take_all(&mut self) -> Vec<UnknownPayload> {
        self.keys.clear();
        self.entries.drain(..).map(|(_, entry)| entry).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnknownPayload> {
        self.entries.iter().map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.keys.clear();
        self.evicted = 0;
    }
}

#[derive(Debug)]
pub struct SignalStore {
    events: BTreeMap<OrderKey, SignalEvent>,
    index: HashMap<String, OrderKey>,
    by_type: HashMap<SignalType, BTreeSet<OrderKey>>,
    by_actor: HashMap<String, BTreeSet<OrderKey>>,
    by_party: HashMap<String, BTreeSet<OrderKey>>,
    /// actor → key of the latest versioned record
    profiles: HashMap<String, OrderKey>,
    trust: TrustLedger,
    contacts: ContactGraph,
    recognition: RecognitionCatalog,
    quarantine: Quarantine,
}

impl Default for SignalStore {
    fn default() -> Self {
        Self::new(DEFAULT_QUARANTINE_CAPACITY)
    }
}

impl SignalStore {
    pub fn new(quarantine_capacity: usize) -> Self {
        Self {
            events: BTreeMap::new(),
            index: HashMap::new(),
            by_type: HashMap::new(),
            by_actor: HashMap::new(),
            by_party: HashMap::new(),
            profiles: HashMap::new(),
            trust: TrustLedger::default(),
            contacts: ContactGraph::default(),
            recognition: RecognitionCatalog::default(),
            quarantine: Quarantine::new(quarantine_capacity),
        }
    }

    /// Ingest one event. Re-adding a stored id is a no-op.
    pub fn add(&mut self, event: SignalEvent) -> AddOutcome {
        if self.index.contains_key(&event.id) {
            return AddOutcome::Duplicate;
        }

        let key = event.order_key();
        self.index.insert(event.id.clone(), key.clone());
        self.by_type
            .entry(event.signal_type.clone())
            .or_default()
            .insert(key.clone());
        self.by_actor
            .entry(event.actor.clone())
            .or_default()
            .insert(key.clone());
        self.by_party
            .entry(event.actor.clone())
            .or_default()
            .insert(key.clone());
        if let Some(target) = event.target.as_ref().filter(|t| **t != event.actor) {
            self.by_party
                .entry(target.clone())
                .or_default()
                .insert(key.clone());
        }

        let outcome = match event.class {
            SignalClass::Trust => {
                let before = self.trust.stats(&event.actor).excluded_over_cap;
                self.trust.apply(&event);
                let after = self.trust.stats(&event.actor).excluded_over_cap;
                AddOutcome::Inserted {
                    catalog: CatalogChange::NotRecognition,
                    newly_excluded: after.saturating_sub(before),
                }
            }
            SignalClass::Contact => {
                self.contacts.apply(&event);
                AddOutcome::Inserted {
                    catalog: CatalogChange::NotRecognition,
                    newly_excluded: 0,
                }
            }
            SignalClass::Recognition => AddOutcome::Inserted {
                catalog: self.recognition.apply(&event),
                newly_excluded: 0,
            },
            SignalClass::Profile => self.supersede_profile(&event.actor, &key),
            SignalClass::System => AddOutcome::Inserted {
                catalog: CatalogChange::NotRecognition,
                newly_excluded: 0,
            },
        };

        self.events.insert(key, event);
        outcome
    }

    fn supersede_profile(&mut self, actor: &str, key: &OrderKey) -> AddOutcome {
        match self.profiles.get(actor) {
            Some(current) if current >= key => AddOutcome::Inserted {
                catalog: CatalogChange::NotRecognition,
                newly_excluded: 0,
            },
            Some(_) => {
                self.profiles.insert(actor.to_string(), key.clone());
                AddOutcome::Replaced
            }
            None => {
                self.profiles.insert(actor.to_string(), key.clone());
                AddOutcome::Inserted {
                    catalog: CatalogChange::NotRecognition,
                    newly_excluded: 0,
                }
            }
        }
    }

    fn collect<'a>(&self, keys: impl Iterator<Item = &'a OrderKey>) -> Vec<SignalEvent> {
        keys.filter_map(|key| self.events.get(key)).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&SignalEvent> {
        self.index.get(id).and_then(|key| self.events.get(key))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get_all(&self) -> Vec<SignalEvent> {
        self.events.values().cloned().collect()
    }

    pub fn get_by_type(&self, signal_type: &SignalType) -> Vec<SignalEvent> {
        self.by_type
            .get(signal_type)
            .map(|keys| self.collect(keys.iter()))
            .unwrap_or_default()
    }

    pub fn get_by_actor(&self, actor: &str) -> Vec<SignalEvent> {
        self.by_actor
            .get(actor)
            .map(|keys| self.collect(keys.iter()))
            .unwrap_or_default()
    }

    /// Events at or after `since`
    pub fn get_since(&self, since: ConsensusTime) -> Vec<SignalEvent> {
        self.events
            .range((since, String::new())..)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// `My` narrows to events where the session is actor or target
    pub fn get_scoped(&self, session_id: &str, scope: Scope, signal_type: Option<&SignalType>) -> Vec<SignalEvent> {
        let events = match scope {
            Scope::Global => match signal_type {
                Some(t) => return self.get_by_type(t),
                None => return self.get_all(),
            },
            Scope::My => self
                .by_party
                .get(session_id)
                .map(|keys| self.collect(keys.iter()))
                .unwrap_or_default(),
        };
        match signal_type {
            Some(t) => events.into_iter().filter(|e| &e.signal_type == t).collect(),
            None => events,
        }
    }

    pub fn get_bonded_contacts(&self, actor: &str) -> Vec<BondedContact> {
        self.contacts
            .bonded(actor)
            .into_iter()
            .map(|(peer_id, bonded_at)| {
                let level = self.trust.allocated_to(actor, &peer_id);
                BondedContact {
                    handle: self.handle_of(&peer_id),
                    trust_level: (level > 0).then_some(level),
                    peer_id,
                    bonded_at,
                }
            })
            .collect()
    }

    fn handle_of(&self, actor: &str) -> Option<String> {
        let profile = self.latest_profile(actor)?;
        ["displayName", "handle", "name"]
            .iter()
            .find_map(|key| profile.payload_str(key))
            .map(str::to_string)
    }

    pub fn get_trust_stats(&self, actor: &str) -> TrustStats {
        self.trust.stats(actor)
    }

    pub fn get_trust_levels_per_contact(&self, actor: &str) -> BTreeMap<String, ContactTrust> {
        self.trust.levels(actor)
    }

    pub fn capacity_violations(&self) -> Vec<CapacityViolation> {
        self.trust.violations()
    }

    pub fn get_recognitions_for(&self, owner: &str) -> Vec<ResolvedRecognition> {
        self.recognition.recognitions_for(owner)
    }

    pub fn definition(&self, id_or_slug: &str) -> Option<&RecognitionDefinition> {
        self.recognition.resolve(id_or_slug)
    }

    pub fn definitions(&self) -> Vec<RecognitionDefinition> {
        self.recognition.definitions()
    }

    pub fn pending_recognitions(&self) -> Vec<RecognitionInstance> {
        self.recognition.pending()
    }

    pub fn latest_profile(&self, actor: &str) -> Option<&SignalEvent> {
        self.profiles.get(actor).and_then(|key| self.events.get(key))
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    pub fn quarantine_mut(&mut self) -> &mut Quarantine {
        &mut self.quarantine
    }

    pub fn summary(&self) -> StoreSummary {
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for (signal_type, keys) in &self.by_type {
            by_type.insert(signal_type.to_string(), keys.len());
        }
        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        for event in self.events.values() {
            let name = match event.source {
                DeliverySource::Backfill => "backfill",
                DeliverySource::Stream => "stream",
            };
            *by_source.entry(name.to_string()).or_insert(0) += 1;
        }

        StoreSummary {
            total: self.events.len(),
            by_type,
            by_source,
            latest: self.events.keys().next_back().map(|(ts, _)| *ts),
            quarantined: self.quarantine.len(),
            quarantine_evicted: self.quarantine.evicted(),
            pending_recognitions: self.recognition.pending().len(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every event, derived view and quarantined payload
    pub fn clear(&mut self) {
        self.events.clear();
        self.index.clear();
        self.by_type.clear();
        self.by_actor.clear();
        self.by_party.clear();
        self.profiles.clear();
        self.trust.clear();
        self.contacts.clear();
        self.recognition.clear();
        self.quarantine.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::types::{Direction, SignalStatus};
    use crate::streamer_core::topic_reader::tests::raw;
    use crate::streamer_core::topic_reader::TopicMessage;
    use serde_json::json;

    pub(crate) fn event(
        id: &str,
        ts_secs: i64,
        signal_type: SignalType,
        actor: &str,
        target: Option<&str>,
    ) -> SignalEvent {
        SignalEvent {
            id: id.to_string(),
            class: signal_type.class(),
            signal_type,
            actor: actor.to_string(),
            target: target.map(str::to_string),
            timestamp: ConsensusTime::new(ts_secs, 0),
            topic_id: "0.0.1".to_string(),
            sequence_number: None,
            status: SignalStatus::Onchain,
            direction: Direction::Inbound,
            source: DeliverySource::Backfill,
            payload: json!({}),
            metadata: BTreeMap::new(),
        }
    }

    fn unknown(seq: u64) -> UnknownPayload {
        let raw = raw("0.0.3", seq, r#"{"foo":"bar"}"#);
        UnknownPayload {
            message: TopicMessage {
                raw,
                payload: json!({"foo": "bar"}),
            },
            source: DeliverySource::Backfill,
            reason: "unclassified".to_string(),
        }
    }

    #[test]
    fn test_duplicate_id_is_noop() {
        let mut store = SignalStore::default();
        let e = event("0.0.1/1", 1, SignalType::ContactRequest, "alice", Some("bob"));
        assert!(matches!(store.add(e.clone()), AddOutcome::Inserted { .. }));
        assert_eq!(store.add(e), AddOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_queries_sorted_regardless_of_arrival() {
        let mut store = SignalStore::default();
        store.add(event("b", 2, SignalType::SystemUpdate, "sys", None));
        store.add(event("c", 3, SignalType::SystemUpdate, "sys", None));
        store.add(event("a", 2, SignalType::SystemUpdate, "sys", None));
        store.add(event("z", 1, SignalType::SystemUpdate, "sys", None));

        let ids: Vec<String> = store.get_all().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["z", "a", "b", "c"]);

        let since: Vec<String> = store
            .get_since(ConsensusTime::new(2, 0))
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(since, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_scoped_queries() {
        let mut store = SignalStore::default();
        store.add(event("1", 1, SignalType::ContactRequest, "alice", Some("bob")));
        store.add(event("2", 2, SignalType::TrustAllocate, "carol", Some("alice")));
        store.add(event("3", 3, SignalType::TrustAllocate, "carol", Some("dave")));

        assert_eq!(store.get_scoped("alice", Scope::My, None).len(), 2);
        assert_eq!(
            store
                .get_scoped("alice", Scope::My, Some(&SignalType::TrustAllocate))
                .len(),
            1
        );
        assert_eq!(store.get_scoped("alice", Scope::Global, None).len(), 3);
        assert_eq!(store.get_scoped("nobody", Scope::My, None).len(), 0);
        assert_eq!(store.get_by_actor("carol").len(), 2);
    }

    #[test]
    fn test_bonded_contacts_carry_handle_and_trust() {
        let mut store = SignalStore::default();
        store.add(event("1", 1, SignalType::ContactRequest, "alice", Some("bob")));
        store.add(event("2", 2, SignalType::ContactAccept, "bob", Some("alice")));
        store.add(event("3", 3, SignalType::TrustAllocate, "alice", Some("bob")));
        let mut profile = event("4", 4, SignalType::ProfileUpdate, "bob", None);
        profile.payload = json!({"displayName": "Bob B."});
        store.add(profile);

        let contacts = store.get_bonded_contacts("alice");
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].peer_id, "bob");
        assert_eq!(contacts[0].handle.as_deref(), Some("Bob B."));
        assert_eq!(contacts[0].trust_level, Some(25));

        let reverse = store.get_bonded_contacts("bob");
        assert_eq!(reverse[0].peer_id, "alice");
        assert_eq!(reverse[0].trust_level, None);
    }

    #[test]
    fn test_profile_update_supersedes_older() {
        let mut store = SignalStore::default();
        let mut old = event("p1", 1, SignalType::ProfileUpdate, "alice", None);
        old.payload = json!({"displayName": "Old"});
        let mut new = event("p2", 2, SignalType::ProfileUpdate, "alice", None);
        new.payload = json!({"displayName": "New"});

        store.add(old.clone());
        assert_eq!(store.add(new.clone()), AddOutcome::Replaced);
        assert_eq!(store.latest_profile("alice").map(|e| e.id.as_str()), Some("p2"));

        let mut reversed = SignalStore::default();
        reversed.add(new);
        assert!(matches!(reversed.add(old), AddOutcome::Inserted { .. }));
        assert_eq!(reversed.latest_profile("alice").map(|e| e.id.as_str()), Some("p2"));
        assert_eq!(reversed.len(), 2);
    }

    #[test]
    fn test_over_cap_allocation_is_reported() {
        let mut store = SignalStore::default();
        for i in 0..9 {
            store.add(event(&format!("t{}", i), i, SignalType::TrustAllocate, "alice", Some(format!("p{}", i).as_str())));
        }
        let outcome = store.add(event("t9", 9, SignalType::TrustAllocate, "alice", Some("p9")));
        assert_eq!(
            outcome,
            AddOutcome::Inserted {
                catalog: CatalogChange::NotRecognition,
                newly_excluded: 1
            }
        );
        assert_eq!(store.get_trust_stats("alice").allocated_out, 225);
        assert_eq!(store.capacity_violations().len(), 1);
        // Retained for audit
        assert_eq!(store.get_by_type(&SignalType::TrustAllocate).len(), 10);
    }

    #[test]
    fn test_recognition_pending_then_resolved() {
        let mut store = SignalStore::default();
        let mut mint = event("r2", 2, SignalType::RecognitionMint, "issuer", Some("alex"));
        mint.payload = json!({"owner": "alex", "recognitionId": "chad"});
        let mut def = event("r1", 1, SignalType::RecognitionDefinition, "system", None);
        def.payload = json!({"id": "chad", "title": "Chad", "icon": "🗿"});

        store.add(mint);
        assert_eq!(store.pending_recognitions().len(), 1);
        assert!(store.get_recognitions_for("alex").is_empty());

        store.add(def);
        assert!(store.pending_recognitions().is_empty());
        assert_eq!(store.get_recognitions_for("alex")[0].definition.title, "Chad");
        assert!(store.definition("chad").is_some());
    }

    #[test]
    fn test_summary_counts() {
        let mut store = SignalStore::default();
        store.add(event("1", 1, SignalType::ContactRequest, "a", Some("b")));
        let mut streamed = event("2", 5, SignalType::ContactRequest, "b", Some("c"));
        streamed.source = DeliverySource::Stream;
        store.add(streamed);
        store.add(event("3", 3, SignalType::TrustAllocate, "a", Some("b")));

        let summary = store.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type["CONTACT_REQUEST"], 2);
        assert_eq!(summary.by_source["backfill"], 2);
        assert_eq!(summary.by_source["stream"], 1);
        assert_eq!(summary.latest, Some(ConsensusTime::new(5, 0)));
    }

    #[test]
    fn test_quarantine_bounded_and_deduplicated() {
        let mut quarantine = Quarantine::new(2);
        assert_eq!(quarantine.push(unknown(1)), QuarantinePush::Queued);
        assert_eq!(quarantine.push(unknown(1)), QuarantinePush::AlreadyQueued);
        assert_eq!(quarantine.push(unknown(2)), QuarantinePush::Queued);
        match quarantine.push(unknown(3)) {
            QuarantinePush::Evicted(oldest) => assert_eq!(oldest.message.sequence_number(), Some(1)),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(quarantine.len(), 2);
        assert_eq!(quarantine.evicted(), 1);

        let drained = quarantine.take_all();
        assert_eq!(drained.len(), 2);
        assert!(quarantine.is_empty());
        // Drained entries may be queued again
        assert_eq!(quarantine.push(unknown(2)), QuarantinePush::Queued);
    }

    #[test]
    fn test_clear_wipes_everything() {
        let mut store = SignalStore::default();
        store.add(event("1", 1, SignalType::TrustAllocate, "a", Some("b")));
        store.quarantine_mut().push(unknown(4));
        store.clear();
        assert!(store.is_empty());
        assert!(store.quarantine().is_empty());
        assert_eq!(store.get_trust_stats("a").allocated_out, 0);
        assert!(!store.contains("1"));
    }
}
