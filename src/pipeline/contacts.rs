//! Bonded-contact derivation
//!
//! A pair is bonded once both a CONTACT_REQUEST and a CONTACT_ACCEPT exist
//! between the two actors, in either direction and in any order. A later
//! CONTACT_REVOKE dissolves the bond. Each pair's events are replayed in
//! (timestamp, id) order at query time.

use super::types::{OrderKey, SignalEvent, SignalType};
use crate::streamer_core::mirror_client::ConsensusTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BondedContact {
    pub peer_id: String,
    pub bonded_at: ConsensusTime,
    pub handle: Option<String>,
    pub trust_level: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContactStep {
    Request,
    Accept,
    Revoke,
}

#[derive(Debug, Default)]
pub struct ContactGraph {
    /// unordered pair (low, high) → steps by order key
    pairs: HashMap<(String, String), BTreeMap<OrderKey, ContactStep>>,
    peers: HashMap<String, BTreeSet<String>>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl ContactGraph {
    pub fn apply(&mut self, event: &SignalEvent) -> bool {
        let step = match event.signal_type {
            SignalType::ContactRequest => ContactStep::Request,
            SignalType::ContactAccept => ContactStep::Accept,
            SignalType::ContactRevoke => ContactStep::Revoke,
            _ => return false,
        };
        let Some(target) = event.target.as_deref() else {
            return false;
        };
        if target == event.actor {
            return false;
        }

        self.pairs
            .entry(pair_key(&event.actor, target))
            .or_default()
            .insert(event.order_key(), step);
        self.peers
            .entry(event.actor.clone())
            .or_default()
            .insert(target.to_string());
        self.peers
            .entry(target.to_string())
            .or_default()
            .insert(event.actor.clone());
        true
    }

    /// Bond time for a pair, if currently bonded
    pub fn bonded_at(&self, a: &str, b: &str) -> Option<ConsensusTime> {
        let steps = self.pairs.get(&pair_key(a, b))?;
        let mut requested = false;
        let mut accepted = false;
        let mut bonded = None;

        for ((ts, _), step) in steps {
            match step {
                ContactStep::Request => requested = true,
                ContactStep::Accept => accepted = true,
                ContactStep::Revoke => {
                    requested = false;
                    accepted = false;
                    bonded = None;
                }
            }
            if requested && accepted && bonded.is_none() {
                bonded = Some(*ts);
            }
        }
        bonded
    }

    /// Bonded peers of `actor`, sorted by (bonded_at, peer)
    pub fn bonded(&self, actor: &str) -> Vec<(String, ConsensusTime)> {
        let mut bonded: Vec<(String, ConsensusTime)> = self
            .peers
            .get(actor)
            .into_iter()
            .flatten()
            .filter_map(|peer| self.bonded_at(actor, peer).map(|at| (peer.clone(), at)))
            .collect();
        bonded.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        bonded
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::tests::event;

    fn step(id: &str, ts: i64, kind: SignalType, actor: &str, target: &str) -> SignalEvent {
        event(id, ts, kind, actor, Some(target))
    }

    #[test]
    fn test_request_then_accept_bonds_both_sides() {
        let mut graph = ContactGraph::default();
        graph.apply(&step("c/1", 1, SignalType::ContactRequest, "alice", "bob"));
        graph.apply(&step("c/2", 2, SignalType::ContactAccept, "bob", "alice"));

        assert_eq!(graph.bonded("alice"), vec![("bob".to_string(), ConsensusTime::new(2, 0))]);
        assert_eq!(graph.bonded("bob"), vec![("alice".to_string(), ConsensusTime::new(2, 0))]);
    }

    #[test]
    fn test_request_alone_is_not_a_bond() {
        let mut graph = ContactGraph::default();
        graph.apply(&step("c/1", 1, SignalType::ContactRequest, "alice", "bob"));
        assert!(graph.bonded("alice").is_empty());
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let mut graph = ContactGraph::default();
        graph.apply(&step("c/2", 2, SignalType::ContactAccept, "bob", "alice"));
        graph.apply(&step("c/1", 1, SignalType::ContactRequest, "alice", "bob"));
        assert_eq!(graph.bonded_at("alice", "bob"), Some(ConsensusTime::new(2, 0)));
    }

    #[test]
    fn test_revoke_dissolves_and_rebond_works() {
        let mut graph = ContactGraph::default();
        graph.apply(&step("c/1", 1, SignalType::ContactRequest, "alice", "bob"));
        graph.apply(&step("c/2", 2, SignalType::ContactAccept, "bob", "alice"));
        graph.apply(&step("c/3", 3, SignalType::ContactRevoke, "alice", "bob"));
        assert!(graph.bonded("alice").is_empty());

        graph.apply(&step("c/4", 4, SignalType::ContactRequest, "bob", "alice"));
        graph.apply(&step("c/5", 5, SignalType::ContactAccept, "alice", "bob"));
        assert_eq!(graph.bonded_at("bob", "alice"), Some(ConsensusTime::new(5, 0)));
    }

    #[test]
    fn test_revoke_before_bond_has_no_effect() {
        let mut graph = ContactGraph::default();
        graph.apply(&step("c/0", 0, SignalType::ContactRevoke, "alice", "bob"));
        graph.apply(&step("c/1", 1, SignalType::ContactRequest, "alice", "bob"));
        graph.apply(&step("c/2", 2, SignalType::ContactAccept, "bob", "alice"));
        assert!(graph.bonded_at("alice", "bob").is_some());
    }
}
