//! Capped trust ledger ("Circle of 9")
//!
//! Each (actor, target) pair is decided by its latest ALLOCATE/REVOKE in
//! (timestamp, id) order. Allocated pairs are admitted oldest first until the
//! actor's nine slots are full; the remainder stay on record as over-cap.

use super::types::{OrderKey, SignalEvent, SignalType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const SLOT_WEIGHT: u32 = 25;
pub const MAX_SLOTS: usize = 9;
pub const TRUST_CAP: u32 = SLOT_WEIGHT * MAX_SLOTS as u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustStats {
    pub allocated_out: u32,
    pub cap: u32,
    pub slots_used: usize,
    pub slots_total: usize,
    pub received_in: u32,
    /// Allocations on record but outside the active aggregate
    pub excluded_over_cap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ContactTrust {
    pub allocated_to: u32,
    pub received_from: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityViolation {
    pub actor: String,
    pub excluded_event_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PairDecision {
    key: OrderKey,
    allocated: bool,
}

#[derive(Debug, Default)]
pub struct TrustLedger {
    /// actor → target → latest decision
    outbound: HashMap<String, BTreeMap<String, PairDecision>>,
    /// target → actors that have ever addressed it
    inbound: HashMap<String, Vec<String>>,
}

impl TrustLedger {
    /// Fold one trust event in; returns false for events that carry no decision
    pub fn apply(&mut self, event: &SignalEvent) -> bool {
        let allocated = match event.signal_type {
            SignalType::TrustAllocate => true,
            SignalType::TrustRevoke => false,
            _ => return false,
        };
        let Some(target) = event.target.as_deref() else {
            return false;
        };

        let decision = PairDecision {
            key: event.order_key(),
            allocated,
        };
        let pairs = self.outbound.entry(event.actor.clone()).or_default();
        match pairs.get(target) {
            Some(current) if current.key >= decision.key => {}
            Some(_) => {
                pairs.insert(target.to_string(), decision);
            }
            None => {
                pairs.insert(target.to_string(), decision);
                self.inbound
                    .entry(target.to_string())
                    .or_default()
                    .push(event.actor.clone());
            }
        }
        true
    }

    /// Allocated pairs split into (admitted, over-cap), each in admission order
    fn partition(&self, actor: &str) -> (Vec<(&String, &PairDecision)>, Vec<(&String, &PairDecision)>) {
        let Some(pairs) = self.outbound.get(actor) else {
            return (Vec::new(), Vec::new());
        };
        let mut allocated: Vec<(&String, &PairDecision)> =
            pairs.iter().filter(|(_, d)| d.allocated).collect();
        allocated.sort_by(|a, b| a.1.key.cmp(&b.1.key));
        let over = allocated.split_off(allocated.len().min(MAX_SLOTS));
        (allocated, over)
    }

    fn admits(&self, actor: &str, target: &str) -> bool {
        self.partition(actor).0.iter().any(|(t, _)| t.as_str() == target)
    }

    pub fn stats(&self, actor: &str) -> TrustStats {
        let (admitted, over) = self.partition(actor);
        let received = self
            .inbound
            .get(actor)
            .map(|sources| sources.iter().filter(|src| self.admits(src, actor)).count())
            .unwrap_or(0);

        TrustStats {
            allocated_out: admitted.len() as u32 * SLOT_WEIGHT,
            cap: TRUST_CAP,
            slots_used: admitted.len(),
            slots_total: MAX_SLOTS,
            received_in: received as u32 * SLOT_WEIGHT,
            excluded_over_cap: over.len(),
        }
    }

    pub fn levels(&self, actor: &str) -> BTreeMap<String, ContactTrust> {
        let mut levels: BTreeMap<String, ContactTrust> = BTreeMap::new();
        for (target, _) in self.partition(actor).0 {
            levels.entry(target.clone()).or_default().allocated_to = SLOT_WEIGHT;
        }
        if let Some(sources) = self.inbound.get(actor) {
            for source in sources {
                if self.admits(source, actor) {
                    levels.entry(source.clone()).or_default().received_from = SLOT_WEIGHT;
                }
            }
        }
        levels
    }

    pub fn allocated_to(&self, actor: &str, target: &str) -> u32 {
        if self.admits(actor, target) {
            SLOT_WEIGHT
        } else {
            0
        }
    }

    pub fn violations(&self) -> Vec<CapacityViolation> {
        let mut actors: Vec<&String> = self.outbound.keys().collect();
        actors.sort();
        actors
            .into_iter()
            .filter_map(|actor| {
                let (_, over) = self.partition(actor);
                (!over.is_empty()).then(|| CapacityViolation {
                    actor: actor.clone(),
                    excluded_event_ids: over.iter().map(|(_, d)| d.key.1.clone()).collect(),
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}
