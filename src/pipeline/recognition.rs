//! Recognition catalog and the late-binding instance join
//!
//! Definitions are immutable: when two claim the same id (or slug) the one
//! with the smallest (timestamp, id) wins regardless of arrival order.
//! Instances are always kept and joined against the catalog at query time;
//! an instance whose definition has not arrived yet is simply pending.

use super::classifier::{DefinitionPayload, InstancePayload};
use super::types::{OrderKey, SignalEvent, SignalType};
use crate::streamer_core::mirror_client::ConsensusTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognitionDefinition {
    pub id: String,
    pub slug: Option<String>,
    pub title: String,
    pub icon: String,
    pub description: Option<String>,
    pub schema: Option<String>,
    pub published_at: ConsensusTime,
    pub event_id: String,
    pub topic_id: String,
}

impl RecognitionDefinition {
    fn key(&self) -> OrderKey {
        (self.published_at, self.event_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognitionInstance {
    pub event_id: String,
    pub owner: String,
    pub recognition_id: String,
    pub issuer: Option<String>,
    pub note: Option<String>,
    pub issued_at: Option<String>,
    pub timestamp: ConsensusTime,
    pub topic_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRecognition {
    pub instance: RecognitionInstance,
    pub definition: RecognitionDefinition,
}

/// What happened when an event was folded into the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    DefinitionPublished { id: String, unblocked: usize },
    DefinitionIgnored { id: String },
    InstanceResolved,
    InstancePending { recognition_id: String },
    NotRecognition,
}

#[derive(Debug, Default)]
pub struct RecognitionCatalog {
    definitions: HashMap<String, RecognitionDefinition>,
    /// slug → (key, definition id) of the earliest definition carrying it
    slugs: HashMap<String, (OrderKey, String)>,
    instances: BTreeMap<OrderKey, RecognitionInstance>,
    by_owner: HashMap<String, BTreeSet<OrderKey>>,
}

impl RecognitionCatalog {
    pub fn apply(&mut self, event: &SignalEvent) -> CatalogChange {
        match event.signal_type {
            SignalType::RecognitionDefinition => match definition_from_event(event) {
                Some(def) => self.publish(def),
                None => CatalogChange::NotRecognition,
            },
            SignalType::RecognitionMint => match instance_from_event(event) {
                Some(instance) => self.issue(instance),
                None => CatalogChange::NotRecognition,
            },
            _ => CatalogChange::NotRecognition,
        }
    }

    fn publish(&mut self, def: RecognitionDefinition) -> CatalogChange {
        let id = def.id.clone();
        if let Some(existing) = self.definitions.get(&id) {
            if existing.key() <= def.key() {
                return CatalogChange::DefinitionIgnored { id };
            }
        }

        let new_slug = def.slug.clone();
        let replaced_slug = self
            .definitions
            .insert(id.clone(), def)
            .and_then(|replaced| replaced.slug);
        for slug in [replaced_slug, new_slug].into_iter().flatten() {
            self.reindex_slug(&slug);
        }

        let unblocked = self
            .instances
            .values()
            .filter(|inst| self.resolve(&inst.recognition_id).map(|d| d.id.as_str()) == Some(id.as_str()))
            .count();
        CatalogChange::DefinitionPublished { id, unblocked }
    }

    /// Point a slug at the earliest definition currently carrying it
    fn reindex_slug(&mut self, slug: &str) {
        let earliest = self
            .definitions
            .values()
            .filter(|d| d.slug.as_deref() == Some(slug))
            .map(|d| (d.key(), d.id.clone()))
            .min();
        match earliest {
            Some(claim) => {
                self.slugs.insert(slug.to_string(), claim);
            }
            None => {
                self.slugs.remove(slug);
            }
        }
    }

    fn issue(&mut self, instance: RecognitionInstance) -> CatalogChange {
        let key = (instance.timestamp, instance.event_id.clone());
        let resolved = self.resolve(&instance.recognition_id).is_some();
        let recognition_id = instance.recognition_id.clone();

        self.by_owner
            .entry(instance.owner.clone())
            .or_default()
            .insert(key.clone());
        self.instances.insert(key, instance);

        if resolved {
            CatalogChange::InstanceResolved
        } else {
            CatalogChange::InstancePending { recognition_id }
        }
    }

    /// Definition by id, then by slug
    pub fn resolve(&self, id_or_slug: &str) -> Option<&RecognitionDefinition> {
        self.definitions.get(id_or_slug).or_else(|| {
            self.slugs
                .get(id_or_slug)
                .and_then(|(_, id)| self.definitions.get(id))
        })
    }

    /// All definitions in publication order
    pub fn definitions(&self) -> Vec<RecognitionDefinition> {
        let mut defs: Vec<RecognitionDefinition> = self.definitions.values().cloned().collect();
        defs.sort_by_key(RecognitionDefinition::key);
        defs
    }

    pub fn recognitions_for(&self, owner: &str) -> Vec<ResolvedRecognition> {
        self.by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|key| self.instances.get(key))
            .filter_map(|instance| {
                self.resolve(&instance.recognition_id).map(|definition| ResolvedRecognition {
                    instance: instance.clone(),
                    definition: definition.clone(),
                })
            })
            .collect()
    }

    /// Instances still waiting for their definition
    pub fn pending(&self) -> Vec<RecognitionInstance> {
        self.instances
            .values()
            .filter(|inst| self.resolve(&inst.recognition_id).is_none())
            .cloned()
            .collect()
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn clear(&mut self) {
        self.definitions.clear();
        self.slugs.clear();
        self.instances.clear();
        self.by_owner.clear();
    }
}

fn definition_from_event(event: &SignalEvent) -> Option<RecognitionDefinition> {
    let payload: DefinitionPayload = serde_json::from_value(event.payload.clone()).ok()?;
    Some(RecognitionDefinition {
        id: payload.id,
        slug: payload.slug,
        title: payload.title,
        icon: payload.icon,
        description: payload.description,
        schema: payload.schema,
        published_at: event.timestamp,
        event_id: event.id.clone(),
        topic_id: event.topic_id.clone(),
    })
}

fn instance_from_event(event: &SignalEvent) -> Option<RecognitionInstance> {
    let payload: InstancePayload = serde_json::from_value(event.payload.clone()).ok()?;
    Some(RecognitionInstance {
        event_id: event.id.clone(),
        owner: payload.owner,
        recognition_id: payload.recognition_id,
        issuer: payload.actor.or_else(|| Some(event.actor.clone())),
        note: payload.note,
        issued_at: payload.timestamp,
        timestamp: event.timestamp,
        topic_id: event.topic_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::tests::event;
    use serde_json::json;

    fn definition(id: &str, ts: i64, payload: serde_json::Value) -> SignalEvent {
        let mut e = event(id, ts, SignalType::RecognitionDefinition, "catalog", None);
        e.payload = payload;
        e
    }

    fn mint(id: &str, ts: i64, owner: &str, recognition_id: &str) -> SignalEvent {
        let mut e = event(id, ts, SignalType::RecognitionMint, "issuer-1", Some(owner));
        e.payload = json!({"owner": owner, "recognitionId": recognition_id});
        e
    }

    #[test]
    fn test_instance_before_definition_is_pending_then_joined() {
        let mut catalog = RecognitionCatalog::default();
        let change = catalog.apply(&mint("r/2", 2, "alex", "chad"));
        assert_eq!(change, CatalogChange::InstancePending { recognition_id: "chad".to_string() });
        assert!(catalog.recognitions_for("alex").is_empty());
        assert_eq!(catalog.pending().len(), 1);

        let change = catalog.apply(&definition(
            "r/1",
            1,
            json!({"id": "chad", "title": "Chad", "icon": "🗿"}),
        ));
        assert_eq!(change, CatalogChange::DefinitionPublished { id: "chad".to_string(), unblocked: 1 });

        let resolved = catalog.recognitions_for("alex");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].definition.title, "Chad");
        assert_eq!(resolved[0].instance.issuer.as_deref(), Some("issuer-1"));
        assert!(catalog.pending().is_empty());
    }

    #[test]
    fn test_resolve_by_slug() {
        let mut catalog = RecognitionCatalog::default();
        catalog.apply(&definition(
            "r/1",
            1,
            json!({"id": "def-001", "slug": "mentor", "title": "Mentor", "icon": "🎓"}),
        ));
        catalog.apply(&mint("r/2", 2, "bob", "mentor"));

        assert_eq!(catalog.resolve("mentor").map(|d| d.id.as_str()), Some("def-001"));
        assert_eq!(catalog.recognitions_for("bob").len(), 1);
    }

    #[test]
    fn test_earliest_definition_wins_in_any_order() {
        let early = definition("r/1", 1, json!({"id": "x", "title": "First", "icon": "1"}));
        let late = definition("r/9", 9, json!({"id": "x", "title": "Second", "icon": "2"}));

        let mut forward = RecognitionCatalog::default();
        forward.apply(&early);
        assert_eq!(forward.apply(&late), CatalogChange::DefinitionIgnored { id: "x".to_string() });

        let mut backward = RecognitionCatalog::default();
        backward.apply(&late);
        backward.apply(&early);

        assert_eq!(forward.definitions(), backward.definitions());
        assert_eq!(forward.resolve("x").unwrap().title, "First");
    }
}
