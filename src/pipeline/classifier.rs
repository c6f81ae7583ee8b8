//! Recognition classifier
//!
//! Every strategy scores the payload independently. The highest verdict at
//! or above `MIN_CONFIDENCE` wins, earlier strategies winning ties; anything
//! below it is reported as unknown so the payload can be reconciled later.

use super::decoder::{
    AliasRule, DEFINITION_DESCRIPTION, DEFINITION_ICON, DEFINITION_ID, DEFINITION_TITLE,
    INSTANCE_ISSUER, INSTANCE_NOTE, INSTANCE_OWNER, INSTANCE_RECOGNITION_ID, INSTANCE_TIMESTAMP,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MIN_CONFIDENCE: u8 = 50;

pub const DEFAULT_TITLE: &str = "Untitled Recognition";
pub const DEFAULT_ICON: &str = "🏷️";

const DEFINITION_FIELDS: [&str; 6] = ["title", "description", "icon", "slug", "schema", "criteria"];
const INSTANCE_FIELDS: [&str; 4] = ["owner", "issuer", "issuedAt", "note"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionKind {
    Definition,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub kind: RecognitionKind,
    pub confidence: u8,
}

pub trait ClassifierStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `hint` is the kind already named by an envelope type code, if any
    fn score(&self, fields: &Map<String, Value>, hint: Option<RecognitionKind>) -> Option<Verdict>;
}

/// Catalog entry in canonical field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub title: String,
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Issuance in canonical field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePayload {
    pub owner: String,
    pub recognition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Definition(DefinitionPayload, &'static str),
    Instance(InstancePayload, &'static str),
    Unknown(String),
}

/// Unambiguous discriminator fields, including legacy aliases
pub struct ExplicitTag;

impl ClassifierStrategy for ExplicitTag {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn score(&self, fields: &Map<String, Value>, hint: Option<RecognitionKind>) -> Option<Verdict> {
        let tag = |key: &str| fields.get(key).and_then(Value::as_str);
        let kind = match (tag("kind"), tag("type"), tag("messageType")) {
            (Some("RECOGNITION_DEFINITION"), _, _)
            | (_, Some("RECOGNITION_DEFINITION" | "HCS11_DEF"), _)
            | (_, _, Some("RECOGNITION_DEFINITION")) => Some(RecognitionKind::Definition),
            (Some("RECOGNITION_MINT"), _, _)
            | (_, Some("RECOGNITION_MINT" | "HCS11_INSTANCE"), _)
            | (_, _, Some("RECOGNITION_MINT")) => Some(RecognitionKind::Instance),
            _ => hint,
        };
        kind.map(|kind| Verdict { kind, confidence: 100 })
    }
}

/// Known schema fingerprints and field-presence patterns
pub struct PatternMatch;

impl ClassifierStrategy for PatternMatch {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn score(&self, fields: &Map<String, Value>, _hint: Option<RecognitionKind>) -> Option<Verdict> {
        let present = |key: &str| fields.get(key).map(truthy).unwrap_or(false);
        let schema = fields.get("schema").and_then(Value::as_str);

        let kind = if schema == Some("hcs-11-recognition-definition")
            || (present("slug") && present("title") && !present("owner"))
        {
            RecognitionKind::Definition
        } else if schema == Some("hcs-11-recognition-instance")
            || (present("owner") && present("recognitionId"))
        {
            RecognitionKind::Instance
        } else {
            return None;
        };
        Some(Verdict { kind, confidence: 80 })
    }
}

/// Field-set scoring against definition- and instance-indicative lists
pub struct StructuralInference;

impl ClassifierStrategy for StructuralInference {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn score(&self, fields: &Map<String, Value>, _hint: Option<RecognitionKind>) -> Option<Verdict> {
        let count = |list: &[&str]| list.iter().filter(|f| fields.contains_key(**f)).count();
        let definition_score = count(&DEFINITION_FIELDS);
        let instance_score = count(&INSTANCE_FIELDS);

        if definition_score >= 2 && definition_score > instance_score {
            let confidence = 40 + 10 * definition_score.min(6) as u8;
            return Some(Verdict {
                kind: RecognitionKind::Definition,
                confidence,
            });
        }

        let has = |key: &str| fields.contains_key(key);
        let owned = has("owner")
            || (has("recognitionId") && (has("to") || has("recipient")));
        owned.then_some(Verdict {
            kind: RecognitionKind::Instance,
            confidence: 60,
        })
    }
}

pub struct RecognitionClassifier {
    strategies: Vec<Box<dyn ClassifierStrategy>>,
    min_confidence: u8,
}

impl Default for RecognitionClassifier {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(ExplicitTag),
                Box::new(PatternMatch),
                Box::new(StructuralInference),
            ],
            min_confidence: MIN_CONFIDENCE,
        }
    }
}

impl RecognitionClassifier {
    pub fn empty(min_confidence: u8) -> Self {
        Self {
            strategies: Vec::new(),
            min_confidence,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ClassifierStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Best verdict above threshold, with the name of the strategy that produced it
    pub fn verdict(
        &self,
        payload: &Value,
        hint: Option<RecognitionKind>,
    ) -> Option<(Verdict, &'static str)> {
        let fields = payload.as_object()?;
        let mut best: Option<(Verdict, &'static str)> = None;
        for strategy in &self.strategies {
            if let Some(verdict) = strategy.score(fields, hint) {
                let better = best
                    .map(|(current, _)| verdict.confidence > current.confidence)
                    .unwrap_or(true);
                if better {
                    best = Some((verdict, strategy.name()));
                }
            }
        }
        best.filter(|(verdict, _)| verdict.confidence >= self.min_confidence)
    }

    /// Classify and coerce; `fallback_id` names definitions that carry no id
    pub fn classify(
        &self,
        payload: &Value,
        hint: Option<RecognitionKind>,
        fallback_id: &str,
    ) -> Classification {
        match self.verdict(payload, hint) {
            Some((Verdict { kind: RecognitionKind::Definition, .. }, strategy)) => {
                Classification::Definition(coerce_definition(payload, fallback_id), strategy)
            }
            Some((Verdict { kind: RecognitionKind::Instance, .. }, strategy)) => {
                match coerce_instance(payload) {
                    Some(instance) => Classification::Instance(instance, strategy),
                    None => Classification::Unknown("instance without owner".to_string()),
                }
            }
            None if !payload.is_object() => Classification::Unknown("payload is not an object".to_string()),
            None => Classification::Unknown("insufficient signal".to_string()),
        }
    }
}

pub fn coerce_definition(payload: &Value, fallback_id: &str) -> DefinitionPayload {
    let text = |rule: AliasRule| rule.resolve(payload);
    let field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    DefinitionPayload {
        id: text(DEFINITION_ID).unwrap_or_else(|| format!("rec-{}", fallback_id)),
        slug: field("slug"),
        title: text(DEFINITION_TITLE).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        icon: text(DEFINITION_ICON).unwrap_or_else(|| DEFAULT_ICON.to_string()),
        description: text(DEFINITION_DESCRIPTION),
        schema: field("schema"),
    }
}

pub fn coerce_instance(payload: &Value) -> Option<InstancePayload> {
    Some(InstancePayload {
        owner: INSTANCE_OWNER.resolve(payload)?,
        recognition_id: INSTANCE_RECOGNITION_ID
            .resolve(payload)
            .unwrap_or_else(|| "unknown".to_string()),
        actor: INSTANCE_ISSUER.resolve(payload),
        note: INSTANCE_NOTE.resolve(payload),
        timestamp: INSTANCE_TIMESTAMP.resolve(payload),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
