use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;
use crate::rules::{RuleAction, Tier};

/// A proposed set of rule changes ("compile response").
///
/// Upserts stay raw JSON so schema problems surface as violations with
/// their index instead of a single parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub upserts: Vec<Value>,
    #[serde(default)]
    pub provenance_summary: ProvenanceSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    #[serde(default)]
    pub observation_ids_used: Vec<String>,
}

impl ChangeBatch {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn with_upsert(mut self, upsert: RuleUpsert) -> Self {
        self.upserts.push(upsert.into());
        self
    }

    pub fn with_summary(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.provenance_summary.observation_ids_used = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the summary to the union of every upsert's provenance.
    pub fn summarized(mut self) -> Self {
        let used: BTreeSet<String> = self
            .upserts
            .iter()
            .filter_map(|u| u.pointer("/provenance/observation_ids"))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        self.provenance_summary.observation_ids_used = used.into_iter().collect();
        self
    }
}

/// Typed builder for one upsert entry of a batch.
#[derive(Debug, Clone)]
pub struct RuleUpsert {
    pub action: RuleAction,
    pub tier: Tier,
    pub rule_id: Option<String>,
    pub model_id: String,
    pub fw_selector: String,
    pub priority: i64,
    pub confidence: f64,
    pub facts: Value,
    pub observation_ids: Vec<String>,
}

impl RuleUpsert {
    pub fn create(
        tier: Tier,
        model_id: impl Into<String>,
        fw_selector: impl Into<String>,
        facts: Value,
    ) -> Self {
        Self {
            action: RuleAction::Create,
            tier,
            rule_id: None,
            model_id: model_id.into(),
            fw_selector: fw_selector.into(),
            priority: 0,
            confidence: 1.0,
            facts,
            observation_ids: Vec::new(),
        }
    }

    pub fn update(rule_id: impl Into<String>, base: RuleUpsert) -> Self {
        Self {
            action: RuleAction::Update,
            rule_id: Some(rule_id.into()),
            ..base
        }
    }

    pub fn delete(rule_id: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Delete,
            tier: Tier::Candidate,
            rule_id: Some(rule_id.into()),
            model_id: String::new(),
            fw_selector: String::new(),
            priority: 0,
            confidence: 0.0,
            facts: Value::Null,
            observation_ids: Vec::new(),
        }
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_provenance(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.observation_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

impl From<RuleUpsert> for Value {
    fn from(upsert: RuleUpsert) -> Self {
        let mut value = match upsert.action {
            RuleAction::Delete => json!({
                "action": upsert.action.as_str(),
                "provenance": {"observation_ids": upsert.observation_ids},
            }),
            _ => json!({
                "action": upsert.action.as_str(),
                "tier": upsert.tier.as_str(),
                "model_id": upsert.model_id,
                "fw_selector": upsert.fw_selector,
                "priority": upsert.priority,
                "confidence": upsert.confidence,
                "facts": upsert.facts,
                "provenance": {"observation_ids": upsert.observation_ids},
            }),
        };
        if let (Some(rule_id), Some(map)) = (upsert.rule_id, value.as_object_mut()) {
            map.insert("rule_id".into(), Value::String(rule_id));
        }
        value
    }
}
