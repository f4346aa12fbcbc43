//! Key-path diff between two revisions of a rule.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::Rule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDiff {
    pub rule_id: String,
    pub from_revision: u32,
    pub to_revision: u32,
    /// Facts only in the newer revision
    pub added: Vec<FactValue>,
    /// Facts only in the older revision
    pub removed: Vec<FactValue>,
    pub changed: Vec<FactChange>,
    /// Selector, tier, priority, confidence and tombstone changes
    pub fields: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactValue {
    pub key_path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactChange {
    pub key_path: String,
    pub from: Value,
    pub to: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: String,
    pub to: String,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.fields.is_empty()
    }
}

pub fn diff_revisions(from: &Rule, to: &Rule) -> RuleDiff {
    let keys: BTreeSet<&String> = from.facts.keys().chain(to.facts.keys()).collect();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    for key in keys {
        match (from.facts.get(key), to.facts.get(key)) {
            (None, Some(value)) => added.push(FactValue {
                key_path: key.clone(),
                value: value.clone(),
            }),
            (Some(value), None) => removed.push(FactValue {
                key_path: key.clone(),
                value: value.clone(),
            }),
            (Some(old), Some(new)) if old != new => changed.push(FactChange {
                key_path: key.clone(),
                from: old.clone(),
                to: new.clone(),
            }),
            _ => {}
        }
    }

    let mut fields = Vec::new();
    let mut compare = |field: &str, old: String, new: String| {
        if old != new {
            fields.push(FieldChange {
                field: field.to_string(),
                from: old,
                to: new,
            });
        }
    };
    compare("fw_selector", from.fw_selector.to_string(), to.fw_selector.to_string());
    compare("tier", from.tier.to_string(), to.tier.to_string());
    compare("priority", from.priority.to_string(), to.priority.to_string());
    compare("confidence", from.confidence.to_string(), to.confidence.to_string());
    compare("deleted", from.deleted.to_string(), to.deleted.to_string());

    RuleDiff {
        rule_id: to.rule_id.clone(),
        from_revision: from.revision,
        to_revision: to.revision,
        added,
        removed,
        changed,
        fields,
    }
}
