use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::selector::{Selector, Specificity, Version};

/// Flattened `key.path` → value map.
pub type FactMap = BTreeMap<String, Value>;

/// Authority class of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Shared, versioned with the project.
    Profile,
    /// Local to one installation.
    Override,
    /// Below the confidence threshold; resolved only on request.
    Candidate,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Profile, Tier::Override, Tier::Candidate];

    /// Authority rank: override > profile > candidate.
    pub fn authority(&self) -> u8 {
        match self {
            Self::Override => 2,
            Self::Profile => 1,
            Self::Candidate => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Override => "override",
            Self::Candidate => "candidate",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "profile" | "shared" => Some(Self::Profile),
            "override" | "local" => Some(Self::Override),
            "candidate" => Some(Self::Candidate),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Create,
    Update,
    Delete,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable revision of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub revision: u32,
    pub model_id: String,
    pub tier: Tier,
    pub fw_selector: Selector,
    pub priority: i64,
    pub confidence: f64,
    #[serde(default)]
    pub facts: FactMap,
    pub provenance: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    pub request_id: String,
}

impl Rule {
    pub fn applies_to(&self, model_id: &str, version: &Version) -> bool {
        !self.deleted && self.model_id == model_id && self.fw_selector.matches(version)
    }

    pub fn specificity(&self) -> Specificity {
        self.fw_selector.specificity()
    }
}

/// Whether `text` can name a model, rule, or run on disk.
pub fn is_valid_identifier(text: &str) -> bool {
    !text.is_empty()
        && text != "."
        && text != ".."
        && text.len() <= 128
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Flatten a JSON object into dotted key paths.
///
/// Returns `None` when `value` is not an object. Arrays and empty objects
/// are leaf values.
pub fn flatten_facts(value: &Value) -> Option<FactMap> {
    let object = value.as_object()?;
    let mut out = FactMap::new();
    for (key, child) in object {
        flatten_into(key, child, &mut out);
    }
    Some(out)
}

fn flatten_into(prefix: &str, value: &Value, out: &mut FactMap) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(&format!("{}.{}", prefix, key), child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}
