use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StorePaths;
use crate::error::{Result, corruption_with};
use crate::rules::{RuleAction, Tier};
use crate::utils::write_atomic;
use crate::validate::{RuleCatalogue, RuleState};

/// Committed catalogue of every rule revision.
///
/// Replacing this file is the commit point of an apply. Revision files not
/// listed here are invisible to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_request: Option<String>,
    #[serde(default)]
    pub rules: BTreeMap<String, ManifestRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRule {
    pub model_id: String,
    pub revisions: Vec<RevisionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub revision: u32,
    pub tier: Tier,
    pub action: RuleAction,
    /// Store-relative path of the revision file.
    pub path: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

impl ManifestRule {
    pub fn latest(&self) -> Option<&RevisionRef> {
        self.revisions.last()
    }

    pub fn revision(&self, revision: u32) -> Option<&RevisionRef> {
        self.revisions.iter().find(|r| r.revision == revision)
    }

    pub fn is_deleted(&self) -> bool {
        self.latest()
            .is_some_and(|r| r.action == RuleAction::Delete)
    }
}

impl Manifest {
    /// Load the committed manifest; a store that never applied has generation 0.
    pub fn load(paths: &StorePaths) -> Result<Self> {
        Self::load_from(&paths.manifest_file())
    }

    fn load_from(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| corruption_with("manifest", e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn publish(&self, paths: &StorePaths) -> Result<()> {
        write_atomic(
            &paths.manifest_file(),
            serde_json::to_string_pretty(self)?.as_bytes(),
        )
    }

    pub fn rule(&self, rule_id: &str) -> Option<&ManifestRule> {
        self.rules.get(rule_id)
    }

    /// Latest revision of every rule that is not tombstoned.
    pub fn live(&self) -> impl Iterator<Item = (&str, &ManifestRule, &RevisionRef)> {
        self.rules.iter().filter_map(|(id, rule)| {
            let latest = rule.latest()?;
            (latest.action != RuleAction::Delete).then_some((id.as_str(), rule, latest))
        })
    }
}

impl RuleCatalogue for Manifest {
    fn rule_state(&self, rule_id: &str) -> Option<RuleState> {
        self.rule(rule_id).map(|rule| RuleState {
            model_id: rule.model_id.clone(),
            deleted: rule.is_deleted(),
        })
    }
}
