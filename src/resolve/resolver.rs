use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::precedence::PrecedenceKey;
use crate::config::StorePaths;
use crate::error::{MemoryError, Result};
use crate::rules::{Rule, Tier};
use crate::selector::{Selector, Version};
use crate::storage::{IndexEntry, Manifest, RuleIndex, read_revision};

/// Merged facts for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveFactSet {
    pub model_id: String,
    pub fw_version: String,
    /// Physical unit the caller resolved for; echoed, not used for matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub facts: BTreeMap<String, ResolvedFact>,
    /// Matching rules, highest precedence first.
    pub matched_rules: Vec<MatchedRule>,
}

impl EffectiveFactSet {
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn value(&self, key_path: &str) -> Option<&Value> {
        self.facts.get(key_path).map(|f| &f.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedFact {
    pub value: Value,
    pub winning_rule_id: String,
    /// Every rule defining this key path, highest precedence first.
    pub contributing_rule_ids: Vec<String>,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub rule_id: String,
    pub revision: u32,
    pub tier: Tier,
    pub value: Value,
    pub observation_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedRule {
    pub rule_id: String,
    pub revision: u32,
    pub tier: Tier,
    pub fw_selector: Selector,
    pub priority: i64,
    pub confidence: f64,
}

/// Read-only view over the last committed state.
pub struct Resolver<'a> {
    paths: &'a StorePaths,
    include_candidates: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(paths: &'a StorePaths, include_candidates: bool) -> Self {
        Self {
            paths,
            include_candidates,
        }
    }

    /// Merge every applicable rule into one fact set.
    ///
    /// Fails with `AmbiguousResolution` when the top-ranked rules for a key
    /// path tie on every precedence field but disagree on the value.
    pub fn resolve(&self, model_id: &str, fw_version: &str) -> Result<EffectiveFactSet> {
        let version = Version::parse(fw_version)?;
        let mut rules = self.applicable_rules(model_id, &version)?;
        rules.sort_by(|a, b| {
            PrecedenceKey::of_rule(b)
                .cmp(&PrecedenceKey::of_rule(a))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        let key_paths: BTreeSet<&String> = rules.iter().flat_map(|r| r.facts.keys()).collect();
        let mut facts = BTreeMap::new();
        for key_path in key_paths {
            facts.insert(key_path.clone(), merge_key(key_path, &rules)?);
        }

        debug!(
            model = model_id,
            fw = fw_version,
            rules = rules.len(),
            facts = facts.len(),
            "Resolved"
        );

        Ok(EffectiveFactSet {
            model_id: model_id.to_string(),
            fw_version: fw_version.to_string(),
            instance_id: None,
            facts,
            matched_rules: rules
                .iter()
                .map(|r| MatchedRule {
                    rule_id: r.rule_id.clone(),
                    revision: r.revision,
                    tier: r.tier,
                    fw_selector: r.fw_selector.clone(),
                    priority: r.priority,
                    confidence: r.confidence,
                })
                .collect(),
        })
    }

    /// Index entries matching the target in every tier, highest precedence first.
    pub fn search(&self, model_id: &str, fw_version: &str) -> Result<Vec<IndexEntry>> {
        let version = Version::parse(fw_version)?;
        let index = self.index()?;
        let mut entries: Vec<IndexEntry> = index.matching(model_id, &version).cloned().collect();
        entries.sort_by(|a, b| {
            PrecedenceKey::of_entry(b)
                .cmp(&PrecedenceKey::of_entry(a))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(entries)
    }

    fn index(&self) -> Result<RuleIndex> {
        let manifest = Manifest::load(self.paths)?;
        RuleIndex::load_or_rebuild(self.paths, &manifest)
    }

    fn applicable_rules(&self, model_id: &str, version: &Version) -> Result<Vec<Rule>> {
        let index = self.index()?;
        let mut rules = Vec::new();

        for entry in index.matching(model_id, version) {
            if entry.tier == Tier::Candidate && !self.include_candidates {
                continue;
            }
            let rule = read_revision(self.paths, &entry.path)?;
            if rule.deleted {
                warn!(rule_id = %rule.rule_id, "Index lists a tombstoned revision, skipping");
                continue;
            }
            rules.push(rule);
        }
        Ok(rules)
    }
}

/// Pick the value for one key path from rules sorted by precedence.
fn merge_key(key_path: &str, sorted: &[Rule]) -> Result<ResolvedFact> {
    let defining: Vec<(&Rule, &Value)> = sorted
        .iter()
        .filter_map(|r| r.facts.get(key_path).map(|v| (r, v)))
        .collect();

    let (winner, value) = defining[0];
    let top = PrecedenceKey::of_rule(winner);
    let tied: Vec<&(&Rule, &Value)> = defining
        .iter()
        .take_while(|(r, _)| PrecedenceKey::of_rule(r) == top)
        .collect();

    if tied.iter().any(|(_, v)| *v != value) {
        let mut rule_ids: Vec<String> = tied.iter().map(|(r, _)| r.rule_id.clone()).collect();
        rule_ids.sort();
        return Err(MemoryError::AmbiguousResolution {
            key_path: key_path.to_string(),
            rule_ids,
        });
    }

    Ok(ResolvedFact {
        value: value.clone(),
        winning_rule_id: winner.rule_id.clone(),
        contributing_rule_ids: defining.iter().map(|(r, _)| r.rule_id.clone()).collect(),
        contributions: defining
            .iter()
            .map(|(r, v)| Contribution {
                rule_id: r.rule_id.clone(),
                revision: r.revision,
                tier: r.tier,
                value: (*v).clone(),
                observation_ids: r.provenance.clone(),
            })
            .collect(),
    })
}
