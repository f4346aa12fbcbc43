use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::manifest::Manifest;
use super::revisions::read_revision;
use crate::config::StorePaths;
use crate::error::{MemoryError, Result, corruption_with};
use crate::rules::Tier;
use crate::selector::{Selector, Specificity, Version};
use crate::utils::write_atomic;

/// Cached selector data of one live rule revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub rule_id: String,
    pub revision: u32,
    pub tier: Tier,
    pub fw_selector: Selector,
    pub priority: i64,
    pub confidence: f64,
    pub specificity: Specificity,
    pub updated_at: DateTime<Utc>,
    pub path: PathBuf,
}

/// Disposable lookup table from model id to live rules.
///
/// Stamped with the manifest generation it was built from; any mismatch
/// means the index is stale and gets rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleIndex {
    pub generation: u64,
    pub models: BTreeMap<String, Vec<IndexEntry>>,
}

impl RuleIndex {
    /// Build from the committed manifest and its revision files.
    pub fn build(paths: &StorePaths, manifest: &Manifest) -> Result<Self> {
        let mut models: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();

        for (rule_id, rule, latest) in manifest.live() {
            let stored = read_revision(paths, &latest.path)?;
            if stored.rule_id != rule_id || stored.revision != latest.revision {
                return Err(MemoryError::StorageCorruption(format!(
                    "revision file {} holds {}@{}, expected {}@{}",
                    latest.path.display(),
                    stored.rule_id,
                    stored.revision,
                    rule_id,
                    latest.revision
                )));
            }

            models
                .entry(rule.model_id.clone())
                .or_default()
                .push(IndexEntry {
                    rule_id: rule_id.to_string(),
                    revision: latest.revision,
                    tier: latest.tier,
                    specificity: stored.fw_selector.specificity(),
                    fw_selector: stored.fw_selector,
                    priority: stored.priority,
                    confidence: stored.confidence,
                    updated_at: stored.updated_at,
                    path: latest.path.clone(),
                });
        }

        Ok(Self {
            generation: manifest.generation,
            models,
        })
    }

    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        write_atomic(
            &paths.index_file(),
            serde_json::to_string_pretty(self)?.as_bytes(),
        )
    }

    /// Rebuild from tiered storage and persist.
    pub fn rebuild(paths: &StorePaths, manifest: &Manifest) -> Result<Self> {
        let index = Self::build(paths, manifest)?;
        index.save(paths)?;
        info!(
            generation = index.generation,
            models = index.models.len(),
            rules = index.len(),
            "Index rebuilt"
        );
        Ok(index)
    }

    /// Load the index, rebuilding it when missing, unreadable, or stale.
    ///
    /// Fails with `StorageCorruption` only when the rebuild itself fails.
    /// Saving the rebuilt index is best effort: concurrent readers may race
    /// on it, and the in-memory copy is already correct.
    pub fn load_or_rebuild(paths: &StorePaths, manifest: &Manifest) -> Result<Self> {
        let path = paths.index_file();
        let reason = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(index) if index.generation == manifest.generation => {
                    debug!(generation = index.generation, "Index loaded");
                    return Ok(index);
                }
                Ok(index) => format!(
                    "stale (generation {}, manifest {})",
                    index.generation, manifest.generation
                ),
                Err(e) => format!("unreadable ({})", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => "missing".to_string(),
            Err(e) => format!("unreadable ({})", e),
        };

        warn!(path = %path.display(), reason = %reason, "Index unusable, rebuilding");
        let index = Self::build(paths, manifest).map_err(|e| match e {
            MemoryError::StorageCorruption(_) => e,
            other => corruption_with("index rebuild failed", other),
        })?;
        match index.save(paths) {
            Ok(()) => info!(generation = index.generation, rules = index.len(), "Index rebuilt"),
            Err(e) => warn!(error = %e, "Rebuilt index not saved"),
        }
        Ok(index)
    }

    /// Live entries of `model_id` whose selector matches `version`.
    pub fn matching<'a>(
        &'a self,
        model_id: &'a str,
        version: &'a Version,
    ) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.models
            .get(model_id)
            .into_iter()
            .flatten()
            .filter(move |e| e.fw_selector.matches(version))
    }

    pub fn len(&self) -> usize {
        self.models.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
