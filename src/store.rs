//! One store root with its evidence, rules, and policy.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{CONFIG_FILE, MemoryConfig, StorePaths};
use crate::error::{MemoryError, Result};
use crate::evidence::{EvidenceStore, NewObservation, Observation};
use crate::lock::StoreLock;
use crate::request::{CompileRequest, RequestLedger};
use crate::resolve::{EffectiveFactSet, Resolver};
use crate::rules::Rule;
use crate::storage::{
    ApplyResult, CrashPoint, HistoryEntry, HistoryLog, IndexEntry, Manifest, RecoveryOutcome,
    RevisionRef, RuleDiff, RuleIndex, Writer, diff_revisions, read_revision,
};
use crate::validate::{ChangeBatch, ValidationContext, validate};

/// Observation or apply, merged in time order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEvent {
    Observation(Observation),
    Apply(HistoryEntry),
}

impl TimelineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Observation(o) => o.created_at,
            Self::Apply(h) => h.applied_at,
        }
    }
}

pub struct MemoryStore {
    paths: StorePaths,
    config: MemoryConfig,
    evidence: EvidenceStore,
}

impl MemoryStore {
    /// Open the store at `root`, reading `data/memory/config.toml` if present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = StorePaths::new(root);
        let config = MemoryConfig::load(&paths.memory_dir)?;
        Ok(Self::with_config(paths, config))
    }

    pub fn with_config(paths: StorePaths, config: MemoryConfig) -> Self {
        let evidence = EvidenceStore::new(paths.clone(), &config.lock);
        Self {
            paths,
            config,
            evidence,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    /// Create the directory layout and a default config. Returns whether
    /// the config file was written.
    pub fn init(&self) -> Result<bool> {
        self.paths.ensure_dirs()?;
        if self.paths.memory_dir.join(CONFIG_FILE).exists() {
            return Ok(false);
        }
        self.config.save(&self.paths.memory_dir)?;
        info!(root = %self.paths.root.display(), "Store initialized");
        Ok(true)
    }

    pub fn observe(&self, observation: NewObservation) -> Result<String> {
        self.evidence.append(observation)
    }

    /// Issue a new outstanding compile request from recent evidence.
    pub fn prepare(&self, run_id: Option<&str>, limit: Option<usize>) -> Result<CompileRequest> {
        let _guard = self.apply_lock().acquire("compile prepare")?;
        RequestLedger::new(self.paths.clone()).prepare(
            &self.evidence,
            &self.config.policy,
            run_id,
            limit.unwrap_or(self.config.prepare.observation_limit),
        )
    }

    pub fn outstanding_request(&self) -> Result<Option<CompileRequest>> {
        RequestLedger::new(self.paths.clone()).outstanding()
    }

    /// Validate and apply a change batch under the apply lock.
    pub fn apply(&self, batch: &ChangeBatch) -> Result<ApplyResult> {
        self.apply_with(batch, None)
    }

    #[doc(hidden)]
    pub fn apply_with(&self, batch: &ChangeBatch, crash: Option<CrashPoint>) -> Result<ApplyResult> {
        let guard = self.apply_lock().acquire("compile apply")?;
        let writer = Writer::new(&self.paths).crash_at(crash);
        writer.recover(&guard)?;

        let manifest = Manifest::load(&self.paths)?;
        let outstanding = RequestLedger::new(self.paths.clone()).outstanding()?;
        let evidence_ids = self.evidence.available_ids()?;
        let ctx = ValidationContext {
            evidence: &evidence_ids,
            catalogue: &manifest,
            outstanding_request: outstanding.as_ref().map(|r| r.request_id.as_str()),
            last_applied_request: manifest.last_applied_request.as_deref(),
            policy: &self.config.policy,
        };

        let validated = validate(batch, &ctx).map_err(MemoryError::ValidationFailed)?;
        writer.apply(&validated, &guard)
    }

    /// Finish or undo an interrupted apply.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let guard = self.apply_lock().acquire("recover")?;
        Writer::new(&self.paths).recover(&guard)
    }

    /// Resolve with the configured candidate policy.
    pub fn resolve(&self, model_id: &str, fw_version: &str) -> Result<EffectiveFactSet> {
        self.resolve_with(model_id, fw_version, self.config.policy.include_candidates)
    }

    pub fn resolve_with(
        &self,
        model_id: &str,
        fw_version: &str,
        include_candidates: bool,
    ) -> Result<EffectiveFactSet> {
        Resolver::new(&self.paths, include_candidates).resolve(model_id, fw_version)
    }

    pub fn search(&self, model_id: &str, fw_version: &str) -> Result<Vec<IndexEntry>> {
        Resolver::new(&self.paths, true).search(model_id, fw_version)
    }

    /// A stored revision; the latest when `revision` is `None`.
    pub fn show(&self, rule_id: &str, revision: Option<u32>) -> Result<Rule> {
        let manifest = Manifest::load(&self.paths)?;
        let rule = manifest
            .rule(rule_id)
            .ok_or_else(|| MemoryError::UnknownRule(rule_id.to_string()))?;

        let reference = match revision {
            Some(rev) => rule.revision(rev),
            None => rule.latest(),
        }
        .ok_or_else(|| MemoryError::RevisionNotFound {
            rule_id: rule_id.to_string(),
            revision: revision.unwrap_or(0),
        })?;
        read_revision(&self.paths, &reference.path)
    }

    pub fn revisions(&self, rule_id: &str) -> Result<Vec<RevisionRef>> {
        let manifest = Manifest::load(&self.paths)?;
        manifest
            .rule(rule_id)
            .map(|r| r.revisions.clone())
            .ok_or_else(|| MemoryError::UnknownRule(rule_id.to_string()))
    }

    pub fn diff(&self, rule_id: &str, from: u32, to: u32) -> Result<RuleDiff> {
        let older = self.show(rule_id, Some(from))?;
        let newer = self.show(rule_id, Some(to))?;
        Ok(diff_revisions(&older, &newer))
    }

    /// The `limit` most recent events, oldest first.
    ///
    /// `run_id` narrows observations only; applies are store-wide.
    pub fn timeline(
        &self,
        model_id: Option<&str>,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TimelineEvent>> {
        let observations = match run_id {
            Some(run) => self.evidence.list_by_run(Some(run))?.collect::<Result<Vec<_>>>()?,
            None => self.evidence.list_all()?,
        };

        let mut events: Vec<TimelineEvent> = observations
            .into_iter()
            .filter(|o| model_id.is_none_or(|m| o.model_id == m))
            .map(TimelineEvent::Observation)
            .collect();
        let manifest = Manifest::load(&self.paths)?;
        events.extend(
            HistoryLog::new(&self.paths)
                .committed(manifest.generation)?
                .into_iter()
                .filter(|h| model_id.is_none_or(|m| h.touches_model(m)))
                .map(TimelineEvent::Apply),
        );

        events.sort_by_key(TimelineEvent::timestamp);
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    /// Force an index rebuild from tiered storage.
    pub fn reindex(&self) -> Result<RuleIndex> {
        let guard = self.apply_lock().acquire("reindex")?;
        Writer::new(&self.paths).recover(&guard)?;
        let manifest = Manifest::load(&self.paths)?;
        RuleIndex::rebuild(&self.paths, &manifest)
    }

    fn apply_lock(&self) -> StoreLock {
        StoreLock::new(self.paths.apply_lock(), &self.config.lock)
    }
}
