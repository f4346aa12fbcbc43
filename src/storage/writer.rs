use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::{ChangeRecord, HistoryEntry, HistoryLog};
use super::index::RuleIndex;
use super::journal::Journal;
use super::manifest::{Manifest, ManifestRule, RevisionRef};
use super::revisions::{read_revision, render_revision, revision_path};
use crate::config::StorePaths;
use crate::error::{MemoryError, Result};
use crate::lock::{LockGuard, is_process_running};
use crate::request::RequestLedger;
use crate::rules::{Rule, RuleAction};
use crate::utils::write_new;
use crate::validate::{Change, Downgrade, RuleContent, ValidatedBatch, Violation};

/// Points at which an apply can be stopped as if the process died.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    AfterJournal,
    AfterRuleWrites,
    AfterHistory,
    AfterCommit,
}

impl fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AfterJournal => "after journal",
            Self::AfterRuleWrites => "after rule writes",
            Self::AfterHistory => "after history append",
            Self::AfterCommit => "after commit",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyResult {
    pub request_id: String,
    pub generation: u64,
    pub changes: Vec<ChangeRecord>,
    pub downgrades: Vec<Downgrade>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Clean,
    RolledBack { generation: u64, files: usize },
    RolledForward { generation: u64 },
    Discarded { generation: u64 },
}

struct Planned {
    index: usize,
    rule: Rule,
    path: PathBuf,
    relative: PathBuf,
}

/// Applies validated batches to tiered storage.
///
/// Every method expects the caller to hold the store's apply lock and takes
/// the guard as proof.
pub struct Writer<'a> {
    paths: &'a StorePaths,
    crash_point: Option<CrashPoint>,
}

impl<'a> Writer<'a> {
    pub fn new(paths: &'a StorePaths) -> Self {
        Self {
            paths,
            crash_point: None,
        }
    }

    #[doc(hidden)]
    pub fn crash_at(mut self, point: Option<CrashPoint>) -> Self {
        self.crash_point = point;
        self
    }

    /// Apply a batch as one unit.
    ///
    /// Revision files and the history entry are written first, then the
    /// manifest is replaced atomically. Nothing is visible to readers before
    /// that rename; a failure before it removes every file written so far and
    /// drops the history entry.
    pub fn apply(&self, batch: &ValidatedBatch, guard: &LockGuard) -> Result<ApplyResult> {
        self.recover(guard)?;

        let manifest = Manifest::load(self.paths)?;
        if manifest.last_applied_request.as_deref() == Some(batch.request_id.as_str()) {
            return Err(MemoryError::ValidationFailed(vec![Violation::StaleRequest {
                request_id: batch.request_id.clone(),
                reason: "request was already applied".into(),
            }]));
        }

        let now = Utc::now();
        let planned = self.plan(batch, &manifest, now)?;
        let next = next_manifest(&manifest, &planned, &batch.request_id, now);
        let entry = history_entry(batch, &planned, next.generation, now);

        let journal = Journal {
            generation: next.generation,
            request_id: batch.request_id.clone(),
            started_at: now,
            files: planned.iter().map(|p| p.relative.clone()).collect(),
            entry,
        };
        journal.save(self.paths)?;
        debug!(generation = journal.generation, files = journal.files.len(), "Journal written");
        self.checkpoint(CrashPoint::AfterJournal)?;

        if let Err(e) = self.write_revisions(&planned) {
            self.rollback(&journal);
            return Err(e);
        }
        self.checkpoint(CrashPoint::AfterRuleWrites)?;

        if let Err(e) = HistoryLog::new(self.paths).append(&journal.entry) {
            self.rollback(&journal);
            return Err(e);
        }
        self.checkpoint(CrashPoint::AfterHistory)?;

        if let Err(e) = next.publish(self.paths) {
            self.rollback(&journal);
            return Err(e);
        }
        info!(
            request_id = %batch.request_id,
            generation = next.generation,
            changes = planned.len(),
            "Batch committed"
        );
        self.checkpoint(CrashPoint::AfterCommit)?;

        self.finish(&journal, &next)?;

        Ok(ApplyResult {
            request_id: batch.request_id.clone(),
            generation: next.generation,
            changes: journal.entry.changes.clone(),
            downgrades: journal.entry.downgrades.clone(),
        })
    }

    /// Complete or undo an apply interrupted by a crash.
    ///
    /// A journal newer than the manifest never committed and is rolled back.
    /// A journal matching the manifest committed and is rolled forward.
    pub fn recover(&self, _guard: &LockGuard) -> Result<RecoveryOutcome> {
        self.remove_interrupted_writes();

        let manifest = Manifest::load(self.paths)?;
        let Some(journal) = Journal::load(self.paths)? else {
            // A lost journal can still leave its history entry behind.
            HistoryLog::new(self.paths).discard_uncommitted(manifest.generation)?;
            return Ok(RecoveryOutcome::Clean);
        };

        if journal.generation > manifest.generation {
            warn!(
                generation = journal.generation,
                request_id = %journal.request_id,
                "Rolling back uncommitted apply"
            );
            self.rollback(&journal);
            Ok(RecoveryOutcome::RolledBack {
                generation: journal.generation,
                files: journal.files.len(),
            })
        } else if journal.generation == manifest.generation {
            warn!(
                generation = journal.generation,
                request_id = %journal.request_id,
                "Rolling forward committed apply"
            );
            self.finish(&journal, &manifest)?;
            Ok(RecoveryOutcome::RolledForward {
                generation: journal.generation,
            })
        } else {
            warn!(generation = journal.generation, "Discarding outdated journal");
            Journal::remove(self.paths)?;
            Ok(RecoveryOutcome::Discarded {
                generation: journal.generation,
            })
        }
    }

    fn plan(&self, batch: &ValidatedBatch, manifest: &Manifest, now: DateTime<Utc>) -> Result<Vec<Planned>> {
        let mut planned = Vec::with_capacity(batch.upserts.len());

        for upsert in &batch.upserts {
            let rule = match &upsert.change {
                Change::Create { rule_id, content } => {
                    let rule_id = rule_id
                        .clone()
                        .unwrap_or_else(|| format!("r-{}", Uuid::new_v4().simple()));
                    if manifest.rule(&rule_id).is_some() {
                        return Err(MemoryError::DuplicateId(rule_id));
                    }
                    revision_from(content, rule_id, 1, now, now, &batch.request_id)
                }
                Change::Update { rule_id, content } => {
                    let previous = self.current(manifest, rule_id)?;
                    revision_from(
                        content,
                        rule_id.clone(),
                        previous.revision + 1,
                        previous.created_at,
                        now,
                        &batch.request_id,
                    )
                }
                Change::Delete { rule_id, provenance } => {
                    let previous = self.current(manifest, rule_id)?;
                    Rule {
                        revision: previous.revision + 1,
                        updated_at: now,
                        deleted: true,
                        provenance: if provenance.is_empty() {
                            previous.provenance.clone()
                        } else {
                            provenance.clone()
                        },
                        request_id: batch.request_id.clone(),
                        ..previous
                    }
                }
            };

            let path = revision_path(self.paths, rule.tier, &rule.model_id, &rule.rule_id, rule.revision);
            planned.push(Planned {
                index: upsert.index,
                relative: self.paths.relative(&path),
                path,
                rule,
            });
        }
        Ok(planned)
    }

    fn current(&self, manifest: &Manifest, rule_id: &str) -> Result<Rule> {
        let latest = manifest
            .rule(rule_id)
            .filter(|r| !r.is_deleted())
            .and_then(ManifestRule::latest)
            .ok_or_else(|| MemoryError::UnknownRule(rule_id.to_string()))?;
        read_revision(self.paths, &latest.path)
    }

    fn write_revisions(&self, planned: &[Planned]) -> Result<()> {
        for item in planned {
            if item.path.exists() {
                // Left by an apply that never committed; no manifest references it.
                warn!(path = %item.relative.display(), "Replacing orphaned revision file");
                fs::remove_file(&item.path)?;
            }
            write_new(&item.path, render_revision(&item.rule)?.as_bytes())?;
            debug!(
                rule_id = %item.rule.rule_id,
                revision = item.rule.revision,
                tier = %item.rule.tier,
                "Revision written"
            );
        }
        Ok(())
    }

    /// Post-commit steps. Safe to repeat.
    fn finish(&self, journal: &Journal, manifest: &Manifest) -> Result<()> {
        let history = HistoryLog::new(self.paths);
        if !history.contains_generation(journal.generation)? {
            warn!(generation = journal.generation, "History entry missing after commit, restoring");
            history.append(&journal.entry)?;
        }

        RuleIndex::rebuild(self.paths, manifest)?;
        RequestLedger::new(self.paths.clone()).consume(&journal.request_id)?;
        Journal::remove(self.paths)?;
        Ok(())
    }

    fn rollback(&self, journal: &Journal) {
        for relative in &journal.files {
            let path = self.paths.root.join(relative);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %relative.display(), "Removed uncommitted revision"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %relative.display(), error = %e, "Failed to remove uncommitted revision"),
            }
            remove_empty_parents(&path);
        }
        let committed = journal.generation.saturating_sub(1);
        if let Err(e) = HistoryLog::new(self.paths).discard_uncommitted(committed) {
            warn!(error = %e, "Failed to drop uncommitted history entry");
        }
        if let Err(e) = Journal::remove(self.paths) {
            warn!(error = %e, "Failed to remove journal after rollback");
        }
        info!(generation = journal.generation, "Uncommitted apply rolled back");
    }

    fn checkpoint(&self, point: CrashPoint) -> Result<()> {
        if self.crash_point == Some(point) {
            warn!(point = %point, "Simulated crash");
            return Err(MemoryError::Aborted(point.to_string()));
        }
        Ok(())
    }

    /// Remove temp files of atomic writes whose writer process is gone.
    fn remove_interrupted_writes(&self) {
        let Ok(entries) = fs::read_dir(&self.paths.memory_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(pid) = temp_file_owner(&name) else {
                continue;
            };
            if is_process_running(pid) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => info!(file = %name, "Removed interrupted write"),
                Err(e) => warn!(file = %name, error = %e, "Failed to remove interrupted write"),
            }
        }
    }
}

fn revision_from(
    content: &RuleContent,
    rule_id: String,
    revision: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    request_id: &str,
) -> Rule {
    Rule {
        rule_id,
        revision,
        model_id: content.model_id.clone(),
        tier: content.tier,
        fw_selector: content.fw_selector.clone(),
        priority: content.priority,
        confidence: content.confidence,
        facts: content.facts.clone(),
        provenance: content.provenance.clone(),
        created_at,
        updated_at,
        deleted: false,
        request_id: request_id.to_string(),
    }
}

fn next_manifest(current: &Manifest, planned: &[Planned], request_id: &str, now: DateTime<Utc>) -> Manifest {
    let mut next = current.clone();
    next.generation += 1;
    next.last_applied_request = Some(request_id.to_string());

    for item in planned {
        let reference = RevisionRef {
            revision: item.rule.revision,
            tier: item.rule.tier,
            action: action_of(&item.rule),
            path: item.relative.clone(),
            recorded_at: now,
        };
        next.rules
            .entry(item.rule.rule_id.clone())
            .or_insert_with(|| ManifestRule {
                model_id: item.rule.model_id.clone(),
                revisions: Vec::new(),
            })
            .revisions
            .push(reference);
    }
    next
}

fn action_of(rule: &Rule) -> RuleAction {
    if rule.deleted {
        RuleAction::Delete
    } else if rule.revision == 1 {
        RuleAction::Create
    } else {
        RuleAction::Update
    }
}

fn history_entry(batch: &ValidatedBatch, planned: &[Planned], generation: u64, now: DateTime<Utc>) -> HistoryEntry {
    let changes = planned
        .iter()
        .map(|p| ChangeRecord {
            rule_id: p.rule.rule_id.clone(),
            revision: p.rule.revision,
            tier: p.rule.tier,
            action: action_of(&p.rule),
            model_id: p.rule.model_id.clone(),
        })
        .collect();

    let downgrades = batch
        .downgrades
        .iter()
        .map(|d| {
            let mut d = d.clone();
            if d.rule_id.is_none() {
                d.rule_id = planned
                    .iter()
                    .find(|p| p.index == d.index)
                    .map(|p| p.rule.rule_id.clone());
            }
            d
        })
        .collect();

    HistoryEntry {
        generation,
        request_id: batch.request_id.clone(),
        applied_at: now,
        changes,
        downgrades,
    }
}

/// Pid embedded in `.<name>[.<seq>].<pid>.tmp`.
fn temp_file_owner(name: &str) -> Option<u32> {
    let stem = name.strip_prefix('.')?.strip_suffix(".tmp")?;
    stem.rsplit_once('.')?.1.parse().ok()
}

/// Drop the rule and model directories a rollback left empty.
fn remove_empty_parents(file: &Path) {
    for dir in file.ancestors().skip(1).take(2) {
        if fs::remove_dir(dir).is_err() {
            break;
        }
    }
}
