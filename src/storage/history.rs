use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StorePaths;
use crate::error::Result;
use crate::rules::{RuleAction, Tier};
use crate::utils::{append_line, read_jsonl, write_atomic};
use crate::validate::Downgrade;

/// Audit record of one apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub generation: u64,
    pub request_id: String,
    pub applied_at: DateTime<Utc>,
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downgrades: Vec<Downgrade>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub rule_id: String,
    pub revision: u32,
    pub tier: Tier,
    pub action: RuleAction,
    pub model_id: String,
}

impl HistoryEntry {
    pub fn touches_model(&self, model_id: &str) -> bool {
        self.changes.iter().any(|c| c.model_id == model_id)
    }
}

/// Append-only `history.jsonl`.
///
/// An apply appends its entry before the manifest commit, so the log can
/// end with entries newer than the committed generation. Readers go through
/// [`HistoryLog::committed`]; recovery drops the leftovers.
pub struct HistoryLog<'a> {
    paths: &'a StorePaths,
}

impl<'a> HistoryLog<'a> {
    pub fn new(paths: &'a StorePaths) -> Self {
        Self { paths }
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        append_line(&self.paths.history_file(), &serde_json::to_string(entry)?)
    }

    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        read_jsonl(&self.paths.history_file())
    }

    /// Entries up to and including the committed `generation`.
    pub fn committed(&self, generation: u64) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.entries()?;
        entries.retain(|e| e.generation <= generation);
        Ok(entries)
    }

    pub fn contains_generation(&self, generation: u64) -> Result<bool> {
        Ok(self.entries()?.iter().any(|e| e.generation == generation))
    }

    /// Rewrite the log without entries above `committed`. Returns how many
    /// were dropped. Caller holds the apply lock.
    pub fn discard_uncommitted(&self, committed: u64) -> Result<usize> {
        let path = self.paths.history_file();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut kept = String::with_capacity(content.len());
        let mut dropped = 0;
        for line in content.lines() {
            let uncommitted = serde_json::from_str::<HistoryEntry>(line)
                .is_ok_and(|e| e.generation > committed);
            if uncommitted {
                dropped += 1;
            } else if !line.trim().is_empty() {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if dropped > 0 {
            if kept.is_empty() {
                fs::remove_file(&path)?;
            } else {
                write_atomic(&path, kept.as_bytes())?;
            }
            warn!(dropped, committed, "Dropped uncommitted history entries");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let log = HistoryLog::new(&paths);

        let entry = HistoryEntry {
            generation: 1,
            request_id: "q1".into(),
            applied_at: Utc::now(),
            changes: vec![ChangeRecord {
                rule_id: "r-1".into(),
                revision: 1,
                tier: Tier::Override,
                action: RuleAction::Create,
                model_id: "X".into(),
            }],
            downgrades: Vec::new(),
        };
        log.append(&entry).unwrap();

        assert_eq!(log.entries().unwrap(), vec![entry.clone()]);
        assert!(log.contains_generation(1).unwrap());
        assert!(!log.contains_generation(2).unwrap());
        assert!(entry.touches_model("X"));

        let line = std::fs::read_to_string(paths.history_file()).unwrap();
        assert!(!line.contains("downgrades"));
    }

    #[test]
    fn test_uncommitted_entries_hidden_then_dropped() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let log = HistoryLog::new(&paths);

        for generation in 1..=3 {
            log.append(&HistoryEntry {
                generation,
                request_id: format!("q{}", generation),
                applied_at: Utc::now(),
                changes: Vec::new(),
                downgrades: Vec::new(),
            })
            .unwrap();
        }

        let visible = log.committed(2).unwrap();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[1].request_id, "q2");

        assert_eq!(log.discard_uncommitted(2).unwrap(), 1);
        assert_eq!(log.entries().unwrap().len(), 2);
        assert!(!log.contains_generation(3).unwrap());
        assert_eq!(log.discard_uncommitted(2).unwrap(), 0);
    }
}
