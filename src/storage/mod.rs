//! Tiered rule storage.
//!
//! Layout under the store root:
//!
//! - `spec/memory/profiles/<model>/<rule>/<rev>.yaml` shared rules
//! - `data/memory/overrides/<model>/<rule>/<rev>.yaml` local rules
//! - `spec/memory/candidates/<model>/<rule>/<rev>.yaml` low-confidence rules
//! - `data/memory/manifest.json` committed catalogue (commit point)
//! - `data/memory/journal.json` in-flight apply, if any
//! - `data/memory/history.jsonl` one entry per apply
//! - `data/memory/index.json` rebuildable lookup cache

mod diff;
mod history;
mod index;
mod journal;
mod manifest;
mod revisions;
mod writer;

pub use diff::{FactChange, FactValue, FieldChange, RuleDiff, diff_revisions};
pub use history::{ChangeRecord, HistoryEntry, HistoryLog};
pub use index::{IndexEntry, RuleIndex};
pub use journal::Journal;
pub use manifest::{Manifest, ManifestRule, RevisionRef};
pub use revisions::{read_revision, revision_path};
pub use writer::{ApplyResult, CrashPoint, RecoveryOutcome, Writer};
