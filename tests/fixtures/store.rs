//! Temporary store roots with helpers for the prepare/apply cycle.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use embedded_memory::config::{MemoryConfig, StorePaths};
use embedded_memory::evidence::{NewObservation, SourceKind};
use embedded_memory::storage::CrashPoint;
use embedded_memory::{ApplyResult, ChangeBatch, MemoryStore, Result, RuleUpsert, Tier};

pub struct TestStore {
    pub store: MemoryStore,
    dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Store whose config is adjusted before it is written to disk.
    pub fn with_config(adjust: impl FnOnce(&mut MemoryConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = MemoryConfig::default();
        config.lock.wait_ms = 300;
        config.lock.retry_delay_ms = 20;
        adjust(&mut config);

        let store = MemoryStore::with_config(StorePaths::new(dir.path()), config);
        store.init().unwrap();
        Self { store, dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> &StorePaths {
        self.store.paths()
    }

    pub fn observe(&self, model_id: &str, fw_version: &str, content: &str) -> String {
        self.store
            .observe(NewObservation::new(
                model_id,
                fw_version,
                SourceKind::Chat,
                content,
            ))
            .unwrap()
    }

    /// Issue a fresh request and return its id.
    pub fn prepare(&self) -> String {
        self.store.prepare(None, None).unwrap().request_id
    }

    /// Batch for the outstanding request with a matching provenance summary.
    pub fn batch(&self, request_id: &str, upserts: Vec<RuleUpsert>) -> ChangeBatch {
        upserts
            .into_iter()
            .fold(ChangeBatch::new(request_id), ChangeBatch::with_upsert)
            .summarized()
    }

    /// Prepare, then apply `upserts` as one batch.
    pub fn apply(&self, upserts: Vec<RuleUpsert>) -> Result<ApplyResult> {
        let request_id = self.prepare();
        self.store.apply(&self.batch(&request_id, upserts))
    }

    pub fn apply_crashing(&self, upserts: Vec<RuleUpsert>, point: CrashPoint) -> Result<ApplyResult> {
        let request_id = self.prepare();
        self.store
            .apply_with(&self.batch(&request_id, upserts), Some(point))
    }

    /// Bytes of every committed metadata file plus the revision tree listing.
    pub fn snapshot(&self) -> Snapshot {
        let paths = self.paths();
        Snapshot {
            manifest: fs::read(paths.manifest_file()).ok(),
            index: fs::read(paths.index_file()).ok(),
            history: fs::read(paths.history_file()).ok(),
            revision_files: self.revision_files(),
        }
    }

    /// Every file under the three tier directories, sorted.
    pub fn revision_files(&self) -> Vec<PathBuf> {
        let paths = self.paths();
        let mut files = Vec::new();
        for tier in Tier::ALL {
            collect_files(paths.tier_dir(tier), &mut files);
        }
        files.sort();
        files
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub manifest: Option<Vec<u8>>,
    pub index: Option<Vec<u8>>,
    pub history: Option<Vec<u8>>,
    pub revision_files: Vec<PathBuf>,
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// Create upsert for `transport.baud` with provenance.
pub fn baud_rule(tier: Tier, selector: &str, baud: u64, observation: &str) -> RuleUpsert {
    RuleUpsert::create(
        tier,
        "X",
        selector,
        serde_json::json!({ "transport": { "baud": baud } }),
    )
    .with_provenance([observation])
}
