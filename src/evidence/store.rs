use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::observation::{NewObservation, Observation};
use crate::config::{LockConfig, StorePaths};
use crate::error::{MemoryError, Result};
use crate::lock::StoreLock;
use crate::rules::is_valid_identifier;
use crate::selector::Version;
use crate::utils::{append_line, count_lines_in_file, read_jsonl};

/// Run used for evidence recorded without one.
pub const DEFAULT_RUN: &str = "default";

/// Existence check used by provenance validation.
pub trait ObservationLookup {
    fn contains(&self, id: &str) -> bool;
}

impl ObservationLookup for HashSet<String> {
    fn contains(&self, id: &str) -> bool {
        HashSet::contains(self, id)
    }
}

/// Append-only observation ledgers under one store root.
pub struct EvidenceStore {
    paths: StorePaths,
    lock: StoreLock,
}

impl EvidenceStore {
    pub fn new(paths: StorePaths, lock_config: &LockConfig) -> Self {
        let lock = StoreLock::new(paths.evidence_lock(), lock_config);
        Self { paths, lock }
    }

    /// Durably append one observation and return its id.
    ///
    /// Generated ids are `<run>-<seq>` with a per-run counter. An explicit id
    /// that is already present fails with `DuplicateId`.
    pub fn append(&self, new: NewObservation) -> Result<String> {
        Self::check(&new)?;
        let _guard = self.lock.acquire("observe")?;

        let ledger = self.paths.observations_file(new.run_id.as_deref());
        let id = match &new.id {
            Some(explicit) => {
                if self.exists(explicit)? {
                    return Err(MemoryError::DuplicateId(explicit.clone()));
                }
                explicit.clone()
            }
            None => self.next_id(new.run_id.as_deref(), &ledger)?,
        };

        let observation = new.into_observation(id.clone(), Utc::now());
        append_line(&ledger, &serde_json::to_string(&observation)?)?;

        info!(
            id = %id,
            model = %observation.model_id,
            fw = %observation.fw_version,
            source = %observation.source,
            "Observation recorded"
        );
        Ok(id)
    }

    fn check(new: &NewObservation) -> Result<()> {
        if new.model_id.trim().is_empty() {
            return Err(MemoryError::InvalidObservation("model_id is empty".into()));
        }
        if new.content.trim().is_empty() {
            return Err(MemoryError::InvalidObservation("content is empty".into()));
        }
        Version::parse(&new.fw_version)?;

        if let Some(run) = &new.run_id
            && !is_valid_identifier(run)
        {
            return Err(MemoryError::InvalidObservation(format!(
                "run id '{}' must use letters, digits, '-', '_' or '.'",
                run
            )));
        }
        if let Some(id) = &new.id
            && id.trim().is_empty()
        {
            return Err(MemoryError::InvalidObservation("explicit id is empty".into()));
        }
        Ok(())
    }

    fn next_id(&self, run_id: Option<&str>, ledger: &Path) -> Result<String> {
        let run = run_id.unwrap_or(DEFAULT_RUN);
        let known = self.available_ids()?;
        let mut seq = count_lines_in_file(ledger)? + 1;
        loop {
            let candidate = format!("{}-{:06}", run, seq);
            if !known.contains(&candidate) {
                return Ok(candidate);
            }
            debug!(id = %candidate, "Generated id already taken, advancing");
            seq += 1;
        }
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        for ledger in self.ledgers()? {
            for observation in ObservationStream::open(&ledger)? {
                if observation?.id == id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Lazy, replayable stream over one run's ledger in append order.
    ///
    /// `None` streams the ledger of run-less observations.
    pub fn list_by_run(&self, run_id: Option<&str>) -> Result<ObservationStream> {
        if let Some(run) = run_id
            && !is_valid_identifier(run)
        {
            return Err(MemoryError::InvalidObservation(format!("invalid run id '{}'", run)));
        }
        ObservationStream::open(&self.paths.observations_file(run_id))
    }

    /// Every observation, run-less ledger first, then runs by name.
    pub fn list_all(&self) -> Result<Vec<Observation>> {
        let mut all = Vec::new();
        for ledger in self.ledgers()? {
            all.extend(read_jsonl::<Observation>(&ledger)?);
        }
        Ok(all)
    }

    /// The `limit` most recent observations, oldest first.
    ///
    /// With a run, only that run and the run-less ledger are considered.
    pub fn latest(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<Observation>> {
        let mut observations = match run_id {
            Some(run) => {
                let mut rows: Vec<Observation> = self.list_by_run(Some(run))?.collect::<Result<_>>()?;
                rows.extend(self.list_by_run(None)?.collect::<Result<Vec<_>>>()?);
                rows
            }
            None => self.list_all()?,
        };

        observations.sort_by_key(|o| o.created_at);
        let skip = observations.len().saturating_sub(limit.max(1));
        Ok(observations.split_off(skip))
    }

    /// Snapshot of every known observation id.
    pub fn available_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for ledger in self.ledgers()? {
            for observation in ObservationStream::open(&ledger)? {
                ids.insert(observation?.id);
            }
        }
        Ok(ids)
    }

    fn ledgers(&self) -> Result<Vec<PathBuf>> {
        let mut ledgers = vec![self.paths.observations_file(None)];
        if !self.paths.runs_dir.exists() {
            return Ok(ledgers);
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&self.paths.runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("observations.jsonl"))
            .filter(|p| p.is_file())
            .collect();
        runs.sort();
        ledgers.extend(runs);
        Ok(ledgers)
    }
}

/// Iterator over one JSONL ledger. Malformed lines are skipped with a warning.
pub struct ObservationStream {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
}

impl ObservationStream {
    fn open(path: &Path) -> Result<Self> {
        let lines = match File::open(path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }
}

impl Iterator for ObservationStream {
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Observation>(&line) {
                Ok(observation) => return Some(Ok(observation)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping invalid observation line");
                }
            }
        }
    }
}
