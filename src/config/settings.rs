use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::rules::Tier;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub policy: PolicyConfig,
    pub lock: LockConfig,
    pub prepare: PrepareConfig,
}

impl MemoryConfig {
    pub fn load(memory_dir: &Path) -> Result<Self> {
        let config_path = memory_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, memory_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(memory_dir)?;
        let content =
            toml::to_string_pretty(self).map_err(|e| MemoryError::Config(e.to_string()))?;
        fs::write(memory_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.policy.min_confidence_profile) {
            errors.push("policy.min_confidence_profile must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.policy.min_confidence_override) {
            errors.push("policy.min_confidence_override must be between 0.0 and 1.0");
        }

        if self.lock.wait_ms == 0 {
            errors.push("lock.wait_ms must be greater than 0");
        }
        if self.lock.retry_delay_ms == 0 {
            errors.push("lock.retry_delay_ms must be greater than 0");
        }
        if self.lock.retry_delay_ms > self.lock.wait_ms {
            errors.push("lock.retry_delay_ms must not exceed lock.wait_ms");
        }
        if self.lock.stale_threshold_secs == 0 {
            errors.push("lock.stale_threshold_secs must be greater than 0");
        }

        if self.prepare.observation_limit == 0 {
            errors.push("prepare.observation_limit must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MemoryError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Admission policy for proposed rules and resolution scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Minimum confidence for the shared profile tier.
    pub min_confidence_profile: f64,
    /// Minimum confidence for the local override tier.
    pub min_confidence_override: f64,
    /// Let resolution consider candidate-tier rules.
    pub include_candidates: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_confidence_profile: 0.85,
            min_confidence_override: 0.80,
            include_candidates: false,
        }
    }
}

impl PolicyConfig {
    /// Confidence floor for `tier`; candidates have none.
    pub fn threshold(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Profile => Some(self.min_confidence_profile),
            Tier::Override => Some(self.min_confidence_override),
            Tier::Candidate => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Upper bound on waiting for the writer lock before `LockTimeout`.
    pub wait_ms: u64,
    /// Delay between acquisition attempts.
    pub retry_delay_ms: u64,
    /// Age after which a lock left by a live-looking owner is reclaimed.
    pub stale_threshold_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 5_000,
            retry_delay_ms: 100,
            stale_threshold_secs: 600,
        }
    }
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    /// Most recent observations copied into a compile request.
    pub observation_limit: usize,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            observation_limit: 200,
        }
    }
}

/// On-disk layout of a store root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub root: PathBuf,
    pub memory_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub candidates_dir: PathBuf,
    pub overrides_dir: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let memory_dir = root.join("data").join("memory");
        let spec_dir = root.join("spec").join("memory");

        Self {
            runs_dir: root.join("runs"),
            profiles_dir: spec_dir.join("profiles"),
            candidates_dir: spec_dir.join("candidates"),
            overrides_dir: memory_dir.join("overrides"),
            memory_dir,
            root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.memory_dir,
            &self.runs_dir,
            &self.profiles_dir,
            &self.candidates_dir,
            &self.overrides_dir,
        ];

        for dir in dirs {
            fs::create_dir_all(dir)?;
        }

        Ok(())
    }

    pub fn tier_dir(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Profile => &self.profiles_dir,
            Tier::Override => &self.overrides_dir,
            Tier::Candidate => &self.candidates_dir,
        }
    }

    /// Observation ledger for `run_id`, or the shared ledger for run-less evidence.
    pub fn observations_file(&self, run_id: Option<&str>) -> PathBuf {
        match run_id {
            Some(run) => self.runs_dir.join(run).join("observations.jsonl"),
            None => self.memory_dir.join("observations.jsonl"),
        }
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.memory_dir.join("manifest.json")
    }

    pub fn index_file(&self) -> PathBuf {
        self.memory_dir.join("index.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.memory_dir.join("history.jsonl")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.memory_dir.join("journal.json")
    }

    pub fn request_file(&self) -> PathBuf {
        self.memory_dir.join("compile_request.json")
    }

    pub fn apply_lock(&self) -> PathBuf {
        self.memory_dir.join("apply.lock")
    }

    pub fn evidence_lock(&self) -> PathBuf {
        self.memory_dir.join("evidence.lock")
    }

    /// Store-relative form of `path`, used in manifests and indexes.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
