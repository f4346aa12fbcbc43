use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::validate::Violation;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid version '{0}': no numeric component")]
    InvalidVersion(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Batch rejected with {} violation(s):\n  - {}", .0.len(), format_violations(.0))]
    ValidationFailed(Vec<Violation>),

    #[error("Ambiguous resolution for '{key_path}': rules {} tie on every precedence key", .rule_ids.join(", "))]
    AmbiguousResolution {
        key_path: String,
        rule_ids: Vec<String>,
    },

    #[error("Timed out after {}ms waiting for store lock {}", .waited.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Rule not found: {0}")]
    UnknownRule(String),

    #[error("Revision {revision} not found for rule {rule_id}")]
    RevisionNotFound { rule_id: String, revision: u32 },

    #[error("Apply aborted at {0}")]
    Aborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MemoryError {
    /// Violations carried by a rejected batch, empty for every other error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::ValidationFailed(violations) => violations,
            _ => &[],
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  - ")
}

pub type Result<T> = std::result::Result<T, MemoryError>;

pub(crate) fn corruption_with<E: std::fmt::Display>(context: &str, err: E) -> MemoryError {
    MemoryError::StorageCorruption(format!("{}: {}", context, err))
}
