use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::history::HistoryEntry;
use crate::config::StorePaths;
use crate::error::Result;
use crate::utils::write_atomic;

/// Write-ahead record of an apply in flight.
///
/// Present on disk from before the first revision file is written until the
/// apply has fully finished. Its generation decides the recovery direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub generation: u64,
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    /// Store-relative revision files this apply creates.
    pub files: Vec<PathBuf>,
    pub entry: HistoryEntry,
}

impl Journal {
    pub fn load(paths: &StorePaths) -> Result<Option<Self>> {
        let path = paths.journal_file();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(journal) => Ok(Some(journal)),
            Err(e) => {
                // Nothing it names can be committed; orphaned files are replaced on the next apply.
                warn!(path = %path.display(), error = %e, "Discarding unreadable journal");
                Self::remove(paths)?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        write_atomic(
            &paths.journal_file(),
            serde_json::to_string_pretty(self)?.as_bytes(),
        )
    }

    pub fn remove(paths: &StorePaths) -> Result<()> {
        match fs::remove_file(paths.journal_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
