use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::Result;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `content` via temp file, fsync, and rename.
///
/// Readers observe either the old or the new file, never a torn write.
/// Temp files are named `.<name>.<seq>.<pid>.tmp`, unique per call so
/// threads of one process never share one.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        seq,
        std::process::id()
    ));

    let mut file = File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    sync_parent(path);

    debug!(path = %path.display(), "Atomic write completed");
    Ok(())
}

/// Write `content` to a path that must not exist yet.
pub fn write_new(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

/// Append one line and fsync before returning.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format!("{}\n", line).as_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// Read every parseable record of a JSONL file; missing file is empty.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid JSONL line"),
        }
    }
    Ok(rows)
}

/// Counts non-blank lines; a missing file counts as zero.
pub fn count_lines_in_file<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(path)?);

    let mut count = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        warn!(error = %e, dir = %parent.display(), "Failed to sync directory");
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
