//! Exclusive store lock with bounded wait.
//!
//! The lock is a file created with `create_new`, holding the owner's pid,
//! hostname, and start time. Locks left by a dead process, or older than the
//! stale threshold, are reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{MemoryError, Result};

fn get_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub hostname: String,
    pub purpose: String,
}

impl LockInfo {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            hostname: get_hostname(),
            purpose: purpose.into(),
        }
    }

    pub fn is_process_alive(&self) -> bool {
        if self.hostname != get_hostname() {
            // Cannot probe a remote pid; rely on the age check only.
            return true;
        }
        is_process_running(self.pid)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        elapsed.to_std().map(|d| d > threshold).unwrap_or(true)
    }

    pub fn is_valid(&self, threshold: Duration) -> bool {
        self.is_process_alive() && !self.is_stale(threshold)
    }
}

#[cfg(unix)]
pub(crate) fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and negative values address process groups, not a process.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn is_process_running(_pid: u32) -> bool {
    true
}

pub struct StoreLock {
    path: PathBuf,
    wait: Duration,
    retry_delay: Duration,
    stale_threshold: Duration,
}

impl StoreLock {
    pub fn new(path: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            path: path.into(),
            wait: config.wait(),
            retry_delay: config.retry_delay(),
            stale_threshold: config.stale_threshold(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting at most the configured bound.
    ///
    /// Fails with `LockTimeout` instead of retrying past the deadline.
    pub fn acquire(&self, purpose: &str) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(purpose)? {
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= self.wait {
                warn!(path = %self.path.display(), waited_ms = waited.as_millis() as u64, "Lock wait exceeded");
                return Err(MemoryError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            std::thread::sleep(self.retry_delay.min(self.wait - waited));
        }
    }

    fn try_acquire(&self, purpose: &str) -> Result<Option<LockGuard>> {
        let info = LockInfo::new(purpose);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let content = serde_yaml_bw::to_string(&info)?;
                file.write_all(content.as_bytes())?;
                file.sync_all()?;
                debug!(path = %self.path.display(), pid = info.pid, purpose, "Lock acquired");
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.reclaim_if_stale()? {
                    return self.try_acquire(purpose);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reclaim_if_stale(&self) -> Result<bool> {
        let stale = match self.read()? {
            Some(existing) => {
                let stale = !existing.is_valid(self.stale_threshold);
                if stale {
                    info!(path = %self.path.display(), old_pid = existing.pid, "Removing stale lock");
                }
                stale
            }
            // Half-written lock: only reclaim once it is older than the threshold.
            None => self.lock_age().is_some_and(|age| age > self.stale_threshold),
        };

        if stale {
            match fs::remove_file(&self.path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(stale)
    }

    /// Current holder, if the lock file exists and is readable.
    pub fn read(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_yaml_bw::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_age(&self) -> Option<Duration> {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
    }
}

/// Held lock; removing the file on drop releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!(path = %self.path.display(), "Lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release lock"),
        }
    }
}
