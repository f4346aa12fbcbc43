//! Configuration types and loading.
//!
//! - `MemoryConfig`: top-level configuration loaded from `data/memory/config.toml`
//! - `PolicyConfig`, `LockConfig`, `PrepareConfig`: per-concern sections
//! - `StorePaths`: on-disk layout derived from the store root

mod settings;

pub use settings::{
    CONFIG_FILE, LockConfig, MemoryConfig, PolicyConfig, PrepareConfig, StorePaths,
};
