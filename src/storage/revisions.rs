use std::fs;
use std::path::{Path, PathBuf};

use crate::config::StorePaths;
use crate::error::{Result, corruption_with};
use crate::rules::{Rule, Tier};

/// `<tier_dir>/<model>/<rule>/<revision>.yaml`
pub fn revision_path(
    paths: &StorePaths,
    tier: Tier,
    model_id: &str,
    rule_id: &str,
    revision: u32,
) -> PathBuf {
    paths
        .tier_dir(tier)
        .join(model_id)
        .join(rule_id)
        .join(format!("{}.yaml", revision))
}

/// Read a committed revision by its store-relative path.
///
/// A committed file that is missing or unparseable is storage corruption.
pub fn read_revision(paths: &StorePaths, relative: &Path) -> Result<Rule> {
    let path = paths.root.join(relative);
    let content = fs::read_to_string(&path)
        .map_err(|e| corruption_with(&format!("revision {}", relative.display()), e))?;
    serde_yaml_bw::from_str(&content)
        .map_err(|e| corruption_with(&format!("revision {}", relative.display()), e))
}

pub fn render_revision(rule: &Rule) -> Result<String> {
    Ok(serde_yaml_bw::to_string(rule)?)
}
