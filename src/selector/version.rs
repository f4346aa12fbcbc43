use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

static VERSION_PATTERN: OnceLock<Regex> = OnceLock::new();

/// First run of up to three dot-separated numeric components.
fn version_pattern() -> &'static Regex {
    VERSION_PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("version pattern is a valid regex")
    })
}

/// Firmware version as `major.minor.patch`, ordered component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the first numeric version found in `text`; missing components are 0.
    ///
    /// `"1.2"` is `1.2.0`, `"v3.1.4-rc2"` is `3.1.4`.
    pub fn parse(text: &str) -> Result<Self> {
        let caps = version_pattern()
            .captures(text.trim())
            .ok_or_else(|| MemoryError::InvalidVersion(text.to_string()))?;

        let component = |idx: usize| -> Result<u64> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| MemoryError::InvalidVersion(text.to_string())),
                None => Ok(0),
            }
        };

        Ok(Self::new(component(1)?, component(2)?, component(3)?))
    }

    pub fn components(&self) -> [u64; 3] {
        [self.major, self.minor, self.patch]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for Version {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
