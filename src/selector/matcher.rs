use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::Version;
use crate::error::{MemoryError, Result};

/// Firmware applicability range of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    Exact(Version),
    /// Leading components that must match; `*` alone has none.
    Wildcard(Vec<u64>),
    /// Half-open `[low, high)`.
    Interval { low: Version, high: Version },
}

impl Selector {
    /// Parses `1.2.3`, `1.2.*`, `*`, `[1.2.0, 1.3.0)`, `1.2.0..1.3.0`,
    /// `1.2.0–1.3.0` or `>=1.2.0 <1.3.0`.
    pub fn parse(text: &str) -> Result<Self> {
        let expr = text.trim();
        if expr.is_empty() {
            return Err(invalid(text, "empty selector"));
        }

        if expr.contains('*') {
            return Self::parse_wildcard(text, expr);
        }

        if let Some((low, high)) = split_interval(expr) {
            let low = strict_version(text, low)?;
            let high = strict_version(text, high)?;
            if low >= high {
                return Err(invalid(
                    text,
                    format!("interval low {} must be below high {}", low, high),
                ));
            }
            return Ok(Self::Interval { low, high });
        }

        if expr.starts_with(['<', '>']) {
            return Err(invalid(
                text,
                "comparator ranges must be written as '>=low <high'",
            ));
        }

        Ok(Self::Exact(strict_version(text, expr)?))
    }

    fn parse_wildcard(text: &str, expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split('.').collect();
        let star_at = parts
            .iter()
            .position(|p| *p == "*")
            .ok_or_else(|| invalid(text, "'*' must be a whole component"))?;

        if star_at != parts.len() - 1 {
            return Err(invalid(text, "'*' must be the trailing component"));
        }
        if star_at > 3 {
            return Err(invalid(text, "at most three fixed components"));
        }

        let fixed = parts[..star_at]
            .iter()
            .map(|p| numeric_component(text, p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::Wildcard(fixed))
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Exact(exact) => exact == version,
            Self::Wildcard(fixed) => fixed
                .iter()
                .zip(version.components())
                .all(|(want, have)| *want == have),
            Self::Interval { low, high } => low <= version && version < high,
        }
    }

    pub fn specificity(&self) -> Specificity {
        match self {
            Self::Exact(_) => Specificity::Exact,
            Self::Wildcard(fixed) => Specificity::Wildcard {
                fixed: fixed.len() as u8,
            },
            Self::Interval { low, high } => Specificity::Interval {
                span: [
                    i128::from(high.major) - i128::from(low.major),
                    i128::from(high.minor) - i128::from(low.minor),
                    i128::from(high.patch) - i128::from(low.patch),
                ],
            },
        }
    }
}

/// Convenience wrapper over [`Selector::parse`] and [`Version::parse`].
pub fn matches(selector: &str, version: &str) -> Result<bool> {
    let selector = Selector::parse(selector)?;
    let version = Version::parse(version)?;
    Ok(selector.matches(&version))
}

fn invalid(text: &str, reason: impl Into<String>) -> MemoryError {
    MemoryError::InvalidSelector {
        selector: text.to_string(),
        reason: reason.into(),
    }
}

fn numeric_component(text: &str, part: &str) -> Result<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(text, format!("'{}' is not a numeric component", part)));
    }
    part.parse()
        .map_err(|_| invalid(text, format!("'{}' is out of range", part)))
}

fn strict_version(text: &str, part: &str) -> Result<Version> {
    let parts: Vec<&str> = part.trim().split('.').collect();
    if parts.len() > 3 {
        return Err(invalid(text, format!("'{}' has more than three components", part)));
    }
    let mut components = [0u64; 3];
    for (slot, p) in components.iter_mut().zip(&parts) {
        *slot = numeric_component(text, p)?;
    }
    Ok(Version::new(components[0], components[1], components[2]))
}

fn split_interval(expr: &str) -> Option<(&str, &str)> {
    if let Some(inner) = expr.strip_prefix('[').and_then(|s| s.strip_suffix(')')) {
        return inner.split_once(',');
    }
    if let Some(pair) = expr.split_once("..") {
        return Some(pair);
    }
    if let Some(pair) = expr.split_once('–') {
        return Some(pair);
    }
    comparator_pair(expr)
}

fn comparator_pair(expr: &str) -> Option<(&str, &str)> {
    let mut low = None;
    let mut high = None;
    for token in expr.split_whitespace() {
        if let Some(v) = token.strip_prefix(">=") {
            low = Some(v);
        } else if let Some(v) = token.strip_prefix('<') {
            if v.starts_with('=') {
                return None;
            }
            high = Some(v);
        } else {
            return None;
        }
    }
    low.zip(high)
}

impl TryFrom<String> for Selector {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

impl std::str::FromStr for Selector {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{}", v),
            Self::Wildcard(fixed) => {
                for c in fixed {
                    write!(f, "{}.", c)?;
                }
                write!(f, "*")
            }
            Self::Interval { low, high } => write!(f, "[{}, {})", low, high),
        }
    }
}

/// Tie-break key: exact > interval > wildcard.
///
/// Wildcards with more fixed components and intervals with a smaller
/// component-wise span (major, then minor, then patch) rank higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Specificity {
    Wildcard { fixed: u8 },
    /// Component differences; u64 components always fit as `i128`.
    Interval { span: [i128; 3] },
    Exact,
}

impl Specificity {
    fn rank(&self) -> u8 {
        match self {
            Self::Wildcard { .. } => 0,
            Self::Interval { .. } => 1,
            Self::Exact => 2,
        }
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Wildcard { fixed: a }, Self::Wildcard { fixed: b }) => a.cmp(b),
            (Self::Interval { span: a }, Self::Interval { span: b }) => b.cmp(a),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
