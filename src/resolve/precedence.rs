use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::rules::{Rule, Tier};
use crate::selector::Specificity;
use crate::storage::IndexEntry;

/// Total order used to pick the winning rule for a key path.
///
/// Compared field by field, highest first: tier authority, priority,
/// selector specificity, confidence, modification time. Equal keys are a
/// tie that only the fact values can settle.
#[derive(Debug, Clone, Copy)]
pub struct PrecedenceKey {
    pub tier: Tier,
    pub priority: i64,
    pub specificity: Specificity,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl PrecedenceKey {
    pub fn of_rule(rule: &Rule) -> Self {
        Self {
            tier: rule.tier,
            priority: rule.priority,
            specificity: rule.specificity(),
            confidence: rule.confidence,
            updated_at: rule.updated_at,
        }
    }

    pub fn of_entry(entry: &IndexEntry) -> Self {
        Self {
            tier: entry.tier,
            priority: entry.priority,
            specificity: entry.specificity,
            confidence: entry.confidence,
            updated_at: entry.updated_at,
        }
    }
}

impl Ord for PrecedenceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .authority()
            .cmp(&other.tier.authority())
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.specificity.cmp(&other.specificity))
            .then_with(|| self.confidence.total_cmp(&other.confidence))
            .then_with(|| self.updated_at.cmp(&other.updated_at))
    }
}

impl PartialOrd for PrecedenceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PrecedenceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrecedenceKey {}
