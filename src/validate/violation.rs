use serde::Serialize;
use thiserror::Error;

use crate::rules::Tier;

/// One defect found in a change batch.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("stale request '{request_id}': {reason}")]
    StaleRequest { request_id: String, reason: String },

    #[error("upsert[{index}].{field}: expected {expected}, got {actual}")]
    SchemaViolation {
        index: usize,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("upsert[{index}].provenance: observation '{observation_id}' does not exist")]
    DanglingProvenance { index: usize, observation_id: String },

    #[error(
        "provenance_summary.observation_ids_used: missing [{}], extra [{}]",
        .missing.join(", "),
        .extra.join(", ")
    )]
    ProvenanceSummaryMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("upsert[{index}].rule_id: rule '{rule_id}' does not exist")]
    UnknownRule { index: usize, rule_id: String },

    #[error("upsert[{index}].rule_id: rule '{rule_id}' already exists")]
    DuplicateId { index: usize, rule_id: String },
}

impl Violation {
    pub(crate) fn schema(
        index: usize,
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::SchemaViolation {
            index,
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StaleRequest { .. } => "stale_request",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::DanglingProvenance { .. } => "dangling_provenance",
            Self::ProvenanceSummaryMismatch { .. } => "provenance_summary_mismatch",
            Self::UnknownRule { .. } => "unknown_rule",
            Self::DuplicateId { .. } => "duplicate_id",
        }
    }

    /// Upsert position the violation refers to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::SchemaViolation { index, .. }
            | Self::DanglingProvenance { index, .. }
            | Self::UnknownRule { index, .. }
            | Self::DuplicateId { index, .. } => Some(*index),
            Self::StaleRequest { .. } | Self::ProvenanceSummaryMismatch { .. } => None,
        }
    }
}

/// A rule re-tagged to the candidate tier for low confidence.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Downgrade {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub requested: Tier,
    pub confidence: f64,
    pub threshold: f64,
}
