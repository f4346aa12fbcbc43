//! Change batch validation.
//!
//! Every check runs before any write and all violations are reported in one
//! pass. A batch either validates completely or is rejected as a whole.

mod batch;
mod checks;
mod violation;

pub use batch::{ChangeBatch, ProvenanceSummary, RuleUpsert};
pub use checks::{
    Change, RuleCatalogue, RuleContent, RuleState, ValidatedBatch, ValidatedUpsert,
    ValidationContext, validate,
};
pub use violation::{Downgrade, Violation};
