//! Append-only evidence ledgers.
//!
//! Observations land in `data/memory/observations.jsonl`, or in
//! `runs/<run>/observations.jsonl` when grouped by run. Nothing is ever
//! rewritten in place.

mod observation;
mod store;

pub use observation::{NewObservation, Observation, SourceKind};
pub use store::{DEFAULT_RUN, EvidenceStore, ObservationLookup, ObservationStream};
