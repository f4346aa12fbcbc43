pub mod cli;
pub mod config;
pub mod error;
pub mod evidence;
pub mod lock;
pub mod output;
pub mod request;
pub mod resolve;
pub mod rules;
pub mod selector;
pub mod storage;
pub mod store;
pub mod utils;
pub mod validate;

pub use config::{MemoryConfig, StorePaths};
pub use error::{MemoryError, Result};
pub use evidence::{EvidenceStore, NewObservation, Observation, SourceKind};
pub use request::CompileRequest;
pub use resolve::{EffectiveFactSet, Resolver};
pub use rules::{Rule, RuleAction, Tier};
pub use selector::{Selector, Version};
pub use storage::{ApplyResult, RecoveryOutcome};
pub use store::{MemoryStore, TimelineEvent};
pub use validate::{ChangeBatch, RuleUpsert, Violation};
