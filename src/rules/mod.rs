//! Rule records shared by validation, storage and resolution.

mod types;

pub use types::{FactMap, Rule, RuleAction, Tier, flatten_facts, is_valid_identifier};
