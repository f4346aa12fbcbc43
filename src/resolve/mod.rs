//! Deterministic merge of applicable rules.

mod precedence;
mod resolver;

pub use precedence::PrecedenceKey;
pub use resolver::{Contribution, EffectiveFactSet, MatchedRule, ResolvedFact, Resolver};
