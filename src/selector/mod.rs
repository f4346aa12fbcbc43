//! Firmware version matching.
//!
//! - `Version`: `major.minor.patch` parsed from free-form version text
//! - `Selector`: exact version, trailing wildcard, or half-open interval
//! - `Specificity`: tie-break key used by resolution

mod matcher;
mod version;

pub use matcher::{Selector, Specificity, matches};
pub use version::Version;
