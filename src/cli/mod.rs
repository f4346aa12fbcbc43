//! Command-line interface definitions.
//!
//! - `Cli`, `Commands`: CLI argument definitions via clap
//! - `Display`: styled status lines on the terminal

mod commands;
mod display;

pub use commands::{Cli, CompileAction, Commands, OutputFormat, SourceArg};
pub use display::Display;
