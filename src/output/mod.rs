//! Result rendering for the command line.
//!
//! - `OutputWriter`: text tables or JSON documents on stdout

mod writer;

pub use writer::OutputWriter;
