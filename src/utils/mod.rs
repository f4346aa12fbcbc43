//! Shared utility functions.
//!
//! - Durable file operations (atomic replace, create-new, fsync'd append)
//! - JSONL reading and line counting
//! - String truncation for terminal output

mod file_ops;
mod string;

pub use file_ops::{append_line, count_lines_in_file, read_jsonl, write_atomic, write_new};
pub use string::{single_line, truncate_chars};
