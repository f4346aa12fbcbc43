use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::evidence::SourceKind;

#[derive(Parser)]
#[command(name = "embedded-memory")]
#[command(author, version, about = "Versioned, provenance-backed facts for embedded targets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Store root (holds data/, spec/ and runs/)
    #[arg(long, global = true, env = "EMBEDDED_MEMORY_ROOT", default_value = ".")]
    pub root: PathBuf,
}

/// Output format for CLI results.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the store layout and a default config
    Init,

    /// Record one observation
    Observe {
        /// Target model identifier
        #[arg(long)]
        model: String,

        /// Firmware version the observation applies to
        #[arg(long)]
        fw: String,

        #[arg(long, value_enum, default_value = "chat")]
        source: SourceArg,

        /// Observation text
        #[arg(long, required_unless_present = "content_file")]
        content: Option<String>,

        /// Read the observation text from a file
        #[arg(long, conflicts_with = "content")]
        content_file: Option<PathBuf>,

        /// Group under a run
        #[arg(long)]
        run: Option<String>,

        /// Explicit observation id (fails if it already exists)
        #[arg(long)]
        id: Option<String>,

        /// Physical instance the observation was made on
        #[arg(long)]
        instance: Option<String>,
    },

    /// Prepare or apply a compile request
    Compile {
        #[command(subcommand)]
        action: CompileAction,
    },

    /// Resolve effective facts for a target
    Resolve {
        #[arg(long)]
        model: String,

        #[arg(long)]
        fw: String,

        /// Physical instance to echo in the result
        #[arg(long = "instance-id")]
        instance_id: Option<String>,

        /// Also merge candidate-tier rules
        #[arg(long)]
        include_candidates: bool,
    },

    /// List rules matching a target, highest precedence first
    Search {
        #[arg(long)]
        model: String,

        #[arg(long)]
        fw: String,
    },

    /// Show a rule revision
    Show {
        rule_id: String,

        /// Revision number (default: latest)
        #[arg(long)]
        revision: Option<u32>,
    },

    /// List every revision of a rule
    History { rule_id: String },

    /// Compare two revisions of a rule
    Diff {
        rule_id: String,

        #[arg(long)]
        from: u32,

        #[arg(long)]
        to: u32,
    },

    /// Observations and applies in time order
    Timeline {
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        run: Option<String>,

        /// Number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Rebuild the rule index from tiered storage
    Reindex,

    /// Finish or undo an interrupted apply
    Recover,
}

#[derive(Subcommand)]
pub enum CompileAction {
    /// Issue a new outstanding request from recent observations
    Prepare {
        #[arg(long)]
        run: Option<String>,

        /// Most recent observations to include (default from config)
        #[arg(long)]
        limit: Option<usize>,

        /// Also write the request to this path
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate and apply a change batch
    Apply {
        /// Change batch JSON file
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceArg {
    Chat,
    Analysis,
    Report,
    System,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Chat => Self::Chat,
            SourceArg::Analysis => Self::Analysis,
            SourceArg::Report => Self::Report,
            SourceArg::System => Self::System,
        }
    }
}
