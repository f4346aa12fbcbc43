use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use embedded_memory::cli::{Cli, Commands, CompileAction, Display, OutputFormat, SourceArg};
use embedded_memory::error::{MemoryError, Result};
use embedded_memory::evidence::NewObservation;
use embedded_memory::output::OutputWriter;
use embedded_memory::store::MemoryStore;
use embedded_memory::validate::ChangeBatch;

/// Context for command output handling.
struct OutputContext<'a> {
    display: &'a Display,
    writer: &'a OutputWriter,
}

impl OutputContext<'_> {
    fn text(&self) -> bool {
        self.writer.format() == OutputFormat::Text
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let display = Display::new();
    let writer = OutputWriter::new(cli.output);
    let out = OutputContext {
        display: &display,
        writer: &writer,
    };

    match run(&out, cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            writer.emit_error(&e);
            match &e {
                MemoryError::ValidationFailed(violations) => display.print_violations(violations),
                other => display.print_error(&other.to_string()),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("embedded_memory=debug")
    } else {
        EnvFilter::new("embedded_memory=info")
    };

    // stdout carries command results; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .init();
}

fn run(out: &OutputContext<'_>, cli: Cli) -> Result<()> {
    let root = cli.root;

    match cli.command {
        Commands::Init => cmd_init(out, root),
        Commands::Observe {
            model,
            fw,
            source,
            content,
            content_file,
            run,
            id,
            instance,
        } => {
            let content = match (content, content_file) {
                (Some(text), _) => text,
                (None, Some(path)) => fs::read_to_string(&path)?,
                (None, None) => {
                    return Err(MemoryError::InvalidObservation(
                        "content is required".into(),
                    ));
                }
            };
            cmd_observe(out, root, model, fw, source, content, run, id, instance)
        }
        Commands::Compile { action } => match action {
            CompileAction::Prepare {
                run,
                limit,
                out: copy,
            } => cmd_prepare(out, root, run.as_deref(), limit, copy.as_deref()),
            CompileAction::Apply { input } => cmd_apply(out, root, &input),
        },
        Commands::Resolve {
            model,
            fw,
            instance_id,
            include_candidates,
        } => {
            let store = MemoryStore::open(root)?;
            let mut resolved = if include_candidates {
                store.resolve_with(&model, &fw, true)?
            } else {
                store.resolve(&model, &fw)?
            };
            if let Some(instance_id) = instance_id {
                resolved = resolved.with_instance(instance_id);
            }
            out.writer.emit_resolution(&resolved);
            Ok(())
        }
        Commands::Search { model, fw } => {
            let store = MemoryStore::open(root)?;
            out.writer.emit_search(&store.search(&model, &fw)?);
            Ok(())
        }
        Commands::Show { rule_id, revision } => {
            let store = MemoryStore::open(root)?;
            out.writer.emit_rule(&store.show(&rule_id, revision)?);
            Ok(())
        }
        Commands::History { rule_id } => {
            let store = MemoryStore::open(root)?;
            out.writer
                .emit_revisions(&rule_id, &store.revisions(&rule_id)?);
            Ok(())
        }
        Commands::Diff { rule_id, from, to } => {
            let store = MemoryStore::open(root)?;
            out.writer.emit_diff(&store.diff(&rule_id, from, to)?);
            Ok(())
        }
        Commands::Timeline { model, run, limit } => {
            let store = MemoryStore::open(root)?;
            let events = store.timeline(model.as_deref(), run.as_deref(), limit)?;
            out.writer.emit_timeline(&events);
            Ok(())
        }
        Commands::Reindex => {
            let store = MemoryStore::open(root)?;
            out.writer.emit_index(&store.reindex()?);
            Ok(())
        }
        Commands::Recover => {
            let store = MemoryStore::open(root)?;
            out.writer.emit_recovery(&store.recover()?);
            Ok(())
        }
    }
}

fn cmd_init(out: &OutputContext<'_>, root: PathBuf) -> Result<()> {
    let store = MemoryStore::open(root)?;
    let created = store.init()?;

    if out.text() {
        if created {
            out.display.print_success("Initialized store.");
            out.display.print_info(&format!(
                "Configuration: {}",
                store.paths().memory_dir.join("config.toml").display()
            ));
        } else {
            out.display.print_warning("Store is already initialized.");
        }
    } else {
        out.writer.emit_message(if created {
            "Initialized store"
        } else {
            "Store already initialized"
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_observe(
    out: &OutputContext<'_>,
    root: PathBuf,
    model: String,
    fw: String,
    source: SourceArg,
    content: String,
    run: Option<String>,
    id: Option<String>,
    instance: Option<String>,
) -> Result<()> {
    let store = MemoryStore::open(root)?;

    let mut observation = NewObservation::new(model, fw, source.into(), content);
    if let Some(run) = run {
        observation = observation.with_run(run);
    }
    if let Some(id) = id {
        observation = observation.with_id(id);
    }
    if let Some(instance) = instance {
        observation = observation.with_instance(instance);
    }

    let id = store.observe(observation)?;
    out.writer.emit_observation(&id);
    Ok(())
}

fn cmd_prepare(
    out: &OutputContext<'_>,
    root: PathBuf,
    run: Option<&str>,
    limit: Option<usize>,
    copy: Option<&Path>,
) -> Result<()> {
    let store = MemoryStore::open(root)?;
    let request = store.prepare(run, limit)?;

    if let Some(path) = copy {
        fs::write(path, serde_json::to_string_pretty(&request)?)?;
    }

    out.writer.emit_request(&request);
    if out.text() && request.observation_ids.is_empty() {
        out.display
            .print_warning("No observations available; the request is empty.");
    }
    Ok(())
}

fn cmd_apply(out: &OutputContext<'_>, root: PathBuf, input: &Path) -> Result<()> {
    let store = MemoryStore::open(root)?;
    let batch = ChangeBatch::load(input)?;
    let result = store.apply(&batch)?;

    if out.text() {
        out.display.print_downgrades(&result.downgrades);
    }
    out.writer.emit_apply(&result);
    Ok(())
}
