use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::error::MemoryError;
use crate::request::CompileRequest;
use crate::resolve::EffectiveFactSet;
use crate::rules::Rule;
use crate::storage::{ApplyResult, IndexEntry, RecoveryOutcome, RevisionRef, RuleDiff, RuleIndex};
use crate::store::TimelineEvent;
use crate::utils::{single_line, truncate_chars};

/// Writes command results as text or as one JSON document on stdout.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn emit_message(&self, message: &str) {
        match self.format {
            OutputFormat::Text => println!("{}", message),
            OutputFormat::Json => self.write_json(&MessageOutput {
                message: message.to_string(),
            }),
        }
    }

    pub fn emit_observation(&self, id: &str) {
        match self.format {
            OutputFormat::Text => println!("{}", id),
            OutputFormat::Json => self.write_json(&serde_json::json!({ "id": id })),
        }
    }

    pub fn emit_request(&self, request: &CompileRequest) {
        match self.format {
            OutputFormat::Text => {
                println!("Request:      {}", request.request_id);
                println!("Observations: {}", request.observation_ids.len());
                if let Some(run) = &request.run_id {
                    println!("Run:          {}", run);
                }
            }
            OutputFormat::Json => self.write_json(request),
        }
    }

    pub fn emit_apply(&self, result: &ApplyResult) {
        match self.format {
            OutputFormat::Text => {
                println!(
                    "Applied {} (generation {}): {} change(s)",
                    result.request_id,
                    result.generation,
                    result.changes.len()
                );
                for change in &result.changes {
                    println!(
                        "  {:<8} {} rev {} [{}] {}",
                        change.action.as_str(),
                        change.rule_id,
                        change.revision,
                        change.tier,
                        change.model_id
                    );
                }
            }
            OutputFormat::Json => self.write_json(result),
        }
    }

    pub fn emit_resolution(&self, resolved: &EffectiveFactSet) {
        match self.format {
            OutputFormat::Text => {
                let target = match &resolved.instance_id {
                    Some(instance) => {
                        format!("{} @ {} ({})", resolved.model_id, resolved.fw_version, instance)
                    }
                    None => format!("{} @ {}", resolved.model_id, resolved.fw_version),
                };
                if resolved.is_empty() {
                    println!("No facts for {}", target);
                    return;
                }
                println!("{}", target);
                println!();
                for (key_path, fact) in &resolved.facts {
                    println!(
                        "  {:<32} {:<20} ({})",
                        key_path,
                        render_value(&fact.value),
                        fact.winning_rule_id
                    );
                }
                println!();
                println!("Matched rules: {}", resolved.matched_rules.len());
            }
            OutputFormat::Json => self.write_json(resolved),
        }
    }

    pub fn emit_search(&self, entries: &[IndexEntry]) {
        match self.format {
            OutputFormat::Text => {
                if entries.is_empty() {
                    println!("No matching rules.");
                    return;
                }
                println!(
                    "{:<36} {:<4} {:<10} {:<18} {:>8} {:>10}",
                    "Rule", "Rev", "Tier", "Selector", "Priority", "Confidence"
                );
                println!("{}", "-".repeat(92));
                for e in entries {
                    println!(
                        "{:<36} {:<4} {:<10} {:<18} {:>8} {:>10.2}",
                        truncate_chars(&e.rule_id, 36),
                        e.revision,
                        e.tier.as_str(),
                        e.fw_selector.to_string(),
                        e.priority,
                        e.confidence
                    );
                }
            }
            OutputFormat::Json => self.write_json(&entries),
        }
    }

    pub fn emit_rule(&self, rule: &Rule) {
        match self.format {
            OutputFormat::Text => match serde_yaml_bw::to_string(rule) {
                Ok(yaml) => print!("{}", yaml),
                Err(_) => self.write_json(rule),
            },
            OutputFormat::Json => self.write_json(rule),
        }
    }

    pub fn emit_revisions(&self, rule_id: &str, revisions: &[RevisionRef]) {
        match self.format {
            OutputFormat::Text => {
                println!("{}", rule_id);
                for r in revisions {
                    println!(
                        "  rev {:<4} {:<7} {:<10} {}  {}",
                        r.revision,
                        r.action.as_str(),
                        r.tier.as_str(),
                        r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        r.path.display()
                    );
                }
            }
            OutputFormat::Json => self.write_json(&serde_json::json!({
                "rule_id": rule_id,
                "revisions": revisions,
            })),
        }
    }

    pub fn emit_diff(&self, diff: &RuleDiff) {
        match self.format {
            OutputFormat::Text => {
                println!(
                    "{}: rev {} → rev {}",
                    diff.rule_id, diff.from_revision, diff.to_revision
                );
                if diff.is_empty() {
                    println!("  (no changes)");
                    return;
                }
                for f in &diff.fields {
                    println!("  ~ {}: {} → {}", f.field, f.from, f.to);
                }
                for f in &diff.added {
                    println!("  + {} = {}", f.key_path, render_value(&f.value));
                }
                for f in &diff.removed {
                    println!("  - {} = {}", f.key_path, render_value(&f.value));
                }
                for f in &diff.changed {
                    println!(
                        "  ~ {}: {} → {}",
                        f.key_path,
                        render_value(&f.from),
                        render_value(&f.to)
                    );
                }
            }
            OutputFormat::Json => self.write_json(diff),
        }
    }

    pub fn emit_timeline(&self, events: &[TimelineEvent]) {
        match self.format {
            OutputFormat::Text => {
                if events.is_empty() {
                    println!("No events.");
                    return;
                }
                for event in events {
                    let ts = event.timestamp().format("%Y-%m-%d %H:%M:%S");
                    match event {
                        TimelineEvent::Observation(o) => println!(
                            "{}  observe  {:<18} {} {} [{}] {}",
                            ts,
                            o.id,
                            o.model_id,
                            o.fw_version,
                            o.source,
                            truncate_chars(&single_line(&o.content), 60)
                        ),
                        TimelineEvent::Apply(h) => println!(
                            "{}  apply    {:<18} {} change(s)",
                            ts,
                            truncate_chars(&h.request_id, 18),
                            h.changes.len()
                        ),
                    }
                }
            }
            OutputFormat::Json => self.write_json(&events),
        }
    }

    pub fn emit_recovery(&self, outcome: &RecoveryOutcome) {
        match self.format {
            OutputFormat::Text => match outcome {
                RecoveryOutcome::Clean => println!("Nothing to recover."),
                RecoveryOutcome::RolledBack { generation, files } => println!(
                    "Rolled back uncommitted generation {} ({} file(s) removed)",
                    generation, files
                ),
                RecoveryOutcome::RolledForward { generation } => {
                    println!("Completed committed generation {}", generation)
                }
                RecoveryOutcome::Discarded { generation } => {
                    println!("Discarded outdated journal for generation {}", generation)
                }
            },
            OutputFormat::Json => self.write_json(outcome),
        }
    }

    pub fn emit_index(&self, index: &RuleIndex) {
        match self.format {
            OutputFormat::Text => println!(
                "Index rebuilt: generation {}, {} model(s), {} rule(s)",
                index.generation,
                index.models.len(),
                index.len()
            ),
            OutputFormat::Json => self.write_json(&serde_json::json!({
                "generation": index.generation,
                "models": index.models.len(),
                "rules": index.len(),
            })),
        }
    }

    /// Machine-readable failure on stdout; text mode reports on stderr instead.
    pub fn emit_error(&self, error: &MemoryError) {
        if self.is_json() {
            self.write_json(&ErrorOutput {
                error: error.to_string(),
                violations: error.violations().to_vec(),
            });
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, value: &T) {
        if let Ok(json) = serde_json::to_string_pretty(value) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct MessageOutput {
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorOutput {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    violations: Vec<crate::validate::Violation>,
}
