use console::{Style, style};

use crate::rules::Tier;
use crate::validate::{Downgrade, Violation};

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    /// Every violation of a rejected batch, one per line on stderr.
    pub fn print_violations(&self, violations: &[Violation]) {
        eprintln!(
            "{} batch rejected with {} violation(s)",
            style("✗").red().bold(),
            violations.len()
        );
        for violation in violations {
            eprintln!("  {} {}", style("-").red(), violation);
        }
    }

    pub fn print_downgrades(&self, downgrades: &[Downgrade]) {
        for d in downgrades {
            self.print_warning(&format!(
                "upsert[{}]{} downgraded {} → candidate (confidence {} < {})",
                d.index,
                d.rule_id
                    .as_deref()
                    .map(|id| format!(" {}", id))
                    .unwrap_or_default(),
                self.tier_style(d.requested).apply_to(d.requested),
                d.confidence,
                d.threshold
            ));
        }
    }

    pub fn tier_style(&self, tier: Tier) -> Style {
        match tier {
            Tier::Override => Style::new().magenta().bold(),
            Tier::Profile => Style::new().green(),
            Tier::Candidate => Style::new().dim(),
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
