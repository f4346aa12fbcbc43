use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::batch::ChangeBatch;
use super::violation::{Downgrade, Violation};
use crate::config::PolicyConfig;
use crate::evidence::ObservationLookup;
use crate::rules::{FactMap, RuleAction, Tier, flatten_facts, is_valid_identifier};
use crate::selector::Selector;
use crate::utils::truncate_chars;

/// Committed state of a rule as seen by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleState {
    pub model_id: String,
    pub deleted: bool,
}

/// Lookup of committed rules by id.
pub trait RuleCatalogue {
    fn rule_state(&self, rule_id: &str) -> Option<RuleState>;
}

/// Everything the validator checks a batch against.
pub struct ValidationContext<'a> {
    pub evidence: &'a dyn ObservationLookup,
    pub catalogue: &'a dyn RuleCatalogue,
    pub outstanding_request: Option<&'a str>,
    pub last_applied_request: Option<&'a str>,
    pub policy: &'a PolicyConfig,
}

/// Fields shared by create and update.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleContent {
    pub model_id: String,
    /// Tier after confidence thresholding.
    pub tier: Tier,
    pub fw_selector: Selector,
    pub priority: i64,
    pub confidence: f64,
    pub facts: FactMap,
    pub provenance: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create {
        rule_id: Option<String>,
        content: RuleContent,
    },
    Update {
        rule_id: String,
        content: RuleContent,
    },
    Delete {
        rule_id: String,
        provenance: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUpsert {
    pub index: usize,
    pub change: Change,
}

impl ValidatedUpsert {
    pub fn action(&self) -> RuleAction {
        match self.change {
            Change::Create { .. } => RuleAction::Create,
            Change::Update { .. } => RuleAction::Update,
            Change::Delete { .. } => RuleAction::Delete,
        }
    }
}

/// A batch that passed every check, ready for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub request_id: String,
    pub upserts: Vec<ValidatedUpsert>,
    pub downgrades: Vec<Downgrade>,
}

/// Check a change batch before any write.
///
/// Every violation is collected; the batch is accepted only when none are
/// found. Low-confidence profile and override rules are moved to the
/// candidate tier and reported as downgrades.
pub fn validate(
    batch: &ChangeBatch,
    ctx: &ValidationContext<'_>,
) -> std::result::Result<ValidatedBatch, Vec<Violation>> {
    let mut violations = Vec::new();

    if let Some(stale) = check_request(&batch.request_id, ctx) {
        violations.push(stale);
    }

    let mut seen_rules = HashSet::new();
    let mut used_ids = BTreeSet::new();
    let mut upserts = Vec::new();
    let mut downgrades = Vec::new();

    for (index, raw) in batch.upserts.iter().enumerate() {
        // Counted even when the upsert itself is rejected below.
        used_ids.extend(declared_provenance(raw));

        let mut reader = UpsertReader {
            index,
            violations: &mut violations,
        };
        let Some(mut upsert) = reader.read(raw, ctx, &mut seen_rules) else {
            continue;
        };

        let content = match &mut upsert.change {
            Change::Create { content, .. } | Change::Update { content, .. } => Some(content),
            Change::Delete { .. } => None,
        };
        if let Some(content) = content
            && let Some(threshold) = ctx.policy.threshold(content.tier)
            && content.confidence < threshold
        {
            downgrades.push(Downgrade {
                index,
                rule_id: rule_id_hint(raw),
                requested: content.tier,
                confidence: content.confidence,
                threshold,
            });
            info!(index, requested = %content.tier, confidence = content.confidence, threshold, "Downgrading rule to candidate tier");
            content.tier = Tier::Candidate;
        }
        upserts.push(upsert);
    }

    check_summary(&batch.provenance_summary.observation_ids_used, &used_ids, &mut violations);

    if violations.is_empty() {
        debug!(request_id = %batch.request_id, upserts = upserts.len(), "Batch validated");
        Ok(ValidatedBatch {
            request_id: batch.request_id.clone(),
            upserts,
            downgrades,
        })
    } else {
        warn!(request_id = %batch.request_id, violations = violations.len(), "Batch rejected");
        Err(violations)
    }
}

/// String ids under `provenance.observation_ids`, whatever else is wrong.
fn declared_provenance(raw: &Value) -> impl Iterator<Item = String> + '_ {
    raw.pointer("/provenance/observation_ids")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

fn rule_id_hint(raw: &Value) -> Option<String> {
    raw.get("rule_id").and_then(Value::as_str).map(str::to_string)
}

fn check_request(request_id: &str, ctx: &ValidationContext<'_>) -> Option<Violation> {
    let reason = if request_id.trim().is_empty() {
        "batch carries no request_id".to_string()
    } else if ctx.last_applied_request == Some(request_id) {
        "request was already applied".to_string()
    } else {
        match ctx.outstanding_request {
            None => "no request is outstanding".to_string(),
            Some(outstanding) if outstanding != request_id => {
                format!("outstanding request is '{}'", outstanding)
            }
            Some(_) => return None,
        }
    };
    Some(Violation::StaleRequest {
        request_id: request_id.to_string(),
        reason,
    })
}

fn check_summary(summary: &[String], used: &BTreeSet<String>, violations: &mut Vec<Violation>) {
    let declared: BTreeSet<String> = summary.iter().cloned().collect();
    let missing: Vec<String> = used.difference(&declared).cloned().collect();
    let extra: Vec<String> = declared.difference(used).cloned().collect();
    if !missing.is_empty() || !extra.is_empty() {
        violations.push(Violation::ProvenanceSummaryMismatch { missing, extra });
    }
}

/// Short rendering of a JSON value for violation messages.
fn describe(value: Option<&Value>) -> String {
    match value {
        None => "missing".into(),
        Some(Value::Null) => "null".into(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => format!("\"{}\"", truncate_chars(s, 40)),
        Some(Value::Array(_)) => "array".into(),
        Some(Value::Object(_)) => "object".into(),
    }
}

struct UpsertReader<'v> {
    index: usize,
    violations: &'v mut Vec<Violation>,
}

impl UpsertReader<'_> {
    fn schema(&mut self, field: &str, expected: &str, actual: Option<&Value>) {
        self.violations
            .push(Violation::schema(self.index, field, expected, describe(actual)));
    }

    fn read(
        &mut self,
        raw: &Value,
        ctx: &ValidationContext<'_>,
        seen_rules: &mut HashSet<String>,
    ) -> Option<ValidatedUpsert> {
        let Some(obj) = raw.as_object() else {
            self.schema("upsert", "object", Some(raw));
            return None;
        };

        let action = match obj.get("action") {
            Some(Value::String(s)) => RuleAction::parse(s),
            _ => None,
        };
        let Some(action) = action else {
            self.schema("action", "one of create, update, delete", obj.get("action"));
            return None;
        };

        let violations_before = self.violations.len();
        let rule_id = self.rule_id(obj, action, ctx, seen_rules);
        let provenance = self.provenance(obj, action, ctx);
        let content = match action {
            RuleAction::Delete => None,
            _ => self.content(obj, provenance.clone()),
        };

        if self.violations.len() > violations_before {
            return None;
        }

        let change = match (action, rule_id, content) {
            (RuleAction::Create, rule_id, Some(content)) => Change::Create { rule_id, content },
            (RuleAction::Update, Some(rule_id), Some(content)) => Change::Update { rule_id, content },
            (RuleAction::Delete, Some(rule_id), None) => Change::Delete {
                rule_id,
                provenance: provenance.unwrap_or_default(),
            },
            _ => return None,
        };
        Some(ValidatedUpsert {
            index: self.index,
            change,
        })
    }

    fn rule_id(
        &mut self,
        obj: &Map<String, Value>,
        action: RuleAction,
        ctx: &ValidationContext<'_>,
        seen_rules: &mut HashSet<String>,
    ) -> Option<String> {
        let rule_id = match obj.get("rule_id") {
            None | Some(Value::Null) if action == RuleAction::Create => return None,
            Some(Value::String(s)) if is_valid_identifier(s) => s.clone(),
            other => {
                self.schema("rule_id", "identifier of letters, digits, '-', '_' or '.'", other);
                return None;
            }
        };

        if !seen_rules.insert(rule_id.clone()) {
            self.schema("rule_id", "rule touched once per batch", Some(&Value::String(rule_id)));
            return None;
        }

        let state = ctx.catalogue.rule_state(&rule_id);
        match (action, state) {
            (RuleAction::Create, Some(_)) => {
                self.violations.push(Violation::DuplicateId {
                    index: self.index,
                    rule_id,
                });
                None
            }
            (RuleAction::Update | RuleAction::Delete, None)
            | (RuleAction::Update | RuleAction::Delete, Some(RuleState { deleted: true, .. })) => {
                self.violations.push(Violation::UnknownRule {
                    index: self.index,
                    rule_id,
                });
                None
            }
            (RuleAction::Update, Some(state)) => {
                let proposed = obj.get("model_id").and_then(Value::as_str);
                if proposed.is_some_and(|m| m != state.model_id) {
                    self.schema(
                        "model_id",
                        &format!("\"{}\" (model of the existing rule)", state.model_id),
                        obj.get("model_id"),
                    );
                }
                Some(rule_id)
            }
            _ => Some(rule_id),
        }
    }

    fn provenance(
        &mut self,
        obj: &Map<String, Value>,
        action: RuleAction,
        ctx: &ValidationContext<'_>,
    ) -> Option<Vec<String>> {
        let required = action != RuleAction::Delete;
        let ids = match obj.get("provenance") {
            None | Some(Value::Null) if !required => return Some(Vec::new()),
            Some(Value::Object(p)) => p.get("observation_ids"),
            other => {
                self.schema("provenance", "object with observation_ids", other);
                return None;
            }
        };

        let Some(Value::Array(items)) = ids else {
            self.schema("provenance.observation_ids", "array of observation ids", ids);
            return None;
        };

        let mut ordered: Vec<String> = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str() {
                Some(id) if !id.trim().is_empty() => {
                    if !ordered.iter().any(|seen| seen == id) {
                        ordered.push(id.to_string());
                    }
                }
                _ => {
                    self.schema("provenance.observation_ids", "non-empty string ids", Some(item));
                    return None;
                }
            }
        }

        if required && ordered.is_empty() {
            self.schema(
                "provenance.observation_ids",
                "at least one observation id",
                ids,
            );
            return None;
        }

        for id in &ordered {
            if !ctx.evidence.contains(id) {
                self.violations.push(Violation::DanglingProvenance {
                    index: self.index,
                    observation_id: id.clone(),
                });
            }
        }
        Some(ordered)
    }

    fn content(
        &mut self,
        obj: &Map<String, Value>,
        provenance: Option<Vec<String>>,
    ) -> Option<RuleContent> {
        let tier = match obj.get("tier") {
            Some(Value::String(s)) => Tier::parse(s),
            _ => None,
        };
        if tier.is_none() {
            self.schema("tier", "one of profile, override, candidate", obj.get("tier"));
        }

        let model_id = match obj.get("model_id") {
            Some(Value::String(s)) if is_valid_identifier(s) => Some(s.clone()),
            other => {
                self.schema("model_id", "identifier of letters, digits, '-', '_' or '.'", other);
                None
            }
        };

        let fw_selector = match obj.get("fw_selector") {
            Some(Value::String(s)) => match Selector::parse(s) {
                Ok(selector) => Some(selector),
                Err(e) => {
                    debug!(index = self.index, error = %e, "Selector rejected");
                    self.schema(
                        "fw_selector",
                        "exact, wildcard, or [low, high) selector",
                        obj.get("fw_selector"),
                    );
                    None
                }
            },
            other => {
                self.schema("fw_selector", "selector string", other);
                None
            }
        };

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => Some(0),
            Some(v) => match v.as_i64() {
                Some(p) => Some(p),
                None => {
                    self.schema("priority", "integer", Some(v));
                    None
                }
            },
        };

        let confidence = match obj.get("confidence").and_then(Value::as_f64) {
            Some(c) if (0.0..=1.0).contains(&c) => Some(c),
            _ => {
                self.schema("confidence", "number in [0, 1]", obj.get("confidence"));
                None
            }
        };

        let facts = match obj.get("facts").and_then(flatten_facts) {
            Some(facts) => Some(facts),
            None => {
                self.schema("facts", "object", obj.get("facts"));
                None
            }
        };

        Some(RuleContent {
            model_id: model_id?,
            tier: tier?,
            fw_selector: fw_selector?,
            priority: priority?,
            confidence: confidence?,
            facts: facts?,
            provenance: provenance?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::RuleUpsert;
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        evidence: HashSet<String>,
        rules: HashMap<String, RuleState>,
        policy: PolicyConfig,
    }

    impl RuleCatalogue for HashMap<String, RuleState> {
        fn rule_state(&self, rule_id: &str) -> Option<RuleState> {
            self.get(rule_id).cloned()
        }
    }

    impl Fixture {
        fn new() -> Self {
            let mut rules = HashMap::new();
            rules.insert(
                "r-live".to_string(),
                RuleState {
                    model_id: "X".into(),
                    deleted: false,
                },
            );
            rules.insert(
                "r-gone".to_string(),
                RuleState {
                    model_id: "X".into(),
                    deleted: true,
                },
            );
            Self {
                evidence: ["o1", "o2", "o3"].iter().map(|s| s.to_string()).collect(),
                rules,
                policy: PolicyConfig::default(),
            }
        }

        fn ctx(&self) -> ValidationContext<'_> {
            ValidationContext {
                evidence: &self.evidence,
                catalogue: &self.rules,
                outstanding_request: Some("q1"),
                last_applied_request: Some("q0"),
                policy: &self.policy,
            }
        }
    }

    fn baud_rule(tier: Tier, confidence: f64) -> RuleUpsert {
        RuleUpsert::create(tier, "X", "1.2.*", json!({"transport": {"baud": 9600}}))
            .with_confidence(confidence)
            .with_provenance(["o1"])
    }

    #[test]
    fn test_valid_batch_passes() {
        let fx = Fixture::new();
        let batch = ChangeBatch::new("q1")
            .with_upsert(baud_rule(Tier::Profile, 0.9).with_priority(2))
            .with_upsert(RuleUpsert::delete("r-live"))
            .summarized();

        let validated = validate(&batch, &fx.ctx()).unwrap();
        assert_eq!(validated.upserts.len(), 2);
        assert!(validated.downgrades.is_empty());
        match &validated.upserts[0].change {
            Change::Create { rule_id, content } => {
                assert!(rule_id.is_none());
                assert_eq!(content.priority, 2);
                assert_eq!(content.facts["transport.baud"], json!(9600));
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert_eq!(validated.upserts[1].action(), RuleAction::Delete);
    }

    #[test]
    fn test_stale_request_reasons() {
        let fx = Fixture::new();

        let replay = ChangeBatch::new("q0");
        let err = validate(&replay, &fx.ctx()).unwrap_err();
        assert!(matches!(&err[0], Violation::StaleRequest { reason, .. } if reason.contains("already applied")));

        let other = ChangeBatch::new("q9");
        let err = validate(&other, &fx.ctx()).unwrap_err();
        assert!(matches!(&err[0], Violation::StaleRequest { reason, .. } if reason.contains("'q1'")));

        let mut ctx = fx.ctx();
        ctx.outstanding_request = None;
        let err = validate(&ChangeBatch::new("q1"), &ctx).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err[0].kind(), "stale_request");
    }

    #[test]
    fn test_collects_every_violation() {
        let fx = Fixture::new();
        let batch = ChangeBatch {
            request_id: "q9".into(),
            upserts: vec![
                json!({
                    "action": "create", "tier": "profile", "model_id": "X",
                    "fw_selector": "1.x", "priority": 1.5, "confidence": 1.4,
                    "facts": [], "provenance": {"observation_ids": ["o1", "ghost"]}
                }),
                json!("not an object"),
                json!({"action": "update", "rule_id": "r-missing"}),
            ],
            ..Default::default()
        }
        .with_summary(["o1", "o2"]);

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        let kinds: Vec<_> = violations.iter().map(Violation::kind).collect();

        assert!(kinds.contains(&"stale_request"));
        assert!(kinds.contains(&"dangling_provenance"));
        assert!(kinds.contains(&"unknown_rule"));
        assert!(kinds.contains(&"provenance_summary_mismatch"));

        let fields: Vec<_> = violations
            .iter()
            .filter_map(|v| match v {
                Violation::SchemaViolation { index: 0, field, .. } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        for field in ["fw_selector", "priority", "confidence", "facts"] {
            assert!(fields.contains(&field), "missing {} in {:?}", field, fields);
        }
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::SchemaViolation { index: 1, field, .. } if field == "upsert"
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::ProvenanceSummaryMismatch { missing, extra }
                if missing == &vec!["ghost".to_string()] && extra == &vec!["o2".to_string()]
        )));
    }

    #[test]
    fn test_rejected_upsert_provenance_still_counts_for_summary() {
        let fx = Fixture::new();
        let batch = ChangeBatch {
            request_id: "q1".into(),
            upserts: vec![
                json!({"action": "rename", "provenance": {"observation_ids": ["o1"]}}),
                json!({"action": "create", "tier": "profile"}),
            ],
            ..Default::default()
        }
        .with_summary(["o1"]);

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        assert!(
            !violations
                .iter()
                .any(|v| v.kind() == "provenance_summary_mismatch"),
            "{:?}",
            violations
        );
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::SchemaViolation { index: 0, field, .. } if field == "action"
        )));
    }

    #[test]
    fn test_confidence_violation_reports_expected_and_actual() {
        let fx = Fixture::new();
        let batch = ChangeBatch::new("q1")
            .with_upsert(baud_rule(Tier::Profile, 1.4))
            .summarized();

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        assert_eq!(
            violations,
            vec![Violation::SchemaViolation {
                index: 0,
                field: "confidence".into(),
                expected: "number in [0, 1]".into(),
                actual: "1.4".into(),
            }]
        );
    }

    #[test]
    fn test_low_confidence_is_downgraded() {
        let fx = Fixture::new();
        let batch = ChangeBatch::new("q1")
            .with_upsert(baud_rule(Tier::Profile, 0.84))
            .with_upsert(baud_rule(Tier::Override, 0.80).with_rule_id("r-local"))
            .with_upsert(baud_rule(Tier::Override, 0.5).with_rule_id("r-weak"))
            .summarized();

        let validated = validate(&batch, &fx.ctx()).unwrap();
        let tiers: Vec<_> = validated
            .upserts
            .iter()
            .map(|u| match &u.change {
                Change::Create { content, .. } => content.tier,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tiers, vec![Tier::Candidate, Tier::Override, Tier::Candidate]);

        assert_eq!(validated.downgrades.len(), 2);
        assert_eq!(validated.downgrades[0].index, 0);
        assert_eq!(validated.downgrades[0].requested, Tier::Profile);
        assert_eq!(validated.downgrades[1].rule_id.as_deref(), Some("r-weak"));
        assert!((validated.downgrades[1].threshold - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rule_id_checks() {
        let fx = Fixture::new();
        let batch = ChangeBatch::new("q1")
            .with_upsert(baud_rule(Tier::Profile, 0.9).with_rule_id("r-live"))
            .with_upsert(RuleUpsert::delete("r-gone"))
            .with_upsert(RuleUpsert::update("r-live", baud_rule(Tier::Profile, 0.9)))
            .with_upsert(RuleUpsert::delete("r-live"))
            .summarized();

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        assert!(violations.contains(&Violation::DuplicateId {
            index: 0,
            rule_id: "r-live".into()
        }));
        assert!(violations.contains(&Violation::UnknownRule {
            index: 1,
            rule_id: "r-gone".into()
        }));
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::SchemaViolation { index: 3, field, .. } if field == "rule_id"
        )));
    }

    #[test]
    fn test_update_cannot_move_model() {
        let fx = Fixture::new();
        let moved = RuleUpsert::create(Tier::Profile, "Y", "1.*", json!({"a": 1}))
            .with_confidence(0.9)
            .with_provenance(["o2"]);
        let batch = ChangeBatch::new("q1")
            .with_upsert(RuleUpsert::update("r-live", moved))
            .summarized();

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        assert!(matches!(
            &violations[0],
            Violation::SchemaViolation { field, .. } if field == "model_id"
        ));
    }

    #[test]
    fn test_create_requires_provenance() {
        let fx = Fixture::new();
        let batch = ChangeBatch::new("q1").with_upsert(
            RuleUpsert::create(Tier::Candidate, "X", "*", json!({"a": 1})).with_confidence(0.2),
        );

        let violations = validate(&batch, &fx.ctx()).unwrap_err();
        assert!(matches!(
            &violations[0],
            Violation::SchemaViolation { field, .. } if field == "provenance.observation_ids"
        ));
    }
}
