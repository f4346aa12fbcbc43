mod fixtures;

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde_json::json;

use fixtures::store::{TestStore, baud_rule};

use embedded_memory::lock::StoreLock;
use embedded_memory::storage::{CrashPoint, HistoryLog, Manifest};
use embedded_memory::{
    MemoryError, RecoveryOutcome, RuleAction, RuleUpsert, Tier, TimelineEvent, Violation,
};

#[test]
fn test_create_commits_revision_and_index() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "console runs at 115200");

    let result = t
        .apply(vec![
            baud_rule(Tier::Profile, "1.2.*", 115200, &obs).with_rule_id("x-uart-baud"),
        ])
        .unwrap();

    assert_eq!(result.generation, 1);
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].action, RuleAction::Create);
    assert_eq!(result.changes[0].revision, 1);
    assert!(result.downgrades.is_empty());

    let rule = t.store.show("x-uart-baud", None).unwrap();
    assert_eq!(rule.tier, Tier::Profile);
    assert_eq!(rule.provenance, vec![obs]);
    assert_eq!(rule.request_id, result.request_id);

    let file = t
        .paths()
        .profiles_dir
        .join("X")
        .join("x-uart-baud")
        .join("1.yaml");
    assert!(file.exists());

    let manifest = Manifest::load(t.paths()).unwrap();
    assert_eq!(manifest.generation, 1);
    assert_eq!(
        manifest.last_applied_request.as_deref(),
        Some(result.request_id.as_str())
    );

    let history = HistoryLog::new(t.paths()).entries().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].generation, 1);

    assert!(t.store.outstanding_request().unwrap().is_none());
    assert_eq!(t.store.search("X", "1.2.9").unwrap().len(), 1);
}

#[test]
fn test_replayed_batch_is_stale() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let request_id = t.prepare();
    let batch = t.batch(&request_id, vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs)]);

    t.store.apply(&batch).unwrap();
    let before = t.snapshot();

    let err = t.store.apply(&batch).unwrap_err();
    let violations = err.violations();
    assert_eq!(violations.len(), 1);
    assert!(matches!(
        &violations[0],
        Violation::StaleRequest { request_id: id, .. } if *id == request_id
    ));
    assert_eq!(t.snapshot(), before);
}

#[test]
fn test_batch_for_other_request_is_stale() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let old = t.prepare();
    let _current = t.prepare();

    let err = t
        .store
        .apply(&t.batch(&old, vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs)]))
        .unwrap_err();
    assert!(
        err.violations()
            .iter()
            .any(|v| matches!(v, Violation::StaleRequest { .. }))
    );
}

#[test]
fn test_low_confidence_rule_lands_in_candidates() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "maybe 57600?");

    let result = t
        .apply(vec![
            baud_rule(Tier::Profile, "1.2.*", 57600, &obs)
                .with_rule_id("x-guess")
                .with_confidence(0.5),
        ])
        .unwrap();

    assert_eq!(result.downgrades.len(), 1);
    let downgrade = &result.downgrades[0];
    assert_eq!(downgrade.requested, Tier::Profile);
    assert_eq!(downgrade.rule_id.as_deref(), Some("x-guess"));
    assert!((downgrade.threshold - 0.85).abs() < f64::EPSILON);
    assert_eq!(result.changes[0].tier, Tier::Candidate);

    assert_eq!(t.store.show("x-guess", None).unwrap().tier, Tier::Candidate);
    assert!(
        t.paths()
            .candidates_dir
            .join("X/x-guess/1.yaml")
            .exists()
    );

    let history = HistoryLog::new(t.paths()).entries().unwrap();
    assert_eq!(history[0].downgrades.len(), 1);
}

#[test]
fn test_downgrade_names_generated_rule_id() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "maybe 57600?");

    let result = t
        .apply(vec![
            baud_rule(Tier::Override, "1.2.*", 57600, &obs).with_confidence(0.1),
        ])
        .unwrap();

    let generated = &result.changes[0].rule_id;
    assert!(generated.starts_with("r-"));
    let history = HistoryLog::new(t.paths()).entries().unwrap();
    assert_eq!(
        history[0].downgrades[0].rule_id.as_deref(),
        Some(generated.as_str())
    );
}

#[test]
fn test_rejected_batch_writes_nothing() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let before = t.snapshot();

    let err = t
        .apply(vec![
            baud_rule(Tier::Profile, "1.2.*", 9600, &obs),
            baud_rule(Tier::Profile, "1.3.*", 9600, "nope-000001"),
        ])
        .unwrap_err();

    assert!(matches!(err, MemoryError::ValidationFailed(_)));
    assert!(err.violations().iter().any(|v| matches!(
        v,
        Violation::DanglingProvenance { index: 1, observation_id } if observation_id == "nope-000001"
    )));
    assert_eq!(t.snapshot(), before);
    assert!(t.revision_files().is_empty());
    assert!(t.store.outstanding_request().unwrap().is_some());
}

#[test]
fn test_every_violation_is_reported() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    t.prepare();

    let batch = t.batch(
        "not-the-request",
        vec![
            baud_rule(Tier::Profile, "not a selector", 9600, &obs),
            RuleUpsert::delete("missing-rule").with_provenance([obs.as_str()]),
        ],
    );
    let err = t.store.apply(&batch).unwrap_err();
    let kinds: Vec<&str> = err.violations().iter().map(Violation::kind).collect();

    assert!(kinds.contains(&"stale_request"));
    assert!(kinds.contains(&"schema_violation"));
    assert!(kinds.contains(&"unknown_rule"));
}

#[test]
fn test_update_delete_and_diff() {
    let t = TestStore::new();
    let obs1 = t.observe("X", "1.2.5", "baud 9600");
    t.apply(vec![
        baud_rule(Tier::Profile, "1.2.*", 9600, &obs1).with_rule_id("x-baud"),
    ])
    .unwrap();

    let obs2 = t.observe("X", "1.2.5", "actually 115200");
    let result = t
        .apply(vec![RuleUpsert::update(
            "x-baud",
            baud_rule(Tier::Profile, "1.2.*", 115200, &obs2).with_priority(5),
        )])
        .unwrap();
    assert_eq!(result.changes[0].action, RuleAction::Update);
    assert_eq!(result.changes[0].revision, 2);

    let diff = t.store.diff("x-baud", 1, 2).unwrap();
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0].key_path, "transport.baud");
    assert!(diff.fields.iter().any(|f| f.field == "priority"));

    let v1 = t.store.show("x-baud", Some(1)).unwrap();
    let v2 = t.store.show("x-baud", Some(2)).unwrap();
    assert_eq!(v1.created_at, v2.created_at);
    assert_eq!(
        t.store.resolve("X", "1.2.5").unwrap().value("transport.baud"),
        Some(&serde_json::json!(115200))
    );

    t.apply(vec![RuleUpsert::delete("x-baud")]).unwrap();
    let tombstone = t.store.show("x-baud", None).unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.revision, 3);
    assert_eq!(tombstone.provenance, vec![obs2]);

    let revisions = t.store.revisions("x-baud").unwrap();
    let actions: Vec<RuleAction> = revisions.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![RuleAction::Create, RuleAction::Update, RuleAction::Delete]
    );
    assert!(t.store.resolve("X", "1.2.5").unwrap().is_empty());
    assert!(t.store.search("X", "1.2.5").unwrap().is_empty());

    let err = t
        .apply(vec![RuleUpsert::update(
            "x-baud",
            baud_rule(Tier::Profile, "1.2.*", 9600, &obs1),
        )])
        .unwrap_err();
    assert!(
        err.violations()
            .iter()
            .any(|v| matches!(v, Violation::UnknownRule { .. }))
    );
}

#[test]
fn test_duplicate_rule_id_rejected() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    t.apply(vec![
        baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud"),
    ])
    .unwrap();

    let err = t
        .apply(vec![
            baud_rule(Tier::Profile, "1.3.*", 9600, &obs).with_rule_id("x-baud"),
        ])
        .unwrap_err();
    assert!(
        err.violations()
            .iter()
            .any(|v| matches!(v, Violation::DuplicateId { rule_id, .. } if rule_id == "x-baud"))
    );
}

#[test]
fn test_crash_before_commit_leaves_committed_state_untouched() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    t.apply(vec![
        baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud"),
    ])
    .unwrap();

    let before = t.snapshot();
    let resolved_before = serde_json::to_string(&t.store.resolve("X", "1.2.5").unwrap()).unwrap();

    let err = t
        .apply_crashing(
            vec![
                baud_rule(Tier::Override, "1.2.0..1.3.0", 115200, &obs).with_rule_id("x-local"),
                RuleUpsert::delete("x-baud"),
            ],
            CrashPoint::AfterRuleWrites,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Aborted(_)));

    // Orphaned files exist on disk but nothing committed references them.
    assert_eq!(t.snapshot().manifest, before.manifest);
    assert_eq!(t.snapshot().index, before.index);
    assert_eq!(t.snapshot().history, before.history);
    let resolved_after = serde_json::to_string(&t.store.resolve("X", "1.2.5").unwrap()).unwrap();
    assert_eq!(resolved_after, resolved_before);

    let outcome = t.store.recover().unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::RolledBack {
            generation: 2,
            files: 2
        }
    );
    assert_eq!(t.snapshot(), before);
    assert!(!t.paths().overrides_dir.join("X").exists());
    assert!(!t.paths().journal_file().exists());

    assert_eq!(t.store.recover().unwrap(), RecoveryOutcome::Clean);
}

#[test]
fn test_crash_after_journal_rolls_back() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let before = t.snapshot();

    let err = t
        .apply_crashing(
            vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs)],
            CrashPoint::AfterJournal,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Aborted(_)));
    assert!(t.paths().journal_file().exists());

    assert!(matches!(
        t.store.recover().unwrap(),
        RecoveryOutcome::RolledBack { generation: 1, .. }
    ));
    assert_eq!(t.snapshot(), before);
}

#[test]
fn test_batch_retried_after_rollback() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let request_id = t.prepare();
    let batch = t.batch(
        &request_id,
        vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud")],
    );

    t.store
        .apply_with(&batch, Some(CrashPoint::AfterRuleWrites))
        .unwrap_err();

    // The next apply recovers first; the request is still outstanding.
    let result = t.store.apply(&batch).unwrap();
    assert_eq!(result.generation, 1);
    assert_eq!(t.store.show("x-baud", None).unwrap().revision, 1);
}

#[test]
fn test_crash_after_history_append_rolls_back() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    t.apply(vec![
        baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud"),
    ])
    .unwrap();
    let before = t.snapshot();
    let resolved_before = serde_json::to_string(&t.store.resolve("X", "1.2.5").unwrap()).unwrap();

    let err = t
        .apply_crashing(
            vec![baud_rule(Tier::Override, "*", 115200, &obs).with_rule_id("x-local")],
            CrashPoint::AfterHistory,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Aborted(_)));

    // The entry is on disk but above the committed generation.
    let history = HistoryLog::new(t.paths());
    assert_eq!(history.entries().unwrap().len(), 2);
    assert_eq!(history.committed(1).unwrap().len(), 1);
    let applies = t
        .store
        .timeline(Some("X"), None, 100)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, TimelineEvent::Apply(_)))
        .count();
    assert_eq!(applies, 1);
    assert_eq!(t.snapshot().manifest, before.manifest);
    let resolved_after = serde_json::to_string(&t.store.resolve("X", "1.2.5").unwrap()).unwrap();
    assert_eq!(resolved_after, resolved_before);

    assert_eq!(
        t.store.recover().unwrap(),
        RecoveryOutcome::RolledBack {
            generation: 2,
            files: 1
        }
    );
    assert_eq!(t.snapshot(), before);
}

#[test]
fn test_history_left_by_lost_journal_is_dropped() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");

    t.apply_crashing(
        vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud")],
        CrashPoint::AfterHistory,
    )
    .unwrap_err();
    fs::remove_file(t.paths().journal_file()).unwrap();

    assert_eq!(t.store.recover().unwrap(), RecoveryOutcome::Clean);
    assert!(HistoryLog::new(t.paths()).entries().unwrap().is_empty());

    // The generation is reused without a duplicate entry.
    let result = t
        .apply(vec![
            baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud"),
        ])
        .unwrap();
    assert_eq!(result.generation, 1);
    let history = HistoryLog::new(t.paths()).entries().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, result.request_id);
}

#[test]
fn test_crash_after_commit_rolls_forward() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");

    let err = t
        .apply_crashing(
            vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs).with_rule_id("x-baud")],
            CrashPoint::AfterCommit,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Aborted(_)));

    // Committed: readers see the rule together with its history entry.
    assert_eq!(
        t.store.resolve("X", "1.2.5").unwrap().value("transport.baud"),
        Some(&serde_json::json!(9600))
    );
    let history = HistoryLog::new(t.paths()).committed(1).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].changes[0].rule_id, "x-baud");

    assert_eq!(
        t.store.recover().unwrap(),
        RecoveryOutcome::RolledForward { generation: 1 }
    );
    assert_eq!(HistoryLog::new(t.paths()).entries().unwrap().len(), 1);
    assert!(t.store.outstanding_request().unwrap().is_none());
    assert!(!t.paths().journal_file().exists());
}

#[test]
fn test_readers_see_history_for_every_visible_rule() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "bench notes");
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let resolved = t.store.resolve("X", "1.2.5").unwrap();
                    let recorded: HashSet<String> = t
                        .store
                        .timeline(Some("X"), None, usize::MAX)
                        .unwrap()
                        .into_iter()
                        .filter_map(|e| match e {
                            TimelineEvent::Apply(entry) => Some(entry),
                            TimelineEvent::Observation(_) => None,
                        })
                        .flat_map(|entry| entry.changes)
                        .map(|c| c.rule_id)
                        .collect();
                    for rule in &resolved.matched_rules {
                        assert!(recorded.contains(&rule.rule_id), "{} has no history", rule.rule_id);
                    }
                }
            });
        }

        for n in 0..6 {
            let key = format!("n{}", n);
            t.apply(vec![
                RuleUpsert::create(Tier::Profile, "X", "1.2.*", json!({ "step": { key: n } }))
                    .with_rule_id(format!("step-{}", n))
                    .with_provenance([obs.as_str()]),
            ])
            .unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(t.store.resolve("X", "1.2.5").unwrap().matched_rules.len(), 6);
}

#[test]
fn test_apply_times_out_on_held_lock() {
    let t = TestStore::new();
    let obs = t.observe("X", "1.2.5", "baud 9600");
    let request_id = t.prepare();
    let batch = t.batch(&request_id, vec![baud_rule(Tier::Profile, "1.2.*", 9600, &obs)]);

    let holder = StoreLock::new(t.paths().apply_lock(), &t.store.config().lock);
    let guard = holder.acquire("other writer").unwrap();

    let err = t.store.apply(&batch).unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(t.revision_files().is_empty());

    drop(guard);
    t.store.apply(&batch).unwrap();
}

#[cfg(unix)]
#[test]
fn test_interrupted_temp_file_removed_on_recover() {
    let t = TestStore::new();
    // Above the kernel's pid limit, so never a live process.
    let leftover = t.paths().memory_dir.join(".manifest.json.4194305.tmp");
    fs::write(&leftover, "{").unwrap();

    t.store.recover().unwrap();
    assert!(!leftover.exists());
}
