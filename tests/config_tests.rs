use std::fs;

use tempfile::TempDir;

use embedded_memory::MemoryError;
use embedded_memory::config::{CONFIG_FILE, MemoryConfig};
use embedded_memory::rules::Tier;

#[test]
fn test_default_config() {
    let config = MemoryConfig::default();

    assert!((config.policy.min_confidence_profile - 0.85).abs() < f64::EPSILON);
    assert!((config.policy.min_confidence_override - 0.80).abs() < f64::EPSILON);
    assert!(!config.policy.include_candidates);

    assert_eq!(config.lock.wait_ms, 5_000);
    assert_eq!(config.lock.retry_delay_ms, 100);
    assert_eq!(config.lock.stale_threshold_secs, 600);

    assert_eq!(config.prepare.observation_limit, 200);
}

#[test]
fn test_thresholds_per_tier() {
    let config = MemoryConfig::default();

    assert_eq!(config.policy.threshold(Tier::Profile), Some(0.85));
    assert_eq!(config.policy.threshold(Tier::Override), Some(0.80));
    assert_eq!(config.policy.threshold(Tier::Candidate), None);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = MemoryConfig::load(dir.path()).unwrap();
    assert_eq!(config.lock.wait_ms, 5_000);
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILE),
        "[policy]\nmin_confidence_override = 0.5\n\n[lock]\nwait_ms = 250\n",
    )
    .unwrap();

    let config = MemoryConfig::load(dir.path()).unwrap();
    assert!((config.policy.min_confidence_override - 0.5).abs() < f64::EPSILON);
    assert!((config.policy.min_confidence_profile - 0.85).abs() < f64::EPSILON);
    assert_eq!(config.lock.wait_ms, 250);
    assert_eq!(config.lock.retry_delay_ms, 100);
}

#[test]
fn test_out_of_range_values_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILE),
        "[policy]\nmin_confidence_profile = 1.5\n\n[prepare]\nobservation_limit = 0\n",
    )
    .unwrap();

    match MemoryConfig::load(dir.path()) {
        Err(MemoryError::Config(message)) => {
            assert!(message.contains("min_confidence_profile"));
            assert!(message.contains("observation_limit"));
        }
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(CONFIG_FILE), "[policy\n").unwrap();

    assert!(matches!(
        MemoryConfig::load(dir.path()),
        Err(MemoryError::Toml(_))
    ));
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let mut config = MemoryConfig::default();
    config.policy.include_candidates = true;
    config.prepare.observation_limit = 25;

    config.save(dir.path()).unwrap();
    let loaded = MemoryConfig::load(dir.path()).unwrap();

    assert!(loaded.policy.include_candidates);
    assert_eq!(loaded.prepare.observation_limit, 25);
}
