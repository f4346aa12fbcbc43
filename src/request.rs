//! Outstanding compile request.
//!
//! `prepare` snapshots recent evidence for the external producer and records
//! the request id the next change batch must carry.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::{PolicyConfig, StorePaths};
use crate::error::{Result, corruption_with};
use crate::evidence::{EvidenceStore, Observation};
use crate::utils::write_atomic;

const PRODUCER_NOTE: &str = "Reply with a single JSON change batch: request_id, upserts \
(action, tier, rule_id, model_id, fw_selector, priority, confidence, facts, \
provenance.observation_ids) and provenance_summary.observation_ids_used covering every cited id.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub request_id: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub policy: PolicyConfig,
    pub observation_ids: Vec<String>,
    pub observations: Vec<Observation>,
    pub note: String,
}

pub struct RequestLedger {
    paths: StorePaths,
}

impl RequestLedger {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// Issue a fresh request, replacing any outstanding one.
    ///
    /// The caller holds the apply lock.
    pub fn prepare(
        &self,
        evidence: &EvidenceStore,
        policy: &PolicyConfig,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<CompileRequest> {
        let observations = evidence.latest(run_id, limit)?;
        let request = CompileRequest {
            request_id: Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            run_id: run_id.map(str::to_string),
            policy: policy.clone(),
            observation_ids: observations.iter().map(|o| o.id.clone()).collect(),
            observations,
            note: PRODUCER_NOTE.to_string(),
        };

        write_atomic(
            &self.paths.request_file(),
            serde_json::to_string_pretty(&request)?.as_bytes(),
        )?;
        info!(
            request_id = %request.request_id,
            observations = request.observations.len(),
            "Compile request prepared"
        );
        Ok(request)
    }

    pub fn outstanding(&self) -> Result<Option<CompileRequest>> {
        let path = self.paths.request_file();
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| corruption_with("compile request", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the outstanding request if it is `request_id`.
    pub fn consume(&self, request_id: &str) -> Result<()> {
        if let Some(current) = self.outstanding()?
            && current.request_id == request_id
        {
            remove_if_exists(&self.paths.request_file())?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
