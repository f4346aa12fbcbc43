use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Chat,
    Analysis,
    Report,
    System,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Analysis => "analysis",
            Self::Report => "report",
            Self::System => "system",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "analysis" => Ok(Self::Analysis),
            "report" => Ok(Self::Report),
            "system" => Ok(Self::System),
            other => Err(format!(
                "unknown source '{}' (expected chat, analysis, report, or system)",
                other
            )),
        }
    }
}

/// Immutable evidence record as stored in a JSONL ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub model_id: String,
    pub fw_version: String,
    pub source: SourceKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Evidence to append; the store assigns the id unless one is given.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub id: Option<String>,
    pub run_id: Option<String>,
    pub model_id: String,
    pub fw_version: String,
    pub source: SourceKind,
    pub content: String,
    pub instance_id: Option<String>,
}

impl NewObservation {
    pub fn new(
        model_id: impl Into<String>,
        fw_version: impl Into<String>,
        source: SourceKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            run_id: None,
            model_id: model_id.into(),
            fw_version: fw_version.into(),
            source,
            content: content.into(),
            instance_id: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub(crate) fn into_observation(self, id: String, created_at: DateTime<Utc>) -> Observation {
        Observation {
            id,
            run_id: self.run_id,
            model_id: self.model_id,
            fw_version: self.fw_version,
            source: self.source,
            content: self.content,
            created_at,
            instance_id: self.instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("Chat".parse::<SourceKind>(), Ok(SourceKind::Chat));
        assert_eq!("system".parse::<SourceKind>(), Ok(SourceKind::System));
        assert!("email".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_observation_json_omits_empty_options() {
        let obs = NewObservation::new("X", "1.2.5", SourceKind::Report, "baud is 9600")
            .into_observation("default-000001".into(), Utc::now());
        let json = serde_json::to_string(&obs).unwrap();

        assert!(json.contains(r#""source":"report""#));
        assert!(!json.contains("run_id"));
        assert!(!json.contains("instance_id"));
    }
}
