//! Work items and their append-only history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{Stage, WorkState};
use super::types::ConsensusResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Issue,
    Pr,
    Roadmap,
}

impl WorkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Roadmap => "roadmap",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "issue" => Ok(Self::Issue),
            "pr" => Ok(Self::Pr),
            "roadmap" => Ok(Self::Roadmap),
            other => Err(anyhow!("unknown work kind '{other}'")),
        }
    }
}

/// Registry key: `kind:id`.
pub fn work_key(kind: WorkKind, id: &str) -> String {
    format!("{kind}:{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Rejected,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Result of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    /// Absent when the stage never reached reconciliation.
    pub consensus: Option<ConsensusResult>,
    pub reason: Option<String>,
    /// Metadata the controller merges into the item when the outcome is recorded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Value>,
}

impl StageOutcome {
    pub fn passed(stage: Stage, consensus: Option<ConsensusResult>) -> Self {
        Self {
            stage,
            status: StageStatus::Passed,
            consensus,
            reason: None,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn rejected(stage: Stage, consensus: Option<ConsensusResult>, reason: String) -> Self {
        Self {
            stage,
            status: StageStatus::Rejected,
            consensus,
            reason: Some(reason),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn failed(stage: Stage, reason: String) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            consensus: None,
            reason: Some(reason),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_artifact(mut self, key: &str, value: Value) -> Self {
        self.artifacts.insert(key.to_string(), value);
        self
    }

    pub fn confidence(&self) -> Option<f64> {
        self.consensus.as_ref().map(|c| c.confidence)
    }
}

/// A stage outcome as recorded in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub at: DateTime<Utc>,
    /// 1-based attempt number of this stage for the item.
    pub attempt: u32,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: WorkState,
    pub to: WorkState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkKind,
    pub id: String,
    pub state: WorkState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub error: Option<String>,
    /// Failed attempts of the current stage.
    pub retry_count: u32,
    /// Fix attempts made since the item was claimed.
    pub fix_attempts: u32,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub outcomes: Vec<StageEntry>,
}

impl WorkItem {
    pub fn new(kind: WorkKind, id: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            id: id.to_string(),
            state: WorkState::Pending,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            error: None,
            retry_count: 0,
            fix_attempts: 0,
            transitions: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        work_key(self.kind, &self.id)
    }

    /// How many times `stage` has produced an outcome.
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.outcomes
            .iter()
            .filter(|entry| entry.outcome.stage == stage)
            .count() as u32
    }

    /// Most recent consensus produced by `stage`, if any.
    pub fn last_consensus(&self, stage: Stage) -> Option<&ConsensusResult> {
        self.outcomes
            .iter()
            .rev()
            .map(|entry| &entry.outcome)
            .filter(|outcome| outcome.stage == stage)
            .find_map(|outcome| outcome.consensus.as_ref())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_kind_and_id() {
        let item = WorkItem::new(WorkKind::Issue, "10", Utc::now());
        assert_eq!(item.key(), "issue:10");
        assert_eq!(item.state, WorkState::Pending);
    }

    #[test]
    fn kind_parses_known_names() {
        assert_eq!("pr".parse::<WorkKind>().expect("parse"), WorkKind::Pr);
        assert!("epic".parse::<WorkKind>().is_err());
    }

    #[test]
    fn attempts_count_per_stage() {
        let now = Utc::now();
        let mut item = WorkItem::new(WorkKind::Issue, "1", now);
        for (stage, n) in [(Stage::Test, 1), (Stage::Fix, 1), (Stage::Test, 2)] {
            item.outcomes.push(StageEntry {
                at: now,
                attempt: n,
                outcome: StageOutcome::failed(stage, "boom".to_string()),
            });
        }
        assert_eq!(item.attempts(Stage::Test), 2);
        assert_eq!(item.attempts(Stage::Fix), 1);
        assert_eq!(item.attempts(Stage::Deliver), 0);
    }
}
