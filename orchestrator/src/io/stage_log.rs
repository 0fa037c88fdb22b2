//! Stage attempt artifacts under `<runs_dir>/<kind>-<id>/`.
//!
//! Every dispatch a stage makes is written here (prompt, raw dispatch
//! result, consensus) regardless of `RUST_LOG`. The directory name carries a
//! sequence number so repeated attempts of a stage never overwrite each other.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::state::Stage;
use crate::core::types::{ConsensusResult, DispatchResult};
use crate::core::work_item::{StageOutcome, WorkItem};

#[derive(Debug, Clone)]
pub struct StageLogPaths {
    pub dir: PathBuf,
}

impl StageLogPaths {
    /// `seq` is the 1-based position of this attempt in the item's history.
    pub fn new(runs_dir: &Path, item: &WorkItem, seq: usize, stage: Stage) -> Self {
        let dir = runs_dir
            .join(format!("{}-{}", item.kind, sanitize(&item.id)))
            .join(format!("{seq:03}-{stage}"));
        Self { dir }
    }

    /// Directory for `label` (`analysis`, `failure`, ...) inside this attempt.
    pub fn dispatch_dir(&self, label: &str) -> PathBuf {
        self.dir.join(label)
    }

    pub fn outcome_path(&self) -> PathBuf {
        self.dir.join("outcome.json")
    }
}

/// Writes artifacts for one stage attempt.
#[derive(Debug, Clone)]
pub struct StageLog {
    paths: StageLogPaths,
}

impl StageLog {
    pub fn new(runs_dir: &Path, item: &WorkItem, stage: Stage) -> Self {
        Self {
            paths: StageLogPaths::new(runs_dir, item, item.outcomes.len() + 1, stage),
        }
    }

    pub fn paths(&self) -> &StageLogPaths {
        &self.paths
    }

    pub fn write_dispatch(
        &self,
        label: &str,
        prompt: &str,
        result: &DispatchResult,
        consensus: Option<&ConsensusResult>,
    ) -> Result<PathBuf> {
        let dir = self.paths.dispatch_dir(label);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create stage log dir {}", dir.display()))?;

        // Write in deterministic order to keep logs stable.
        write_text(&dir.join("prompt.md"), prompt)?;
        write_json(&dir.join("dispatch.json"), result)?;
        if let Some(consensus) = consensus {
            write_json(&dir.join("consensus.json"), consensus)?;
        }
        Ok(dir)
    }

    pub fn write_outcome(&self, outcome: &StageOutcome) -> Result<()> {
        fs::create_dir_all(&self.paths.dir)
            .with_context(|| format!("create stage log dir {}", self.paths.dir.display()))?;
        write_json(&self.paths.outcome_path(), outcome)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.paths.dir)
            .with_context(|| format!("create stage log dir {}", self.paths.dir.display()))?;
        write_text(&self.paths.dir.join(name), contents)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::types::Strategy;
    use crate::core::work_item::WorkKind;

    #[test]
    fn stage_log_paths_are_stable() {
        let item = WorkItem::new(WorkKind::Roadmap, "q3/cache", Utc::now());
        let paths = StageLogPaths::new(Path::new("/runs"), &item, 4, Stage::Fix);
        assert!(paths.dir.ends_with("roadmap-q3_cache/004-fix"));
        assert!(paths.outcome_path().ends_with("004-fix/outcome.json"));
    }

    #[test]
    fn writes_dispatch_and_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let item = WorkItem::new(WorkKind::Issue, "10", Utc::now());
        let log = StageLog::new(temp.path(), &item, Stage::Analyze);
        let result =
            DispatchResult::failed(Strategy::All, vec!["a".to_string()], "down".to_string());

        let dir = log
            .write_dispatch("analysis", "prompt text", &result, None)
            .expect("write dispatch");
        assert_eq!(fs::read_to_string(dir.join("prompt.md")).expect("read"), "prompt text");
        assert!(dir.join("dispatch.json").is_file());
        assert!(!dir.join("consensus.json").exists());

        log.write_outcome(&StageOutcome::failed(Stage::Analyze, "down".to_string()))
            .expect("write outcome");
        assert!(log.paths().outcome_path().is_file());
        assert!(log.paths().dir.ends_with("issue-10/001-analyze"));
    }
}
