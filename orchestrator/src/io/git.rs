//! Git adapter for the delivery workspace.
//!
//! Every call goes through [`run_command_with_timeout`]; branch, apply,
//! commit and push are the only write operations the orchestrator performs.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);
const OUTPUT_LIMIT: usize = 100_000;

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Current branch name; a detached HEAD is an error.
    pub fn current_branch(&self) -> Result<String> {
        let name = self.stdout(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = name.trim();
        if name == "HEAD" {
            bail!("detached HEAD in {}", self.workdir.display());
        }
        Ok(name.to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = self.exec(
            &["show-ref", "--verify", "--quiet", &reference],
            None,
            LOCAL_TIMEOUT,
        )?;
        Ok(output.success())
    }

    /// Check out `branch`; with `create`, start it at the current HEAD.
    #[instrument(skip_all, fields(branch, create))]
    pub fn checkout(&self, branch: &str, create: bool) -> Result<()> {
        let mut args = vec!["checkout"];
        if create {
            args.push("-b");
        }
        args.push(branch);
        self.checked(&args, None, LOCAL_TIMEOUT).map(drop)
    }

    /// Apply a unified diff to the worktree.
    #[instrument(skip_all, fields(bytes = patch.len()))]
    pub fn apply(&self, patch: &str) -> Result<()> {
        let mut input = patch.to_string();
        if !input.ends_with('\n') {
            input.push('\n');
        }
        self.checked(
            &["apply", "--whitespace=nowarn", "-"],
            Some(input.as_bytes()),
            LOCAL_TIMEOUT,
        )
        .map(drop)
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let out = self.stdout(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out.lines().filter_map(porcelain_path).collect())
    }

    /// Stage everything and commit; `Ok(false)` when nothing was staged.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.checked(&["add", "-A"], None, LOCAL_TIMEOUT)?;
        let staged = self.stdout(&["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            debug!("nothing staged; skipping commit");
            return Ok(false);
        }
        self.checked(&["commit", "-m", message], None, LOCAL_TIMEOUT)?;
        Ok(true)
    }

    /// Files changed on HEAD since it forked from `base`, plus dirty paths, sorted.
    pub fn changed_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}...HEAD");
        let diff = self.exec(&["diff", "--name-only", &range], None, LOCAL_TIMEOUT)?;
        let mut files: Vec<String> = if diff.success() {
            diff.stdout_text()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        files.extend(self.dirty_paths()?);
        files.sort();
        files.dedup();
        Ok(files)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_upstream(&self, remote: &str, branch: &str) -> Result<()> {
        self.checked(&["push", "-u", remote, branch], None, PUSH_TIMEOUT)
            .map(drop)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        Ok(self.checked(args, None, LOCAL_TIMEOUT)?.stdout_text())
    }

    fn checked(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let output = self.exec(args, stdin, timeout)?;
        if output.timed_out {
            bail!("git {} timed out after {}s", args.join(" "), timeout.as_secs());
        }
        if !output.success() {
            bail!("git {} failed: {}", args.join(" "), output.stderr_text().trim());
        }
        Ok(output)
    }

    fn exec(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, stdin, timeout, OUTPUT_LIMIT)
            .with_context(|| format!("run git {}", args.join(" ")))
    }
}

/// The path a `git status --porcelain=v1` line refers to (the new name for renames).
fn porcelain_path(line: &str) -> Option<String> {
    let path = line.get(3..)?.trim();
    let path = path.split_once(" -> ").map_or(path, |(_, new)| new);
    (!path.is_empty()).then(|| path.to_string())
}
