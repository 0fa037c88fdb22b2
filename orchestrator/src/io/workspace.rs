//! Local checkout the pipeline edits and delivers from.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::io::git::Git;

pub trait Workspace {
    /// Check out `branch`, creating it from the base branch if needed.
    fn prepare_branch(&self, branch: &str) -> Result<()>;
    fn apply_patch(&self, patch: &str) -> Result<()>;
    /// Paths changed relative to the base branch, sorted.
    fn changed_files(&self) -> Result<Vec<String>>;
    /// Stage everything and commit; `Ok(false)` when there was nothing to commit.
    fn commit(&self, message: &str) -> Result<bool>;
    fn publish(&self, branch: &str) -> Result<()>;
}

/// [`Workspace`] over a git checkout.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    git: Git,
    base_branch: String,
    remote: String,
}

impl GitWorkspace {
    pub fn new(workdir: &Path, base_branch: &str, remote: &str) -> Self {
        Self {
            git: Git::new(workdir),
            base_branch: base_branch.to_string(),
            remote: remote.to_string(),
        }
    }
}

impl Workspace for GitWorkspace {
    fn prepare_branch(&self, branch: &str) -> Result<()> {
        if self.git.current_branch()? == branch {
            debug!(branch, "already on work branch");
            return Ok(());
        }
        if self.git.branch_exists(branch)? {
            return self.git.checkout(branch, false);
        }
        if !self.git.dirty_paths()?.is_empty() {
            bail!("working tree not clean; refusing to start branch {branch}");
        }
        self.git.checkout(&self.base_branch, false)?;
        self.git.checkout(branch, true)
    }

    fn apply_patch(&self, patch: &str) -> Result<()> {
        if patch.trim().is_empty() {
            bail!("patch is empty");
        }
        self.git.apply(patch)
    }

    fn changed_files(&self) -> Result<Vec<String>> {
        self.git.changed_since(&self.base_branch)
    }

    fn commit(&self, message: &str) -> Result<bool> {
        self.git.commit_all(message)
    }

    fn publish(&self, branch: &str) -> Result<()> {
        info!(branch, remote = %self.remote, "publishing branch");
        self.git.push_upstream(&self.remote, branch)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::process::Command;

    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?}");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "bot@example.com"]);
        git(dir, &["config", "user.name", "bot"]);
        fs::write(dir.join("lib.txt"), "one\n").expect("write");
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn branch_patch_commit_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let ws = GitWorkspace::new(temp.path(), "main", "origin");

        ws.prepare_branch("orchestrator/issue-1-fix").expect("branch");
        let patch = "--- a/lib.txt\n+++ b/lib.txt\n@@ -1 +1 @@\n-one\n+two\n";
        ws.apply_patch(patch).expect("apply");
        assert_eq!(fs::read_to_string(temp.path().join("lib.txt")).expect("read"), "two\n");
        assert_eq!(ws.changed_files().expect("changed"), vec!["lib.txt"]);

        assert!(ws.commit("change").expect("commit"));
        assert!(!ws.commit("again").expect("nothing to commit"));
        assert_eq!(ws.changed_files().expect("changed"), vec!["lib.txt"]);

        ws.prepare_branch("orchestrator/issue-1-fix").expect("idempotent");
    }

    #[test]
    fn bad_patch_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let ws = GitWorkspace::new(temp.path(), "main", "origin");
        let err = ws
            .apply_patch("--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-x\n+y\n")
            .expect_err("does not apply");
        assert!(format!("{err:#}").contains("git apply"));
        assert!(ws.apply_patch("  ").is_err());
    }
}
