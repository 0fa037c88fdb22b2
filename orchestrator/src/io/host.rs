//! Issue / pull-request host.
//!
//! [`WorkHost`] is the seam the pipeline talks through; [`GhHost`] implements
//! it with the GitHub CLI and its `--json` output.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::config::{HostConfig, MergeStrategy};
use crate::io::process::{command_from_argv, run_command_with_timeout};

const HOST_OUTPUT_LIMIT: usize = 1_000_000;
const LIST_LIMIT: &str = "100";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// `open` or `closed`.
    pub state: String,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiCheck {
    pub name: String,
    /// `queued`, `in_progress` or `completed`.
    pub status: String,
    /// Set once the check completed: `success`, `failure`, `neutral`, ...
    pub conclusion: Option<String>,
}

impl CiCheck {
    pub fn is_failing(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("failure" | "cancelled" | "timed_out" | "action_required" | "error")
        )
    }

    pub fn is_pending(&self) -> bool {
        self.status != "completed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

pub trait WorkHost {
    /// Open issues carrying any of `labels` (all open issues when empty).
    fn list_issues(&self, labels: &[String]) -> Result<Vec<Issue>>;
    fn issue(&self, number: u64) -> Result<Issue>;
    fn comment(&self, number: u64, body: &str) -> Result<()>;
    fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest>;
    fn ci_checks(&self, pr: u64) -> Result<Vec<CiCheck>>;
    fn merge(&self, pr: u64, strategy: MergeStrategy) -> Result<()>;
}

/// GitHub via the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhHost {
    command: Vec<String>,
    repo: Option<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl GhHost {
    pub fn new(cfg: &HostConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: cfg.command.clone(),
            repo: cfg.repo.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = command_from_argv(&self.command, Some(&self.workdir))?;
        cmd.args(args);
        if let Some(repo) = &self.repo {
            cmd.args(["--repo", repo]);
        }
        let label = format!("{} {}", self.command.join(" "), args.join(" "));
        let output = run_command_with_timeout(
            cmd,
            stdin.map(str::as_bytes),
            self.timeout,
            HOST_OUTPUT_LIMIT,
        )
        .with_context(|| format!("run {label}"))?;
        if output.timed_out {
            bail!("{label} timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!("{label} failed: {}", output.stderr_text().trim());
        }
        Ok(output.stdout_text())
    }
}

const ISSUE_FIELDS: &str = "number,title,body,labels,state";

impl WorkHost for GhHost {
    #[instrument(skip_all, fields(labels = labels.len()))]
    fn list_issues(&self, labels: &[String]) -> Result<Vec<Issue>> {
        let base = [
            "issue", "list", "--state", "open", "--json", ISSUE_FIELDS, "--limit", LIST_LIMIT,
        ];
        // `--label` given twice means "both"; any-of needs one query per label.
        let mut issues: Vec<Issue> = Vec::new();
        if labels.is_empty() {
            issues = parse_issue_list(&self.run(&base, None)?)?;
        }
        for label in labels {
            let mut args = base.to_vec();
            args.extend(["--label", label.as_str()]);
            for issue in parse_issue_list(&self.run(&args, None)?)? {
                if !issues.iter().any(|known| known.number == issue.number) {
                    issues.push(issue);
                }
            }
        }
        issues.sort_by_key(|issue| issue.number);
        debug!(count = issues.len(), "listed issues");
        Ok(issues)
    }

    fn issue(&self, number: u64) -> Result<Issue> {
        let number = number.to_string();
        let raw = self.run(&["issue", "view", &number, "--json", ISSUE_FIELDS], None)?;
        let gh: GhIssue = serde_json::from_str(&raw).context("parse gh issue view")?;
        Ok(gh.into())
    }

    fn comment(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.run(&["issue", "comment", &number, "--body-file", "-"], Some(body))?;
        Ok(())
    }

    #[instrument(skip_all, fields(head = %draft.head))]
    fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            draft.title.as_str(),
            "--body-file",
            "-",
            "--head",
            draft.head.as_str(),
            "--base",
            draft.base.as_str(),
        ];
        for label in &draft.labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.run(&args, Some(&draft.body))?;
        parse_pull_request_url(&out)
    }

    fn ci_checks(&self, pr: u64) -> Result<Vec<CiCheck>> {
        let pr = pr.to_string();
        let raw = self.run(&["pr", "view", &pr, "--json", "statusCheckRollup"], None)?;
        parse_check_rollup(&raw)
    }

    fn merge(&self, pr: u64, strategy: MergeStrategy) -> Result<()> {
        let pr = pr.to_string();
        let flag = format!("--{}", strategy.as_str());
        self.run(&["pr", "merge", &pr, &flag, "--delete-branch"], None)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    state: String,
}

impl From<GhIssue> for Issue {
    fn from(gh: GhIssue) -> Self {
        Self {
            number: gh.number,
            title: gh.title,
            body: gh.body.unwrap_or_default(),
            labels: gh.labels.into_iter().map(|l| l.name).collect(),
            state: gh.state.to_ascii_lowercase(),
        }
    }
}

fn parse_issue_list(raw: &str) -> Result<Vec<Issue>> {
    let issues: Vec<GhIssue> = serde_json::from_str(raw).context("parse gh issue list")?;
    Ok(issues.into_iter().map(Issue::from).collect())
}

/// `gh pr create` prints the new PR URL, ending in `/pull/<n>`.
fn parse_pull_request_url(out: &str) -> Result<PullRequest> {
    let url = out
        .lines()
        .map(str::trim)
        .rfind(|line| line.contains("/pull/"))
        .ok_or_else(|| anyhow!("no pull request url in gh output: {}", out.trim()))?;
    let number = url
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("pull request url has no number: {url}"))?;
    Ok(PullRequest {
        number,
        url: url.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRollup {
    #[serde(default)]
    status_check_rollup: Vec<GhCheck>,
}

/// Check runs carry name/status/conclusion; legacy status contexts carry context/state.
#[derive(Debug, Deserialize)]
struct GhCheck {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

fn parse_check_rollup(raw: &str) -> Result<Vec<CiCheck>> {
    let rollup: GhRollup = serde_json::from_str(raw).context("parse gh status check rollup")?;
    Ok(rollup
        .status_check_rollup
        .into_iter()
        .map(|check| {
            let name = check.name.or(check.context).unwrap_or_default();
            let (status, conclusion) = match (check.status, check.state) {
                (Some(status), _) => (
                    status.to_ascii_lowercase(),
                    check
                        .conclusion
                        .filter(|c| !c.is_empty())
                        .map(|c| c.to_ascii_lowercase()),
                ),
                (None, Some(state)) => {
                    let state = state.to_ascii_lowercase();
                    if state == "pending" || state == "expected" {
                        ("in_progress".to_string(), None)
                    } else {
                        ("completed".to_string(), Some(state))
                    }
                }
                (None, None) => ("completed".to_string(), None),
            };
            CiCheck {
                name,
                status,
                conclusion,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_list_labels() {
        let raw = r#"[{"number":10,"title":"Crash","body":null,"labels":[{"name":"bug"},{"name":"bot-approved"}],"state":"OPEN"}]"#;
        let issues = parse_issue_list(raw).expect("parse");
        assert_eq!(issues[0].number, 10);
        assert_eq!(issues[0].body, "");
        assert_eq!(issues[0].state, "open");
        assert!(issues[0].has_label("BOT-APPROVED"));
    }

    #[test]
    fn parses_pr_number_from_url() {
        let pr =
            parse_pull_request_url("Creating pull request...\nhttps://github.com/o/r/pull/42\n")
                .expect("parse");
        assert_eq!(pr.number, 42);
        assert!(parse_pull_request_url("nothing").is_err());
    }

    #[test]
    fn normalizes_check_runs_and_status_contexts() {
        let raw = r#"{"statusCheckRollup":[
            {"__typename":"CheckRun","name":"ci","status":"COMPLETED","conclusion":"FAILURE"},
            {"__typename":"CheckRun","name":"lint","status":"IN_PROGRESS","conclusion":""},
            {"__typename":"StatusContext","context":"legacy","state":"SUCCESS"}
        ]}"#;
        let checks = parse_check_rollup(raw).expect("parse");
        assert!(checks[0].is_failing());
        assert!(checks[1].is_pending());
        assert_eq!(checks[1].conclusion, None);
        assert_eq!(checks[2].name, "legacy");
        assert_eq!(checks[2].conclusion.as_deref(), Some("success"));
        assert!(!checks[2].is_failing());
    }
}
