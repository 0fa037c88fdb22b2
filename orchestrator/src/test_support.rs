//! Test-only fakes and fixtures.
//!
//! Every fake keeps its recorded calls behind an `Arc<Mutex<_>>`, so a test
//! can hand a clone to the pipeline and still inspect what happened.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use serde_json::json;

use crate::core::cost::Limits;
use crate::core::test_report::{TestFailure, TestReport};
use crate::core::work_item::{WorkItem, WorkKind};
use crate::io::config::{MergeStrategy, OrchestratorConfig, ProviderConfig};
use crate::io::dispatch::Dispatcher;
use crate::io::host::{CiCheck, Issue, PullRequest, PullRequestDraft, WorkHost};
use crate::io::prompt::PromptEngine;
use crate::io::provider::{Provider, ProviderReply};
use crate::io::test_runner::{TestExecutor, TestScope};
use crate::io::workspace::Workspace;
use crate::stages::{StageContext, keys};

/// Substrings that identify which stage template rendered a prompt.
///
/// Critique and synthesis prompts embed the original task, so they route to
/// the same reply as the task itself.
pub mod markers {
    pub const ANALYZE: &str = "You are triaging";
    pub const PLAN: &str = "You are writing an implementation plan";
    pub const IMPLEMENT: &str = "You are implementing a planned change";
    pub const FAILURE: &str = "A test run failed";
    pub const FIX: &str = "Propose a fix";
    pub const REVIEW: &str = "Review an automated pull request";
}

enum Script {
    Always(String),
    Queue(Mutex<VecDeque<String>>),
    Routed(Vec<(String, String)>),
}

/// Provider replying from a script and recording every prompt it receives.
pub struct ScriptedProvider {
    id: String,
    script: Script,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    /// Replies with `text` to every prompt.
    pub fn always(id: &str, text: impl Into<String>) -> Self {
        Self::with_script(id, Script::Always(text.into()))
    }

    /// Replies in order; errors once the queue is exhausted.
    pub fn new<I, S>(id: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = replies.into_iter().map(Into::into).collect();
        Self::with_script(id, Script::Queue(Mutex::new(queue)))
    }

    /// Replies with the first route whose marker appears in the prompt.
    pub fn routed<I, M, S>(id: &str, routes: I) -> Self
    where
        I: IntoIterator<Item = (M, S)>,
        M: Into<String>,
        S: Into<String>,
    {
        let routes = routes
            .into_iter()
            .map(|(marker, reply)| (marker.into(), reply.into()))
            .collect();
        Self::with_script(id, Script::Routed(routes))
    }

    fn with_script(id: &str, script: Script) -> Self {
        Self {
            id: id.to_string(),
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn query(&self, prompt: &str, _timeout: Duration) -> Result<ProviderReply> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(prompt.to_string());
        let text = match &self.script {
            Script::Always(text) => text.clone(),
            Script::Queue(queue) => queue
                .lock()
                .map_err(|_| anyhow!("queue lock poisoned"))?
                .pop_front()
                .ok_or_else(|| anyhow!("{}: scripted replies exhausted", self.id))?,
            Script::Routed(routes) => routes
                .iter()
                .find(|(marker, _)| prompt.contains(marker.as_str()))
                .map(|(_, reply)| reply.clone())
                .ok_or_else(|| anyhow!("{}: no scripted reply for prompt", self.id))?,
        };
        Ok(ProviderReply::text(text))
    }
}

/// Provider that always errors.
pub struct FailingProvider {
    id: String,
}

impl FailingProvider {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl Provider for FailingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn query(&self, _prompt: &str, _timeout: Duration) -> Result<ProviderReply> {
        bail!("{} is unavailable", self.id)
    }
}

/// Provider that sleeps before replying, ignoring the timeout.
pub struct SlowProvider {
    id: String,
    delay: Duration,
    text: String,
}

impl SlowProvider {
    pub fn new(id: &str, delay: Duration, text: &str) -> Self {
        Self {
            id: id.to_string(),
            delay,
            text: text.to_string(),
        }
    }
}

impl Provider for SlowProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn query(&self, _prompt: &str, _timeout: Duration) -> Result<ProviderReply> {
        let until = Instant::now() + self.delay;
        while Instant::now() < until {
            thread::sleep(Duration::from_millis(10));
        }
        Ok(ProviderReply::text(self.text.clone()))
    }
}

#[derive(Debug, Default)]
struct HostState {
    issues: Vec<Issue>,
    comments: Vec<(u64, String)>,
    pull_requests: Vec<PullRequestDraft>,
    checks: Vec<CiCheck>,
    merged: Vec<(u64, MergeStrategy)>,
}

/// In-memory [`WorkHost`] recording every write.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    state: Arc<Mutex<HostState>>,
}

impl RecordingHost {
    pub fn new(issues: Vec<Issue>) -> Self {
        let host = Self::default();
        host.lock().issues = issues;
        host
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("host state lock")
    }

    /// Checks reported for every pull request.
    pub fn set_checks(&self, checks: Vec<CiCheck>) {
        self.lock().checks = checks;
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.lock().comments.clone()
    }

    pub fn pull_requests(&self) -> Vec<PullRequestDraft> {
        self.lock().pull_requests.clone()
    }

    pub fn merged(&self) -> Vec<(u64, MergeStrategy)> {
        self.lock().merged.clone()
    }
}

/// Pull requests opened by [`RecordingHost`] are numbered from here.
pub const FIRST_PR_NUMBER: u64 = 100;

impl WorkHost for RecordingHost {
    fn list_issues(&self, labels: &[String]) -> Result<Vec<Issue>> {
        Ok(self
            .lock()
            .issues
            .iter()
            .filter(|issue| issue.state == "open")
            .filter(|issue| labels.is_empty() || labels.iter().any(|l| issue.has_label(l)))
            .cloned()
            .collect())
    }

    fn issue(&self, number: u64) -> Result<Issue> {
        self.lock()
            .issues
            .iter()
            .find(|issue| issue.number == number)
            .cloned()
            .ok_or_else(|| anyhow!("issue #{number} not found"))
    }

    fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.lock().comments.push((number, body.to_string()));
        Ok(())
    }

    fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest> {
        let mut state = self.lock();
        let number = FIRST_PR_NUMBER + state.pull_requests.len() as u64;
        state.pull_requests.push(draft.clone());
        Ok(PullRequest {
            number,
            url: format!("https://example.test/pull/{number}"),
        })
    }

    fn ci_checks(&self, _pr: u64) -> Result<Vec<CiCheck>> {
        Ok(self.lock().checks.clone())
    }

    fn merge(&self, pr: u64, strategy: MergeStrategy) -> Result<()> {
        self.lock().merged.push((pr, strategy));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WorkspaceState {
    branch: Option<String>,
    patches: Vec<String>,
    files: BTreeSet<String>,
    commits: Vec<String>,
    published: Vec<String>,
    uncommitted: bool,
    fail_apply: bool,
}

/// In-memory [`Workspace`]; a patch "changes" the files named in its
/// `+++ b/` headers.
#[derive(Debug, Clone, Default)]
pub struct FakeWorkspace {
    state: Arc<Mutex<WorkspaceState>>,
}

impl FakeWorkspace {
    fn lock(&self) -> std::sync::MutexGuard<'_, WorkspaceState> {
        self.state.lock().expect("workspace state lock")
    }

    /// Make every `apply_patch` fail, as a conflicting patch would.
    pub fn fail_apply(&self) {
        self.lock().fail_apply = true;
    }

    pub fn branch(&self) -> Option<String> {
        self.lock().branch.clone()
    }

    pub fn patches(&self) -> Vec<String> {
        self.lock().patches.clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    pub fn published(&self) -> Vec<String> {
        self.lock().published.clone()
    }
}

impl Workspace for FakeWorkspace {
    fn prepare_branch(&self, branch: &str) -> Result<()> {
        self.lock().branch = Some(branch.to_string());
        Ok(())
    }

    fn apply_patch(&self, patch: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_apply {
            bail!("git apply failed: patch does not apply");
        }
        for line in patch.lines() {
            if let Some(path) = line.strip_prefix("+++ b/") {
                state.files.insert(path.trim().to_string());
            }
        }
        state.patches.push(patch.to_string());
        state.uncommitted = true;
        Ok(())
    }

    fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self.lock().files.iter().cloned().collect())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        let mut state = self.lock();
        if !state.uncommitted {
            return Ok(false);
        }
        state.uncommitted = false;
        state.commits.push(message.to_string());
        Ok(true)
    }

    fn publish(&self, branch: &str) -> Result<()> {
        self.lock().published.push(branch.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TestsState {
    reports: VecDeque<TestReport>,
    scopes: Vec<TestScope>,
}

/// [`TestExecutor`] returning queued reports; errors when the queue is empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTests {
    state: Arc<Mutex<TestsState>>,
}

impl ScriptedTests {
    pub fn new(reports: Vec<TestReport>) -> Self {
        let tests = Self::default();
        tests.lock().reports = reports.into();
        tests
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TestsState> {
        self.state.lock().expect("tests state lock")
    }

    pub fn push(&self, report: TestReport) {
        self.lock().reports.push_back(report);
    }

    /// Scopes of every run so far.
    pub fn scopes(&self) -> Vec<TestScope> {
        self.lock().scopes.clone()
    }

    pub fn runs(&self) -> usize {
        self.lock().scopes.len()
    }
}

impl TestExecutor for ScriptedTests {
    fn run(&self, scope: &TestScope) -> Result<TestReport> {
        let mut state = self.lock();
        state.scopes.push(scope.clone());
        state
            .reports
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted test report left"))
    }
}

pub fn green_report(passed: u32) -> TestReport {
    TestReport {
        total: passed,
        passed,
        failed: 0,
        skipped: 0,
        duration_secs: Some(0.5),
        failures: Vec::new(),
    }
}

/// Three passing tests and one failure in `file`.
pub fn red_report(name: &str, file: &str) -> TestReport {
    TestReport {
        total: 4,
        passed: 3,
        failed: 1,
        skipped: 0,
        duration_secs: Some(0.5),
        failures: vec![TestFailure {
            name: name.to_string(),
            file: Some(file.to_string()),
            message: "assertion `left == right` failed".to_string(),
            trace: format!("thread '{name}' panicked at {file}:10:5"),
        }],
    }
}

pub fn issue(number: u64, title: &str, labels: &[&str]) -> Issue {
    Issue {
        number,
        title: title.to_string(),
        body: format!("{title}. Steps to reproduce are in the thread."),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        state: "open".to_string(),
    }
}

/// Defaults with every path under `root` and no stop file.
pub fn test_config(root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        workdir: root.to_path_buf(),
        state_path: root.join(".orchestrator/state.json"),
        runs_dir: root.join(".orchestrator/runs"),
        stop_file: None,
        providers: ["alpha", "beta"]
            .into_iter()
            .map(|id| ProviderConfig {
                id: id.to_string(),
                command: vec!["cat".to_string()],
                input_per_1k: Some(0.0),
                output_per_1k: Some(0.0),
            })
            .collect(),
        ..OrchestratorConfig::default()
    }
}

pub fn test_limits() -> Limits {
    Limits {
        max_cost_usd: 100.0,
        max_calls: 1_000,
    }
}

pub fn analysis_reply(issue_type: &str, complexity: u32, actionable: bool) -> String {
    format!(
        "Issue Type: {issue_type}\n\
         Complexity: {complexity}/10\n\
         Actionable: {}\n\
         \n\
         Key Requirements:\n\
         1. Fall back to defaults when the config file is missing\n\
         2. Keep explicit settings working\n\
         \n\
         Affected Files:\n\
         - src/config.rs\n\
         \n\
         Risks:\n\
         - Silent misconfiguration\n\
         \n\
         Recommended Approach: Treat a missing file as the default configuration.\n",
        if actionable { "yes" } else { "no" }
    )
}

pub fn plan_reply() -> String {
    "Files to Modify:\n\
     - src/config.rs\n\
     \n\
     Files to Create:\n\
     - tests/missing_config.rs\n\
     \n\
     Implementation Steps:\n\
     1. Detect a missing config file\n\
     2. Return the default configuration\n\
     3. Add a regression test\n\
     \n\
     Test Strategy: Run the binary in an empty directory.\n\
     \n\
     Validation Criteria:\n\
     - Starting without a config file succeeds\n\
     \n\
     Complexity: 3/10\n"
        .to_string()
}

/// A reply whose patch touches `path`.
pub fn implementation_reply(path: &str) -> String {
    format!(
        "Summary: Fall back to defaults when the config file is missing.\n\
         \n\
         Files Changed:\n\
         - {path}\n\
         \n\
         ```diff\n\
         --- a/{path}\n\
         +++ b/{path}\n\
         @@ -1 +1 @@\n\
         -fail\n\
         +default\n\
         ```\n\
         \n\
         Confidence: 0.8\n"
    )
}

pub fn failure_reply() -> String {
    "Root Cause: The fallback returns an error instead of the defaults.\n\
     Failure Category: assertion_error\n\
     Related Files:\n\
     - src/config.rs\n\
     Confidence: 0.7\n"
        .to_string()
}

pub fn fix_reply(success_probability: f64) -> String {
    format!(
        "Recommended Fix: Return the default configuration when the file is absent.\n\
         Files to Modify:\n\
         - src/config.rs\n\
         \n\
         ```diff\n\
         --- a/src/config.rs\n\
         +++ b/src/config.rs\n\
         @@ -1 +1 @@\n\
         -error\n\
         +default\n\
         ```\n\
         \n\
         Success Probability: {success_probability}\n\
         Rationale: The failing assertion expects the defaults.\n"
    )
}

pub fn review_reply(approve: bool) -> String {
    format!(
        "Decision: {}\n\
         Summary: Small, targeted change with a regression test.\n\
         Concerns:\n\
         - None\n",
        if approve { "approve" } else { "request changes" }
    )
}

/// Routes for a provider that answers every stage the same way.
pub fn stage_routes(
    analysis: String,
    fix_probability: f64,
    approve: bool,
) -> Vec<(&'static str, String)> {
    vec![
        (markers::ANALYZE, analysis),
        (markers::PLAN, plan_reply()),
        (markers::IMPLEMENT, implementation_reply("src/config.rs")),
        (markers::FAILURE, failure_reply()),
        (markers::FIX, fix_reply(fix_probability)),
        (markers::REVIEW, review_reply(approve)),
    ]
}

/// Everything a single stage needs, backed by fakes and a temp directory.
pub struct StageFixture {
    pub config: OrchestratorConfig,
    pub dispatcher: Dispatcher,
    pub prompts: PromptEngine,
    pub host: RecordingHost,
    pub workspace: FakeWorkspace,
    pub tests: ScriptedTests,
    _temp: tempfile::TempDir,
}

impl StageFixture {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        Self {
            config: test_config(temp.path()),
            dispatcher: Dispatcher::new(providers, test_limits()),
            prompts: PromptEngine::new(),
            host: RecordingHost::default(),
            workspace: FakeWorkspace::default(),
            tests: ScriptedTests::default(),
            _temp: temp,
        }
    }

    /// One [`ScriptedProvider::always`] per `(id, reply)`.
    pub fn with_replies(replies: &[(&str, String)]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|(id, text)| {
                    Arc::new(ScriptedProvider::always(id, text.clone())) as Arc<dyn Provider>
                })
                .collect(),
        )
    }

    pub fn runs_dir(&self) -> &Path {
        &self.config.runs_dir
    }

    pub fn issue_item(&self, number: u64, title: &str) -> WorkItem {
        let mut item = WorkItem::new(WorkKind::Issue, &number.to_string(), Utc::now());
        item.metadata.insert(keys::TITLE.to_string(), json!(title));
        item.metadata
            .insert(keys::BODY.to_string(), json!(format!("{title}, reported by a user.")));
        item.metadata.insert(keys::LABELS.to_string(), json!(["bug"]));
        item
    }

    pub fn context(&mut self) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            dispatcher: &mut self.dispatcher,
            prompts: &self.prompts,
            host: &self.host,
            workspace: &self.workspace,
            tests: &self.tests,
            deadline: Instant::now() + Duration::from_secs(30),
            checkpoints: Default::default(),
        }
    }
}
