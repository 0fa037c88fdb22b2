//! Drive one work item through the stage graph.
//!
//! [`Pipeline`] owns the registry and every seam a stage talks through. Each
//! stage attempt is persisted before the next one starts, so a crash or a
//! halt at any point leaves an item that `process` can pick up again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::core::cost::LimitExceeded;
use crate::core::metrics::PipelineMetrics;
use crate::core::state::{Event, Stage, WorkState};
use crate::core::work_item::{StageOutcome, StageStatus, WorkItem, WorkKind, work_key};
use crate::io::config::{OrchestratorConfig, PipelineConfig};
use crate::io::dispatch::Dispatcher;
use crate::io::host::{GhHost, Issue, WorkHost};
use crate::io::prompt::PromptEngine;
use crate::io::provider::build_providers;
use crate::io::registry::{Claim, WorkRegistry, WorkUpdate};
use crate::io::stage_log::StageLog;
use crate::io::test_runner::{CommandTestExecutor, TestExecutor};
use crate::io::workspace::{GitWorkspace, Workspace};
use crate::stages::{StageContext, handler_for, keys};

/// Cooperative stop request, raised by Ctrl-C or by creating the stop file.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    file: Option<PathBuf>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            file: Some(path.into()),
        }
    }

    /// The shared flag, for signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.file.as_deref().is_some_and(Path::exists)
    }
}

/// How a call to [`Pipeline::process`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The item reached a terminal state.
    Finished(WorkState),
    /// A stop was requested; the item waits in this state.
    Stopped(WorkState),
}

impl ProcessOutcome {
    pub fn state(self) -> WorkState {
        match self {
            ProcessOutcome::Finished(state) | ProcessOutcome::Stopped(state) => state,
        }
    }
}

pub struct Pipeline {
    config: OrchestratorConfig,
    registry: WorkRegistry,
    dispatcher: Dispatcher,
    prompts: PromptEngine,
    host: Box<dyn WorkHost>,
    workspace: Box<dyn Workspace>,
    tests: Box<dyn TestExecutor>,
    stop: StopSignal,
    metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn new(
        config: OrchestratorConfig,
        registry: WorkRegistry,
        dispatcher: Dispatcher,
        host: Box<dyn WorkHost>,
        workspace: Box<dyn Workspace>,
        tests: Box<dyn TestExecutor>,
    ) -> Self {
        Self {
            config,
            registry,
            dispatcher,
            prompts: PromptEngine::new(),
            host,
            workspace,
            tests,
            stop: StopSignal::new(),
            metrics: PipelineMetrics::default(),
        }
    }

    /// Wire the production seams: command providers, `gh`, git and the test command.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let registry = WorkRegistry::open(&config.state_path)
            .with_context(|| format!("open state {}", config.state_path.display()))?;
        let mut dispatcher = Dispatcher::new(build_providers(&config), config.safety.limits());
        for provider in &config.providers {
            dispatcher = dispatcher.with_price(&provider.id, provider.price());
        }
        let host = GhHost::new(&config.host, &config.workdir);
        let workspace = GitWorkspace::new(
            &config.workdir,
            &config.host.base_branch,
            &config.host.remote,
        );
        let tests = CommandTestExecutor::new(&config.tests, &config.workdir);
        let stop = match &config.stop_file {
            Some(path) => StopSignal::with_file(path),
            None => StopSignal::new(),
        };
        Ok(Self::new(
            config,
            registry,
            dispatcher,
            Box::new(host),
            Box::new(workspace),
            Box::new(tests),
        )
        .with_stop(stop))
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn host(&self) -> &dyn WorkHost {
        self.host.as_ref()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_raised()
    }

    /// Start tracking `issue` in `pending` with its title, body and labels.
    pub fn track_issue(&mut self, issue: &Issue) -> Result<()> {
        let key = work_key(WorkKind::Issue, &issue.number.to_string());
        if self.registry.get(&key).is_some() {
            return Ok(());
        }
        self.registry.add(
            WorkKind::Issue,
            &issue.number.to_string(),
            issue_metadata(issue),
        )?;
        Ok(())
    }

    /// Track the item if needed and move it out of `pending`.
    ///
    /// Issues and pull requests unknown to the registry are looked up on the
    /// host first so stages see their title and body.
    pub fn claim(&mut self, kind: WorkKind, id: &str) -> Result<Claim> {
        let key = work_key(kind, id);
        if self.registry.get(&key).is_none() {
            let metadata = self.fetch_metadata(kind, id)?;
            self.registry.add(kind, id, metadata)?;
        }
        let claim = self
            .registry
            .try_claim(kind, id, self.config.intake.max_concurrent)?;
        debug!(item = %key, ?claim, "claim");
        Ok(claim)
    }

    fn fetch_metadata(&self, kind: WorkKind, id: &str) -> Result<BTreeMap<String, Value>> {
        match kind {
            WorkKind::Roadmap => Ok(BTreeMap::new()),
            WorkKind::Issue | WorkKind::Pr => {
                let number: u64 = id
                    .parse()
                    .with_context(|| format!("{kind} id '{id}' is not a number"))?;
                let issue = self
                    .host
                    .issue(number)
                    .with_context(|| format!("fetch {kind} #{number}"))?;
                Ok(issue_metadata(&issue))
            }
        }
    }

    /// Claim the item when it is new or pending, then run stages until it is
    /// terminal or a stop is requested.
    ///
    /// A cost or call limit halts the run with an error and leaves the item
    /// in its current state.
    pub fn process(&mut self, kind: WorkKind, id: &str) -> Result<ProcessOutcome> {
        let key = work_key(kind, id);
        let state = self.registry.get(&key).map(|item| item.state);
        if self.stop.is_raised() {
            let state = state.unwrap_or(WorkState::Pending);
            info!(item = %key, %state, "stop requested");
            return Ok(ProcessOutcome::Stopped(state));
        }
        if matches!(state, None | Some(WorkState::Pending))
            && self.claim(kind, id)? == Claim::AtCapacity
        {
            bail!(
                "cannot claim {key}: {} items already in progress (intake.max_concurrent = {})",
                self.registry.in_progress_count(),
                self.config.intake.max_concurrent
            );
        }
        self.drive(&key)
    }

    #[instrument(skip_all, fields(item = %key))]
    fn drive(&mut self, key: &str) -> Result<ProcessOutcome> {
        let mut ran = false;
        loop {
            let item = self
                .registry
                .get(key)
                .ok_or_else(|| anyhow!("unknown work item {key}"))?
                .clone();
            if item.state.is_terminal() {
                if ran {
                    self.metrics.record_finish(item.state);
                }
                info!(state = %item.state, "work item finished");
                return Ok(ProcessOutcome::Finished(item.state));
            }
            if self.stop.is_raised() {
                info!(state = %item.state, "stop requested");
                return Ok(ProcessOutcome::Stopped(item.state));
            }
            let stage = item
                .state
                .stage()
                .ok_or_else(|| anyhow!("{key} is {}; claim it first", item.state))?;
            ran = true;
            self.run_stage(&item, stage)?;
        }
    }

    fn run_stage(&mut self, item: &WorkItem, stage: Stage) -> Result<()> {
        let handler = handler_for(stage);
        let timeout = self.config.pipeline.stage_timeouts.for_stage(stage);
        info!(%stage, attempt = item.attempts(stage) + 1, "stage started");

        let (result, checkpoints) = {
            let mut ctx = StageContext {
                config: &self.config,
                dispatcher: &mut self.dispatcher,
                prompts: &self.prompts,
                host: self.host.as_ref(),
                workspace: self.workspace.as_ref(),
                tests: self.tests.as_ref(),
                deadline: Instant::now() + timeout,
                checkpoints: BTreeMap::new(),
            };
            let result = handler.run(&mut ctx, item);
            (result, ctx.take_checkpoints())
        };

        // Checkpoints survive a failed attempt so a retry reuses them.
        let update = checkpoints
            .into_iter()
            .fold(WorkUpdate::new(), |update, (k, v)| update.meta(&k, v));
        match result {
            Ok(outcome) if outcome.status == StageStatus::Failed => {
                let reason = outcome.reason.clone().unwrap_or_default();
                self.record_failure(item, outcome, anyhow!(reason), update)
            }
            Ok(outcome) => self.record_outcome(item, outcome, update),
            Err(err) => {
                let outcome = StageOutcome::failed(stage, format!("{err:#}"));
                self.record_failure(item, outcome, err, update)
            }
        }
    }

    fn record_outcome(
        &mut self,
        item: &WorkItem,
        outcome: StageOutcome,
        update: WorkUpdate,
    ) -> Result<()> {
        let key = item.key();
        let stage = outcome.stage;
        self.metrics.record_stage(stage, outcome.status);

        let (event, reason) = decide(&self.config.pipeline, item, &outcome);
        let mut update = update.clear_error();
        if stage == Stage::Fix {
            update = update.fix_attempt();
        }
        let state = self
            .registry
            .update(&key, update.outcome(outcome.clone()).transition(event, reason.clone()))?
            .state;
        info!(%stage, ?event, to = %state, "stage recorded");
        self.write_stage_log(item, &outcome);

        if state == WorkState::Escalated {
            self.notify_escalation(item, &reason);
        }
        Ok(())
    }

    fn record_failure(
        &mut self,
        item: &WorkItem,
        outcome: StageOutcome,
        err: anyhow::Error,
        update: WorkUpdate,
    ) -> Result<()> {
        let key = item.key();
        let stage = outcome.stage;
        let message = format!("{err:#}");
        self.metrics.record_stage(stage, StageStatus::Failed);
        let update = update.outcome(outcome.clone()).error(message.clone());

        if err.downcast_ref::<LimitExceeded>().is_some() {
            warn!(%stage, error = %message, "safety limit reached; halting");
            self.registry.update(&key, update)?;
            self.write_stage_log(item, &outcome);
            return Err(err);
        }

        let max = self.config.pipeline.retries_for(stage);
        if item.retry_count < max {
            warn!(
                %stage,
                retry = item.retry_count + 1,
                max,
                error = %message,
                "stage failed; retrying"
            );
            self.registry.update(&key, update.retry())?;
        } else {
            error!(%stage, error = %message, "stage failed; retries exhausted");
            let reason = format!("{stage} failed after {max} retries: {message}");
            self.registry
                .update(&key, update.transition(Event::Failed, reason))?;
        }
        self.write_stage_log(item, &outcome);
        Ok(())
    }

    /// The registry is the record of truth; a stage log that cannot be
    /// written only warns.
    fn write_stage_log(&self, item: &WorkItem, outcome: &StageOutcome) {
        let log = StageLog::new(&self.config.runs_dir, item, outcome.stage);
        if let Err(err) = log.write_outcome(outcome) {
            warn!(
                item = %item.key(),
                stage = %outcome.stage,
                error = %format!("{err:#}"),
                "stage log write failed"
            );
        }
    }

    fn notify_escalation(&self, item: &WorkItem, reason: &str) {
        if item.kind == WorkKind::Roadmap {
            return;
        }
        let Ok(number) = item.id.parse::<u64>() else {
            return;
        };
        let body = format!("Automated work on this item needs a human: {reason}.");
        if let Err(err) = self.host.comment(number, &body) {
            warn!(item = %item.key(), error = %format!("{err:#}"), "escalation comment failed");
        }
    }
}

/// Title, body and labels in the metadata keys stages read.
pub fn issue_metadata(issue: &Issue) -> BTreeMap<String, Value> {
    BTreeMap::from([
        (keys::TITLE.to_string(), json!(issue.title)),
        (keys::BODY.to_string(), json!(issue.body)),
        (keys::LABELS.to_string(), json!(issue.labels)),
    ])
}

/// The event a recorded outcome triggers, with the reason kept in history.
pub fn decide(cfg: &PipelineConfig, item: &WorkItem, outcome: &StageOutcome) -> (Event, String) {
    let stage = outcome.stage;
    let why = outcome.reason.as_deref().unwrap_or("no reason given");
    if outcome.status == StageStatus::Passed {
        return (Event::Passed, format!("{stage} passed"));
    }
    match stage {
        Stage::Analyze | Stage::Plan | Stage::Implement => {
            (Event::Rejected, format!("{stage} rejected: {why}"))
        }
        Stage::Test if !cfg.enable_auto_fix => (
            Event::Escalate,
            format!("tests failing ({why}); auto-fix is disabled"),
        ),
        Stage::Test if item.fix_attempts < cfg.max_fix_attempts => (
            Event::TestsFailed,
            format!(
                "tests failing ({why}); fix attempt {} of {}",
                item.fix_attempts + 1,
                cfg.max_fix_attempts
            ),
        ),
        Stage::Test => (
            Event::Escalate,
            format!(
                "tests still failing after {} fix attempts ({why})",
                item.fix_attempts
            ),
        ),
        Stage::Fix | Stage::Deliver => (Event::Escalate, format!("{stage} rejected: {why}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::core::cost::Limits;
    use crate::io::provider::Provider;
    use crate::test_support::{
        FakeWorkspace, RecordingHost, ScriptedProvider, ScriptedTests, analysis_reply,
        green_report, issue, stage_routes, test_config, test_limits,
    };

    struct Harness {
        pipeline: Pipeline,
        host: RecordingHost,
        workspace: FakeWorkspace,
        _temp: tempfile::TempDir,
    }

    fn harness(analysis: String, reports: Vec<crate::core::test_report::TestReport>) -> Harness {
        harness_with(analysis, reports, test_limits(), |_| {})
    }

    fn harness_with(
        analysis: String,
        reports: Vec<crate::core::test_report::TestReport>,
        limits: Limits,
        tweak: impl FnOnce(&mut OrchestratorConfig),
    ) -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        tweak(&mut config);
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::routed(
            "alpha",
            stage_routes(analysis, 0.8, true),
        ));
        let host = RecordingHost::new(vec![issue(10, "Crash on missing config", &["bug"])]);
        let workspace = FakeWorkspace::default();
        let registry = WorkRegistry::open(&config.state_path).expect("registry");
        let pipeline = Pipeline::new(
            config,
            registry,
            Dispatcher::new(vec![provider], limits),
            Box::new(host.clone()),
            Box::new(workspace.clone()),
            Box::new(ScriptedTests::new(reports)),
        );
        Harness {
            pipeline,
            host,
            workspace,
            _temp: temp,
        }
    }

    fn item_with(fix_attempts: u32) -> WorkItem {
        let mut item = WorkItem::new(WorkKind::Issue, "1", Utc::now());
        item.fix_attempts = fix_attempts;
        item
    }

    #[test]
    fn red_tests_go_to_fixing_until_attempts_run_out() {
        let cfg = PipelineConfig::default();
        let red = StageOutcome::rejected(Stage::Test, None, "1 of 4 tests failed".to_string());

        let (event, reason) = decide(&cfg, &item_with(0), &red);
        assert_eq!(event, Event::TestsFailed);
        assert!(reason.contains("fix attempt 1 of 2"), "{reason}");

        let (event, _) = decide(&cfg, &item_with(cfg.max_fix_attempts), &red);
        assert_eq!(event, Event::Escalate);

        let no_fix = PipelineConfig {
            enable_auto_fix: false,
            ..PipelineConfig::default()
        };
        assert_eq!(decide(&no_fix, &item_with(0), &red).0, Event::Escalate);
    }

    #[test]
    fn early_rejections_reject_and_late_ones_escalate() {
        let cfg = PipelineConfig::default();
        for (stage, expected) in [
            (Stage::Analyze, Event::Rejected),
            (Stage::Plan, Event::Rejected),
            (Stage::Implement, Event::Rejected),
            (Stage::Fix, Event::Escalate),
            (Stage::Deliver, Event::Escalate),
        ] {
            let outcome = StageOutcome::rejected(stage, None, "low".to_string());
            assert_eq!(decide(&cfg, &item_with(0), &outcome).0, expected, "{stage}");
        }
        let passed = StageOutcome::passed(Stage::Deliver, None);
        assert_eq!(decide(&cfg, &item_with(0), &passed).0, Event::Passed);
    }

    #[test]
    fn green_issue_runs_to_completion() {
        let mut h = harness(analysis_reply("bug", 4, true), vec![green_report(8)]);

        let outcome = h.pipeline.process(WorkKind::Issue, "10").expect("process");

        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Completed));
        let item = h.pipeline.registry().get("issue:10").expect("item");
        let states: Vec<WorkState> = item.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                WorkState::Analyzing,
                WorkState::Planning,
                WorkState::Implementing,
                WorkState::Testing,
                WorkState::Delivering,
                WorkState::Completed,
            ]
        );
        assert_eq!(item.meta_str(keys::TITLE), Some("Crash on missing config"));
        assert_eq!(h.host.pull_requests().len(), 1);
        assert_eq!(h.pipeline.metrics().completed, 1);
        assert!(
            h.pipeline
                .config()
                .runs_dir
                .join("issue-10/001-analyze/outcome.json")
                .is_file()
        );
    }

    #[test]
    fn stop_before_processing_leaves_the_item_untouched() {
        let mut h = harness(analysis_reply("bug", 4, true), vec![green_report(8)]);
        let stop = StopSignal::new();
        stop.raise();
        h.pipeline = h.pipeline.with_stop(stop);

        let outcome = h.pipeline.process(WorkKind::Issue, "10").expect("process");

        assert_eq!(outcome, ProcessOutcome::Stopped(WorkState::Pending));
        assert!(h.pipeline.registry().is_empty());
        assert_eq!(h.pipeline.metrics().processed, 0);
    }

    #[test]
    fn stop_file_is_honoured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("STOP");
        let stop = StopSignal::with_file(&path);
        assert!(!stop.is_raised());
        std::fs::write(&path, "").expect("write stop");
        assert!(stop.is_raised());
    }

    #[test]
    fn a_failing_stage_retries_then_fails() {
        let mut h = harness_with(
            analysis_reply("bug", 4, true),
            vec![green_report(8)],
            test_limits(),
            |cfg| cfg.pipeline.max_stage_retries = 1,
        );
        h.workspace.fail_apply();

        let outcome = h.pipeline.process(WorkKind::Issue, "10").expect("process");

        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Failed));
        let item = h.pipeline.registry().get("issue:10").expect("item");
        assert_eq!(item.attempts(Stage::Implement), 2);
        assert!(item.error.as_deref().is_some_and(|e| e.contains("apply implementation patch")));
        assert_eq!(h.pipeline.metrics().failed, 1);
    }

    #[test]
    fn each_stage_fails_at_its_own_retry_bound() {
        let bounded = |cfg: &mut OrchestratorConfig| {
            cfg.pipeline.max_stage_retries = 3;
            cfg.pipeline.stage_retries.implement = Some(0);
            cfg.pipeline.stage_retries.test = Some(2);
        };
        let last_reason = |item: &WorkItem| {
            item.transitions
                .last()
                .map(|t| t.reason.clone())
                .unwrap_or_default()
        };

        let mut implement = harness_with(
            analysis_reply("bug", 4, true),
            vec![green_report(8)],
            test_limits(),
            bounded,
        );
        implement.workspace.fail_apply();
        let outcome = implement.pipeline.process(WorkKind::Issue, "10").expect("process");
        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Failed));
        let item = implement.pipeline.registry().get("issue:10").expect("item");
        assert_eq!(item.attempts(Stage::Implement), 1);
        assert!(last_reason(item).starts_with("implement failed after 0 retries"));

        // No scripted reports: every test run errors.
        let mut test = harness_with(analysis_reply("bug", 4, true), vec![], test_limits(), bounded);
        let outcome = test.pipeline.process(WorkKind::Issue, "10").expect("process");
        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Failed));
        let item = test.pipeline.registry().get("issue:10").expect("item");
        assert_eq!(item.attempts(Stage::Test), 3);
        assert!(last_reason(item).starts_with("test failed after 2 retries"));
    }

    #[test]
    fn unwritable_stage_log_still_records_the_outcome() {
        let mut h = harness_with(
            analysis_reply("bug", 4, true),
            vec![green_report(8)],
            test_limits(),
            |cfg| {
                cfg.pipeline.max_stage_retries = 0;
                let parent = cfg.runs_dir.parent().expect("runs parent");
                std::fs::create_dir_all(parent).expect("mkdir");
                std::fs::write(&cfg.runs_dir, "not a directory").expect("block runs dir");
            },
        );

        let outcome = h.pipeline.process(WorkKind::Issue, "10").expect("process");

        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Failed));
        let item = h.pipeline.registry().get("issue:10").expect("item");
        assert_eq!(item.outcomes.len(), 1);
        assert_eq!(item.outcomes[0].outcome.stage, Stage::Analyze);
        assert_eq!(item.outcomes[0].outcome.status, StageStatus::Failed);
    }

    #[test]
    fn call_limit_halts_and_keeps_the_state() {
        let mut h = harness_with(
            analysis_reply("bug", 4, true),
            vec![green_report(8)],
            Limits {
                max_cost_usd: 100.0,
                max_calls: 1,
            },
            |_| {},
        );

        let err = h.pipeline.process(WorkKind::Issue, "10").expect_err("limit");

        assert!(err.downcast_ref::<LimitExceeded>().is_some(), "{err:#}");
        let item = h.pipeline.registry().get("issue:10").expect("item");
        assert_eq!(item.state, WorkState::Planning);
        assert_eq!(item.retry_count, 0);
        assert!(item.error.is_some());
    }

    #[test]
    fn pending_roadmap_items_are_claimed_without_the_host() {
        let mut h = harness(analysis_reply("feature", 9, true), vec![]);

        let outcome = h
            .pipeline
            .process(WorkKind::Roadmap, "q3-cache")
            .expect("process");

        assert_eq!(outcome, ProcessOutcome::Finished(WorkState::Rejected));
        assert!(h.host.comments().is_empty());
    }
}
