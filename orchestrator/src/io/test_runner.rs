//! Test execution for the Test stage.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::test_report::{TestFailure, TestReport, parse_test_output};
use crate::io::config::TestsConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Which part of the suite the caller cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestScope {
    pub changed_files: Vec<String>,
}

pub trait TestExecutor {
    fn run(&self, scope: &TestScope) -> Result<TestReport>;
}

/// Runs the configured test command and parses its output.
///
/// The changed files are exported as `ORCHESTRATOR_CHANGED_FILES`
/// (newline-separated) so wrapper scripts can narrow the run.
#[derive(Debug, Clone)]
pub struct CommandTestExecutor {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandTestExecutor {
    pub fn new(cfg: &TestsConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: cfg.command.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl TestExecutor for CommandTestExecutor {
    #[instrument(skip_all, fields(command = %self.command.join(" ")))]
    fn run(&self, scope: &TestScope) -> Result<TestReport> {
        let mut cmd = command_from_argv(&self.command, Some(&self.workdir))?;
        cmd.env("ORCHESTRATOR_CHANGED_FILES", scope.changed_files.join("\n"));
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run test command")?;

        let text = output.combined_text();
        if output.timed_out {
            let mut report = parse_test_output(&text, false);
            report.failed += 1;
            report.total += 1;
            report.failures.push(TestFailure {
                name: "test command".to_string(),
                file: None,
                message: format!("timed out after {}s", self.timeout.as_secs()),
                trace: String::new(),
            });
            return Ok(report);
        }

        let mut report = parse_test_output(&text, output.status.success());
        if !output.status.success() && report.is_green() {
            // Non-zero exit with an all-green summary: build or harness failure.
            report.failed += 1;
            report.total += 1;
            report.failures.push(TestFailure {
                name: "test command".to_string(),
                file: None,
                message: format!("exited with {:?}", output.status.code()),
                trace: output.stderr_text(),
            });
        }
        info!(
            passed = report.passed,
            failed = report.failed,
            skipped = report.skipped,
            "tests finished"
        );
        Ok(report)
    }
}
