//! Orchestrator configuration stored in `orchestrator.toml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::cost::{Limits, Price, default_price};
use crate::core::reconcile::ConfidenceWeights;
use crate::core::state::Stage;
use crate::core::types::Strategy;

pub const DEFAULT_CONFIG_PATH: &str = "orchestrator.toml";

/// How much the orchestrator may do without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Items are only processed when named explicitly.
    Manual,
    /// Pull requests are opened but never merged.
    Supervised,
    /// Approved pull requests with green CI are merged.
    Autonomous,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Supervised => "supervised",
            Self::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "supervised" => Ok(Self::Supervised),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(anyhow!("unknown mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Merge,
    Squash,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

/// Orchestrator configuration (TOML).
///
/// Missing fields take the defaults below; a missing file is the default
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: Mode,

    /// Repository the workspace and test commands run in.
    pub workdir: PathBuf,

    /// Work-item registry snapshot.
    pub state_path: PathBuf,

    /// Per-stage prompt and response artifacts.
    pub runs_dir: PathBuf,

    /// Creating this file asks a running `start` to stop between stages.
    pub stop_file: Option<PathBuf>,

    pub host: HostConfig,
    pub intake: IntakeConfig,
    pub dispatch: DispatchConfig,
    pub providers: Vec<ProviderConfig>,
    pub consensus: ConsensusConfig,
    pub pipeline: PipelineConfig,
    pub tests: TestsConfig,
    pub safety: SafetyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Supervised,
            workdir: PathBuf::from("."),
            state_path: PathBuf::from(".orchestrator/state.json"),
            runs_dir: PathBuf::from(".orchestrator/runs"),
            stop_file: Some(PathBuf::from(".orchestrator/STOP")),
            host: HostConfig::default(),
            intake: IntakeConfig::default(),
            dispatch: DispatchConfig::default(),
            providers: Vec::new(),
            consensus: ConsensusConfig::default(),
            pipeline: PipelineConfig::default(),
            tests: TestsConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// `owner/name`; `None` lets `gh` infer it from the workdir.
    pub repo: Option<String>,
    /// Host CLI invocation (e.g. `["gh"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub base_branch: String,
    pub remote: String,
    pub merge_strategy: MergeStrategy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            repo: None,
            command: vec!["gh".to_string()],
            timeout_secs: 60,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            merge_strategy: MergeStrategy::Squash,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntakeConfig {
    pub auto_claim_labels: Vec<String>,
    pub ignore_labels: Vec<String>,
    /// Cap on items in a non-terminal, non-pending state.
    pub max_concurrent: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            auto_claim_labels: vec!["bot-approved".to_string()],
            ignore_labels: vec!["wontfix".to_string(), "manual-only".to_string()],
            max_concurrent: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_strategy: Strategy,
    pub implementation_strategy: Strategy,
    pub fix_strategy: Strategy,
    /// Provider ids to query; empty means every configured provider.
    pub default_providers: Vec<String>,
    pub query_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::All,
            implementation_strategy: Strategy::Sequential,
            fix_strategy: Strategy::Dialectic,
            default_providers: Vec::new(),
            query_timeout_secs: 120,
            output_limit_bytes: 200_000,
        }
    }
}

impl DispatchConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// One `[[providers]]` entry: a command that reads a prompt on stdin and
/// writes the reply to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub command: Vec<String>,
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
}

impl ProviderConfig {
    /// Configured rates, falling back to the built-in table per side.
    pub fn price(&self) -> Price {
        let fallback = default_price(&self.id);
        Price::new(
            self.input_per_1k.unwrap_or(fallback.input_per_1k),
            self.output_per_1k.unwrap_or(fallback.output_per_1k),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConsensusConfig {
    pub weights: ConfidenceWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_fix_attempts: u32,
    pub max_stage_retries: u32,
    pub enable_auto_fix: bool,
    pub min_analysis_confidence: f64,
    pub max_complexity: f64,
    pub min_plan_confidence: f64,
    pub min_implementation_confidence: f64,
    pub min_fix_confidence: f64,
    pub min_review_confidence: f64,
    pub stage_timeouts: StageTimeouts,
    pub stage_retries: StageRetries,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 2,
            max_stage_retries: 3,
            enable_auto_fix: true,
            min_analysis_confidence: 0.6,
            max_complexity: 7.0,
            min_plan_confidence: 0.6,
            min_implementation_confidence: 0.5,
            min_fix_confidence: 0.6,
            min_review_confidence: 0.6,
            stage_timeouts: StageTimeouts::default(),
            stage_retries: StageRetries::default(),
        }
    }
}

impl PipelineConfig {
    /// Retry budget for `stage`: its `[pipeline.stage_retries]` entry, else
    /// `max_stage_retries`.
    pub fn retries_for(&self, stage: Stage) -> u32 {
        self.stage_retries
            .for_stage(stage)
            .unwrap_or(self.max_stage_retries)
    }
}

/// Wall-clock budget per stage, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageTimeouts {
    pub analyze: u64,
    pub plan: u64,
    pub implement: u64,
    pub test: u64,
    pub fix: u64,
    pub deliver: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            analyze: 600,
            plan: 600,
            implement: 1200,
            test: 1800,
            fix: 1200,
            deliver: 600,
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Analyze => self.analyze,
            Stage::Plan => self.plan,
            Stage::Implement => self.implement,
            Stage::Test => self.test,
            Stage::Fix => self.fix,
            Stage::Deliver => self.deliver,
        };
        Duration::from_secs(secs)
    }
}

/// Per-stage overrides of `max_stage_retries`; unset stages use the global bound.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StageRetries {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyze: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implement: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver: Option<u32>,
}

impl StageRetries {
    pub fn for_stage(&self, stage: Stage) -> Option<u32> {
        match stage {
            Stage::Analyze => self.analyze,
            Stage::Plan => self.plan,
            Stage::Implement => self.implement,
            Stage::Test => self.test,
            Stage::Fix => self.fix,
            Stage::Deliver => self.deliver,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Test command run in the workdir (e.g. `["cargo","test"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: 1800,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_cost_usd: f64,
    pub max_provider_calls: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 50.0,
            max_provider_calls: 500,
        }
    }
}

impl SafetyConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_cost_usd: self.max_cost_usd,
            max_calls: self.max_provider_calls,
        }
    }
}

impl OrchestratorConfig {
    /// Every problem with the configuration, in a stable order.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.state_path.as_os_str().is_empty() {
            problems.push("state_path must be non-empty".to_string());
        }
        if self.runs_dir.as_os_str().is_empty() {
            problems.push("runs_dir must be non-empty".to_string());
        }
        if is_blank_command(&self.host.command) {
            problems.push("host.command must be a non-empty array".to_string());
        }
        if self.host.timeout_secs == 0 {
            problems.push("host.timeout_secs must be > 0".to_string());
        }
        if self.intake.max_concurrent == 0 {
            problems.push("intake.max_concurrent must be > 0".to_string());
        }
        if self.dispatch.query_timeout_secs == 0 {
            problems.push("dispatch.query_timeout_secs must be > 0".to_string());
        }
        if self.dispatch.output_limit_bytes == 0 {
            problems.push("dispatch.output_limit_bytes must be > 0".to_string());
        }

        let mut seen = Vec::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.id.trim().is_empty() {
                problems.push(format!("providers[{index}].id must be non-empty"));
            } else if seen.contains(&provider.id.as_str()) {
                problems.push(format!("providers[{index}].id '{}' is duplicated", provider.id));
            } else {
                seen.push(provider.id.as_str());
            }
            if is_blank_command(&provider.command) {
                problems.push(format!("providers[{index}].command must be a non-empty array"));
            }
            let price = provider.price();
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                problems.push(format!("providers[{index}] prices must be >= 0"));
            }
        }
        for id in &self.dispatch.default_providers {
            if !self.providers.iter().any(|p| &p.id == id) {
                problems.push(format!("dispatch.default_providers names unknown provider '{id}'"));
            }
        }

        problems.extend(self.consensus.weights.problems());

        let pipeline = &self.pipeline;
        for (name, value) in [
            ("min_analysis_confidence", pipeline.min_analysis_confidence),
            ("min_plan_confidence", pipeline.min_plan_confidence),
            (
                "min_implementation_confidence",
                pipeline.min_implementation_confidence,
            ),
            ("min_fix_confidence", pipeline.min_fix_confidence),
            ("min_review_confidence", pipeline.min_review_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                problems.push(format!("pipeline.{name} must be within [0, 1]"));
            }
        }
        if !(0.0..=10.0).contains(&pipeline.max_complexity) {
            problems.push("pipeline.max_complexity must be within [0, 10]".to_string());
        }
        for stage in Stage::ALL {
            if pipeline.stage_timeouts.for_stage(stage).is_zero() {
                problems.push(format!("pipeline.stage_timeouts.{stage} must be > 0"));
            }
        }

        if is_blank_command(&self.tests.command) {
            problems.push("tests.command must be a non-empty array".to_string());
        }
        if self.tests.timeout_secs == 0 {
            problems.push("tests.timeout_secs must be > 0".to_string());
        }
        if self.tests.output_limit_bytes == 0 {
            problems.push("tests.output_limit_bytes must be > 0".to_string());
        }
        if self.safety.max_cost_usd.is_nan() || self.safety.max_cost_usd < 0.0 {
            problems.push("safety.max_cost_usd must be >= 0".to_string());
        }

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        bail!("invalid config: {}", problems.join("; "))
    }

    /// Apply `ORCHESTRATOR_*` overrides from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("ORCHESTRATOR_MODE") {
            self.mode = mode.parse().context("ORCHESTRATOR_MODE")?;
        }
        if let Some(path) = lookup("ORCHESTRATOR_STATE_PATH")
            && !path.trim().is_empty()
        {
            self.state_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("ORCHESTRATOR_MAX_COST_USD") {
            self.safety.max_cost_usd = raw
                .trim()
                .parse()
                .with_context(|| format!("ORCHESTRATOR_MAX_COST_USD '{raw}' is not a number"))?;
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

fn is_blank_command(command: &[String]) -> bool {
    command.first().is_none_or(|program| program.trim().is_empty())
}

/// Parse a config file without validating it.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn read_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Load config from a TOML file, apply process environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let mut cfg = read_config(path)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
