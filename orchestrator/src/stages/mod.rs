//! Stage handlers.
//!
//! Every consensus-driven stage follows the same shape: render a prompt from
//! the item and its earlier artifacts, dispatch it, reconcile the replies
//! against the stage schema, and gate the consensus. A handler returns a
//! `passed` or `rejected` [`StageOutcome`]; an `Err` means the attempt itself
//! broke and the controller decides whether to retry.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::core::budget::dispatch_timeout;
use crate::core::gate::Gate;
use crate::core::reconcile::reconcile_dispatch;
use crate::core::schema::Schema;
use crate::core::state::Stage;
use crate::core::types::{ConsensusResult, DispatchResult, ExtractedRecord, Fields, Strategy};
use crate::core::work_item::{StageOutcome, WorkItem};
use crate::io::config::OrchestratorConfig;
use crate::io::dispatch::{Acceptance, DispatchRequest, Dispatcher};
use crate::io::host::WorkHost;
use crate::io::prompt::PromptEngine;
use crate::io::stage_log::StageLog;
use crate::io::test_runner::TestExecutor;
use crate::io::workspace::Workspace;

pub mod analyze;
pub mod deliver;
pub mod fix;
pub mod implement;
pub mod plan;

/// Work-item metadata keys written by intake and the stages.
pub mod keys {
    pub const TITLE: &str = "title";
    pub const BODY: &str = "body";
    pub const LABELS: &str = "labels";

    pub const ANALYSIS: &str = "analysis";
    pub const PLAN: &str = "plan";
    pub const PLAN_CONFIDENCE_LEVEL: &str = "plan_confidence_level";
    pub const BRANCH: &str = "branch";
    pub const IMPLEMENTATION: &str = "implementation";
    pub const CHANGED_FILES: &str = "changed_files";
    pub const TEST_REPORT: &str = "test_report";
    pub const FAILURE_ANALYSIS: &str = "failure_analysis";
    pub const FIX: &str = "fix";
    pub const PR_NUMBER: &str = "pr_number";
    pub const PR_URL: &str = "pr_url";
    pub const REVIEW: &str = "review";
    pub const MERGED: &str = "merged";
}

/// Everything a stage may touch during one attempt.
pub struct StageContext<'a> {
    pub config: &'a OrchestratorConfig,
    pub dispatcher: &'a mut Dispatcher,
    pub prompts: &'a PromptEngine,
    pub host: &'a dyn WorkHost,
    pub workspace: &'a dyn Workspace,
    pub tests: &'a dyn TestExecutor,
    /// End of this attempt's time budget.
    pub deadline: Instant,
    pub(crate) checkpoints: BTreeMap<String, Value>,
}

impl<'a> StageContext<'a> {
    /// Metadata that must survive even if the attempt later fails, such as
    /// the number of a pull request that was already opened.
    pub fn checkpoint(&mut self, key: &str, value: impl Into<Value>) {
        self.checkpoints.insert(key.to_string(), value.into());
    }

    pub fn take_checkpoints(&mut self) -> BTreeMap<String, Value> {
        std::mem::take(&mut self.checkpoints)
    }
}

pub trait StageHandler {
    fn stage(&self) -> Stage;
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome>;
}

pub fn handler_for(stage: Stage) -> &'static dyn StageHandler {
    match stage {
        Stage::Analyze => &analyze::AnalyzeStage,
        Stage::Plan => &plan::PlanStage,
        Stage::Implement => &implement::ImplementStage,
        Stage::Test => &test::TestStage,
        Stage::Fix => &fix::FixStage,
        Stage::Deliver => &deliver::DeliverStage,
    }
}

/// One consensus round: a rendered prompt and how to read the replies.
pub(crate) struct Query<'q> {
    /// Directory name under the attempt's stage log.
    pub label: &'static str,
    pub prompt: String,
    pub strategy: Strategy,
    pub schema: Schema,
    pub accept: Option<Acceptance<'q>>,
}

impl<'q> Query<'q> {
    pub fn new(label: &'static str, prompt: String, strategy: Strategy, schema: Schema) -> Self {
        Self {
            label,
            prompt,
            strategy,
            schema,
            accept: None,
        }
    }

    pub fn accept(mut self, accept: Acceptance<'q>) -> Self {
        self.accept = Some(accept);
        self
    }
}

/// Dispatch, reconcile and log one query.
pub(crate) fn consult<B>(
    ctx: &mut StageContext<'_>,
    log: &StageLog,
    query: Query<'_>,
    boost: B,
) -> Result<ConsensusResult>
where
    B: FnOnce(&DispatchResult, &Fields, &[ExtractedRecord]) -> f64,
{
    let config = ctx.config;
    let timeout = dispatch_timeout(config.dispatch.query_timeout(), ctx.deadline)?;
    let mut request = DispatchRequest::new(query.prompt.as_str(), query.strategy, timeout)
        .with_providers(config.dispatch.default_providers.clone());
    if let Some(accept) = query.accept {
        request = request.with_acceptance(accept);
    }

    let result = ctx.dispatcher.dispatch(&request)?;
    let (_, consensus) = reconcile_dispatch(
        &query.schema,
        &result,
        &config.consensus.weights,
        |fields, records| boost(&result, fields, records),
    );
    log.write_dispatch(query.label, &query.prompt, &result, Some(&consensus))?;
    info!(
        schema = %query.schema.id,
        confidence = consensus.confidence,
        contributors = consensus.contributing_providers.len(),
        queried = result.providers_queried.len(),
        "consensus"
    );
    Ok(consensus)
}

/// Gate `consensus` into a passed or rejected outcome.
pub(crate) fn gated(stage: Stage, consensus: ConsensusResult, gate: &Gate) -> StageOutcome {
    match gate.evaluate(&consensus).reason() {
        None => StageOutcome::passed(stage, Some(consensus)),
        Some(reason) => StageOutcome::rejected(stage, Some(consensus), reason),
    }
}

/// Attach the reconciled fields under `key` so later stages can read them.
pub(crate) fn with_fields(outcome: StageOutcome, key: &str) -> StageOutcome {
    match outcome.consensus.as_ref().map(ConsensusResult::fields_json) {
        Some(value) => outcome.with_artifact(key, value),
        None => outcome,
    }
}

/// The issue as prompt templates see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct IssueContext {
    pub number: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

impl IssueContext {
    pub fn from_item(item: &WorkItem) -> Self {
        Self {
            number: item.id.clone(),
            title: item.meta_str(keys::TITLE).unwrap_or(&item.id).to_string(),
            body: item.meta_str(keys::BODY).unwrap_or_default().to_string(),
            labels: meta_list(item, keys::LABELS),
        }
    }
}

/// String list stored under `key`; non-string entries are skipped.
pub(crate) fn meta_list(item: &WorkItem, key: &str) -> Vec<String> {
    item.metadata
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Object stored under `key`, or an empty object.
pub(crate) fn meta_object(item: &WorkItem, key: &str) -> Value {
    match item.metadata.get(key) {
        Some(value @ Value::Object(_)) => value.clone(),
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Text field `field` of the object stored under `key`.
pub(crate) fn meta_field_str<'i>(item: &'i WorkItem, key: &str, field: &str) -> Option<&'i str> {
    item.metadata
        .get(key)
        .and_then(|value| value.get(field))
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}
