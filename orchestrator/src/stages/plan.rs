//! Plan: turn the triage into an ordered implementation plan.

use anyhow::Result;
use minijinja::context;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::gate::{Condition, Gate};
use crate::core::schemas::{self, fields};
use crate::core::state::Stage;
use crate::core::types::{DispatchResult, FieldValue, Fields};
use crate::core::work_item::{StageOutcome, StageStatus, WorkItem};
use crate::io::config::PipelineConfig;
use crate::io::stage_log::StageLog;

use super::{
    IssueContext, Query, StageContext, StageHandler, consult, gated, keys, meta_object,
};

const BRANCH_PREFIX: &str = "orchestrator";
const MAX_SLUG_LEN: usize = 50;
const MIN_DETAILED_STEPS: usize = 3;
/// Average reply length at which the detail term saturates.
const DETAILED_REPLY_CHARS: f64 = 5000.0;

pub const DEFAULT_VALIDATION_CRITERIA: [&str; 3] = [
    "All tests pass",
    "Code follows project style",
    "No regressions",
];

pub struct PlanStage;

pub fn plan_gate(cfg: &PipelineConfig) -> Gate {
    Gate::new()
        .require(Condition::MinConfidence(cfg.min_plan_confidence))
        .require(Condition::NonEmpty(fields::STEPS))
}

/// Specificity of a plan in `[0, 1]`: names files, has several steps, and
/// the replies went into some detail.
pub fn specificity(result: &DispatchResult, fields: &Fields) -> f64 {
    let has = |name: &str| {
        fields
            .get(name)
            .and_then(Option::as_ref)
            .is_some_and(|value| !value.is_blank())
    };
    let steps = match fields.get(fields::STEPS) {
        Some(Some(FieldValue::List(steps))) => steps.len(),
        _ => 0,
    };

    let mut score = 0.0;
    if has(fields::FILES_TO_MODIFY) || has(fields::FILES_TO_CREATE) {
        score += 0.2;
    }
    if steps >= MIN_DETAILED_STEPS {
        score += 0.2;
    }
    if !result.responses.is_empty() {
        let total: usize = result.responses.iter().map(|r| r.raw_text.len()).sum();
        let avg = total as f64 / result.responses.len() as f64;
        score += (avg / DETAILED_REPLY_CHARS).min(0.2);
    }
    score / 0.6
}

pub fn confidence_level(confidence: f64) -> &'static str {
    if confidence < 0.6 {
        "low"
    } else if confidence < 0.8 {
        "medium"
    } else if confidence < 0.9 {
        "high"
    } else {
        "very_high"
    }
}

/// `orchestrator/<kind>-<id>-<title slug>`.
pub fn branch_name(item: &WorkItem, title: &str) -> String {
    let id = slugify(&item.id);
    let slug = slugify(title);
    if slug.is_empty() || slug == id {
        format!("{BRANCH_PREFIX}/{}-{id}", item.kind)
    } else {
        format!("{BRANCH_PREFIX}/{}-{id}-{slug}", item.kind)
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

/// Plan fields for metadata, with default validation criteria filled in.
fn plan_artifact(mut plan: Value) -> Value {
    let missing = plan
        .get(fields::VALIDATION_CRITERIA)
        .and_then(Value::as_array)
        .is_none_or(Vec::is_empty);
    if missing && let Some(map) = plan.as_object_mut() {
        map.insert(
            fields::VALIDATION_CRITERIA.to_string(),
            json!(DEFAULT_VALIDATION_CRITERIA),
        );
    }
    plan
}

impl StageHandler for PlanStage {
    fn stage(&self) -> Stage {
        Stage::Plan
    }

    #[instrument(skip_all, fields(item = %item.key()))]
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome> {
        let config = ctx.config;
        let log = StageLog::new(&config.runs_dir, item, Stage::Plan);
        let issue = IssueContext::from_item(item);
        let prompt = ctx.prompts.render(
            "plan",
            context! {
                issue => &issue,
                analysis => meta_object(item, keys::ANALYSIS),
            },
        )?;

        let query = Query::new("plan", prompt, config.dispatch.default_strategy, schemas::plan());
        let consensus = consult(ctx, &log, query, |result, fields, _| {
            specificity(result, fields)
        })?;

        let level = confidence_level(consensus.confidence);
        let plan = plan_artifact(consensus.fields_json());
        let outcome = gated(Stage::Plan, consensus, &plan_gate(&config.pipeline))
            .with_artifact(keys::PLAN, plan)
            .with_artifact(keys::PLAN_CONFIDENCE_LEVEL, json!(level));
        if outcome.status != StageStatus::Passed {
            return Ok(outcome);
        }

        let branch = branch_name(item, &issue.title);
        debug!(%branch, level, "plan accepted");
        Ok(outcome.with_artifact(keys::BRANCH, json!(branch)))
    }
}
