//! Analyze: triage the issue before any planning happens.

use anyhow::Result;
use minijinja::context;
use tracing::{debug, instrument};

use crate::core::gate::{Condition, Gate};
use crate::core::reconcile::corroboration;
use crate::core::schemas::{self, fields};
use crate::core::state::Stage;
use crate::core::types::FieldValue;
use crate::core::work_item::{StageOutcome, WorkItem};
use crate::io::config::PipelineConfig;
use crate::io::stage_log::StageLog;

use super::{
    IssueContext, Query, StageContext, StageHandler, consult, gated, keys, meta_list, with_fields,
};

/// Fields every provider is expected to answer for the triage to be trusted.
const CORROBORATED: &[&str] = &[fields::ISSUE_TYPE, fields::COMPLEXITY, fields::ACTIONABLE];

/// Issue labels that settle the type ahead of what providers say.
const LABEL_TYPES: &[(&str, &str)] = &[
    ("bug", "bug"),
    ("defect", "bug"),
    ("feature", "feature"),
    ("enhancement", "feature"),
    ("refactor", "refactor"),
    ("documentation", "documentation"),
    ("docs", "documentation"),
    ("test", "test"),
    ("tests", "test"),
    ("chore", "chore"),
    ("maintenance", "chore"),
];

pub struct AnalyzeStage;

/// Type named by the first label that maps to one.
pub fn labelled_type(item: &WorkItem) -> Option<&'static str> {
    meta_list(item, keys::LABELS).iter().find_map(|label| {
        let label = label.trim().to_ascii_lowercase();
        LABEL_TYPES
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, issue_type)| *issue_type)
    })
}

pub fn analysis_gate(cfg: &PipelineConfig) -> Gate {
    Gate::new()
        .require(Condition::MinConfidence(cfg.min_analysis_confidence))
        .require(Condition::AtMost {
            field: fields::COMPLEXITY,
            max: cfg.max_complexity,
        })
        .require(Condition::IsTrue(fields::ACTIONABLE))
}

impl StageHandler for AnalyzeStage {
    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    #[instrument(skip_all, fields(item = %item.key()))]
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome> {
        let config = ctx.config;
        let log = StageLog::new(&config.runs_dir, item, Stage::Analyze);
        let prompt = ctx
            .prompts
            .render("analyze", context! { issue => IssueContext::from_item(item) })?;

        let query = Query::new(
            "analysis",
            prompt,
            config.dispatch.default_strategy,
            schemas::analysis(),
        );
        let mut consensus = consult(ctx, &log, query, |_, _, records| {
            corroboration(records, CORROBORATED)
        })?;
        if let Some(issue_type) = labelled_type(item) {
            debug!(issue_type, "issue type taken from label");
            consensus.fields.insert(
                fields::ISSUE_TYPE.to_string(),
                Some(FieldValue::Text(issue_type.to_string())),
            );
        }

        let outcome = gated(Stage::Analyze, consensus, &analysis_gate(&config.pipeline));
        Ok(with_fields(outcome, keys::ANALYSIS))
    }
}
