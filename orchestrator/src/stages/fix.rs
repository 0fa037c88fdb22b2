//! Fix: debate a fix for the failing run and apply it when trusted.

use anyhow::{Context, Result};
use minijinja::context;
use serde_json::json;
use tracing::{info, instrument};

use crate::core::gate::{Condition, Gate};
use crate::core::reconcile::corroboration;
use crate::core::schemas::{self, fields};
use crate::core::state::Stage;
use crate::core::test_report::TestReport;
use crate::core::work_item::{StageOutcome, StageStatus, WorkItem};
use crate::io::config::PipelineConfig;
use crate::io::stage_log::StageLog;

use super::{
    IssueContext, Query, StageContext, StageHandler, consult, gated, keys, meta_object,
    with_fields,
};

const CORROBORATED: &[&str] = &[fields::RECOMMENDED_FIX, fields::PROPOSED_CHANGES];

pub struct FixStage;

pub fn fix_gate(cfg: &PipelineConfig) -> Gate {
    Gate::new()
        .require(Condition::MinConfidence(cfg.min_fix_confidence))
        .require(Condition::AtLeast {
            field: fields::SUCCESS_PROBABILITY,
            min: cfg.min_fix_confidence,
        })
        .require(Condition::NonEmpty(fields::PROPOSED_CHANGES))
}

/// The last test report recorded on the item.
pub fn stored_report(item: &WorkItem) -> Option<TestReport> {
    item.metadata
        .get(keys::TEST_REPORT)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

impl StageHandler for FixStage {
    fn stage(&self) -> Stage {
        Stage::Fix
    }

    #[instrument(skip_all, fields(item = %item.key(), attempt = item.fix_attempts + 1))]
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome> {
        let config = ctx.config;
        let log = StageLog::new(&config.runs_dir, item, Stage::Fix);
        let summary = stored_report(item)
            .map(|report| report.failure_summary())
            .unwrap_or_default();
        let prompt = ctx.prompts.render(
            "fix",
            context! {
                issue => IssueContext::from_item(item),
                failure => meta_object(item, keys::FAILURE_ANALYSIS),
                summary => summary,
                attempt => item.fix_attempts + 1,
            },
        )?;

        let query = Query::new("fix", prompt, config.dispatch.fix_strategy, schemas::fix());
        let consensus = consult(ctx, &log, query, |_, _, records| {
            corroboration(records, CORROBORATED)
        })?;

        let outcome = with_fields(
            gated(Stage::Fix, consensus, &fix_gate(&config.pipeline)),
            keys::FIX,
        );
        if outcome.status != StageStatus::Passed {
            return Ok(outcome);
        }
        let changes = outcome
            .consensus
            .as_ref()
            .and_then(|c| c.text(fields::PROPOSED_CHANGES))
            .unwrap_or_default()
            .to_string();

        if let Some(branch) = item.meta_str(keys::BRANCH) {
            ctx.workspace.prepare_branch(branch)?;
        }
        ctx.workspace
            .apply_patch(&changes)
            .context("apply proposed fix")?;
        let changed = ctx.workspace.changed_files()?;
        info!(files = changed.len(), "fix applied");
        Ok(outcome.with_artifact(keys::CHANGED_FILES, json!(changed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StageFixture, fix_reply};

    #[test]
    fn confident_fix_is_applied() {
        let mut fixture =
            StageFixture::with_replies(&[("alpha", fix_reply(0.8)), ("beta", fix_reply(0.9))]);
        let item = fixture.issue_item(10, "Crash");

        let outcome = FixStage.run(&mut fixture.context(), &item).expect("fix");

        assert_eq!(outcome.status, StageStatus::Passed, "{:?}", outcome.reason);
        let consensus = outcome.consensus.as_ref().expect("consensus");
        assert_eq!(consensus.number(fields::SUCCESS_PROBABILITY), Some(0.85));
        assert_eq!(fixture.workspace.patches().len(), 1);
        // Every provider answers proposal, critique and synthesis rounds.
        assert_eq!(fixture.dispatcher.ledger().calls(), 6);
    }

    #[test]
    fn unlikely_fix_is_rejected_and_not_applied() {
        let mut fixture = StageFixture::with_replies(&[("alpha", fix_reply(0.3))]);
        let item = fixture.issue_item(10, "Crash");

        let outcome = FixStage.run(&mut fixture.context(), &item).expect("fix");

        assert_eq!(outcome.status, StageStatus::Rejected);
        assert!(
            outcome
                .reason
                .as_deref()
                .is_some_and(|r| r.contains("success_probability 0.3 below minimum 0.6"))
        );
        assert!(fixture.workspace.patches().is_empty());
    }
}
