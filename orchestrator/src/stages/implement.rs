//! Implement: get a patch for the plan and apply it on the work branch.

use anyhow::{Context, Result, anyhow};
use minijinja::context;
use serde_json::json;
use tracing::{info, instrument};

use crate::core::gate::{Condition, Gate};
use crate::core::schemas::{self, fields};
use crate::core::state::Stage;
use crate::core::types::{FieldValue, Fields};
use crate::core::work_item::{StageOutcome, StageStatus, WorkItem};
use crate::io::config::PipelineConfig;
use crate::io::stage_log::StageLog;

use super::{
    IssueContext, Query, StageContext, StageHandler, consult, gated, keys, meta_object,
    with_fields,
};

pub struct ImplementStage;

pub fn implementation_gate(cfg: &PipelineConfig) -> Gate {
    Gate::new()
        .require(Condition::MinConfidence(cfg.min_implementation_confidence))
        .require(Condition::NonEmpty(fields::PATCH))
}

/// A reply is only useful if it carries a fenced patch.
pub fn has_patch(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start().to_ascii_lowercase();
        line.starts_with("```diff") || line.starts_with("```patch")
    })
}

/// The provider's own confidence in its change, when it states one.
fn self_reported(fields: &Fields) -> f64 {
    fields
        .get(fields::CONFIDENCE)
        .and_then(Option::as_ref)
        .and_then(FieldValue::as_number)
        .unwrap_or(0.0)
}

impl StageHandler for ImplementStage {
    fn stage(&self) -> Stage {
        Stage::Implement
    }

    #[instrument(skip_all, fields(item = %item.key()))]
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome> {
        let config = ctx.config;
        let branch = item
            .meta_str(keys::BRANCH)
            .ok_or_else(|| anyhow!("no work branch recorded for {}", item.key()))?;
        let log = StageLog::new(&config.runs_dir, item, Stage::Implement);
        let prompt = ctx.prompts.render(
            "implement",
            context! {
                issue => IssueContext::from_item(item),
                plan => meta_object(item, keys::PLAN),
            },
        )?;

        let query = Query::new(
            "implementation",
            prompt,
            config.dispatch.implementation_strategy,
            schemas::implementation(),
        )
        .accept(&has_patch);
        let consensus = consult(ctx, &log, query, |_, fields, _| self_reported(fields))?;

        let outcome = with_fields(
            gated(Stage::Implement, consensus, &implementation_gate(&config.pipeline)),
            keys::IMPLEMENTATION,
        );
        if outcome.status != StageStatus::Passed {
            return Ok(outcome);
        }
        let patch = outcome
            .consensus
            .as_ref()
            .and_then(|c| c.text(fields::PATCH))
            .ok_or_else(|| anyhow!("accepted implementation has no patch"))?
            .to_string();

        ctx.workspace.prepare_branch(branch)?;
        ctx.workspace
            .apply_patch(&patch)
            .with_context(|| format!("apply implementation patch on {branch}"))?;
        let changed = ctx.workspace.changed_files()?;
        info!(%branch, files = changed.len(), "implementation applied");
        Ok(outcome.with_artifact(keys::CHANGED_FILES, json!(changed)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{StageFixture, implementation_reply};

    #[test]
    fn patch_detection_needs_a_diff_fence() {
        assert!(has_patch("Summary: x\n```diff\n+a\n```"));
        assert!(has_patch("  ```PATCH\n+a\n```"));
        assert!(!has_patch("I would change src/lib.rs"));
    }

    #[test]
    fn applies_the_first_reply_with_a_patch() {
        let mut fixture = StageFixture::with_replies(&[
            ("alpha", "I would rather not.".to_string()),
            ("beta", implementation_reply("src/config.rs")),
        ]);
        let mut item = fixture.issue_item(10, "Crash");
        item.metadata
            .insert(keys::BRANCH.to_string(), json!("orchestrator/issue-10-crash"));

        let outcome = ImplementStage
            .run(&mut fixture.context(), &item)
            .expect("implement");

        assert_eq!(outcome.status, StageStatus::Passed, "{:?}", outcome.reason);
        assert_eq!(outcome.artifacts[keys::CHANGED_FILES], json!(["src/config.rs"]));
        assert_eq!(
            fixture.workspace.branch().as_deref(),
            Some("orchestrator/issue-10-crash")
        );
        assert_eq!(fixture.workspace.patches().len(), 1);
    }

    #[test]
    fn rejected_replies_before_the_accepted_one_do_not_lower_confidence() {
        let reply = implementation_reply("src/config.rs").replace("Confidence: 0.8\n", "");
        let run = |replies: &[(&str, String)]| {
            let mut fixture = StageFixture::with_replies(replies);
            let mut item = fixture.issue_item(10, "Crash");
            item.metadata.insert(keys::BRANCH.to_string(), json!("b"));
            ImplementStage
                .run(&mut fixture.context(), &item)
                .expect("implement")
        };

        let first_try = run(&[("beta", reply.clone())]);
        let after_refusal = run(&[
            ("alpha", "I would rather not.".to_string()),
            ("beta", reply),
        ]);

        assert_eq!(first_try.status, StageStatus::Passed, "{:?}", first_try.reason);
        assert_eq!(after_refusal.status, StageStatus::Passed, "{:?}", after_refusal.reason);
        let confidence = |outcome: &StageOutcome| {
            outcome.consensus.as_ref().map(|c| c.confidence).expect("consensus")
        };
        assert_eq!(confidence(&first_try), confidence(&after_refusal));
    }

    #[test]
    fn no_patch_means_rejection_without_touching_the_workspace() {
        let mut fixture = StageFixture::with_replies(&[("alpha", "Summary: later".to_string())]);
        let mut item = fixture.issue_item(10, "Crash");
        item.metadata.insert(keys::BRANCH.to_string(), json!("b"));

        let outcome = ImplementStage
            .run(&mut fixture.context(), &item)
            .expect("implement");

        assert_eq!(outcome.status, StageStatus::Rejected);
        assert!(fixture.workspace.patches().is_empty());
    }

    #[test]
    fn missing_branch_is_an_error() {
        let mut fixture = StageFixture::with_replies(&[("alpha", implementation_reply("a.rs"))]);
        let item = fixture.issue_item(10, "Crash");
        let err = ImplementStage
            .run(&mut fixture.context(), &item)
            .expect_err("no branch");
        assert!(format!("{err:#}").contains("no work branch"));
    }
}
