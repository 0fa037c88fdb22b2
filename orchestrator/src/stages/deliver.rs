//! Deliver: publish the branch, open the pull request, review it, and merge
//! when the mode allows.

use anyhow::{Result, anyhow};
use minijinja::context;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::gate::{Condition, Gate, Verdict};
use crate::core::reconcile::corroboration;
use crate::core::schemas::{self, fields};
use crate::core::state::Stage;
use crate::core::test_report::TestReport;
use crate::core::work_item::{StageOutcome, WorkItem, WorkKind};
use crate::io::config::{Mode, PipelineConfig};
use crate::io::host::{PullRequest, PullRequestDraft};
use crate::io::stage_log::StageLog;

use super::fix::stored_report;
use super::{
    IssueContext, Query, StageContext, StageHandler, consult, keys, meta_field_str, meta_list,
};

const CORROBORATED: &[&str] = &[fields::APPROVE, fields::SUMMARY];

pub struct DeliverStage;

pub fn review_gate(cfg: &PipelineConfig) -> Gate {
    Gate::new()
        .require(Condition::MinConfidence(cfg.min_review_confidence))
        .require(Condition::IsTrue(fields::APPROVE))
}

fn recorded_pr(item: &WorkItem) -> Option<PullRequest> {
    let number = item.metadata.get(keys::PR_NUMBER)?.as_u64()?;
    let url = item.meta_str(keys::PR_URL).unwrap_or_default().to_string();
    Some(PullRequest { number, url })
}

fn tests_line(report: Option<&TestReport>) -> String {
    match report {
        Some(r) => format!("{} passed, {} failed, {} skipped", r.passed, r.failed, r.skipped),
        None => "no test report recorded".to_string(),
    }
}

pub fn pull_request_draft(item: &WorkItem, branch: &str, base: &str) -> PullRequestDraft {
    let issue = IssueContext::from_item(item);
    let summary = meta_field_str(item, keys::IMPLEMENTATION, fields::SUMMARY)
        .unwrap_or(&issue.title)
        .to_string();
    let steps: Vec<String> = item
        .metadata
        .get(keys::PLAN)
        .and_then(|plan| plan.get(fields::STEPS))
        .and_then(|steps| steps.as_array())
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| s.as_str())
                .enumerate()
                .map(|(i, s)| format!("{}. {s}", i + 1))
                .collect()
        })
        .unwrap_or_default();

    let (title, reference) = match item.kind {
        WorkKind::Issue => (format!("{} (#{})", issue.title, item.id), format!("#{}", item.id)),
        WorkKind::Pr => (issue.title.clone(), format!("#{}", item.id)),
        WorkKind::Roadmap => (issue.title.clone(), format!("roadmap item `{}`", item.id)),
    };

    let mut body = format!("Automated change for {reference}.\n\n## Summary\n{summary}\n");
    if !steps.is_empty() {
        body.push_str(&format!("\n## Plan\n{}\n", steps.join("\n")));
    }
    body.push_str(&format!(
        "\n## Tests\n{}\n",
        tests_line(stored_report(item).as_ref())
    ));
    if item.kind == WorkKind::Issue {
        body.push_str(&format!("\nCloses #{}\n", item.id));
    }

    PullRequestDraft {
        title,
        body,
        head: branch.to_string(),
        base: base.to_string(),
        labels: Vec::new(),
    }
}

impl StageHandler for DeliverStage {
    fn stage(&self) -> Stage {
        Stage::Deliver
    }

    #[instrument(skip_all, fields(item = %item.key()))]
    fn run(&self, ctx: &mut StageContext<'_>, item: &WorkItem) -> Result<StageOutcome> {
        let config = ctx.config;
        let branch = item
            .meta_str(keys::BRANCH)
            .ok_or_else(|| anyhow!("no work branch recorded for {}", item.key()))?;
        let log = StageLog::new(&config.runs_dir, item, Stage::Deliver);

        let pr = match recorded_pr(item) {
            Some(pr) => {
                info!(pr = pr.number, "reusing open pull request");
                pr
            }
            None => {
                let draft = pull_request_draft(item, branch, &config.host.base_branch);
                ctx.workspace.prepare_branch(branch)?;
                ctx.workspace.commit(&draft.title)?;
                ctx.workspace.publish(branch)?;
                let pr = ctx.host.open_pull_request(&draft)?;
                info!(pr = pr.number, url = %pr.url, "pull request opened");
                ctx.checkpoint(keys::PR_NUMBER, pr.number);
                ctx.checkpoint(keys::PR_URL, pr.url.clone());
                pr
            }
        };

        let checks = ctx.host.ci_checks(pr.number)?;
        let failing: Vec<&str> = checks
            .iter()
            .filter(|c| c.is_failing())
            .map(|c| c.name.as_str())
            .collect();
        let pending = checks.iter().any(|c| c.is_pending());

        let report = stored_report(item);
        let issue = IssueContext::from_item(item);
        let prompt = ctx.prompts.render(
            "review",
            context! {
                issue => &issue,
                summary => meta_field_str(item, keys::IMPLEMENTATION, fields::SUMMARY)
                    .unwrap_or(&issue.title),
                changed_files => meta_list(item, keys::CHANGED_FILES),
                patch => meta_field_str(item, keys::IMPLEMENTATION, fields::PATCH),
                tests => tests_line(report.as_ref()),
            },
        )?;
        let query = Query::new(
            "review",
            prompt,
            config.dispatch.default_strategy,
            schemas::review(),
        );
        let consensus = consult(ctx, &log, query, |_, _, records| {
            corroboration(records, CORROBORATED)
        })?;

        let mut reasons = match review_gate(&config.pipeline).evaluate(&consensus) {
            Verdict::Pass => Vec::new(),
            Verdict::Reject(reasons) => reasons,
        };
        if !failing.is_empty() {
            reasons.push(format!("failing CI checks: {}", failing.join(", ")));
        }
        let review = consensus.fields_json();
        if !reasons.is_empty() {
            return Ok(
                StageOutcome::rejected(Stage::Deliver, Some(consensus), reasons.join("; "))
                    .with_artifact(keys::REVIEW, review)
                    .with_artifact(keys::PR_NUMBER, json!(pr.number))
                    .with_artifact(keys::PR_URL, json!(pr.url)),
            );
        }

        let merged = match config.mode {
            Mode::Autonomous if pending => {
                info!(pr = pr.number, "checks still running; leaving pull request open");
                false
            }
            Mode::Autonomous => {
                ctx.host.merge(pr.number, config.host.merge_strategy)?;
                info!(pr = pr.number, strategy = config.host.merge_strategy.as_str(), "merged");
                true
            }
            Mode::Manual | Mode::Supervised => false,
        };

        if item.kind == WorkKind::Issue
            && let Ok(number) = item.id.parse::<u64>()
        {
            let body = if merged {
                format!("Merged in {}.", pr.url)
            } else {
                format!("Opened {} for review.", pr.url)
            };
            if let Err(err) = ctx.host.comment(number, &body) {
                warn!(err = %format!("{err:#}"), "failed to comment on issue");
            }
        }

        Ok(StageOutcome::passed(Stage::Deliver, Some(consensus))
            .with_artifact(keys::REVIEW, review)
            .with_artifact(keys::PR_NUMBER, json!(pr.number))
            .with_artifact(keys::PR_URL, json!(pr.url))
            .with_artifact(keys::MERGED, json!(merged)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::work_item::StageStatus;
    use crate::io::config::MergeStrategy;
    use crate::io::host::CiCheck;
    use crate::test_support::{StageFixture, review_reply};

    fn ready_item(fixture: &StageFixture) -> WorkItem {
        let mut item = fixture.issue_item(10, "Crash when config is missing");
        item.metadata
            .insert(keys::BRANCH.to_string(), json!("orchestrator/issue-10-crash"));
        item.metadata.insert(
            keys::IMPLEMENTATION.to_string(),
            json!({"summary": "Fall back to defaults", "patch": "+x"}),
        );
        item.metadata
            .insert(keys::PLAN.to_string(), json!({"steps": ["Detect", "Default"]}));
        item
    }

    fn check(name: &str, status: &str, conclusion: Option<&str>) -> CiCheck {
        CiCheck {
            name: name.to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
        }
    }

    #[test]
    fn draft_links_issue_and_lists_plan() {
        let fixture = StageFixture::with_replies(&[]);
        let draft =
            pull_request_draft(&ready_item(&fixture), "orchestrator/issue-10-crash", "main");
        assert_eq!(draft.title, "Crash when config is missing (#10)");
        assert!(draft.body.contains("Fall back to defaults"));
        assert!(draft.body.contains("1. Detect\n2. Default"));
        assert!(draft.body.ends_with("Closes #10\n"));
        assert_eq!(draft.base, "main");
    }

    #[test]
    fn supervised_mode_opens_pr_and_never_merges() {
        let mut fixture = StageFixture::with_replies(&[("alpha", review_reply(true))]);
        fixture.host.set_checks(vec![check("ci", "completed", Some("success"))]);
        let item = ready_item(&fixture);

        let outcome = DeliverStage.run(&mut fixture.context(), &item).expect("deliver");

        assert_eq!(outcome.status, StageStatus::Passed, "{:?}", outcome.reason);
        assert_eq!(outcome.artifacts[keys::MERGED], json!(false));
        assert_eq!(fixture.host.pull_requests().len(), 1);
        assert!(fixture.host.merged().is_empty());
        assert_eq!(fixture.workspace.published(), vec!["orchestrator/issue-10-crash"]);
        let comments = fixture.host.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, 10);
        assert!(comments[0].1.contains("for review"));
    }

    #[test]
    fn autonomous_mode_merges_green_approved_pr() {
        let mut fixture = StageFixture::with_replies(&[("alpha", review_reply(true))]);
        fixture.config.mode = Mode::Autonomous;
        fixture.config.host.merge_strategy = MergeStrategy::Rebase;
        fixture.host.set_checks(vec![check("ci", "completed", Some("success"))]);
        let item = ready_item(&fixture);

        let outcome = DeliverStage.run(&mut fixture.context(), &item).expect("deliver");

        assert_eq!(outcome.artifacts[keys::MERGED], json!(true));
        let merged = fixture.host.merged();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1, MergeStrategy::Rebase);
    }

    #[test]
    fn autonomous_mode_waits_for_pending_checks() {
        let mut fixture = StageFixture::with_replies(&[("alpha", review_reply(true))]);
        fixture.config.mode = Mode::Autonomous;
        fixture.host.set_checks(vec![check("ci", "in_progress", None)]);
        let item = ready_item(&fixture);

        let outcome = DeliverStage.run(&mut fixture.context(), &item).expect("deliver");

        assert_eq!(outcome.status, StageStatus::Passed);
        assert_eq!(outcome.artifacts[keys::MERGED], json!(false));
        assert!(fixture.host.merged().is_empty());
    }

    #[test]
    fn failing_ci_or_request_changes_rejects() {
        let mut fixture = StageFixture::with_replies(&[("alpha", review_reply(false))]);
        fixture.host.set_checks(vec![check("lint", "completed", Some("failure"))]);
        let item = ready_item(&fixture);

        let outcome = DeliverStage.run(&mut fixture.context(), &item).expect("deliver");

        assert_eq!(outcome.status, StageStatus::Rejected);
        let reason = outcome.reason.as_deref().unwrap_or_default();
        assert!(reason.contains("approve is false"), "{reason}");
        assert!(reason.contains("failing CI checks: lint"), "{reason}");
        assert!(outcome.artifacts.contains_key(keys::PR_NUMBER));
        assert!(fixture.host.comments().is_empty());
    }

    #[test]
    fn recorded_pull_request_is_reused() {
        let mut fixture = StageFixture::with_replies(&[("alpha", review_reply(true))]);
        let mut item = ready_item(&fixture);
        item.metadata.insert(keys::PR_NUMBER.to_string(), json!(7));
        item.metadata
            .insert(keys::PR_URL.to_string(), json!("https://example.test/pull/7"));

        let mut ctx = fixture.context();
        let outcome = DeliverStage.run(&mut ctx, &item).expect("deliver");
        assert!(ctx.take_checkpoints().is_empty());
        drop(ctx);

        assert_eq!(outcome.artifacts[keys::PR_NUMBER], json!(7));
        assert!(fixture.host.pull_requests().is_empty());
        assert!(fixture.workspace.published().is_empty());
    }
}
