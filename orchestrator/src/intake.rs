//! Intake sweeps for `orchestrator start`.

use anyhow::{Result, bail};
use tracing::{info, instrument, warn};

use crate::core::state::WorkState;
use crate::core::work_item::{WorkKind, work_key};
use crate::io::config::Mode;
use crate::io::registry::Claim;
use crate::pipeline::{Pipeline, ProcessOutcome};

/// Limits for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOptions {
    /// Stop after processing this many items.
    pub max_items: Option<usize>,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys newly claimed by this sweep.
    pub claimed: Vec<String>,
    /// Every item driven, with the state it was left in.
    pub processed: Vec<(String, WorkState)>,
    /// Open issues passed over (ignored label or already finished).
    pub skipped: Vec<String>,
    /// The sweep ended early on a stop request.
    pub stopped: bool,
}

/// Resume in-progress items, then claim and process labelled open issues.
///
/// Items already tracked in a terminal state are never picked up again. The
/// sweep ends when the in-progress cap is reached, when `max_items` items
/// were processed, or on a stop request.
#[instrument(skip_all, fields(mode = %pipeline.config().mode))]
pub fn sweep(pipeline: &mut Pipeline, options: SweepOptions) -> Result<SweepReport> {
    if pipeline.config().mode == Mode::Manual {
        bail!("mode is manual: start does not claim work; use `process <ID>`");
    }
    let mut report = SweepReport::default();
    let limit_reached =
        |report: &SweepReport| options.max_items.is_some_and(|max| report.processed.len() >= max);

    let resumable: Vec<(WorkKind, String)> = pipeline
        .registry()
        .in_progress()
        .into_iter()
        .map(|item| (item.kind, item.id.clone()))
        .collect();
    for (kind, id) in resumable {
        if limit_reached(&report) {
            return Ok(report);
        }
        if !drive(pipeline, kind, &id, &mut report)? {
            return Ok(report);
        }
    }

    let intake = pipeline.config().intake.clone();
    let issues = pipeline.host().list_issues(&intake.auto_claim_labels)?;
    info!(open = issues.len(), "issues listed");
    for issue in issues {
        if limit_reached(&report) {
            break;
        }
        if pipeline.stop_requested() {
            report.stopped = true;
            break;
        }
        let id = issue.number.to_string();
        let key = work_key(WorkKind::Issue, &id);
        if let Some(label) = intake.ignore_labels.iter().find(|l| issue.has_label(l)) {
            info!(item = %key, %label, "skipping ignored issue");
            report.skipped.push(key);
            continue;
        }
        match pipeline.registry().get(&key).map(|item| item.state) {
            Some(state) if state != WorkState::Pending => {
                report.skipped.push(key);
                continue;
            }
            Some(_) => {}
            None => pipeline.track_issue(&issue)?,
        }
        match pipeline.claim(WorkKind::Issue, &id)? {
            Claim::Claimed => report.claimed.push(key),
            Claim::AlreadyTracked(_) => {}
            Claim::AtCapacity => {
                info!(
                    cap = intake.max_concurrent,
                    "in-progress cap reached; ending sweep"
                );
                break;
            }
        }
        if !drive(pipeline, WorkKind::Issue, &id, &mut report)? {
            break;
        }
    }
    Ok(report)
}

/// Process one item; `false` when the sweep should end on a stop request.
fn drive(
    pipeline: &mut Pipeline,
    kind: WorkKind,
    id: &str,
    report: &mut SweepReport,
) -> Result<bool> {
    let key = work_key(kind, id);
    match pipeline.process(kind, id)? {
        ProcessOutcome::Finished(state) => {
            report.processed.push((key, state));
            Ok(true)
        }
        ProcessOutcome::Stopped(state) => {
            warn!(item = %key, %state, "sweep stopped");
            report.processed.push((key, state));
            report.stopped = true;
            Ok(false)
        }
    }
}
