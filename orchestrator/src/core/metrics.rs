//! Per-instance statistics accumulators.
//!
//! Each dispatcher and controller owns its own accumulator; nothing here is
//! global, so parallel tests never observe each other's counts.

use std::collections::BTreeMap;

use serde::Serialize;

use super::state::{Stage, WorkState};
use super::work_item::StageStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderTally {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchMetrics {
    pub dispatches: u64,
    pub failed_dispatches: u64,
    pub timeouts: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_provider: BTreeMap<String, ProviderTally>,
}

impl DispatchMetrics {
    pub fn record_success(&mut self, provider: &str, tokens: u64, cost: f64) {
        let tally = self.by_provider.entry(provider.to_string()).or_default();
        tally.calls += 1;
        tally.successes += 1;
        tally.tokens += tokens;
        tally.cost += cost;
        self.total_tokens += tokens;
        self.total_cost += cost;
    }

    pub fn record_failure(&mut self, provider: &str) {
        let tally = self.by_provider.entry(provider.to_string()).or_default();
        tally.calls += 1;
        tally.failures += 1;
    }

    pub fn record_dispatch(&mut self, ok: bool, timed_out: bool) {
        self.dispatches += 1;
        if !ok {
            self.failed_dispatches += 1;
        }
        if timed_out {
            self.timeouts += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTally {
    pub passed: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub completed: u64,
    pub rejected: u64,
    pub escalated: u64,
    pub failed: u64,
    pub stages: BTreeMap<Stage, StageTally>,
}

impl PipelineMetrics {
    pub fn record_stage(&mut self, stage: Stage, status: StageStatus) {
        let tally = self.stages.entry(stage).or_default();
        match status {
            StageStatus::Passed => tally.passed += 1,
            StageStatus::Rejected => tally.rejected += 1,
            StageStatus::Failed => tally.failed += 1,
        }
    }

    /// Count a finished item by its final state. Non-terminal states only bump `processed`.
    pub fn record_finish(&mut self, state: WorkState) {
        self.processed += 1;
        match state {
            WorkState::Completed => self.completed += 1,
            WorkState::Rejected => self.rejected += 1,
            WorkState::Escalated => self.escalated += 1,
            WorkState::Failed => self.failed += 1,
            WorkState::Pending
            | WorkState::Analyzing
            | WorkState::Planning
            | WorkState::Implementing
            | WorkState::Testing
            | WorkState::Fixing
            | WorkState::Delivering => {}
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.completed as f64 / self.processed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_metrics_tally_per_provider() {
        let mut metrics = DispatchMetrics::default();
        metrics.record_success("a", 10, 0.5);
        metrics.record_failure("a");
        metrics.record_success("b", 5, 0.25);
        metrics.record_dispatch(true, false);
        assert_eq!(metrics.total_tokens, 15);
        assert_eq!(metrics.by_provider["a"].calls, 2);
        assert_eq!(metrics.by_provider["a"].failures, 1);
        assert_eq!(metrics.dispatches, 1);
    }

    #[test]
    fn pipeline_metrics_count_final_states() {
        let mut metrics = PipelineMetrics::default();
        metrics.record_finish(WorkState::Completed);
        metrics.record_finish(WorkState::Escalated);
        metrics.record_stage(Stage::Fix, StageStatus::Passed);
        metrics.record_stage(Stage::Fix, StageStatus::Passed);
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.success_rate(), 0.5);
        assert_eq!(metrics.stages[&Stage::Fix].passed, 2);
    }
}
