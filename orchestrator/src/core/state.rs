//! Work-item lifecycle: states, stages and the transition table.
//!
//! `next_state` is the single transition function. Every (state, event) pair
//! is matched explicitly; pairs that make no sense return an error instead of
//! being ignored.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    Analyzing,
    Planning,
    Implementing,
    Testing,
    Fixing,
    Delivering,
    Completed,
    Rejected,
    Escalated,
    Failed,
}

impl WorkState {
    pub const ALL: [WorkState; 11] = [
        Self::Pending,
        Self::Analyzing,
        Self::Planning,
        Self::Implementing,
        Self::Testing,
        Self::Fixing,
        Self::Delivering,
        Self::Completed,
        Self::Rejected,
        Self::Escalated,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Testing => "testing",
            Self::Fixing => "fixing",
            Self::Delivering => "delivering",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Escalated | Self::Failed
        )
    }

    /// Claimed and not yet finished. Counts against the concurrency cap.
    pub fn is_in_progress(self) -> bool {
        !self.is_terminal() && self != Self::Pending
    }

    /// Stage the controller runs while the item sits in this state.
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Analyzing => Some(Stage::Analyze),
            Self::Planning => Some(Stage::Plan),
            Self::Implementing => Some(Stage::Implement),
            Self::Testing => Some(Stage::Test),
            Self::Fixing => Some(Stage::Fix),
            Self::Delivering => Some(Stage::Deliver),
            Self::Pending
            | Self::Completed
            | Self::Rejected
            | Self::Escalated
            | Self::Failed => None,
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow!("unknown work state '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Plan,
    Implement,
    Test,
    Fix,
    Deliver,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Self::Analyze,
        Self::Plan,
        Self::Implement,
        Self::Test,
        Self::Fix,
        Self::Deliver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Fix => "fix",
            Self::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened, as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Item claimed from intake.
    Claimed,
    /// Stage gate passed.
    Passed,
    /// Stage gate rejected the item.
    Rejected,
    /// Tests failed and the fix budget allows another attempt.
    TestsFailed,
    /// Automated budgets are spent; a human must decide.
    Escalate,
    /// Stage retries exhausted.
    Failed,
}

/// The transition table.
pub fn next_state(from: WorkState, event: Event) -> Result<WorkState> {
    use WorkState as S;

    let to = match (from, event) {
        (S::Pending, Event::Claimed) => S::Analyzing,

        (S::Analyzing, Event::Passed) => S::Planning,
        (S::Planning, Event::Passed) => S::Implementing,
        (S::Implementing, Event::Passed) => S::Testing,
        (S::Testing, Event::Passed) => S::Delivering,
        (S::Fixing, Event::Passed) => S::Testing,
        (S::Delivering, Event::Passed) => S::Completed,

        (S::Analyzing | S::Planning | S::Implementing, Event::Rejected) => S::Rejected,

        (S::Testing, Event::TestsFailed) => S::Fixing,
        (S::Testing | S::Fixing | S::Delivering, Event::Escalate) => S::Escalated,

        (
            S::Analyzing
            | S::Planning
            | S::Implementing
            | S::Testing
            | S::Fixing
            | S::Delivering,
            Event::Failed,
        ) => S::Failed,

        (
            S::Pending,
            Event::Passed | Event::Rejected | Event::TestsFailed | Event::Escalate | Event::Failed,
        )
        | (
            S::Analyzing | S::Planning | S::Implementing | S::Fixing | S::Delivering,
            Event::Claimed | Event::TestsFailed,
        )
        | (S::Analyzing | S::Planning | S::Implementing, Event::Escalate)
        | (S::Testing, Event::Claimed | Event::Rejected)
        | (S::Fixing | S::Delivering, Event::Rejected)
        | (S::Completed | S::Rejected | S::Escalated | S::Failed, _) => {
            bail!("no transition from {from} on {event:?}")
        }
    };
    Ok(to)
}
