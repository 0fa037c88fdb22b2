//! Stage gates: predicates over a consensus result.
//!
//! Boundaries are inclusive. A condition on a field that consensus left empty
//! fails, so a missing answer never lets an item advance.

use super::types::ConsensusResult;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `confidence >= threshold`.
    MinConfidence(f64),
    /// Numeric field `<= max`.
    AtMost { field: &'static str, max: f64 },
    /// Numeric field `>= min`.
    AtLeast { field: &'static str, min: f64 },
    /// Boolean field is `true`.
    IsTrue(&'static str),
    /// Text or list field has content.
    NonEmpty(&'static str),
}

impl Condition {
    /// `None` when the condition holds, otherwise the reason it failed.
    fn check(&self, result: &ConsensusResult) -> Option<String> {
        match self {
            Self::MinConfidence(threshold) => (result.confidence < *threshold).then(|| {
                format!(
                    "confidence {:.2} below threshold {threshold:.2}",
                    result.confidence
                )
            }),
            Self::AtMost { field, max } => match result.number(field) {
                Some(value) if value <= *max => None,
                Some(value) => Some(format!("{field} {value} exceeds maximum {max}")),
                None => Some(format!("{field} missing")),
            },
            Self::AtLeast { field, min } => match result.number(field) {
                Some(value) if value >= *min => None,
                Some(value) => Some(format!("{field} {value} below minimum {min}")),
                None => Some(format!("{field} missing")),
            },
            Self::IsTrue(field) => match result.flag(field) {
                Some(true) => None,
                Some(false) => Some(format!("{field} is false")),
                None => Some(format!("{field} missing")),
            },
            Self::NonEmpty(field) => {
                let present = result.get(field).is_some_and(|value| !value.is_blank());
                (!present).then(|| format!("{field} missing"))
            }
        }
    }
}

/// Conjunction of conditions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gate {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Every failed condition, in declaration order.
    Reject(Vec<String>),
}

impl Verdict {
    /// Reasons joined for logs and stage outcomes.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Pass => None,
            Self::Reject(reasons) => Some(reasons.join("; ")),
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn evaluate(&self, result: &ConsensusResult) -> Verdict {
        let failures: Vec<String> = self
            .conditions
            .iter()
            .filter_map(|condition| condition.check(result))
            .collect();
        if failures.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Reject(failures)
        }
    }
}
