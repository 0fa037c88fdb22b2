//! Cross-provider consensus.
//!
//! Each field is merged with the strategy its type selects:
//!
//! | kind        | strategy                                                   |
//! |-------------|------------------------------------------------------------|
//! | categorical | plurality; ties go to the value voted first (query order)  |
//! | numeric     | mean, rounded and clamped; schema default when no values   |
//! | list        | union, case-insensitive dedup, truncated to the cap        |
//! | free text   | longest non-empty value; ties go to the earliest           |
//! | boolean     | strict majority; a tie resolves to `false`                 |
//!
//! Confidence is a fixed weighted sum of response completeness, field
//! coverage and a caller-supplied boost, clamped to `[0, 1]`. Everything here
//! is a pure function of its inputs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::extract::{extract_all, unique_capped};
use super::schema::{FieldKind, FieldSpec, Schema, normalize_number};
use super::types::{ConsensusResult, DispatchResult, ExtractedRecord, FieldValue, Fields};

/// Weights of the confidence terms. They must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    /// Share of queried providers that produced a parseable record.
    pub completeness: f64,
    /// Share of schema fields with at least one contributor.
    pub coverage: f64,
    /// Caller-supplied corroboration term.
    pub boost: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            completeness: 0.5,
            coverage: 0.3,
            boost: 0.2,
        }
    }
}

impl ConfidenceWeights {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("completeness", self.completeness),
            ("coverage", self.coverage),
            ("boost", self.boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                problems.push(format!("consensus.weights.{name} must be within [0, 1]"));
            }
        }
        let sum = self.completeness + self.coverage + self.boost;
        if (sum - 1.0).abs() > 1e-6 {
            problems.push(format!("consensus.weights must sum to 1.0 (got {sum})"));
        }
        problems
    }

    /// Weighted sum of the three terms, each clamped to `[0, 1]` first.
    pub fn combine(&self, completeness: f64, coverage: f64, boost: f64) -> f64 {
        let score = self.completeness * unit(completeness)
            + self.coverage * unit(coverage)
            + self.boost * unit(boost);
        unit(score)
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Reconcile records with no boost and no raw responses attached.
pub fn reconcile(
    schema: &Schema,
    records: &[ExtractedRecord],
    weights: &ConfidenceWeights,
) -> ConsensusResult {
    reconcile_with(schema, records, weights, BTreeMap::new(), |_, _| 0.0)
}

/// Reconcile records, computing the boost from the merged fields.
pub fn reconcile_with<B>(
    schema: &Schema,
    records: &[ExtractedRecord],
    weights: &ConfidenceWeights,
    raw_responses: BTreeMap<String, String>,
    boost: B,
) -> ConsensusResult
where
    B: FnOnce(&Fields, &[ExtractedRecord]) -> f64,
{
    let fields: Fields = schema
        .fields
        .iter()
        .map(|spec| (spec.name.to_string(), merge_field(spec, records)))
        .collect();

    let contributing_providers: BTreeSet<String> = records
        .iter()
        .filter(|record| record.is_parseable())
        .map(|record| record.provider_id.clone())
        .collect();

    let confidence = if records.is_empty() {
        0.0
    } else {
        let completeness = contributing_providers.len() as f64 / records.len() as f64;
        let coverage = field_coverage(schema, records);
        weights.combine(completeness, coverage, boost(&fields, records))
    };

    ConsensusResult {
        schema_id: schema.id.to_string(),
        fields,
        confidence,
        contributing_providers,
        raw_responses,
    }
}

/// Extract every queried provider's reply and reconcile it in one call.
pub fn reconcile_dispatch<B>(
    schema: &Schema,
    result: &DispatchResult,
    weights: &ConfidenceWeights,
    boost: B,
) -> (Vec<ExtractedRecord>, ConsensusResult)
where
    B: FnOnce(&Fields, &[ExtractedRecord]) -> f64,
{
    let records = extract_all(schema, result);
    let consensus = reconcile_with(schema, &records, weights, result.texts(), boost);
    (records, consensus)
}

/// Mean share of records that supplied each named field.
///
/// Used as the boost for stages whose key fields should be corroborated by
/// every provider rather than by one.
pub fn corroboration(records: &[ExtractedRecord], names: &[&str]) -> f64 {
    if records.is_empty() || names.is_empty() {
        return 0.0;
    }
    let total: f64 = names
        .iter()
        .map(|name| {
            let present = records.iter().filter(|r| r.get(name).is_some()).count();
            present as f64 / records.len() as f64
        })
        .sum();
    total / names.len() as f64
}

fn field_coverage(schema: &Schema, records: &[ExtractedRecord]) -> f64 {
    if schema.fields.is_empty() {
        return 0.0;
    }
    let covered = schema
        .fields
        .iter()
        .filter(|spec| records.iter().any(|r| r.get(spec.name).is_some()))
        .count();
    covered as f64 / schema.fields.len() as f64
}

fn merge_field(spec: &FieldSpec, records: &[ExtractedRecord]) -> Option<FieldValue> {
    let values = records.iter().filter_map(|r| r.get(spec.name));
    match &spec.kind {
        FieldKind::Categorical { default, .. } => {
            let votes: Vec<&str> = values.filter_map(FieldValue::as_text).collect();
            plurality(&votes)
                .or(*default)
                .map(|choice| FieldValue::Text(choice.to_string()))
        }
        FieldKind::Numeric {
            min,
            max,
            precision,
            default,
        } => {
            let numbers: Vec<f64> = values.filter_map(FieldValue::as_number).collect();
            if numbers.is_empty() {
                return default.map(FieldValue::Number);
            }
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Some(FieldValue::Number(normalize_number(
                mean, *min, *max, *precision,
            )))
        }
        FieldKind::TextList { max } => {
            let merged = unique_capped(
                values
                    .filter_map(FieldValue::as_list)
                    .flat_map(|items| items.iter().map(String::as_str)),
                *max,
            );
            (!merged.is_empty()).then_some(FieldValue::List(merged))
        }
        FieldKind::FreeText => {
            let mut best: Option<(&str, usize)> = None;
            for text in values.filter_map(FieldValue::as_text) {
                let len = text.trim().chars().count();
                if len == 0 {
                    continue;
                }
                if best.is_none_or(|(_, top)| len > top) {
                    best = Some((text, len));
                }
            }
            best.map(|(text, _)| FieldValue::Text(text.trim().to_string()))
        }
        FieldKind::Boolean => {
            let (yes, no) = values
                .filter_map(FieldValue::as_flag)
                .fold((0usize, 0usize), |(yes, no), flag| {
                    if flag { (yes + 1, no) } else { (yes, no + 1) }
                });
            if yes + no == 0 {
                return None;
            }
            Some(FieldValue::Flag(yes > no))
        }
    }
}

/// Most frequent vote; among equal counts the value voted first wins.
fn plurality<'a>(votes: &[&'a str]) -> Option<&'a str> {
    let mut tally: Vec<(&'a str, usize)> = Vec::new();
    for vote in votes {
        match tally.iter_mut().find(|entry| entry.0 == *vote) {
            Some(entry) => entry.1 += 1,
            None => tally.push((vote, 1)),
        }
    }
    let mut best: Option<(&'a str, usize)> = None;
    for (value, count) in tally {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::extract;
    use crate::core::schemas::{self, fields};

    fn record(provider: &str, schema: &Schema, values: &[(&str, FieldValue)]) -> ExtractedRecord {
        let mut fields: Fields = schema
            .fields
            .iter()
            .map(|f| (f.name.to_string(), None))
            .collect();
        for (name, value) in values {
            fields.insert((*name).to_string(), Some(value.clone()));
        }
        ExtractedRecord {
            provider_id: provider.to_string(),
            schema_id: schema.id.to_string(),
            fields,
        }
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    #[test]
    fn reconcile_is_deterministic() {
        let schema = schemas::analysis();
        let records = vec![
            record(
                "a",
                &schema,
                &[
                    (fields::ISSUE_TYPE, text("bug")),
                    (fields::COMPLEXITY, FieldValue::Number(3.0)),
                ],
            ),
            record(
                "b",
                &schema,
                &[
                    (fields::ISSUE_TYPE, text("feature")),
                    (fields::ACTIONABLE, FieldValue::Flag(true)),
                ],
            ),
        ];
        let weights = ConfidenceWeights::default();
        let first = reconcile(&schema, &records, &weights);
        let second = reconcile(&schema, &records, &weights);
        assert_eq!(first, second);
        assert_eq!(first.confidence.to_bits(), second.confidence.to_bits());
    }

    #[test]
    fn empty_records_have_zero_confidence() {
        let result = reconcile(&schemas::analysis(), &[], &ConfidenceWeights::default());
        assert_eq!(result.confidence, 0.0);
        assert!(result.contributing_providers.is_empty());
        // Numeric default still applies.
        assert_eq!(result.number(fields::COMPLEXITY), Some(5.0));
        assert_eq!(result.text(fields::ISSUE_TYPE), Some("unknown"));
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let schema = schemas::analysis();
        let full = record(
            "a",
            &schema,
            &[
                (fields::ISSUE_TYPE, text("bug")),
                (fields::COMPLEXITY, FieldValue::Number(2.0)),
                (fields::ACTIONABLE, FieldValue::Flag(true)),
                (fields::REQUIREMENTS, FieldValue::List(vec!["r".to_string()])),
                (fields::AFFECTED_FILES, FieldValue::List(vec!["a.rs".to_string()])),
                (fields::RISKS, FieldValue::List(vec!["x".to_string()])),
                (fields::APPROACH, text("do it")),
            ],
        );
        let weights = ConfidenceWeights::default();
        for boost in [-5.0, 0.0, 0.5, 1.0, 9.0, f64::NAN] {
            let result = reconcile_with(
                &schema,
                std::slice::from_ref(&full),
                &weights,
                BTreeMap::new(),
                |_, _| boost,
            );
            assert!((0.0..=1.0).contains(&result.confidence), "boost {boost}");
        }
        let empty = record("b", &schema, &[]);
        let result = reconcile(&schema, &[empty], &weights);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn boolean_tie_resolves_to_false() {
        let schema = schemas::analysis();
        let records = vec![
            record("a", &schema, &[(fields::ACTIONABLE, FieldValue::Flag(true))]),
            record("b", &schema, &[(fields::ACTIONABLE, FieldValue::Flag(false))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.flag(fields::ACTIONABLE), Some(false));
    }

    #[test]
    fn boolean_majority_wins() {
        let schema = schemas::review();
        let records = vec![
            record("a", &schema, &[(fields::APPROVE, FieldValue::Flag(true))]),
            record("b", &schema, &[(fields::APPROVE, FieldValue::Flag(false))]),
            record("c", &schema, &[(fields::APPROVE, FieldValue::Flag(true))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.flag(fields::APPROVE), Some(true));
    }

    #[test]
    fn categorical_tie_goes_to_first_queried_provider() {
        let schema = schemas::analysis();
        let records = vec![
            record("a", &schema, &[(fields::ISSUE_TYPE, text("feature"))]),
            record("b", &schema, &[(fields::ISSUE_TYPE, text("bug"))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.text(fields::ISSUE_TYPE), Some("feature"));

        let reversed: Vec<_> = records.into_iter().rev().collect();
        let result = reconcile(&schema, &reversed, &ConfidenceWeights::default());
        assert_eq!(result.text(fields::ISSUE_TYPE), Some("bug"));
    }

    #[test]
    fn categorical_plurality_beats_order() {
        let schema = schemas::analysis();
        let records = vec![
            record("a", &schema, &[(fields::ISSUE_TYPE, text("feature"))]),
            record("b", &schema, &[(fields::ISSUE_TYPE, text("bug"))]),
            record("c", &schema, &[(fields::ISSUE_TYPE, text("bug"))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.text(fields::ISSUE_TYPE), Some("bug"));
    }

    #[test]
    fn list_union_respects_cap_and_dedup() {
        let schema = schemas::analysis();
        let make = |offset: usize, upper: bool| {
            let items: Vec<String> = (0..10)
                .map(|i| {
                    let item = format!("file{}.rs", i + offset);
                    if upper { item.to_uppercase() } else { item }
                })
                .collect();
            items
        };
        let records = vec![
            record("a", &schema, &[(fields::AFFECTED_FILES, FieldValue::List(make(0, false)))]),
            record("b", &schema, &[(fields::AFFECTED_FILES, FieldValue::List(make(3, true)))]),
            record("c", &schema, &[(fields::AFFECTED_FILES, FieldValue::List(make(6, false)))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        let merged = result.list(fields::AFFECTED_FILES);
        assert_eq!(merged.len(), 10);
        let mut lowered: Vec<String> = merged.iter().map(|s| s.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), merged.len());
        assert_eq!(merged[0], "file0.rs");
    }

    #[test]
    fn longest_free_text_wins() {
        let schema = schemas::analysis();
        let records = vec![
            record("a", &schema, &[(fields::APPROACH, text("short"))]),
            record("b", &schema, &[(fields::APPROACH, text("a much more detailed plan"))]),
            record("c", &schema, &[(fields::APPROACH, text("x"))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.text(fields::APPROACH), Some("a much more detailed plan"));
    }

    #[test]
    fn numeric_mean_is_rounded_and_defaults_apply() {
        let schema = schemas::fix();
        let records = vec![
            record("a", &schema, &[(fields::SUCCESS_PROBABILITY, FieldValue::Number(0.6))]),
            record("b", &schema, &[(fields::SUCCESS_PROBABILITY, FieldValue::Number(0.9))]),
        ];
        let result = reconcile(&schema, &records, &ConfidenceWeights::default());
        assert_eq!(result.number(fields::SUCCESS_PROBABILITY), Some(0.75));

        let silent = vec![record("a", &schema, &[])];
        let result = reconcile(&schema, &silent, &ConfidenceWeights::default());
        assert_eq!(result.number(fields::SUCCESS_PROBABILITY), Some(0.0));
    }

    /// Two providers vote bug with complexity 6 and 8.
    #[test]
    fn two_provider_analysis_averages_complexity() {
        let schema = schemas::analysis();
        let records = vec![
            extract(&schema, "anthropic", "Issue Type: bug\nComplexity: 6\nActionable: yes"),
            extract(&schema, "openai", "Issue Type: bug\nComplexity: 8\nActionable: yes"),
        ];
        let weights = ConfidenceWeights::default();
        let result = reconcile_with(&schema, &records, &weights, BTreeMap::new(), |_, recs| {
            corroboration(recs, &[fields::ISSUE_TYPE, fields::COMPLEXITY, fields::ACTIONABLE])
        });
        assert_eq!(result.text(fields::ISSUE_TYPE), Some("bug"));
        assert_eq!(result.number(fields::COMPLEXITY), Some(7.0));
        assert_eq!(result.flag(fields::ACTIONABLE), Some(true));
        assert_eq!(result.contributing_providers.len(), 2);
        // completeness 2/2, coverage 3/7, full corroboration
        let expected = 0.5 + 0.3 * (3.0 / 7.0) + 0.2;
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn weights_must_sum_to_one() {
        assert!(ConfidenceWeights::default().problems().is_empty());
        let bad = ConfidenceWeights {
            completeness: 0.5,
            coverage: 0.5,
            boost: 0.5,
        };
        assert_eq!(bad.problems().len(), 1);
    }
}
