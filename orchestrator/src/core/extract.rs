//! Rule-based field extraction from free-form provider text.
//!
//! Extraction never fails: a rule that finds nothing yields `None` and the next
//! rule for the field is tried. Numeric values are clamped to the declared
//! range, lists are capped and deduplicated case-insensitively in first-seen
//! order.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use super::schema::{FieldKind, FieldSpec, Rule, Schema, normalize_number};
use super::types::{DispatchResult, ExtractedRecord, FieldValue, Strategy};

static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[.)]|[-*•+])\s+(.+?)\s*$").expect("bullet regex should compile")
});

static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+[.)]\s+(.+?)\s*$").expect("numbered regex should compile")
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d+(?:\.\d+)?)\s*(%)?").expect("number regex should compile")
});

static OUT_OF_TEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*(?:/\s*10|out of 10)\b")
        .expect("out-of-ten regex should compile")
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s`'"(\[:,])((?:[A-Za-z0-9_.-]+/)*[A-Za-z0-9_.-]*[A-Za-z0-9_-]\.(?:rs|py|toml|ya?ml|json|md|txt|js|ts|tsx|jsx|go|java|kt|c|h|cc|cpp|hpp|rb|sh|cfg|ini|lock|sql|html|css))\b"#,
    )
    .expect("path regex should compile")
});

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#+\s|\*\*[^*]+\*\*|[A-Za-z][A-Za-z0-9 /()_-]{0,40}:(?:\s|$))")
        .expect("header regex should compile")
});

/// Extract one record for `provider_id` from `raw_text`.
///
/// Every schema field gets an entry; absent fields are `None`.
pub fn extract(schema: &Schema, provider_id: &str, raw_text: &str) -> ExtractedRecord {
    let mut fields = BTreeMap::new();
    if raw_text.trim().is_empty() {
        for spec in &schema.fields {
            fields.insert(spec.name.to_string(), None);
        }
        return ExtractedRecord {
            provider_id: provider_id.to_string(),
            schema_id: schema.id.to_string(),
            fields,
        };
    }
    for spec in &schema.fields {
        let value = spec
            .rules
            .iter()
            .find_map(|rule| apply_rule(spec, rule, raw_text).filter(|v| !v.is_blank()));
        fields.insert(spec.name.to_string(), value);
    }
    ExtractedRecord {
        provider_id: provider_id.to_string(),
        schema_id: schema.id.to_string(),
        fields,
    }
}

/// One record per queried provider, in query order.
///
/// Providers that did not reply get an all-`None` record so response
/// completeness is measured against everyone that was asked. A sequential
/// dispatch that accepted a reply is the exception: the providers it moved
/// past were rejected by the acceptance test, not silent, so only the
/// accepted responses are extracted.
pub fn extract_all(schema: &Schema, result: &DispatchResult) -> Vec<ExtractedRecord> {
    if result.strategy == Strategy::Sequential && !result.responses.is_empty() {
        return result
            .responses
            .iter()
            .map(|response| extract(schema, &response.provider_id, &response.raw_text))
            .collect();
    }
    result
        .providers_queried
        .iter()
        .map(|provider| match result.response(provider) {
            Some(response) => extract(schema, provider, &response.raw_text),
            None => extract(schema, provider, ""),
        })
        .collect()
}

/// Case-insensitive dedup preserving first-seen order, truncated to `max`.
pub fn unique_capped<'a, I>(items: I, max: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let cleaned = clean_item(item);
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.to_lowercase()) {
            out.push(cleaned);
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

fn apply_rule(spec: &FieldSpec, rule: &Rule, text: &str) -> Option<FieldValue> {
    match rule {
        Rule::Labeled(labels) => labeled(spec, labels, text),
        Rule::Section(headers) => {
            let hit = find_section(text, headers)?;
            match &spec.kind {
                FieldKind::TextList { max } => {
                    let items = if hit.items.is_empty() {
                        split_inline(&hit.inline)
                    } else {
                        hit.items
                    };
                    Some(FieldValue::List(unique_capped(
                        items.iter().map(String::as_str),
                        *max,
                    )))
                }
                FieldKind::FreeText => {
                    let body = if hit.items.is_empty() {
                        hit.inline
                    } else {
                        hit.items.join("\n")
                    };
                    Some(FieldValue::Text(body))
                }
                _ => convert_inline(spec, &hit.inline),
            }
        }
        Rule::SectionPaths(headers) => {
            let FieldKind::TextList { max } = spec.kind else {
                return None;
            };
            let hit = find_section(text, headers)?;
            let mut joined = hit.inline.clone();
            for line in hit.items.iter().chain(hit.body.iter()) {
                joined.push('\n');
                joined.push_str(line);
            }
            let paths = file_paths(&joined);
            Some(FieldValue::List(unique_capped(
                paths.iter().map(String::as_str),
                max,
            )))
        }
        Rule::Numbered => {
            let FieldKind::TextList { max } = spec.kind else {
                return None;
            };
            let items: Vec<&str> = text
                .lines()
                .filter_map(|line| NUMBERED_RE.captures(line))
                .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
                .collect();
            Some(FieldValue::List(unique_capped(items, max)))
        }
        Rule::KeywordVote(groups) => {
            if !matches!(spec.kind, FieldKind::Categorical { .. }) {
                return None;
            }
            keyword_vote(text, groups).map(|choice| FieldValue::Text(choice.to_string()))
        }
        Rule::OutOfTen => {
            let FieldKind::Numeric {
                min,
                max,
                precision,
                ..
            } = spec.kind
            else {
                return None;
            };
            let caps = OUT_OF_TEN_RE.captures(text)?;
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            Some(FieldValue::Number(normalize_number(value, min, max, precision)))
        }
        Rule::FilePaths => {
            let FieldKind::TextList { max } = spec.kind else {
                return None;
            };
            let paths = file_paths(text);
            Some(FieldValue::List(unique_capped(
                paths.iter().map(String::as_str),
                max,
            )))
        }
        Rule::Fenced(lang) => {
            if !matches!(spec.kind, FieldKind::FreeText) {
                return None;
            }
            fenced_block(text, lang).map(FieldValue::Text)
        }
        Rule::Presence { require, forbid } => {
            if !matches!(spec.kind, FieldKind::Boolean) {
                return None;
            }
            let lower = text.to_lowercase();
            let required = require.iter().any(|term| lower.contains(term));
            let forbidden = forbid.iter().any(|term| lower.contains(term));
            // Text that mentions neither side says nothing either way.
            (required || forbidden).then_some(FieldValue::Flag(required && !forbidden))
        }
    }
}

fn labeled(spec: &FieldSpec, labels: &[&str], text: &str) -> Option<FieldValue> {
    let lines: Vec<&str> = text.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        let Some(hit) = match_label(line, labels) else {
            continue;
        };
        let value = match &spec.kind {
            FieldKind::Numeric { .. } => {
                let usable = hit.separated
                    || hit
                        .inline
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_digit());
                if !usable {
                    continue;
                }
                convert_inline(spec, &hit.inline)
            }
            FieldKind::FreeText => {
                if !hit.separated && !hit.inline.is_empty() {
                    continue;
                }
                let mut parts = Vec::new();
                if !hit.inline.is_empty() {
                    parts.push(hit.inline.clone());
                }
                for next in &lines[index + 1..] {
                    if next.trim().is_empty() {
                        if parts.is_empty() {
                            continue;
                        }
                        break;
                    }
                    if is_header_line(next) {
                        break;
                    }
                    parts.push(next.trim().to_string());
                }
                let body = parts.join("\n");
                (!body.trim().is_empty()).then_some(FieldValue::Text(body))
            }
            FieldKind::TextList { max } => {
                if !hit.separated {
                    continue;
                }
                let items = split_inline(&hit.inline);
                (!items.is_empty()).then(|| {
                    FieldValue::List(unique_capped(items.iter().map(String::as_str), *max))
                })
            }
            FieldKind::Categorical { .. } | FieldKind::Boolean => {
                if !hit.separated {
                    continue;
                }
                convert_inline(spec, &hit.inline)
            }
        };
        if value.is_some() {
            return value;
        }
    }
    None
}

/// Convert a single inline value according to the field kind.
fn convert_inline(spec: &FieldSpec, inline: &str) -> Option<FieldValue> {
    match &spec.kind {
        FieldKind::Categorical { choices, .. } => {
            normalize_choice(inline, choices).map(|c| FieldValue::Text(c.to_string()))
        }
        FieldKind::Numeric {
            min,
            max,
            precision,
            ..
        } => parse_number(inline, *max)
            .map(|value| FieldValue::Number(normalize_number(value, *min, *max, *precision))),
        FieldKind::Boolean => parse_flag(inline).map(FieldValue::Flag),
        FieldKind::FreeText => {
            let trimmed = inline.trim();
            (!trimmed.is_empty()).then(|| FieldValue::Text(trimmed.to_string()))
        }
        FieldKind::TextList { max } => {
            let items = split_inline(inline);
            Some(FieldValue::List(unique_capped(
                items.iter().map(String::as_str),
                *max,
            )))
        }
    }
}

/// A label at the start of a line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelHit {
    /// Text after the label (and separator), decorations stripped.
    inline: String,
    /// True if a `:`/`=`/` - ` separator followed the label.
    separated: bool,
}

fn match_label(line: &str, labels: &[&str]) -> Option<LabelHit> {
    let stripped = line.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '>' | '#' | '*' | '_')
    });
    let lower = stripped.to_ascii_lowercase();
    for label in labels {
        if !lower.starts_with(label) {
            continue;
        }
        let rest = &stripped[label.len()..];
        if rest.chars().next().is_some_and(char::is_alphanumeric) {
            continue;
        }
        let rest = skip_parenthetical(rest.trim_start());
        let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '_'));
        let after = rest
            .strip_prefix(':')
            .or_else(|| rest.strip_prefix('='))
            .or_else(|| rest.strip_prefix("- "))
            .or_else(|| rest.strip_prefix("— "));
        if let Some(after) = after {
            return Some(LabelHit {
                inline: trim_decorations(after),
                separated: true,
            });
        }
        return Some(LabelHit {
            inline: trim_decorations(rest),
            separated: false,
        });
    }
    None
}

fn skip_parenthetical(rest: &str) -> &str {
    if let Some(inner) = rest.strip_prefix('(')
        && let Some(end) = inner.find(')')
    {
        return &inner[end + 1..];
    }
    rest
}

fn trim_decorations(value: &str) -> String {
    value
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '_'))
        .to_string()
}

fn is_header_line(line: &str) -> bool {
    !BULLET_RE.is_match(line) && HEADER_RE.is_match(line)
}

#[derive(Debug, Default)]
struct SectionHit {
    inline: String,
    items: Vec<String>,
    /// Non-item lines inside the section.
    body: Vec<String>,
}

fn find_section(text: &str, headers: &[&str]) -> Option<SectionHit> {
    let lines: Vec<&str> = text.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        if BULLET_RE.is_match(line) {
            continue;
        }
        let Some(hit) = match_label(line, headers) else {
            continue;
        };
        if !hit.separated && !hit.inline.is_empty() {
            continue;
        }
        let mut section = SectionHit {
            inline: hit.inline,
            ..SectionHit::default()
        };
        for next in &lines[index + 1..] {
            if next.trim().is_empty() {
                if section.items.is_empty() && section.inline.is_empty() {
                    continue;
                }
                break;
            }
            if let Some(caps) = BULLET_RE.captures(next) {
                if let Some(item) = caps.get(1) {
                    section.items.push(item.as_str().to_string());
                }
                continue;
            }
            if is_header_line(next) {
                break;
            }
            section.body.push(next.trim().to_string());
        }
        if !section.items.is_empty() || !section.inline.is_empty() || !section.body.is_empty() {
            return Some(section);
        }
    }
    None
}

fn split_inline(inline: &str) -> Vec<String> {
    inline
        .split([',', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn clean_item(item: &str) -> String {
    item.trim()
        .trim_matches(|c: char| c == '*' || c.is_whitespace())
        .to_string()
}

fn normalize_choice(value: &str, choices: &[&'static str]) -> Option<&'static str> {
    let normalized = value.trim().to_lowercase().replace([' ', '-'], "_");
    if normalized.is_empty() {
        return None;
    }
    if let Some(exact) = choices.iter().find(|choice| normalized == **choice) {
        return Some(*exact);
    }
    choices
        .iter()
        .filter_map(|choice| normalized.find(choice).map(|pos| (pos, *choice)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, choice)| choice)
}

fn keyword_vote(text: &str, groups: &[(&'static str, &[&str])]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;
    for (choice, keywords) in groups {
        let hits: usize = keywords.iter().map(|kw| lower.matches(kw).count()).sum();
        if hits == 0 {
            continue;
        }
        if best.is_none_or(|(_, top)| hits > top) {
            best = Some((*choice, hits));
        }
    }
    best.map(|(choice, _)| choice)
}

fn parse_number(inline: &str, max: f64) -> Option<f64> {
    let caps = NUMBER_RE.captures(inline)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    if caps.get(2).is_some() && max <= 1.0 {
        return Some(value / 100.0);
    }
    Some(value)
}

const FALSE_WORDS: &[&str] = &[
    "no", "false", "not", "reject", "rejected", "request", "needs", "deny", "n",
];
const TRUE_WORDS: &[&str] = &[
    "yes", "true", "approve", "approved", "lgtm", "accept", "actionable", "y",
];

fn parse_flag(inline: &str) -> Option<bool> {
    let lower = inline
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let starts_with_word = |word: &str| {
        lower.starts_with(word)
            && !lower[word.len()..]
                .chars()
                .next()
                .is_some_and(char::is_alphanumeric)
    };
    if FALSE_WORDS.iter().any(|word| starts_with_word(word)) {
        return Some(false);
    }
    if TRUE_WORDS.iter().any(|word| starts_with_word(word)) {
        return Some(true);
    }
    None
}

fn file_paths(text: &str) -> Vec<String> {
    PATH_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let path = m.as_str();
            path.strip_prefix("a/")
                .or_else(|| path.strip_prefix("b/"))
                .unwrap_or(path)
                .to_string()
        })
        .collect()
}

fn fenced_block(text: &str, lang: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(tag) = line.trim().strip_prefix("```") else {
            continue;
        };
        if !tag.trim().to_ascii_lowercase().starts_with(lang) {
            continue;
        }
        let mut body = Vec::new();
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                break;
            }
            body.push(inner);
        }
        let mut joined = body.join("\n");
        if joined.trim().is_empty() {
            return None;
        }
        joined.push('\n');
        return Some(joined);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schemas::{self, fields};

    const ANALYSIS: &str = "\
**Issue Type:** Bug
**Complexity Score (0-10):** 6/10
**Actionability:** Yes, the report is specific.

**Key Requirements:**
1. Reject expired tokens
2. Return 401 instead of 500
- reject EXPIRED tokens

**Affected Files:** `src/auth/session.rs`, src/http/errors.rs

**Risks:**
- Breaking existing clients

**Recommended Approach:** Validate expiry before decoding claims.
Add a regression test.
";

    #[test]
    fn extracts_labeled_analysis_fields() {
        let record = extract(&schemas::analysis(), "anthropic", ANALYSIS);
        assert_eq!(
            record.get(fields::ISSUE_TYPE),
            Some(&FieldValue::Text("bug".to_string()))
        );
        assert_eq!(record.get(fields::COMPLEXITY), Some(&FieldValue::Number(6.0)));
        assert_eq!(record.get(fields::ACTIONABLE), Some(&FieldValue::Flag(true)));
        assert_eq!(
            record.get(fields::REQUIREMENTS),
            Some(&FieldValue::List(vec![
                "Reject expired tokens".to_string(),
                "Return 401 instead of 500".to_string(),
            ]))
        );
        assert_eq!(
            record.get(fields::AFFECTED_FILES),
            Some(&FieldValue::List(vec![
                "src/auth/session.rs".to_string(),
                "src/http/errors.rs".to_string(),
            ]))
        );
        assert_eq!(
            record.get(fields::RISKS),
            Some(&FieldValue::List(vec!["Breaking existing clients".to_string()]))
        );
        assert_eq!(
            record.get(fields::APPROACH),
            Some(&FieldValue::Text(
                "Validate expiry before decoding claims.\nAdd a regression test.".to_string()
            ))
        );
    }

    #[test]
    fn malformed_text_yields_empty_fields_not_errors() {
        let record = extract(&schemas::analysis(), "p", "}}}{{ ### \u{0} ***");
        assert_eq!(record.fields.len(), schemas::analysis().fields.len());
        assert_eq!(record.get(fields::COMPLEXITY), None);
        assert_eq!(record.get(fields::ISSUE_TYPE), None);
    }

    #[test]
    fn numeric_values_are_clamped_to_range() {
        let record = extract(&schemas::analysis(), "p", "Complexity: 42");
        assert_eq!(record.get(fields::COMPLEXITY), Some(&FieldValue::Number(10.0)));

        let record = extract(&schemas::implementation(), "p", "Confidence: 85%");
        assert_eq!(record.get(fields::CONFIDENCE), Some(&FieldValue::Number(0.85)));
    }

    #[test]
    fn out_of_ten_fallback_when_unlabeled() {
        let record = extract(&schemas::analysis(), "p", "I would rate this 3 out of 10.");
        assert_eq!(record.get(fields::COMPLEXITY), Some(&FieldValue::Number(3.0)));
    }

    #[test]
    fn keyword_vote_picks_most_mentioned_type() {
        let text = "This is a feature request: a new enhancement, not a defect.";
        let record = extract(&schemas::analysis(), "p", text);
        assert_eq!(
            record.get(fields::ISSUE_TYPE),
            Some(&FieldValue::Text("feature".to_string()))
        );
    }

    #[test]
    fn actionability_falls_back_to_presence_heuristic() {
        let record = extract(&schemas::analysis(), "p", "The requirements are well defined.");
        assert_eq!(record.get(fields::ACTIONABLE), Some(&FieldValue::Flag(true)));

        let record = extract(
            &schemas::analysis(),
            "p",
            "The requirements are unclear and need discussion.",
        );
        assert_eq!(record.get(fields::ACTIONABLE), Some(&FieldValue::Flag(false)));
    }

    #[test]
    fn list_is_capped_and_deduplicated() {
        let mut text = String::from("Risks:\n");
        for i in 0..8 {
            text.push_str(&format!("- risk {}\n- RISK {}\n", i % 3, i % 3));
        }
        let record = extract(&schemas::analysis(), "p", &text);
        let Some(FieldValue::List(items)) = record.get(fields::RISKS) else {
            panic!("expected risks list");
        };
        assert_eq!(items, &vec!["risk 0", "risk 1", "risk 2"]);
    }

    #[test]
    fn header_only_section_with_blank_line() {
        let text = "## Implementation Steps\n\n1. Add parser\n2. Wire CLI\n3. Add tests\n\nDone.";
        let record = extract(&schemas::plan(), "p", text);
        assert_eq!(
            record.get(fields::STEPS),
            Some(&FieldValue::List(vec![
                "Add parser".to_string(),
                "Wire CLI".to_string(),
                "Add tests".to_string(),
            ]))
        );
    }

    #[test]
    fn fenced_diff_is_extracted_verbatim() {
        let text = "Here you go:\n```diff\n\
                    --- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n```\n";
        let record = extract(&schemas::implementation(), "p", text);
        assert_eq!(
            record.get(fields::PATCH),
            Some(&FieldValue::Text(
                "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n".to_string()
            ))
        );
        assert_eq!(
            record.get(fields::FILES_CHANGED),
            Some(&FieldValue::List(vec!["src/lib.rs".to_string()]))
        );
    }

    #[test]
    fn review_decision_parses_negative_before_positive() {
        let record = extract(&schemas::review(), "p", "Decision: not approved yet");
        assert_eq!(record.get(fields::APPROVE), Some(&FieldValue::Flag(false)));
        let record = extract(&schemas::review(), "p", "**Decision:** APPROVE");
        assert_eq!(record.get(fields::APPROVE), Some(&FieldValue::Flag(true)));
    }

    #[test]
    fn extract_all_covers_silent_providers() {
        let result = DispatchResult::from_responses(
            crate::core::types::Strategy::All,
            vec!["a".to_string(), "b".to_string()],
            vec![crate::core::types::ProviderResponse {
                provider_id: "b".to_string(),
                raw_text: "Complexity: 4".to_string(),
                token_count: 3,
                cost: 0.0,
                elapsed_ms: 1,
            }],
        );
        let records = extract_all(&schemas::analysis(), &result);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].provider_id, "a");
        assert!(!records[0].is_parseable());
        assert!(records[1].is_parseable());
    }

    #[test]
    fn sequential_extracts_only_the_accepted_reply() {
        let accepted = |raw: &str| crate::core::types::ProviderResponse {
            provider_id: "b".to_string(),
            raw_text: raw.to_string(),
            token_count: 3,
            cost: 0.0,
            elapsed_ms: 1,
        };
        let result = DispatchResult::from_responses(
            Strategy::Sequential,
            vec!["a".to_string(), "b".to_string()],
            vec![accepted("Complexity: 4")],
        );
        let records = extract_all(&schemas::analysis(), &result);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_id, "b");

        let exhausted = DispatchResult::from_responses(
            Strategy::Sequential,
            vec!["a".to_string(), "b".to_string()],
            vec![],
        );
        assert_eq!(extract_all(&schemas::analysis(), &exhausted).len(), 2);
    }
}
