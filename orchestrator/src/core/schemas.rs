//! Built-in schemas, one per consensus-driven stage.

use super::schema::{FieldSpec, Rule, Schema};

pub const ISSUE_TYPES: &[&str] = &[
    "bug",
    "feature",
    "refactor",
    "documentation",
    "test",
    "chore",
    "unknown",
];

const ISSUE_TYPE_KEYWORDS: &[(&str, &[&str])] = &[
    ("bug", &["bug", "defect", "error", "crash"]),
    ("feature", &["feature", "enhancement", "new functionality"]),
    ("refactor", &["refactor", "restructure"]),
    ("documentation", &["documentation", "docs", "readme"]),
    ("test", &["test coverage", "testing"]),
    ("chore", &["chore", "maintenance", "cleanup"]),
];

pub const FAILURE_CATEGORIES: &[&str] = &[
    "assertion_error",
    "import_error",
    "syntax_error",
    "type_error",
    "attribute_error",
    "runtime_error",
    "timeout",
    "unknown",
];

const FAILURE_KEYWORDS: &[(&str, &[&str])] = &[
    ("assertion_error", &["assertionerror", "assertion failed", "assert_eq"]),
    ("import_error", &["importerror", "modulenotfounderror", "unresolved import"]),
    ("syntax_error", &["syntaxerror", "syntax error", "expected one of"]),
    ("type_error", &["typeerror", "mismatched types", "type error"]),
    ("attribute_error", &["attributeerror", "has no attribute", "no field", "no method"]),
    ("timeout", &["timed out", "timeout"]),
    ("runtime_error", &["runtimeerror", "panicked", "exception"]),
];

/// Field names shared between schemas and the stages that read them.
pub mod fields {
    pub const ISSUE_TYPE: &str = "issue_type";
    pub const COMPLEXITY: &str = "complexity";
    pub const ACTIONABLE: &str = "actionable";
    pub const REQUIREMENTS: &str = "requirements";
    pub const AFFECTED_FILES: &str = "affected_files";
    pub const RISKS: &str = "risks";
    pub const APPROACH: &str = "approach";

    pub const FILES_TO_MODIFY: &str = "files_to_modify";
    pub const FILES_TO_CREATE: &str = "files_to_create";
    pub const STEPS: &str = "steps";
    pub const TEST_STRATEGY: &str = "test_strategy";
    pub const VALIDATION_CRITERIA: &str = "validation_criteria";

    pub const PATCH: &str = "patch";
    pub const FILES_CHANGED: &str = "files_changed";
    pub const SUMMARY: &str = "summary";
    pub const CONFIDENCE: &str = "confidence";

    pub const ROOT_CAUSE: &str = "root_cause";
    pub const CATEGORY: &str = "category";
    pub const RELATED_FILES: &str = "related_files";

    pub const RECOMMENDED_FIX: &str = "recommended_fix";
    pub const FILE_TO_MODIFY: &str = "file_to_modify";
    pub const PROPOSED_CHANGES: &str = "proposed_changes";
    pub const SUCCESS_PROBABILITY: &str = "success_probability";
    pub const RATIONALE: &str = "rationale";

    pub const APPROVE: &str = "approve";
    pub const CONCERNS: &str = "concerns";
}

/// Issue triage: type, complexity, actionability, requirements, risks.
pub fn analysis() -> Schema {
    Schema::new(
        "analysis",
        vec![
            FieldSpec::categorical(
                fields::ISSUE_TYPE,
                ISSUE_TYPES,
                Some("unknown"),
                vec![
                    Rule::Labeled(&["issue type", "type", "category"]),
                    Rule::KeywordVote(ISSUE_TYPE_KEYWORDS),
                ],
            ),
            FieldSpec::numeric(
                fields::COMPLEXITY,
                (0.0, 10.0),
                0,
                Some(5.0),
                vec![
                    Rule::Labeled(&["complexity score", "complexity", "score"]),
                    Rule::OutOfTen,
                ],
            ),
            FieldSpec::flag(
                fields::ACTIONABLE,
                vec![
                    Rule::Labeled(&["actionability", "actionable"]),
                    Rule::Presence {
                        require: &["requirement"],
                        forbid: &["unclear", "not actionable"],
                    },
                ],
            ),
            FieldSpec::list(
                fields::REQUIREMENTS,
                5,
                vec![Rule::Section(&["key requirements", "requirements"])],
            ),
            FieldSpec::list(
                fields::AFFECTED_FILES,
                10,
                vec![
                    Rule::SectionPaths(&["affected files", "files affected"]),
                    Rule::FilePaths,
                ],
            ),
            FieldSpec::list(
                fields::RISKS,
                5,
                vec![Rule::Section(&["risks", "risk", "challenges"])],
            ),
            FieldSpec::text(
                fields::APPROACH,
                vec![Rule::Labeled(&["recommended approach", "approach"])],
            ),
        ],
    )
}

/// Implementation plan: files, ordered steps, test strategy.
pub fn plan() -> Schema {
    Schema::new(
        "plan",
        vec![
            FieldSpec::list(
                fields::FILES_TO_MODIFY,
                10,
                vec![Rule::SectionPaths(&["files to modify", "modify"])],
            ),
            FieldSpec::list(
                fields::FILES_TO_CREATE,
                10,
                vec![Rule::SectionPaths(&["files to create", "new files", "create"])],
            ),
            FieldSpec::list(
                fields::STEPS,
                15,
                vec![
                    Rule::Section(&["implementation steps", "steps"]),
                    Rule::Numbered,
                ],
            ),
            FieldSpec::text(
                fields::TEST_STRATEGY,
                vec![Rule::Labeled(&["test strategy", "testing strategy", "testing"])],
            ),
            FieldSpec::list(
                fields::VALIDATION_CRITERIA,
                5,
                vec![Rule::Section(&[
                    "validation criteria",
                    "acceptance criteria",
                    "success criteria",
                ])],
            ),
            FieldSpec::numeric(
                fields::COMPLEXITY,
                (0.0, 10.0),
                0,
                Some(5.0),
                vec![
                    Rule::Labeled(&["overall complexity", "complexity"]),
                    Rule::OutOfTen,
                ],
            ),
        ],
    )
}

/// A concrete change set for the plan.
pub fn implementation() -> Schema {
    Schema::new(
        "implementation",
        vec![
            FieldSpec::text(
                fields::PATCH,
                vec![Rule::Fenced("diff"), Rule::Fenced("patch")],
            ),
            FieldSpec::list(
                fields::FILES_CHANGED,
                20,
                vec![
                    Rule::SectionPaths(&["files changed", "changed files"]),
                    Rule::FilePaths,
                ],
            ),
            FieldSpec::text(fields::SUMMARY, vec![Rule::Labeled(&["summary"])]),
            FieldSpec::numeric(
                fields::CONFIDENCE,
                (0.0, 1.0),
                2,
                None,
                vec![Rule::Labeled(&["confidence"])],
            ),
        ],
    )
}

/// Root-cause reading of a failing test run.
pub fn failure() -> Schema {
    Schema::new(
        "failure",
        vec![
            FieldSpec::text(fields::ROOT_CAUSE, vec![Rule::Labeled(&["root cause"])]),
            FieldSpec::categorical(
                fields::CATEGORY,
                FAILURE_CATEGORIES,
                Some("unknown"),
                vec![
                    Rule::Labeled(&["failure category", "category"]),
                    Rule::KeywordVote(FAILURE_KEYWORDS),
                ],
            ),
            FieldSpec::list(fields::RELATED_FILES, 5, vec![Rule::FilePaths]),
            FieldSpec::numeric(
                fields::CONFIDENCE,
                (0.0, 1.0),
                2,
                None,
                vec![Rule::Labeled(&["confidence"])],
            ),
        ],
    )
}

/// Proposed fix for a failing run.
pub fn fix() -> Schema {
    Schema::new(
        "fix",
        vec![
            FieldSpec::text(
                fields::RECOMMENDED_FIX,
                vec![Rule::Labeled(&["recommended fix", "fix"])],
            ),
            FieldSpec::list(
                fields::FILE_TO_MODIFY,
                5,
                vec![
                    Rule::SectionPaths(&["file to modify", "files to modify"]),
                    Rule::FilePaths,
                ],
            ),
            FieldSpec::text(
                fields::PROPOSED_CHANGES,
                vec![
                    Rule::Fenced("diff"),
                    Rule::Fenced("patch"),
                    Rule::Labeled(&["proposed changes"]),
                ],
            ),
            FieldSpec::numeric(
                fields::SUCCESS_PROBABILITY,
                (0.0, 1.0),
                2,
                Some(0.0),
                vec![Rule::Labeled(&["success probability", "probability"])],
            ),
            FieldSpec::text(fields::RATIONALE, vec![Rule::Labeled(&["rationale"])]),
        ],
    )
}

/// Pull request review vote.
pub fn review() -> Schema {
    Schema::new(
        "review",
        vec![
            FieldSpec::flag(
                fields::APPROVE,
                vec![Rule::Labeled(&["decision", "verdict", "approve"])],
            ),
            FieldSpec::text(fields::SUMMARY, vec![Rule::Labeled(&["summary"])]),
            FieldSpec::list(
                fields::CONCERNS,
                5,
                vec![Rule::Section(&["concerns", "issues found"])],
            ),
        ],
    )
}
