//! Normalized test results and parsers for common runner output.
//!
//! Understands cargo's libtest output and pytest's summary format. Output in
//! any other shape still yields a report: a failing command without
//! recognizable counts becomes one synthetic failure carrying the output tail.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    pub file: Option<String>,
    pub message: String,
    pub trace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_secs: Option<f64>,
    pub failures: Vec<TestFailure>,
}

impl TestReport {
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }

    /// One line per failure, for prompts and comments.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| match &f.file {
                Some(file) => format!("{} ({file}): {}", f.name, f.message),
                None => format!("{}: {}", f.name, f.message),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

static CARGO_RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"test result: (?:ok|FAILED)\. (\d+) passed; (\d+) failed; (\d+) ignored;.*?(?:finished in ([\d.]+)s)?$",
    )
    .expect("cargo result regex should compile")
});

static CARGO_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (\S+) \.\.\. FAILED$").expect("cargo failed regex should compile")
});

static CARGO_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^---- (\S+) stdout ----$").expect("cargo block regex should compile")
});

static PANIC_LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"panicked at ([^:\s]+):\d+:\d+").expect("panic regex should compile")
});

static PYTEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=+ (.*?) in ([\d.]+)s.*=+$").expect("pytest summary regex should compile")
});

static PYTEST_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|skipped|errors?|xfailed|xpassed)")
        .expect("pytest count regex should compile")
});

static PYTEST_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:FAILED|ERROR) ([^\s:]+)::(\S+)(?: - (.*))?$")
        .expect("pytest failed regex should compile")
});

static PYTEST_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_{3,} (.+?) _{3,}$").expect("pytest section regex should compile")
});

const TAIL_LINES: usize = 40;

/// Parse combined stdout/stderr of a test command.
pub fn parse_test_output(output: &str, success: bool) -> TestReport {
    if let Some(report) = parse_cargo(output) {
        return report;
    }
    if let Some(report) = parse_pytest(output) {
        return report;
    }
    if success {
        return TestReport::default();
    }
    let lines: Vec<&str> = output.lines().collect();
    let tail = lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n");
    TestReport {
        total: 1,
        passed: 0,
        failed: 1,
        skipped: 0,
        duration_secs: None,
        failures: vec![TestFailure {
            name: "test command".to_string(),
            file: None,
            message: "test command failed without a recognizable summary".to_string(),
            trace: tail,
        }],
    }
}

fn parse_cargo(output: &str) -> Option<TestReport> {
    let mut report = TestReport::default();
    let mut matched = false;
    let mut duration = 0.0;
    for line in output.lines() {
        let Some(caps) = CARGO_RESULT_RE.captures(line.trim()) else {
            continue;
        };
        matched = true;
        let count = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };
        report.passed += count(1);
        report.failed += count(2);
        report.skipped += count(3);
        if let Some(secs) = caps.get(4).and_then(|m| m.as_str().parse::<f64>().ok()) {
            duration += secs;
        }
    }
    if !matched {
        return None;
    }
    report.total = report.passed + report.failed + report.skipped;
    report.duration_secs = Some(duration);

    let lines: Vec<&str> = output.lines().collect();
    let names: Vec<&str> = lines
        .iter()
        .filter_map(|line| CARGO_FAILED_RE.captures(line.trim()))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    for name in names {
        let trace = cargo_block(&lines, name);
        let file = PANIC_LOCATION_RE
            .captures(&trace)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        let message = trace
            .lines()
            .skip_while(|line| !line.contains("panicked at"))
            .nth(1)
            .or_else(|| trace.lines().find(|line| line.contains("panicked at")))
            .unwrap_or("test failed")
            .trim()
            .to_string();
        report.failures.push(TestFailure {
            name: name.to_string(),
            file,
            message,
            trace,
        });
    }
    Some(report)
}

fn cargo_block(lines: &[&str], name: &str) -> String {
    let Some(start) = lines.iter().position(|line| {
        CARGO_BLOCK_RE
            .captures(line.trim())
            .and_then(|caps| caps.get(1))
            .is_some_and(|m| m.as_str() == name)
    }) else {
        return String::new();
    };
    lines[start + 1..]
        .iter()
        .take_while(|line| {
            let trimmed = line.trim();
            !CARGO_BLOCK_RE.is_match(trimmed) && trimmed != "failures:"
        })
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn parse_pytest(output: &str) -> Option<TestReport> {
    let lines: Vec<&str> = output.lines().collect();
    let (summary, secs) = lines.iter().rev().find_map(|line| {
        let caps = PYTEST_SUMMARY_RE.captures(line.trim())?;
        let body = caps.get(1)?.as_str();
        PYTEST_COUNT_RE.is_match(body).then(|| {
            let secs = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
            (body.to_string(), secs)
        })
    })?;

    let mut report = TestReport {
        duration_secs: secs,
        ..TestReport::default()
    };
    for caps in PYTEST_COUNT_RE.captures_iter(&summary) {
        let n: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        match caps.get(2).map(|m| m.as_str()) {
            Some("passed" | "xpassed") => report.passed += n,
            Some("failed" | "error" | "errors") => report.failed += n,
            Some("skipped" | "xfailed") => report.skipped += n,
            _ => {}
        }
    }
    report.total = report.passed + report.failed + report.skipped;

    for line in &lines {
        let Some(caps) = PYTEST_FAILED_RE.captures(line.trim()) else {
            continue;
        };
        let file = caps.get(1).map(|m| m.as_str().to_string());
        let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let message = caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "test failed".to_string());
        let short = name.rsplit("::").next().unwrap_or(name);
        report.failures.push(TestFailure {
            name: name.to_string(),
            file,
            message,
            trace: pytest_section(&lines, short),
        });
    }
    Some(report)
}

fn pytest_section(lines: &[&str], test_name: &str) -> String {
    let Some(start) = lines.iter().position(|line| {
        PYTEST_SECTION_RE
            .captures(line.trim())
            .and_then(|caps| caps.get(1))
            .is_some_and(|m| m.as_str().ends_with(test_name))
    }) else {
        return String::new();
    };
    lines[start + 1..]
        .iter()
        .take_while(|line| {
            let trimmed = line.trim();
            !PYTEST_SECTION_RE.is_match(trimmed) && !trimmed.starts_with("====")
        })
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// True if the failure plausibly comes from the changed files.
///
/// Either the failing test lives in a changed file, or a changed file's name
/// shows up in its trace.
pub fn is_related_to_changes(failure: &TestFailure, changed_files: &[String]) -> bool {
    let in_changed_file = failure
        .file
        .as_deref()
        .is_some_and(|file| changed_files.iter().any(|c| c == file || c.ends_with(file)));
    if in_changed_file {
        return true;
    }
    changed_files.iter().any(|changed| {
        let name = changed.rsplit('/').next().unwrap_or(changed);
        !name.is_empty() && failure.trace.contains(name)
    })
}
