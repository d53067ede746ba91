//! Code runs: what was executed, how, and what came back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Language ─────────────────────────────────────────────────────

/// Languages the sandbox knows how to format, build, and test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Python,
    TypeScript,
    Rust,
    Java,
}

impl Language {
    pub const ALL: &'static [Language] = &[
        Self::Go,
        Self::Python,
        Self::TypeScript,
        Self::Rust,
        Self::Java,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Java => "java",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Recipe ───────────────────────────────────────────────────────

/// Which checks to run, and the per-request deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub format: bool,
    pub build: bool,
    pub test: bool,
    /// Whole-run deadline in seconds.
    pub timeout_seconds: u32,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            format: true,
            build: true,
            test: true,
            timeout_seconds: 60,
        }
    }
}

// ── Parsed results ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

/// A build diagnostic lifted from raw toolchain output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

/// One test case result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Package / module / suite the test belongs to.
    pub package: String,
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    /// Captured output for failing tests (empty when passing).
    pub output: String,
}

// ── Risk notices ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Security,
    Quality,
    Performance,
    Reliability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
}

/// A categorized pattern finding from static inspection of the code map.
/// Advisory only: notices never fail a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskNotice {
    pub category: RiskCategory,
    pub severity: RiskSeverity,
    pub title: String,
    pub description: String,
    pub file: String,
    pub line: u32,
    pub suggestion: String,
}

// ── Run output ───────────────────────────────────────────────────

/// Everything observed from one format → build → test pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub format_ok: bool,
    pub format_diff: String,
    pub build_ok: bool,
    pub build_errors: Vec<Diagnostic>,
    pub test_results: Vec<TestResult>,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub duration_ms: u64,
    pub risks: Vec<RiskNotice>,
}

impl RunOutput {
    /// Green run: at least one test ran and none failed.
    pub fn all_tests_passed(&self) -> bool {
        self.tests_failed == 0 && self.tests_passed > 0
    }

    /// Failing test results, for prompt assembly.
    pub fn failing_tests(&self) -> impl Iterator<Item = &TestResult> {
        self.test_results.iter().filter(|t| !t.passed)
    }
}

// ── Run entity ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

/// One sandboxed execution of the session's working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub language: Language,
    /// Snapshot of the code map that was executed.
    pub code_snapshot: BTreeMap<String, String>,
    pub recipe: Recipe,
    pub status: RunStatus,
    pub output: Option<RunOutput>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        session_id: Uuid,
        language: Language,
        code_snapshot: BTreeMap<String, String>,
        recipe: Recipe,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            language,
            code_snapshot,
            recipe,
            status: RunStatus::Pending,
            output: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tests_passed_requires_at_least_one_test() {
        let mut out = RunOutput::default();
        assert!(!out.all_tests_passed());
        out.tests_passed = 3;
        assert!(out.all_tests_passed());
        out.tests_failed = 1;
        assert!(!out.all_tests_passed());
    }

    #[test]
    fn failing_tests_filters() {
        let out = RunOutput {
            test_results: vec![
                TestResult {
                    package: "pkg".into(),
                    name: "ok".into(),
                    passed: true,
                    duration_ms: 4,
                    output: String::new(),
                },
                TestResult {
                    package: "pkg".into(),
                    name: "bad".into(),
                    passed: false,
                    duration_ms: 9,
                    output: "assertion failed".into(),
                },
            ],
            tests_passed: 1,
            tests_failed: 1,
            ..RunOutput::default()
        };
        let failing: Vec<_> = out.failing_tests().map(|t| t.name.as_str()).collect();
        assert_eq!(failing, vec!["bad"]);
    }

    #[test]
    fn language_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Language::TypeScript).unwrap(),
            "\"typescript\""
        );
        let back: Language = serde_json::from_str("\"go\"").unwrap();
        assert_eq!(back, Language::Go);
    }

    #[test]
    fn recipe_default_is_full_check() {
        let r = Recipe::default();
        assert!(r.format && r.build && r.test);
        assert_eq!(r.timeout_seconds, 60);
    }
}
