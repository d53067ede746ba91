//! Static risk inspection of submitted code.
//!
//! After a run, the code map is scanned against a fixed pattern set and
//! any hits become [`RiskNotice`]s on the run output. Notices are
//! advisory: scanning never fails a run, and the pattern set deliberately
//! favors precision over recall.

use crate::domain::{RiskCategory, RiskNotice, RiskSeverity};
use aho_corasick::AhoCorasick;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Upper bound on notices per run; beyond this the signal is noise.
const MAX_NOTICES: usize = 50;

struct Pattern {
    needle: &'static str,
    category: RiskCategory,
    severity: RiskSeverity,
    title: &'static str,
    description: &'static str,
    suggestion: &'static str,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        needle: "password =",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "Hardcoded password",
        description: "A password appears to be assigned directly in source.",
        suggestion: "Read credentials from configuration or a secrets file.",
    },
    Pattern {
        needle: "api_key =",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "Hardcoded API key",
        description: "An API key appears to be assigned directly in source.",
        suggestion: "Read credentials from configuration or a secrets file.",
    },
    Pattern {
        needle: "eval(",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "Dynamic code evaluation",
        description: "eval() executes arbitrary strings as code.",
        suggestion: "Parse the input instead of evaluating it.",
    },
    Pattern {
        needle: "os.system(",
        category: RiskCategory::Security,
        severity: RiskSeverity::Medium,
        title: "Shell command execution",
        description: "os.system passes strings to the shell.",
        suggestion: "Use subprocess with an argument list and no shell.",
    },
    Pattern {
        needle: "pickle.loads(",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "Unsafe deserialization",
        description: "Unpickling untrusted data can execute arbitrary code.",
        suggestion: "Use a safe format such as JSON for untrusted input.",
    },
    Pattern {
        needle: "InsecureSkipVerify",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "TLS verification disabled",
        description: "Certificate verification is being skipped.",
        suggestion: "Keep TLS verification on; pin certificates if needed.",
    },
    Pattern {
        needle: "http://",
        category: RiskCategory::Security,
        severity: RiskSeverity::Low,
        title: "Plaintext URL",
        description: "An http:// URL transmits data unencrypted.",
        suggestion: "Prefer https:// endpoints.",
    },
    Pattern {
        needle: ".unwrap()",
        category: RiskCategory::Reliability,
        severity: RiskSeverity::Low,
        title: "Panic on error path",
        description: "unwrap() panics when the value is absent or an error.",
        suggestion: "Propagate the error or handle the None case.",
    },
    Pattern {
        needle: "catch (e) {}",
        category: RiskCategory::Reliability,
        severity: RiskSeverity::Medium,
        title: "Swallowed exception",
        description: "An empty catch block hides failures.",
        suggestion: "Handle the error or at least log it.",
    },
    Pattern {
        needle: "except:",
        category: RiskCategory::Reliability,
        severity: RiskSeverity::Medium,
        title: "Bare except clause",
        description: "A bare except catches SystemExit and KeyboardInterrupt too.",
        suggestion: "Catch the specific exception types you expect.",
    },
    Pattern {
        needle: "TODO",
        category: RiskCategory::Quality,
        severity: RiskSeverity::Low,
        title: "Unfinished work marker",
        description: "A TODO marker indicates incomplete work.",
        suggestion: "Resolve the TODO or track it outside the code.",
    },
    Pattern {
        needle: "time.sleep(",
        category: RiskCategory::Performance,
        severity: RiskSeverity::Low,
        title: "Blocking sleep",
        description: "Sleeping in the main path hides races and wastes time.",
        suggestion: "Wait for the actual condition instead of sleeping.",
    },
    Pattern {
        needle: "SELECT * FROM",
        category: RiskCategory::Performance,
        severity: RiskSeverity::Low,
        title: "Unbounded select",
        description: "Selecting every column couples code to schema width.",
        suggestion: "Name the columns the code actually uses.",
    },
    Pattern {
        needle: "+ \" WHERE ",
        category: RiskCategory::Security,
        severity: RiskSeverity::High,
        title: "SQL built by concatenation",
        description: "String-built SQL invites injection.",
        suggestion: "Use parameterized queries.",
    },
];

static MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(PATTERNS.iter().map(|p| p.needle))
        .expect("static pattern set")
});

/// Scan a code map and return the notices found, bounded and ordered by
/// file then line.
pub fn scan(code: &BTreeMap<String, String>) -> Vec<RiskNotice> {
    let mut notices = Vec::new();

    'files: for (file, content) in code {
        // One notice per (pattern, file): repetition adds nothing.
        let mut seen = [false; PATTERNS.len()];
        for (line_no, line) in content.lines().enumerate() {
            for hit in MATCHER.find_iter(line) {
                let index = hit.pattern().as_usize();
                if seen[index] {
                    continue;
                }
                seen[index] = true;
                let pattern = &PATTERNS[index];
                notices.push(RiskNotice {
                    category: pattern.category,
                    severity: pattern.severity,
                    title: pattern.title.to_string(),
                    description: pattern.description.to_string(),
                    file: file.clone(),
                    line: (line_no + 1) as u32,
                    suggestion: pattern.suggestion.to_string(),
                });
                if notices.len() >= MAX_NOTICES {
                    break 'files;
                }
            }
        }
    }

    notices
}
