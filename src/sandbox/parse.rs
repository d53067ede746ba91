//! Toolchain output parsers.
//!
//! Each parser lifts one toolchain's raw text into [`Diagnostic`]s or
//! [`TestResult`]s. Parsers are tolerant by contract: a line that doesn't
//! match any known shape is skipped, never an error.

use crate::domain::{Diagnostic, DiagnosticSeverity, TestResult};
use regex::Regex;
use std::sync::LazyLock;

fn seconds_to_ms(seconds: &str) -> u64 {
    seconds
        .parse::<f64>()
        .map(|s| (s * 1000.0) as u64)
        .unwrap_or(0)
}

// ── Go ───────────────────────────────────────────────────────────

static GO_DIAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^:\s]+\.go):(?P<line>\d+):(?P<col>\d+):\s*(?P<msg>.+)$")
        .expect("static regex")
});

pub fn go_build(stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for line in stderr.lines().chain(stdout.lines()) {
        if let Some(caps) = GO_DIAG.captures(line.trim()) {
            out.push(Diagnostic {
                file: caps["file"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
                column: caps["col"].parse().unwrap_or(0),
                severity: DiagnosticSeverity::Error,
                message: caps["msg"].to_string(),
            });
        }
    }
    out
}

static GO_TEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^--- (?P<status>PASS|FAIL): (?P<name>\S+) \((?P<secs>[0-9.]+)s\)")
        .expect("static regex")
});
static GO_PKG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ok|FAIL)\s+(?P<pkg>\S+)").expect("static regex"));

pub fn go_tests(stdout: &str, _stderr: &str) -> Vec<TestResult> {
    let mut results: Vec<TestResult> = Vec::new();
    let mut failing_output: Vec<(usize, Vec<String>)> = Vec::new();
    let mut package = String::new();

    for line in stdout.lines() {
        if let Some(caps) = GO_TEST.captures(line) {
            let passed = &caps["status"] == "PASS";
            results.push(TestResult {
                package: package.clone(),
                name: caps["name"].to_string(),
                passed,
                duration_ms: seconds_to_ms(&caps["secs"]),
                output: String::new(),
            });
            if !passed {
                failing_output.push((results.len() - 1, Vec::new()));
            }
        } else if let Some(caps) = GO_PKG.captures(line) {
            // Package summary arrives after its tests; back-fill.
            package = caps["pkg"].to_string();
            for result in results.iter_mut().filter(|r| r.package.is_empty()) {
                result.package = package.clone();
            }
        } else if let Some((_, lines)) = failing_output.last_mut() {
            // Indented lines after a FAIL belong to its output.
            if line.starts_with("    ") {
                lines.push(line.trim().to_string());
            }
        }
    }

    for (index, lines) in failing_output {
        results[index].output = lines.join("\n");
    }
    results
}

// ── Rust ─────────────────────────────────────────────────────────

static RUST_MSG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sev>error|warning)(\[\w+\])?:\s*(?P<msg>.+)$").expect("static regex")
});
static RUST_LOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-->\s*(?P<file>[^:]+):(?P<line>\d+):(?P<col>\d+)").expect("static regex")
});

pub fn rustc(_stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let mut pending: Option<(DiagnosticSeverity, String)> = None;

    for line in stderr.lines() {
        if let Some(caps) = RUST_MSG.captures(line) {
            let severity = if &caps["sev"] == "error" {
                DiagnosticSeverity::Error
            } else {
                DiagnosticSeverity::Warning
            };
            let message = caps["msg"].to_string();
            // Summary lines ("error: aborting due to …") carry no location.
            if !message.starts_with("aborting due to") {
                pending = Some((severity, message));
            }
        } else if let (Some(caps), Some((severity, message))) =
            (RUST_LOC.captures(line), pending.take())
        {
            out.push(Diagnostic {
                file: caps["file"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
                column: caps["col"].parse().unwrap_or(0),
                severity,
                message,
            });
        }
    }
    out
}

static CARGO_TEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (?P<name>\S+) \.\.\. (?P<status>ok|FAILED|ignored)$").expect("static regex")
});

pub fn cargo_tests(stdout: &str, _stderr: &str) -> Vec<TestResult> {
    let mut results = Vec::new();
    for line in stdout.lines() {
        if let Some(caps) = CARGO_TEST.captures(line.trim()) {
            if &caps["status"] == "ignored" {
                continue;
            }
            let name = caps["name"].to_string();
            let package = name.rsplit_once("::").map(|(p, _)| p.to_string());
            results.push(TestResult {
                package: package.unwrap_or_default(),
                name,
                passed: &caps["status"] == "ok",
                duration_ms: 0,
                output: String::new(),
            });
        }
    }
    results
}

// ── Python ───────────────────────────────────────────────────────

static PY_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "(?P<file>[^"]+)", line (?P<line>\d+)"#).expect("static regex")
});

pub fn python_build(stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    let combined = format!("{stderr}\n{stdout}");
    let mut out = Vec::new();
    let mut location: Option<(String, u32)> = None;

    for line in combined.lines() {
        if let Some(caps) = PY_SYNTAX.captures(line) {
            location = Some((
                caps["file"].trim_start_matches("./").to_string(),
                caps["line"].parse().unwrap_or(0),
            ));
        } else if let Some((file, line_no)) = location.take() {
            let trimmed = line.trim();
            if trimmed.contains("Error") {
                out.push(Diagnostic {
                    file,
                    line: line_no,
                    column: 0,
                    severity: DiagnosticSeverity::Error,
                    message: trimmed.to_string(),
                });
            } else {
                // Source echo line; keep looking for the error message.
                location = Some((file, line_no));
            }
        }
    }
    out
}

static PYTEST_VERBOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>\S+?)::(?P<name>\S+)\s+(?P<status>PASSED|FAILED|ERROR)")
        .expect("static regex")
});
static PYTEST_FAILLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^FAILED (?P<file>\S+?)::(?P<name>\S+?)(?:\s+-\s+(?P<msg>.+))?$")
        .expect("static regex")
});

pub fn pytest(stdout: &str, _stderr: &str) -> Vec<TestResult> {
    let mut results: Vec<TestResult> = Vec::new();
    for line in stdout.lines() {
        if let Some(caps) = PYTEST_VERBOSE.captures(line.trim()) {
            results.push(TestResult {
                package: caps["file"].to_string(),
                name: caps["name"].to_string(),
                passed: &caps["status"] == "PASSED",
                duration_ms: 0,
                output: String::new(),
            });
        } else if let Some(caps) = PYTEST_FAILLINE.captures(line.trim()) {
            // Summary section: attach the short failure reason.
            let name = &caps["name"];
            if let Some(result) = results.iter_mut().find(|r| r.name == name) {
                if let Some(msg) = caps.name("msg") {
                    result.output = msg.as_str().to_string();
                }
            }
        }
    }
    results
}

// ── TypeScript ───────────────────────────────────────────────────

static TSC_DIAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^\(\s]+)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<sev>error|warning)\s+\w+:\s*(?P<msg>.+)$",
    )
    .expect("static regex")
});

pub fn tsc(stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        if let Some(caps) = TSC_DIAG.captures(line.trim()) {
            out.push(Diagnostic {
                file: caps["file"].to_string(),
                line: caps["line"].parse().unwrap_or(0),
                column: caps["col"].parse().unwrap_or(0),
                severity: if &caps["sev"] == "error" {
                    DiagnosticSeverity::Error
                } else {
                    DiagnosticSeverity::Warning
                },
                message: caps["msg"].to_string(),
            });
        }
    }
    out
}

static JEST_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<mark>[✓✕√×])\s+(?P<name>.+?)(?:\s+\((?P<ms>\d+)\s*ms\))?$")
        .expect("static regex")
});

pub fn jest(stdout: &str, stderr: &str) -> Vec<TestResult> {
    // Jest writes its reporter output to stderr.
    let combined = format!("{stderr}\n{stdout}");
    let mut results = Vec::new();
    let mut suite = String::new();

    for line in combined.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("PASS ").or_else(|| trimmed.strip_prefix("FAIL "))
        {
            suite = rest.split_whitespace().next().unwrap_or("").to_string();
        } else if let Some(caps) = JEST_CASE.captures(line) {
            let passed = matches!(&caps["mark"], "✓" | "√");
            results.push(TestResult {
                package: suite.clone(),
                name: caps["name"].trim().to_string(),
                passed,
                duration_ms: caps
                    .name("ms")
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0),
                output: String::new(),
            });
        }
    }
    results
}

// ── Java ─────────────────────────────────────────────────────────

static JAVAC_DIAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^:\s]+\.java):(?P<line>\d+):\s*(?P<sev>error|warning):\s*(?P<msg>.+)$")
        .expect("static regex")
});

pub fn javac(_stdout: &str, stderr: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for line in stderr.lines() {
        if let Some(caps) = JAVAC_DIAG.captures(line.trim()) {
            out.push(Diagnostic {
                file: caps["file"].trim_start_matches("./").to_string(),
                line: caps["line"].parse().unwrap_or(0),
                column: 0,
                severity: if &caps["sev"] == "error" {
                    DiagnosticSeverity::Error
                } else {
                    DiagnosticSeverity::Warning
                },
                message: caps["msg"].to_string(),
            });
        }
    }
    out
}

static JUNIT_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<name>[\w$]+)\(\)\s+(?P<mark>[✔✘])").expect("static regex")
});

pub fn junit(stdout: &str, _stderr: &str) -> Vec<TestResult> {
    let mut results = Vec::new();
    let mut class = String::new();

    for line in stdout.lines() {
        // Container lines name the test class before its methods.
        if let Some(start) = line.find("─ ") {
            let rest = &line[start + "─ ".len()..];
            let name = rest.trim_end_matches(" ✔").trim_end_matches(" ✘").trim();
            if !name.contains("()") && name.ends_with("Test") {
                class = name.to_string();
                continue;
            }
        }
        if let Some(caps) = JUNIT_CASE.captures(line) {
            results.push(TestResult {
                package: class.clone(),
                name: caps["name"].to_string(),
                passed: &caps["mark"] == "✔",
                duration_ms: 0,
                output: String::new(),
            });
        }
    }
    results
}
