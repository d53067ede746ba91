//! Per-language toolchain plans.
//!
//! A toolchain turns a [`Recipe`] into the concrete format/build/test
//! commands for its language and knows how to lift that toolchain's raw
//! output into diagnostics and test results. Commands are fixed by the
//! daemon; user code never chooses what runs.

use super::parse;
use crate::domain::{Diagnostic, Language, Recipe, TestResult};
use std::collections::HashMap;
use std::sync::Arc;

/// One subprocess invocation, relative to the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Wrap a pipeline that needs shell glob expansion.
    pub fn shell(line: &str) -> Self {
        Self::new("sh", &["-c", line])
    }
}

/// The steps to run for one request, in pipeline order.
#[derive(Debug, Clone, Default)]
pub struct ToolchainPlan {
    pub format: Option<CommandSpec>,
    pub build: Option<CommandSpec>,
    pub test: Option<CommandSpec>,
}

/// A language the sandbox can check.
pub trait Toolchain: Send + Sync {
    fn language(&self) -> Language;

    /// Commands for the enabled recipe steps. `None` for a step means the
    /// language has no meaningful action for it and the step passes.
    fn plan(&self, recipe: &Recipe) -> ToolchainPlan;

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic>;

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult>;
}

/// Registry of all supported toolchains, built once at startup.
pub fn registry() -> HashMap<Language, Arc<dyn Toolchain>> {
    let mut map: HashMap<Language, Arc<dyn Toolchain>> = HashMap::new();
    map.insert(Language::Go, Arc::new(GoToolchain));
    map.insert(Language::Python, Arc::new(PythonToolchain));
    map.insert(Language::TypeScript, Arc::new(TypeScriptToolchain));
    map.insert(Language::Rust, Arc::new(RustToolchain));
    map.insert(Language::Java, Arc::new(JavaToolchain));
    map
}

// ── Go ───────────────────────────────────────────────────────────

pub struct GoToolchain;

impl Toolchain for GoToolchain {
    fn language(&self) -> Language {
        Language::Go
    }

    fn plan(&self, recipe: &Recipe) -> ToolchainPlan {
        ToolchainPlan {
            format: recipe.format.then(|| CommandSpec::new("gofmt", &["-l", "-d", "."])),
            build: recipe.build.then(|| CommandSpec::new("go", &["build", "./..."])),
            test: recipe.test.then(|| CommandSpec::new("go", &["test", "-v", "./..."])),
        }
    }

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic> {
        parse::go_build(stdout, stderr)
    }

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult> {
        parse::go_tests(stdout, stderr)
    }
}

// ── Python ───────────────────────────────────────────────────────

pub struct PythonToolchain;

impl Toolchain for PythonToolchain {
    fn language(&self) -> Language {
        Language::Python
    }

    fn plan(&self, recipe: &Recipe) -> ToolchainPlan {
        ToolchainPlan {
            format: recipe
                .format
                .then(|| CommandSpec::new("black", &["--check", "--diff", "--quiet", "."])),
            build: recipe
                .build
                .then(|| CommandSpec::new("python3", &["-m", "compileall", "-q", "."])),
            test: recipe
                .test
                .then(|| CommandSpec::new("python3", &["-m", "pytest", "-v", "--tb=short"])),
        }
    }

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic> {
        parse::python_build(stdout, stderr)
    }

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult> {
        parse::pytest(stdout, stderr)
    }
}

// ── TypeScript ───────────────────────────────────────────────────

pub struct TypeScriptToolchain;

impl Toolchain for TypeScriptToolchain {
    fn language(&self) -> Language {
        Language::TypeScript
    }

    fn plan(&self, recipe: &Recipe) -> ToolchainPlan {
        ToolchainPlan {
            format: recipe
                .format
                .then(|| CommandSpec::new("npx", &["--no-install", "prettier", "--check", "."])),
            build: recipe
                .build
                .then(|| CommandSpec::new("npx", &["--no-install", "tsc", "--noEmit"])),
            test: recipe.test.then(|| {
                CommandSpec::new("npx", &["--no-install", "jest", "--colors=false", "--verbose"])
            }),
        }
    }

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic> {
        parse::tsc(stdout, stderr)
    }

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult> {
        parse::jest(stdout, stderr)
    }
}

// ── Rust ─────────────────────────────────────────────────────────

pub struct RustToolchain;

impl Toolchain for RustToolchain {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn plan(&self, recipe: &Recipe) -> ToolchainPlan {
        ToolchainPlan {
            format: recipe.format.then(|| CommandSpec::new("cargo", &["fmt", "--check"])),
            build: recipe.build.then(|| CommandSpec::new("cargo", &["build"])),
            test: recipe.test.then(|| CommandSpec::new("cargo", &["test"])),
        }
    }

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic> {
        parse::rustc(stdout, stderr)
    }

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult> {
        parse::cargo_tests(stdout, stderr)
    }
}

// ── Java ─────────────────────────────────────────────────────────

pub struct JavaToolchain;

impl Toolchain for JavaToolchain {
    fn language(&self) -> Language {
        Language::Java
    }

    fn plan(&self, recipe: &Recipe) -> ToolchainPlan {
        ToolchainPlan {
            // No ubiquitous Java formatter; the step passes vacuously.
            format: None,
            build: recipe
                .build
                .then(|| CommandSpec::shell("javac -d out $(find . -name '*.java')")),
            test: recipe.test.then(|| {
                CommandSpec::shell(
                    "java -jar /opt/junit/junit-platform-console-standalone.jar \
                     execute --scan-class-path out --disable-banner --disable-ansi-colors",
                )
            }),
        }
    }

    fn parse_build(&self, stdout: &str, stderr: &str) -> Vec<Diagnostic> {
        parse::javac(stdout, stderr)
    }

    fn parse_tests(&self, stdout: &str, stderr: &str) -> Vec<TestResult> {
        parse::junit(stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_all_languages() {
        let reg = registry();
        for language in Language::ALL {
            assert!(reg.contains_key(language), "missing toolchain: {language}");
            assert_eq!(reg[language].language(), *language);
        }
    }

    #[test]
    fn plan_respects_recipe_toggles() {
        let recipe = Recipe {
            format: false,
            build: true,
            test: false,
            timeout_seconds: 10,
        };
        let plan = GoToolchain.plan(&recipe);
        assert!(plan.format.is_none());
        assert!(plan.build.is_some());
        assert!(plan.test.is_none());
    }

    #[test]
    fn go_plan_commands() {
        let plan = GoToolchain.plan(&Recipe::default());
        assert_eq!(plan.build.unwrap(), CommandSpec::new("go", &["build", "./..."]));
        assert_eq!(
            plan.test.unwrap(),
            CommandSpec::new("go", &["test", "-v", "./..."])
        );
    }

    #[test]
    fn java_has_no_format_step() {
        let plan = JavaToolchain.plan(&Recipe::default());
        assert!(plan.format.is_none());
        assert!(plan.build.unwrap().program == "sh");
    }
}
