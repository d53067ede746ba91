//! Sandboxed code execution: format → build → test in a scratch directory.
//!
//! Each request materializes the session's code map into a fresh scratch
//! directory, runs the language toolchain steps in order, and parses the
//! results into a [`RunOutput`]. The scratch directory is deleted on every
//! exit path. A per-request deadline applies to the whole pipeline; on
//! expiry the running process is signaled and the run reports `Timeout`.
//!
//! Isolation: when a container runtime is available (and configuration
//! allows), steps run inside `docker`/`podman` with the network disabled
//! and CPU/memory caps. A missing runtime falls back to local process
//! execution; the fallback is logged, never surfaced as a failure.

pub mod parse;
pub mod risk;
pub mod toolchains;

use crate::config::{IsolationMode, SandboxSettings};
use crate::domain::{Language, Recipe, RunOutput, RunStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use toolchains::{CommandSpec, Toolchain};

/// Cap on captured bytes per stream per step.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// Cap on the stored format diff.
const MAX_FORMAT_DIFF: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),

    #[error("invalid file path in code map: {0}")]
    InvalidPath(String),

    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),
}

/// What one execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub output: RunOutput,
}

pub struct Sandbox {
    settings: SandboxSettings,
    registry: HashMap<Language, Arc<dyn Toolchain>>,
    /// Resolved container runtime binary, when one was found.
    container: Option<PathBuf>,
}

impl Sandbox {
    pub fn new(settings: SandboxSettings) -> Result<Self, SandboxError> {
        let container = match settings.isolation {
            IsolationMode::Local => None,
            IsolationMode::Auto | IsolationMode::Container => detect_container_runtime(),
        };

        match settings.isolation {
            IsolationMode::Container if container.is_none() => {
                return Err(SandboxError::Infrastructure(
                    "isolation = \"container\" but no docker/podman runtime found".into(),
                ));
            }
            IsolationMode::Auto if container.is_none() => {
                tracing::warn!(
                    "no container runtime found; sandbox falls back to local process execution"
                );
            }
            _ => {}
        }

        if let Some(ref runtime) = container {
            tracing::info!(runtime = %runtime.display(), "sandbox container isolation enabled");
        }

        Ok(Self {
            settings,
            registry: toolchains::registry(),
            container,
        })
    }

    /// Short description of the active runner for the status endpoint.
    pub fn runner_label(&self) -> String {
        match &self.container {
            Some(runtime) => format!(
                "container({})",
                runtime
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            None => "local".into(),
        }
    }

    #[cfg(test)]
    fn insert_toolchain(&mut self, toolchain: Arc<dyn Toolchain>) {
        self.registry.insert(toolchain.language(), toolchain);
    }

    /// Run the full pipeline for one request.
    pub async fn execute(
        &self,
        language: Language,
        code: &BTreeMap<String, String>,
        recipe: &Recipe,
    ) -> Result<ExecutionReport, SandboxError> {
        let toolchain = self
            .registry
            .get(&language)
            .cloned()
            .ok_or(SandboxError::UnsupportedLanguage(language))?;

        // The scratch directory is owned by this call; TempDir removes it
        // on every exit path, early returns and panics included.
        let scratch = self.create_scratch()?;
        materialize(scratch.path(), code)?;

        let started = Instant::now();
        let deadline = started + Duration::from_secs(u64::from(recipe.timeout_seconds.max(1)));
        let plan = toolchain.plan(recipe);
        let mut output = RunOutput {
            format_ok: true,
            build_ok: true,
            ..RunOutput::default()
        };
        let mut status = RunStatus::Completed;

        'pipeline: {
            // ── Format ──
            if let Some(spec) = &plan.format {
                match self.run_step(spec, scratch.path(), deadline).await? {
                    StepResult::TimedOut => {
                        status = RunStatus::Timeout;
                        break 'pipeline;
                    }
                    StepResult::Finished {
                        exit_ok,
                        stdout,
                        stderr: _,
                    } => {
                        output.format_ok = exit_ok;
                        if !exit_ok {
                            output.format_diff = cap(&stdout, MAX_FORMAT_DIFF);
                        }
                    }
                }
            }

            // ── Build ──
            if let Some(spec) = &plan.build {
                match self.run_step(spec, scratch.path(), deadline).await? {
                    StepResult::TimedOut => {
                        status = RunStatus::Timeout;
                        break 'pipeline;
                    }
                    StepResult::Finished {
                        exit_ok,
                        stdout,
                        stderr,
                    } => {
                        output.build_ok = exit_ok;
                        if !exit_ok {
                            output.build_errors = toolchain.parse_build(&stdout, &stderr);
                            // Build failure short-circuits test execution.
                            break 'pipeline;
                        }
                    }
                }
            }

            // ── Test ──
            if let Some(spec) = &plan.test {
                match self.run_step(spec, scratch.path(), deadline).await? {
                    StepResult::TimedOut => {
                        status = RunStatus::Timeout;
                        break 'pipeline;
                    }
                    StepResult::Finished {
                        stdout, stderr, ..
                    } => {
                        output.test_results = toolchain.parse_tests(&stdout, &stderr);
                        output.tests_passed =
                            output.test_results.iter().filter(|t| t.passed).count() as u32;
                        output.tests_failed =
                            output.test_results.iter().filter(|t| !t.passed).count() as u32;
                    }
                }
            }
        }

        output.duration_ms = started.elapsed().as_millis() as u64;
        output.risks = risk::scan(code);

        Ok(ExecutionReport { status, output })
    }

    fn create_scratch(&self) -> Result<tempfile::TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mentord-run-");
        let result = if self.settings.scratch_root.is_empty() {
            builder.tempdir()
        } else {
            std::fs::create_dir_all(&self.settings.scratch_root).map_err(|e| {
                SandboxError::Infrastructure(format!("cannot create scratch root: {e}"))
            })?;
            builder.tempdir_in(&self.settings.scratch_root)
        };
        result.map_err(|e| SandboxError::Infrastructure(format!("cannot create scratch dir: {e}")))
    }

    fn command_for(
        &self,
        spec: &CommandSpec,
        dir: &Path,
        containerized: bool,
    ) -> tokio::process::Command {
        if containerized {
            if let Some(runtime) = &self.container {
                let mut cmd = tokio::process::Command::new(runtime);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("--network=none")
                    .arg(format!("--cpus={}", self.settings.container_cpus))
                    .arg(format!("--memory={}m", self.settings.container_memory_mb))
                    .arg("-v")
                    .arg(format!("{}:/work", dir.display()))
                    .arg("-w")
                    .arg("/work")
                    .arg(&self.settings.container_image)
                    .arg(&spec.program)
                    .args(&spec.args);
                return cmd;
            }
        }
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(dir);
        cmd
    }

    async fn run_step(
        &self,
        spec: &CommandSpec,
        dir: &Path,
        deadline: Instant,
    ) -> Result<StepResult, SandboxError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(StepResult::TimedOut);
        }

        if self.container.is_some() {
            match self.spawn_and_wait(spec, dir, remaining, true).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    // Container start failure falls back to the local
                    // sandbox; only a second failure is infrastructure.
                    tracing::warn!(
                        step = %spec.program,
                        "container execution failed ({e}); falling back to local process"
                    );
                }
            }
        }

        self.spawn_and_wait(spec, dir, remaining, false)
            .await
            .map_err(SandboxError::Infrastructure)
    }

    async fn spawn_and_wait(
        &self,
        spec: &CommandSpec,
        dir: &Path,
        remaining: Duration,
        containerized: bool,
    ) -> Result<StepResult, String> {
        let mut cmd = self.command_for(spec, dir, containerized);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", spec.program))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| format!("wait failed: {e}"))?;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(StepResult::Finished {
                    exit_ok: status.success(),
                    stdout,
                    stderr,
                })
            }
            _ = tokio::time::sleep(remaining) => {
                terminate(&mut child, Duration::from_millis(self.settings.kill_grace_ms)).await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(StepResult::TimedOut)
            }
        }
    }
}

enum StepResult {
    Finished {
        exit_ok: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

// ── Helpers ──────────────────────────────────────────────────────

fn detect_container_runtime() -> Option<PathBuf> {
    for candidate in ["docker", "podman"] {
        if let Ok(path) = which::which(candidate) {
            return Some(path);
        }
    }
    None
}

/// Write the code map into the scratch directory, refusing paths that
/// could escape it.
fn materialize(root: &Path, code: &BTreeMap<String, String>) -> Result<(), SandboxError> {
    for (name, content) in code {
        let rel = Path::new(name);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if name.is_empty() || escapes {
            return Err(SandboxError::InvalidPath(name.clone()));
        }
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Infrastructure(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&path, content).map_err(|e| {
            SandboxError::Infrastructure(format!("cannot write {}: {e}", path.display()))
        })?;
    }
    Ok(())
}

async fn read_capped(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < MAX_CAPTURE_BYTES {
                    let take = n.min(MAX_CAPTURE_BYTES - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                // Keep draining past the cap so the child never blocks on
                // a full pipe.
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// SIGTERM, a short grace, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a child pid we own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn cap(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    format!("{}...[truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Diagnostic, DiagnosticSeverity, TestResult};
    use tempfile::TempDir;

    /// Shell-backed toolchain so tests run without any real language
    /// toolchain installed.
    struct FakeToolchain {
        build_cmd: &'static str,
        test_cmd: &'static str,
    }

    impl Toolchain for FakeToolchain {
        fn language(&self) -> Language {
            Language::Go
        }

        fn plan(&self, recipe: &Recipe) -> toolchains::ToolchainPlan {
            toolchains::ToolchainPlan {
                format: None,
                build: recipe.build.then(|| CommandSpec::shell(self.build_cmd)),
                test: recipe.test.then(|| CommandSpec::shell(self.test_cmd)),
            }
        }

        fn parse_build(&self, _stdout: &str, stderr: &str) -> Vec<Diagnostic> {
            stderr
                .lines()
                .filter(|l| l.starts_with("ERR "))
                .map(|l| Diagnostic {
                    file: "main.go".into(),
                    line: 1,
                    column: 1,
                    severity: DiagnosticSeverity::Error,
                    message: l.trim_start_matches("ERR ").to_string(),
                })
                .collect()
        }

        fn parse_tests(&self, stdout: &str, _stderr: &str) -> Vec<TestResult> {
            stdout
                .lines()
                .filter_map(|l| {
                    let (status, name) = l.split_once(' ')?;
                    Some(TestResult {
                        package: "fake".into(),
                        name: name.to_string(),
                        passed: status == "PASS",
                        duration_ms: 1,
                        output: String::new(),
                    })
                })
                .collect()
        }
    }

    fn sandbox_with(
        scratch_root: &Path,
        build_cmd: &'static str,
        test_cmd: &'static str,
    ) -> Sandbox {
        let settings = SandboxSettings {
            isolation: IsolationMode::Local,
            scratch_root: scratch_root.to_string_lossy().into_owned(),
            kill_grace_ms: 100,
            ..SandboxSettings::default()
        };
        let mut sandbox = Sandbox::new(settings).unwrap();
        sandbox.insert_toolchain(Arc::new(FakeToolchain { build_cmd, test_cmd }));
        sandbox
    }

    fn code() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("main.go".to_string(), "package main\n".to_string());
        map
    }

    fn scratch_is_empty(root: &Path) -> bool {
        std::fs::read_dir(root)
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn green_pipeline_reports_results_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(root.path(), "true", "printf 'PASS alpha\\nPASS beta\\n'");
        let report = sandbox
            .execute(Language::Go, &code(), &Recipe::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.output.build_ok);
        assert_eq!(report.output.tests_passed, 2);
        assert_eq!(report.output.tests_failed, 0);
        assert!(report.output.all_tests_passed());
        assert!(scratch_is_empty(root.path()), "scratch dir must be removed");
    }

    #[tokio::test]
    async fn build_failure_short_circuits_tests() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(
            root.path(),
            "echo 'ERR undefined symbol' >&2; false",
            "printf 'PASS never\\n'",
        );
        let report = sandbox
            .execute(Language::Go, &code(), &Recipe::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(!report.output.build_ok);
        assert_eq!(report.output.build_errors.len(), 1);
        assert!(report.output.test_results.is_empty(), "tests must not run");
        assert!(scratch_is_empty(root.path()));
    }

    #[tokio::test]
    async fn failing_tests_are_counted_not_fatal() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(
            root.path(),
            "true",
            "printf 'PASS alpha\\nFAIL beta\\n'; false",
        );
        let report = sandbox
            .execute(Language::Go, &code(), &Recipe::default())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.output.tests_passed, 1);
        assert_eq!(report.output.tests_failed, 1);
    }

    #[tokio::test]
    async fn deadline_yields_timeout_and_no_leftovers() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(root.path(), "true", "sleep 30");
        let recipe = Recipe {
            timeout_seconds: 1,
            ..Recipe::default()
        };
        let started = std::time::Instant::now();
        let report = sandbox.execute(Language::Go, &code(), &recipe).await.unwrap();

        assert_eq!(report.status, RunStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(scratch_is_empty(root.path()), "no scratch left after timeout");
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(root.path(), "true", "true");
        let mut bad = BTreeMap::new();
        bad.insert("../escape.txt".to_string(), "nope".to_string());
        let err = sandbox
            .execute(Language::Go, &bad, &Recipe::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath(_)));
        assert!(scratch_is_empty(root.path()));
    }

    #[tokio::test]
    async fn nested_files_materialize() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(root.path(), "test -f src/lib.go", "true");
        let mut map = BTreeMap::new();
        map.insert("src/lib.go".to_string(), "package lib\n".to_string());
        let report = sandbox
            .execute(Language::Go, &map, &Recipe::default())
            .await
            .unwrap();
        assert!(report.output.build_ok, "nested file must exist during build");
    }

    #[tokio::test]
    async fn risk_notices_ride_along() {
        let root = TempDir::new().unwrap();
        let sandbox = sandbox_with(root.path(), "true", "true");
        let mut map = BTreeMap::new();
        map.insert("config.py".to_string(), "password = \"x\"\n".to_string());
        let report = sandbox
            .execute(Language::Go, &map, &Recipe::default())
            .await
            .unwrap();
        assert_eq!(report.output.risks.len(), 1);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unsupported_language_errors() {
        let root = TempDir::new().unwrap();
        let settings = SandboxSettings {
            isolation: IsolationMode::Local,
            scratch_root: root.path().to_string_lossy().into_owned(),
            ..SandboxSettings::default()
        };
        let mut sandbox = Sandbox::new(settings).unwrap();
        sandbox.registry.clear();
        let err = sandbox
            .execute(Language::Rust, &code(), &Recipe::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }

    #[test]
    fn runner_label_reports_mode() {
        let settings = SandboxSettings {
            isolation: IsolationMode::Local,
            ..SandboxSettings::default()
        };
        let sandbox = Sandbox::new(settings).unwrap();
        assert_eq!(sandbox.runner_label(), "local");
    }
}
