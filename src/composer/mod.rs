//! Prompt composition: turns a resolved selection plus context into a
//! (system, user) prompt pair.
//!
//! The system prompt carries the hard constraints for the selected level;
//! the user prompt is assembled from sections in a fixed order. Same
//! inputs always produce the same output. Sections that outgrow their
//! budget are cut at a paragraph boundary, never mid-sentence when that
//! can be avoided.

use crate::domain::{
    Exercise, Intent, InterventionLevel, InterventionType, ProductSpec, RunOutput,
};
use crate::selector::Selection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

// ── Budgets ──────────────────────────────────────────────────────

/// Per-section character budgets for the user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionBudgets {
    pub exercise: usize,
    pub code_per_file: usize,
    pub run_results: usize,
    pub hints: usize,
    pub spec: usize,
}

impl Default for SectionBudgets {
    fn default() -> Self {
        Self {
            exercise: 2_000,
            code_per_file: 6_000,
            run_results: 2_500,
            hints: 1_200,
            spec: 1_800,
        }
    }
}

/// Failing-test output lines kept per test in the run-results section.
const FAILING_OUTPUT_LINES: usize = 12;

// ── Input & output ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompositionInput<'a> {
    pub intent: Intent,
    pub selection: Selection,
    pub exercise: Option<&'a Exercise>,
    pub code: &'a BTreeMap<String, String>,
    pub run_output: Option<&'a RunOutput>,
    pub spec: Option<&'a ProductSpec>,
    pub focus_criterion: Option<&'a str>,
    /// Required for gated levels; its absence there is a programming error.
    pub justification: Option<&'a str>,
}

static EMPTY_CODE: std::sync::LazyLock<BTreeMap<String, String>> =
    std::sync::LazyLock::new(BTreeMap::new);

impl Default for CompositionInput<'_> {
    fn default() -> Self {
        Self {
            intent: Intent::Hint,
            selection: Selection {
                level: InterventionLevel::Clarify,
                kind: InterventionType::Question,
            },
            exercise: None,
            code: &EMPTY_CODE,
            run_output: None,
            spec: None,
            focus_criterion: None,
            justification: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ComposerError {
    /// A gated (L4/L5) composition reached the composer without a
    /// justification. Callers must validate escalations first.
    #[error("gated level {0} composed without a justification")]
    MissingJustification(InterventionLevel),
}

// ── Composer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Composer {
    budgets: SectionBudgets,
}

impl Composer {
    pub fn new(budgets: SectionBudgets) -> Self {
        Self { budgets }
    }

    pub fn build(&self, input: &CompositionInput<'_>) -> Result<PromptPair, ComposerError> {
        let level = input.selection.level;
        if level.is_gated() && input.justification.map_or(true, |j| j.trim().is_empty()) {
            debug_assert!(false, "escalation must be validated before composition");
            return Err(ComposerError::MissingJustification(level));
        }

        Ok(PromptPair {
            system: self.system_prompt(level, input.justification),
            user: self.user_prompt(input),
        })
    }

    fn system_prompt(&self, level: InterventionLevel, justification: Option<&str>) -> String {
        let mut out = String::from(
            "You are a pairing mentor for a developer who must remain the author \
             of their own code. You operate under a Learning Contract that caps \
             how directive you may be. Obey the constraints for the current \
             level exactly; when in doubt, say less.\n\n",
        );

        out.push_str("## Hard constraints\n\n");
        match level {
            InterventionLevel::Clarify => out.push_str(
                "- Respond with exactly one clarifying question.\n\
                 - Do not give guidance, name APIs, or show any code.\n\
                 - The question must help the learner articulate the problem.\n",
            ),
            InterventionLevel::CategoryHint => out.push_str(
                "- Name the category of the problem (e.g. off-by-one, ownership, \
                 missing await) without specifics.\n\
                 - Never name specific APIs, functions, or types.\n\
                 - Do not show any code.\n",
            ),
            InterventionLevel::LocationConcept => out.push_str(
                "- Point to the file and region where the problem lives and name \
                 the concept that applies there.\n\
                 - Never show code, not even fragments.\n\
                 - Do not write the fix; describe what to think about.\n",
            ),
            InterventionLevel::ConstrainedSnippet => out.push_str(
                "- You may sketch an outline: signatures and structure with \
                 placeholder comments (e.g. `// handle the empty case here`).\n\
                 - Placeholder bodies only; no working implementations.\n\
                 - Keep the outline minimal and leave the decisions to the learner.\n",
            ),
            InterventionLevel::PartialSolution => out.push_str(
                "- You may provide a partial solution: implement the hard core, \
                 leave clearly marked gaps for the learner to complete.\n\
                 - Explain every non-obvious decision so the learner can finish it.\n",
            ),
            InterventionLevel::FullSolution => out.push_str(
                "- You may provide a complete solution.\n\
                 - Accompany it with an explanation the learner could use to \
                 rebuild it from scratch.\n",
            ),
        }

        if level.is_gated() {
            // Validated by `build`; present by construction here.
            let j = justification.unwrap_or_default();
            let _ = write!(
                out,
                "\n## Escalation\n\nThe learner explicitly escalated past their \
                 contract with this justification:\n> {}\n\nHonor the request, \
                 but keep the teaching framing.\n",
                j.trim()
            );
        }

        out
    }

    fn user_prompt(&self, input: &CompositionInput<'_>) -> String {
        let mut out = String::new();
        let level = input.selection.level;

        // Exercise context.
        if let Some(exercise) = input.exercise {
            let _ = writeln!(
                out,
                "## Exercise: {} ({:?})\n",
                exercise.title, exercise.difficulty
            );
            out.push_str(&truncate_paragraphs(
                &exercise.description,
                self.budgets.exercise,
            ));
            out.push_str("\n\n");
        }

        // Learner intent.
        let _ = writeln!(out, "## Learner intent\n\n{}\n", intent_line(input.intent));

        // Level header.
        let _ = writeln!(
            out,
            "## Assistance level: {}\n\nAt this level you {}.\n",
            level.label(),
            level.description()
        );

        // Current code.
        if !input.code.is_empty() {
            out.push_str("## Current code\n\n");
            for (file, content) in input.code {
                let _ = writeln!(out, "### {file}\n");
                out.push_str("```\n");
                out.push_str(&truncate_paragraphs(content, self.budgets.code_per_file));
                if !content.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```\n\n");
            }
        }

        // Run results.
        if let Some(output) = input.run_output {
            out.push_str("## Run results\n\n");
            out.push_str(&truncate_paragraphs(
                &run_summary(output),
                self.budgets.run_results,
            ));
            out.push_str("\n\n");
        }

        // Hints available at or below the selected level.
        if let Some(exercise) = input.exercise {
            let hints = exercise.hints_up_to(level);
            if !hints.is_empty() {
                out.push_str("## Available hints\n\n");
                let joined = hints
                    .iter()
                    .map(|h| format!("- {h}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                out.push_str(&truncate_paragraphs(&joined, self.budgets.hints));
                out.push_str("\n\n");
            }
        }

        // Spec block.
        if let Some(spec) = input.spec {
            out.push_str(&truncate_paragraphs(
                &spec_block(spec, input.focus_criterion),
                self.budgets.spec,
            ));
            out.push_str("\n\n");
        }

        // Task instruction.
        let _ = writeln!(
            out,
            "## Task\n\n{}",
            task_instruction(input.intent, input.selection.kind)
        );

        out
    }
}

// ── Section renderers ────────────────────────────────────────────

fn intent_line(intent: Intent) -> &'static str {
    match intent {
        Intent::Hint => "The learner asked for a hint.",
        Intent::Review => "The learner asked for a review of their current code.",
        Intent::Stuck => "The learner reports being stuck.",
        Intent::Next => "The learner asked what to work on next.",
        Intent::Explain => "The learner asked for an explanation.",
        Intent::Escalate => "The learner explicitly escalated for deeper help.",
    }
}

fn run_summary(output: &RunOutput) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Format: {} | Build: {} | Tests: {} passed, {} failed ({} ms)",
        if output.format_ok { "ok" } else { "needs formatting" },
        if output.build_ok { "ok" } else { "FAILED" },
        output.tests_passed,
        output.tests_failed,
        output.duration_ms
    );

    if !output.build_errors.is_empty() {
        out.push_str("\nBuild errors:\n");
        for d in &output.build_errors {
            let _ = writeln!(out, "- {}:{}:{}: {}", d.file, d.line, d.column, d.message);
        }
    }

    let failing: Vec<_> = output.failing_tests().collect();
    if !failing.is_empty() {
        out.push_str("\nFailing tests:\n");
        for t in failing {
            let _ = writeln!(out, "- {}::{}", t.package, t.name);
            for line in t.output.lines().take(FAILING_OUTPUT_LINES) {
                let _ = writeln!(out, "    {line}");
            }
        }
    }

    if !output.risks.is_empty() {
        out.push_str("\nRisk notices:\n");
        for r in &output.risks {
            let _ = writeln!(
                out,
                "- [{:?}/{:?}] {} ({}:{})",
                r.category, r.severity, r.title, r.file, r.line
            );
        }
    }

    out
}

fn spec_block(spec: &ProductSpec, focus_criterion: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Product spec: {} v{}\n", spec.name, spec.version);

    if !spec.goals.is_empty() {
        let _ = writeln!(out, "Goals: {}", spec.goals.join("; "));
    }
    let _ = writeln!(
        out,
        "Progress: {:.0}% of acceptance criteria satisfied",
        spec.satisfied_fraction() * 100.0
    );

    if let Some(focus) = focus_criterion {
        if let Some(criterion) = spec.criterion(focus) {
            let _ = writeln!(
                out,
                "Focus criterion: {} — {} [{}]",
                criterion.id,
                criterion.description,
                if criterion.satisfied { "satisfied" } else { "open" }
            );
        } else {
            let _ = writeln!(out, "Focus criterion: {focus}");
        }
    }

    if !spec.features.is_empty() {
        let _ = writeln!(out, "Features in scope: {}", spec.features.join(", "));
    }
    if !spec.non_functional.is_empty() {
        let _ = writeln!(out, "Non-functional: {}", spec.non_functional.join("; "));
    }

    out
}

fn task_instruction(intent: Intent, kind: InterventionType) -> &'static str {
    match (intent, kind) {
        (_, InterventionType::Question) => {
            "Ask the one clarifying question that would most help the learner \
             make their next decision on their own."
        }
        (Intent::Next, InterventionType::Hint) => {
            "Suggest, in one or two sentences, the category of work to tackle \
             next. Do not name APIs or show code."
        }
        (_, InterventionType::Hint) => {
            "Give one category-level hint about the most pressing problem. Do \
             not name APIs or show code."
        }
        (_, InterventionType::Critique) => {
            "Critique the current code: name the most important issue, where it \
             lives, and the concept the learner should revisit. No code."
        }
        (_, InterventionType::Nudge) => {
            "Point the learner at the place and concept to examine next. \
             Describe what to look for; do not reveal the fix. No code."
        }
        (_, InterventionType::Explain) => {
            "Explain the concept behind the current failure with a structural \
             outline. Placeholder comments only, no working code."
        }
        (Intent::Escalate, InterventionType::Snippet) => {
            "Provide the requested solution at the escalated depth, with the \
             explanation the learner needs to own it afterwards."
        }
        (_, InterventionType::Snippet) => {
            "Sketch a constrained outline of the solution: structure and \
             signatures with placeholder comments for every body."
        }
    }
}

// ── Truncation ───────────────────────────────────────────────────

/// Cut `text` to at most `max_chars`, preferring a paragraph boundary,
/// then a sentence boundary, then a character boundary.
pub fn truncate_paragraphs(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let hard_end = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let window = &text[..hard_end];

    // Prefer the last paragraph break inside the window.
    if let Some(cut) = window.rfind("\n\n") {
        if cut > 0 {
            return format!("{}\n\n[... truncated]", window[..cut].trim_end());
        }
    }

    // Fall back to the last sentence end.
    if let Some(cut) = window.rfind(['.', '!', '?']) {
        if cut > 0 {
            return format!("{} [... truncated]", &window[..=cut]);
        }
    }

    format!("{}[... truncated]", window)
}
