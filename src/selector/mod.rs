//! The intervention selector: a pure, deterministic mapping from
//! (intent, context signals, policy) to (level, type).
//!
//! The selector never suspends and never touches I/O. All heuristic
//! constants live in [`SelectorTuning`] so tests can treat them as
//! parameters rather than laws.

use crate::domain::{
    Difficulty, Exercise, Intent, InterventionLevel, InterventionType, LearningPolicy,
    LearningProfile, ProductSpec, RunOutput,
};
use serde::{Deserialize, Serialize};

// ── Tuning ───────────────────────────────────────────────────────

/// Heuristic thresholds for level adjustment and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorTuning {
    /// Above this hint-dependency, the learner leans on hints: keep level.
    pub high_dependency: f64,
    /// Below this dependency (with enough runs), the learner is independent:
    /// reduce level by one.
    pub low_dependency: f64,
    /// Minimum runs before the low-dependency reduction applies.
    pub independent_run_gate: u32,
    /// More failed tests than this raises the level to at least L2.
    pub failed_test_gate: u32,
    /// Spec progress above this fraction reduces the level by one.
    pub spec_progress_gate: f64,
    /// Consecutive same-level interventions before recommending escalation.
    pub escalation_window: u32,
    pub escalation_window_beginner: u32,
    pub escalation_window_advanced: u32,
}

impl Default for SelectorTuning {
    fn default() -> Self {
        Self {
            high_dependency: 0.5,
            low_dependency: 0.2,
            independent_run_gate: 10,
            failed_test_gate: 3,
            spec_progress_gate: 0.5,
            escalation_window: 3,
            escalation_window_beginner: 4,
            escalation_window_advanced: 2,
        }
    }
}

// ── Input & output ───────────────────────────────────────────────

/// Everything the selector may consult besides intent and policy.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext<'a> {
    pub exercise: Option<&'a Exercise>,
    pub profile: Option<&'a LearningProfile>,
    pub run_output: Option<&'a RunOutput>,
    pub spec: Option<&'a ProductSpec>,
    /// Acceptance criterion currently anchoring feedback.
    pub focus_criterion: Option<&'a str>,
    /// Consecutive same-level interventions with no passing run between,
    /// taken from the session aggregate.
    pub consecutive_same_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub level: InterventionLevel,
    pub kind: InterventionType,
}

// ── Selector ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Selector {
    tuning: SelectorTuning,
}

impl Selector {
    pub fn new(tuning: SelectorTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &SelectorTuning {
        &self.tuning
    }

    /// Map a normal (non-escalate) pairing intent to a level and type.
    ///
    /// Adjustments apply in a fixed order — difficulty, profile, run
    /// output, spec progress — and the result is clamped to the policy
    /// cap last. A green run short-circuits to L0 no matter the intent.
    pub fn select(
        &self,
        intent: Intent,
        ctx: &SelectionContext<'_>,
        policy: &LearningPolicy,
    ) -> Selection {
        let mut level = base_level(intent);

        // 1. Exercise difficulty.
        if let Some(exercise) = ctx.exercise {
            if exercise.difficulty == Difficulty::Advanced {
                level = level.lowered();
            }
        }

        // 2. Learner profile.
        if let Some(profile) = ctx.profile {
            let dependency = profile.hint_dependency();
            if dependency < self.tuning.low_dependency
                && profile.total_runs > self.tuning.independent_run_gate
            {
                level = level.lowered();
            }
            // High dependency keeps the level as-is.
        }

        // 3. Run output.
        let mut forced_floor = false;
        if let Some(output) = ctx.run_output {
            if output.all_tests_passed() {
                return Selection {
                    level: InterventionLevel::Clarify,
                    kind: kind_for(InterventionLevel::Clarify, intent),
                };
            }
            let broken_build = !output.build_errors.is_empty();
            let many_failures = output.tests_failed > self.tuning.failed_test_gate;
            let stuck_on_red = intent == Intent::Stuck && output.tests_failed > 0;
            if broken_build || many_failures || stuck_on_red {
                if level < InterventionLevel::LocationConcept {
                    level = InterventionLevel::LocationConcept;
                }
                forced_floor = true;
            }
        }

        // 4. Spec progress.
        if let Some(spec) = ctx.spec {
            if ctx.focus_criterion.is_none()
                && spec.satisfied_fraction() > self.tuning.spec_progress_gate
                && !forced_floor
                && level > InterventionLevel::CategoryHint
            {
                level = level.lowered();
            }
        }

        // Escalation window: a stalled streak earns one level, still short
        // of the gated band.
        if self.escalation_recommended(ctx) {
            let bumped = level.raised();
            if !bumped.is_gated() {
                level = bumped;
            }
        }

        // 5. Clamp to the contract.
        if level > policy.max_level {
            level = policy.max_level;
        }

        Selection {
            level,
            kind: kind_for(level, intent),
        }
    }

    /// Level/type for an explicitly justified escalation. Validation of the
    /// justification happens in the orchestrator; this only shapes output.
    pub fn select_escalation(&self, level: InterventionLevel) -> Selection {
        Selection {
            level,
            kind: InterventionType::Snippet,
        }
    }

    /// Whether the session's same-level streak has exhausted the window.
    pub fn escalation_recommended(&self, ctx: &SelectionContext<'_>) -> bool {
        let mut window = match ctx.exercise.map(|e| e.difficulty) {
            Some(Difficulty::Beginner) => self.tuning.escalation_window_beginner,
            Some(Difficulty::Advanced) => self.tuning.escalation_window_advanced,
            _ => self.tuning.escalation_window,
        };
        if let Some(profile) = ctx.profile {
            if profile.hint_dependency() > self.tuning.high_dependency {
                window = window.saturating_sub(1);
            }
        }
        window = window.max(1);
        ctx.consecutive_same_level >= window
    }
}

fn base_level(intent: Intent) -> InterventionLevel {
    match intent {
        Intent::Hint | Intent::Next => InterventionLevel::CategoryHint,
        Intent::Review | Intent::Stuck | Intent::Explain => InterventionLevel::LocationConcept,
        // Escalation never reaches the base table; the orchestrator routes
        // it through `select_escalation`.
        Intent::Escalate => InterventionLevel::LocationConcept,
    }
}

fn kind_for(level: InterventionLevel, intent: Intent) -> InterventionType {
    match level {
        InterventionLevel::Clarify => InterventionType::Question,
        InterventionLevel::CategoryHint => InterventionType::Hint,
        InterventionLevel::LocationConcept => {
            if intent == Intent::Review {
                InterventionType::Critique
            } else {
                InterventionType::Nudge
            }
        }
        InterventionLevel::ConstrainedSnippet => {
            if intent == Intent::Explain {
                InterventionType::Explain
            } else {
                InterventionType::Snippet
            }
        }
        InterventionLevel::PartialSolution | InterventionLevel::FullSolution => {
            InterventionType::Snippet
        }
    }
}
