//! Core domain model for the pairing daemon.
//!
//! Everything here is plain data plus the invariants that guard it. The
//! aggregate root is [`Session`]; runs and interventions are owned by their
//! session and append-only. No I/O lives in this module.

pub mod exercise;
pub mod intervention;
pub mod profile;
pub mod run;
pub mod session;

pub use exercise::{AcceptanceCriterion, Difficulty, Exercise, ProductSpec};
pub use intervention::{Intervention, InterventionType, Target};
pub use profile::{LearningProfile, TopicSkill};
pub use run::{
    Diagnostic, DiagnosticSeverity, Language, Recipe, RiskCategory, RiskNotice, RiskSeverity, Run,
    RunOutput, RunStatus, TestResult,
};
pub use session::{LearningPolicy, Session, SessionError, SessionMode, SessionStatus};

use serde::{Deserialize, Serialize};

// ── Request intent ───────────────────────────────────────────────

/// What the learner is asking for in a single pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// A small push in the right direction.
    Hint,
    /// Critique of the current code.
    Review,
    /// The learner is blocked and needs unsticking.
    Stuck,
    /// What to work on next.
    Next,
    /// Explain a concept or an error.
    Explain,
    /// Explicit request to exceed the policy cap (requires justification).
    Escalate,
}

impl Intent {
    pub fn label(self) -> &'static str {
        match self {
            Self::Hint => "hint",
            Self::Review => "review",
            Self::Stuck => "stuck",
            Self::Next => "next",
            Self::Explain => "explain",
            Self::Escalate => "escalate",
        }
    }

    /// Parse a URL path segment (`/v1/sessions/{id}/{intent}`).
    pub fn from_path_segment(s: &str) -> Option<Self> {
        match s {
            "hint" => Some(Self::Hint),
            "review" => Some(Self::Review),
            "stuck" => Some(Self::Stuck),
            "next" => Some(Self::Next),
            "explain" => Some(Self::Explain),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Intervention level ───────────────────────────────────────────

/// Ordinal depth of AI assistance. Higher is more directive.
///
/// L4 and L5 are gated: they are only reachable through an explicit
/// escalation request carrying a written justification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InterventionLevel {
    /// L0 — ask a clarifying question, never answer directly.
    Clarify,
    /// L1 — name the category of the problem, no specifics.
    CategoryHint,
    /// L2 — point at the location and the concept involved.
    LocationConcept,
    /// L3 — a constrained snippet: outline with placeholders.
    ConstrainedSnippet,
    /// L4 — a partial solution (gated).
    PartialSolution,
    /// L5 — a full solution (gated).
    FullSolution,
}

impl InterventionLevel {
    pub const ALL: &'static [InterventionLevel] = &[
        Self::Clarify,
        Self::CategoryHint,
        Self::LocationConcept,
        Self::ConstrainedSnippet,
        Self::PartialSolution,
        Self::FullSolution,
    ];

    /// Numeric rank, 0..=5.
    pub fn rank(self) -> u8 {
        match self {
            Self::Clarify => 0,
            Self::CategoryHint => 1,
            Self::LocationConcept => 2,
            Self::ConstrainedSnippet => 3,
            Self::PartialSolution => 4,
            Self::FullSolution => 5,
        }
    }

    /// Clamping constructor from a numeric rank.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Self::Clarify,
            1 => Self::CategoryHint,
            2 => Self::LocationConcept,
            3 => Self::ConstrainedSnippet,
            4 => Self::PartialSolution,
            _ => Self::FullSolution,
        }
    }

    /// One level down, saturating at L0.
    pub fn lowered(self) -> Self {
        Self::from_rank(self.rank().saturating_sub(1))
    }

    /// One level up, saturating at L5.
    pub fn raised(self) -> Self {
        Self::from_rank((self.rank() + 1).min(5))
    }

    /// Gated levels require an explicit, justified escalation.
    pub fn is_gated(self) -> bool {
        self >= Self::PartialSolution
    }

    /// Levels at or above this one are subject to the policy cooldown.
    pub fn is_cooldown_gated(self) -> bool {
        self >= Self::ConstrainedSnippet
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Clarify => "L0 Clarify",
            Self::CategoryHint => "L1 Category Hint",
            Self::LocationConcept => "L2 Location & Concept",
            Self::ConstrainedSnippet => "L3 Constrained Snippet",
            Self::PartialSolution => "L4 Partial Solution",
            Self::FullSolution => "L5 Full Solution",
        }
    }

    /// One-line description used in prompt headers.
    pub fn description(self) -> &'static str {
        match self {
            Self::Clarify => "ask one clarifying question that moves the learner forward",
            Self::CategoryHint => "name the category of the problem without specifics",
            Self::LocationConcept => "point to where the problem lives and which concept applies",
            Self::ConstrainedSnippet => "sketch an outline with placeholder comments, no working code",
            Self::PartialSolution => "provide a partial solution the learner completes",
            Self::FullSolution => "provide a complete solution with an explanation",
        }
    }
}

impl std::fmt::Display for InterventionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.rank())
    }
}

/// Minimum length of an escalation justification.
pub const MIN_JUSTIFICATION_LEN: usize = 20;
