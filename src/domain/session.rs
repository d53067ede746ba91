//! The session aggregate: the sole mutator of pairing-session state.
//!
//! A session binds a learner's working set (code, run/hint counters) to a
//! [`LearningPolicy`]. Every mutation goes through the aggregate so the
//! invariants hold: terminal sessions are immutable, cooldown applies to
//! interventions at L3 and above, and mode-specific bindings (exercise for
//! training, spec for feature guidance) are checked at construction.

use super::{Intent, InterventionLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Learning policy ──────────────────────────────────────────────

/// The Learning Contract: caps on assistance depth, immutable for the
/// lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPolicy {
    /// Highest level the selector may return without explicit escalation.
    pub max_level: InterventionLevel,
    /// Whether the daemon may propose patches for user confirmation.
    pub patching_enabled: bool,
    /// Minimum seconds between interventions at L3 or above.
    pub cooldown_seconds: u32,
    /// Human-readable track label (e.g. "strict", "balanced", "mentor").
    pub track: String,
}

impl LearningPolicy {
    /// The `strict` track: hints only, long cooldown.
    pub fn strict() -> Self {
        Self {
            max_level: InterventionLevel::LocationConcept,
            patching_enabled: false,
            cooldown_seconds: 300,
            track: "strict".into(),
        }
    }

    /// The `balanced` track: outlines allowed, moderate cooldown.
    pub fn balanced() -> Self {
        Self {
            max_level: InterventionLevel::ConstrainedSnippet,
            patching_enabled: false,
            cooldown_seconds: 120,
            track: "balanced".into(),
        }
    }

    /// The `mentor` track: everything short of gated levels, short cooldown.
    pub fn mentor() -> Self {
        Self {
            max_level: InterventionLevel::ConstrainedSnippet,
            patching_enabled: true,
            cooldown_seconds: 30,
            track: "mentor".into(),
        }
    }

    /// Resolve a named track, if known.
    pub fn from_track(track: &str) -> Option<Self> {
        match track {
            "strict" => Some(Self::strict()),
            "balanced" => Some(Self::balanced()),
            "mentor" => Some(Self::mentor()),
            _ => None,
        }
    }
}

impl Default for LearningPolicy {
    fn default() -> Self {
        Self::balanced()
    }
}

// ── Session mode & status ────────────────────────────────────────

/// What kind of pairing a session is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Working through a curated exercise (requires `exercise_id`).
    Training,
    /// Free-form project work.
    Greenfield,
    /// Building against a product spec (requires `spec_path`).
    FeatureGuidance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

// ── Errors ───────────────────────────────────────────────────────

/// Why a session mutation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,
    #[error("cooldown active: {remaining_seconds}s remaining")]
    CooldownActive { remaining_seconds: u32 },
    #[error("training sessions require an exercise_id")]
    MissingExercise,
    #[error("feature-guidance sessions require a spec_path")]
    MissingSpec,
}

// ── Session aggregate ────────────────────────────────────────────

/// Aggregate root for one pairing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub exercise_id: Option<String>,
    /// Spec document bound to a feature-guidance session.
    pub spec_path: Option<String>,
    pub mode: SessionMode,
    pub policy: LearningPolicy,
    pub status: SessionStatus,
    /// Current working set: filename → content.
    pub code: BTreeMap<String, String>,
    pub run_count: u32,
    pub hint_count: u32,
    pub last_intervention_at: Option<DateTime<Utc>>,
    /// Level of the most recent intervention, for the escalation window.
    pub last_intervention_level: Option<InterventionLevel>,
    /// Consecutive same-level interventions with no passing run between.
    pub consecutive_same_level: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new Active session, validating the mode bindings.
    pub fn new(
        mode: SessionMode,
        policy: LearningPolicy,
        exercise_id: Option<String>,
        spec_path: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        match mode {
            SessionMode::Training if exercise_id.is_none() => {
                return Err(SessionError::MissingExercise)
            }
            SessionMode::FeatureGuidance if spec_path.is_none() => {
                return Err(SessionError::MissingSpec)
            }
            _ => {}
        }
        Ok(Self {
            id: Uuid::new_v4(),
            exercise_id,
            spec_path,
            mode,
            policy,
            status: SessionStatus::Active,
            code: BTreeMap::new(),
            run_count: 0,
            hint_count: 0,
            last_intervention_at: None,
            last_intervention_level: None,
            consecutive_same_level: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Seconds of cooldown left before another L3+ intervention is allowed.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> u32 {
        let Some(last) = self.last_intervention_at else {
            return 0;
        };
        let elapsed = (now - last).num_seconds().max(0) as u64;
        u64::from(self.policy.cooldown_seconds)
            .saturating_sub(elapsed)
            .try_into()
            .unwrap_or(u32::MAX)
    }

    /// True iff the session may accept an intervention at `level` right now.
    ///
    /// Below-L3 requests ignore the cooldown entirely.
    pub fn can_request_intervention(&self, level: InterventionLevel, now: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        if !level.is_cooldown_gated() {
            return true;
        }
        self.cooldown_remaining(now) == 0
    }

    /// Record a delivered intervention. Bumps the hint counter, stamps the
    /// cooldown clock, and tracks the consecutive same-level streak for the
    /// selector's escalation window.
    pub fn record_intervention(
        &mut self,
        intent: Intent,
        level: InterventionLevel,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        if level.is_cooldown_gated() {
            let remaining = self.cooldown_remaining(now);
            if remaining > 0 {
                return Err(SessionError::CooldownActive {
                    remaining_seconds: remaining,
                });
            }
        }
        if intent != Intent::Escalate {
            if self.last_intervention_level == Some(level) {
                self.consecutive_same_level += 1;
            } else {
                self.consecutive_same_level = 1;
            }
            self.last_intervention_level = Some(level);
        }
        self.hint_count += 1;
        self.last_intervention_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a completed run. A passing run resets the escalation streak.
    pub fn record_run(&mut self, all_tests_passed: bool, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        self.run_count += 1;
        if all_tests_passed {
            self.consecutive_same_level = 0;
            self.last_intervention_level = None;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Replace the working set.
    pub fn update_code(
        &mut self,
        code: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        self.code = code;
        self.updated_at = now;
        Ok(())
    }

    /// Terminal: mark the session completed. Irreversible.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        self.status = SessionStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// Terminal: mark the session abandoned. Irreversible.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        self.status = SessionStatus::Abandoned;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    fn active_session(cooldown: u32) -> Session {
        let policy = LearningPolicy {
            cooldown_seconds: cooldown,
            ..LearningPolicy::balanced()
        };
        Session::new(SessionMode::Greenfield, policy, None, None, t0()).unwrap()
    }

    #[test]
    fn training_requires_exercise() {
        let err = Session::new(
            SessionMode::Training,
            LearningPolicy::balanced(),
            None,
            None,
            t0(),
        )
        .unwrap_err();
        assert_eq!(err, SessionError::MissingExercise);
    }

    #[test]
    fn feature_guidance_requires_spec() {
        let err = Session::new(
            SessionMode::FeatureGuidance,
            LearningPolicy::balanced(),
            None,
            None,
            t0(),
        )
        .unwrap_err();
        assert_eq!(err, SessionError::MissingSpec);

        let ok = Session::new(
            SessionMode::FeatureGuidance,
            LearningPolicy::balanced(),
            None,
            Some("specs/checkout.json".into()),
            t0(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn below_l3_ignores_cooldown() {
        let mut s = active_session(60);
        s.record_intervention(Intent::Hint, InterventionLevel::ConstrainedSnippet, t0())
            .unwrap();
        // 5 seconds later, an L2 request sails through.
        let later = t0() + Duration::seconds(5);
        assert!(s.can_request_intervention(InterventionLevel::LocationConcept, later));
        assert!(!s.can_request_intervention(InterventionLevel::ConstrainedSnippet, later));
    }

    #[test]
    fn cooldown_remaining_counts_down() {
        let mut s = active_session(60);
        s.record_intervention(Intent::Stuck, InterventionLevel::ConstrainedSnippet, t0())
            .unwrap();
        assert_eq!(s.cooldown_remaining(t0() + Duration::seconds(10)), 50);
        assert_eq!(s.cooldown_remaining(t0() + Duration::seconds(60)), 0);
        assert_eq!(s.cooldown_remaining(t0() + Duration::seconds(90)), 0);
    }

    #[test]
    fn record_intervention_during_cooldown_fails() {
        let mut s = active_session(60);
        s.record_intervention(Intent::Stuck, InterventionLevel::ConstrainedSnippet, t0())
            .unwrap();
        let err = s
            .record_intervention(
                Intent::Stuck,
                InterventionLevel::ConstrainedSnippet,
                t0() + Duration::seconds(10),
            )
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::CooldownActive {
                remaining_seconds: 50
            }
        );
        // Counter untouched on refusal.
        assert_eq!(s.hint_count, 1);
    }

    #[test]
    fn terminal_sessions_refuse_mutation() {
        let mut s = active_session(0);
        s.complete(t0()).unwrap();
        assert_eq!(
            s.record_run(false, t0()).unwrap_err(),
            SessionError::NotActive
        );
        assert_eq!(
            s.update_code(BTreeMap::new(), t0()).unwrap_err(),
            SessionError::NotActive
        );
        assert_eq!(
            s.record_intervention(Intent::Hint, InterventionLevel::CategoryHint, t0())
                .unwrap_err(),
            SessionError::NotActive
        );
        assert_eq!(s.abandon(t0()).unwrap_err(), SessionError::NotActive);
    }

    #[test]
    fn same_level_streak_tracks_and_resets_on_green() {
        let mut s = active_session(0);
        for i in 1..=3 {
            s.record_intervention(Intent::Hint, InterventionLevel::CategoryHint, t0())
                .unwrap();
            assert_eq!(s.consecutive_same_level, i);
        }
        s.record_intervention(Intent::Stuck, InterventionLevel::LocationConcept, t0())
            .unwrap();
        assert_eq!(s.consecutive_same_level, 1);

        s.record_run(true, t0()).unwrap();
        assert_eq!(s.consecutive_same_level, 0);
        assert_eq!(s.last_intervention_level, None);
    }

    #[test]
    fn policy_tracks_resolve() {
        assert_eq!(LearningPolicy::from_track("strict").unwrap().track, "strict");
        assert_eq!(
            LearningPolicy::from_track("mentor").unwrap().max_level,
            InterventionLevel::ConstrainedSnippet
        );
        assert!(LearningPolicy::from_track("vibe").is_none());
    }

    #[test]
    fn session_serde_round_trips() {
        let s = active_session(45);
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, s.id);
        assert_eq!(back.policy, s.policy);
        assert_eq!(back.status, SessionStatus::Active);
    }
}
