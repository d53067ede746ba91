//! The cross-session learning profile.
//!
//! Profiles aggregate across sessions: how often the learner runs code,
//! how often they reach for hints, and a per-topic skill estimate. The
//! selector reads these to decide how much help to give.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Skill estimate for one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSkill {
    /// Estimated mastery in [0, 1].
    pub level: f64,
    pub attempts: u32,
    pub last_seen: DateTime<Utc>,
}

/// Process-wide learner profile, mutated only by the profile store owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningProfile {
    pub topic_skills: BTreeMap<String, TopicSkill>,
    pub total_runs: u32,
    pub hint_requests: u32,
    /// Rolling average seconds from session start to first green run.
    pub avg_time_to_green_seconds: f64,
    /// Most frequent build-error summaries, most recent first, bounded.
    pub common_errors: Vec<String>,
}

/// How many distinct common errors a profile retains.
const COMMON_ERROR_CAP: usize = 20;

/// Exponential moving-average weight for skill updates.
const SKILL_EMA_ALPHA: f64 = 0.3;

impl LearningProfile {
    /// Ratio of hint requests to runs, clamped to [0, 1]. Zero when the
    /// learner has not run anything yet.
    pub fn hint_dependency(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        (f64::from(self.hint_requests) / f64::from(self.total_runs)).min(1.0)
    }

    /// Fold a run result into the per-topic skill estimate.
    pub fn record_run(&mut self, topic: &str, passed: bool, now: DateTime<Utc>) {
        self.total_runs += 1;
        let outcome = if passed { 1.0 } else { 0.0 };
        let entry = self
            .topic_skills
            .entry(topic.to_string())
            .or_insert(TopicSkill {
                level: 0.0,
                attempts: 0,
                last_seen: now,
            });
        entry.attempts += 1;
        entry.level = (entry.level * (1.0 - SKILL_EMA_ALPHA) + outcome * SKILL_EMA_ALPHA)
            .clamp(0.0, 1.0);
        entry.last_seen = now;
    }

    pub fn record_hint(&mut self) {
        self.hint_requests += 1;
    }

    /// Fold a new time-to-green sample into the rolling average.
    pub fn record_time_to_green(&mut self, seconds: f64) {
        if self.avg_time_to_green_seconds == 0.0 {
            self.avg_time_to_green_seconds = seconds;
        } else {
            self.avg_time_to_green_seconds =
                self.avg_time_to_green_seconds * 0.8 + seconds * 0.2;
        }
    }

    /// Remember a build-error summary, deduplicated, most recent first.
    pub fn record_common_error(&mut self, summary: &str) {
        self.common_errors.retain(|e| e != summary);
        self.common_errors.insert(0, summary.to_string());
        self.common_errors.truncate(COMMON_ERROR_CAP);
    }
}
