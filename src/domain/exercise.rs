//! External collaborator values: exercises from the pack loader and
//! product specs from the documentation indexer. Both arrive as plain
//! domain values; the daemon never mutates them.

use super::run::Recipe;
use super::InterventionLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

/// A curated exercise supplied by the exercise pack loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub title: String,
    pub difficulty: Difficulty,
    pub description: String,
    /// filename → content the learner starts from.
    pub starter_code: BTreeMap<String, String>,
    /// filename → content of the exercise's test files.
    pub test_code: BTreeMap<String, String>,
    /// Author-written hints, keyed by the deepest level they may appear at.
    #[serde(default)]
    pub hints_by_level: BTreeMap<InterventionLevel, Vec<String>>,
    pub check_recipe: Recipe,
}

impl Exercise {
    /// Hints visible at or below `level`, in level order.
    pub fn hints_up_to(&self, level: InterventionLevel) -> Vec<&str> {
        self.hints_by_level
            .iter()
            .filter(|(l, _)| **l <= level)
            .flat_map(|(_, hints)| hints.iter().map(String::as_str))
            .collect()
    }
}

// ── Product spec ─────────────────────────────────────────────────

/// One acceptance criterion in a product spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    pub satisfied: bool,
    #[serde(default)]
    pub evidence: String,
}

/// A product spec supplied by the documentation indexer, anchoring
/// feature-guidance sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSpec {
    pub name: String,
    pub version: String,
    pub goals: Vec<String>,
    pub features: Vec<String>,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub non_functional: Vec<String>,
    #[serde(default)]
    pub milestones: Vec<String>,
}

impl ProductSpec {
    /// Fraction of acceptance criteria currently satisfied, in [0, 1].
    pub fn satisfied_fraction(&self) -> f64 {
        if self.acceptance_criteria.is_empty() {
            return 0.0;
        }
        let satisfied = self
            .acceptance_criteria
            .iter()
            .filter(|c| c.satisfied)
            .count();
        satisfied as f64 / self.acceptance_criteria.len() as f64
    }

    pub fn criterion(&self, id: &str) -> Option<&AcceptanceCriterion> {
        self.acceptance_criteria.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(satisfied: usize, total: usize) -> ProductSpec {
        ProductSpec {
            name: "checkout".into(),
            version: "1.0".into(),
            goals: vec!["ship checkout".into()],
            features: vec![],
            acceptance_criteria: (0..total)
                .map(|i| AcceptanceCriterion {
                    id: format!("AC-{i}"),
                    description: format!("criterion {i}"),
                    satisfied: i < satisfied,
                    evidence: String::new(),
                })
                .collect(),
            non_functional: vec![],
            milestones: vec![],
        }
    }

    #[test]
    fn satisfied_fraction_basic() {
        assert_eq!(spec_with(3, 4).satisfied_fraction(), 0.75);
        assert_eq!(spec_with(0, 0).satisfied_fraction(), 0.0);
    }

    #[test]
    fn hints_up_to_filters_by_level() {
        let mut hints = BTreeMap::new();
        hints.insert(InterventionLevel::CategoryHint, vec!["think arrays".to_string()]);
        hints.insert(
            InterventionLevel::ConstrainedSnippet,
            vec!["use a two-pointer scan".to_string()],
        );
        let ex = Exercise {
            id: "two-sum".into(),
            title: "Two Sum".into(),
            difficulty: Difficulty::Beginner,
            description: String::new(),
            starter_code: BTreeMap::new(),
            test_code: BTreeMap::new(),
            hints_by_level: hints,
            check_recipe: Recipe::default(),
        };
        assert_eq!(
            ex.hints_up_to(InterventionLevel::CategoryHint),
            vec!["think arrays"]
        );
        assert_eq!(ex.hints_up_to(InterventionLevel::FullSolution).len(), 2);
    }
}
