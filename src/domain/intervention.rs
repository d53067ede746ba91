//! Interventions: what the daemon actually said, at which depth.

use super::{Intent, InterventionLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shape of the delivered assistance, derived from the final level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    Question,
    Hint,
    Nudge,
    Critique,
    Explain,
    Snippet,
}

impl InterventionType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Hint => "hint",
            Self::Nudge => "nudge",
            Self::Critique => "critique",
            Self::Explain => "explain",
            Self::Snippet => "snippet",
        }
    }
}

/// A file region an intervention points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// One delivered intervention. Append-only per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_id: Option<Uuid>,
    pub intent: Intent,
    pub level: InterventionLevel,
    #[serde(rename = "type")]
    pub kind: InterventionType,
    pub content: String,
    pub targets: Vec<Target>,
    pub created_at: DateTime<Utc>,
}

impl Intervention {
    pub fn new(
        session_id: Uuid,
        run_id: Option<Uuid>,
        intent: Intent,
        level: InterventionLevel,
        kind: InterventionType,
        content: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            run_id,
            intent,
            level,
            kind,
            content,
            targets: Vec::new(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_under_type_key() {
        let iv = Intervention::new(
            Uuid::new_v4(),
            None,
            Intent::Hint,
            InterventionLevel::CategoryHint,
            InterventionType::Hint,
            "look at the loop bounds".into(),
            Utc::now(),
        );
        let json = serde_json::to_value(&iv).unwrap();
        assert_eq!(json["type"], "hint");
        assert_eq!(json["level"], "category_hint");
    }
}
