//! Pattern model: higher-level observations about the user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Behavioral,
    Emotional,
    Cognitive,
    Relational,
    Temporal,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Behavioral => "behavioral",
            PatternCategory::Emotional => "emotional",
            PatternCategory::Cognitive => "cognitive",
            PatternCategory::Relational => "relational",
            PatternCategory::Temporal => "temporal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "behavioral" => Some(PatternCategory::Behavioral),
            "emotional" => Some(PatternCategory::Emotional),
            "cognitive" => Some(PatternCategory::Cognitive),
            "relational" => Some(PatternCategory::Relational),
            "temporal" => Some(PatternCategory::Temporal),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Detected,
    Surfaced,
    Confirmed,
    Rejected,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Detected => "detected",
            PatternStatus::Surfaced => "surfaced",
            PatternStatus::Confirmed => "confirmed",
            PatternStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(PatternStatus::Detected),
            "surfaced" => Some(PatternStatus::Surfaced),
            "confirmed" => Some(PatternStatus::Confirmed),
            "rejected" => Some(PatternStatus::Rejected),
            _ => None,
        }
    }
}

/// An inferred behavioral or cognitive pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub user_id: String,
    pub category: PatternCategory,
    pub description: String,
    pub short_description: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub status: PatternStatus,
    pub surfaced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(
        user_id: impl Into<String>,
        category: PatternCategory,
        description: impl Into<String>,
        short_description: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            category,
            description: description.into(),
            short_description: short_description.into(),
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
            status: PatternStatus::Detected,
            surfaced_at: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Rejected patterns are never retrieved.
    pub fn is_retrievable(&self) -> bool {
        self.status != PatternStatus::Rejected
    }
}
