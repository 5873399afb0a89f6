//! Behavior model: how the user relates to an entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, now};

/// Predicate describing the user's stance toward an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BehaviorPredicate {
    TrustsOpinionOf,
    SeeksAdviceFrom,
    ReliesOn,
    SupportedBy,
    InspiredBy,
    AvoidsDiscussing,
    ConflictsWith,
    Other(String),
}

impl BehaviorPredicate {
    pub fn as_str(&self) -> &str {
        match self {
            BehaviorPredicate::TrustsOpinionOf => "trusts_opinion_of",
            BehaviorPredicate::SeeksAdviceFrom => "seeks_advice_from",
            BehaviorPredicate::ReliesOn => "relies_on",
            BehaviorPredicate::SupportedBy => "supported_by",
            BehaviorPredicate::InspiredBy => "inspired_by",
            BehaviorPredicate::AvoidsDiscussing => "avoids_discussing",
            BehaviorPredicate::ConflictsWith => "conflicts_with",
            BehaviorPredicate::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        let key = s.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "trusts_opinion_of" => BehaviorPredicate::TrustsOpinionOf,
            "seeks_advice_from" => BehaviorPredicate::SeeksAdviceFrom,
            "relies_on" => BehaviorPredicate::ReliesOn,
            "supported_by" => BehaviorPredicate::SupportedBy,
            "inspired_by" => BehaviorPredicate::InspiredBy,
            "avoids_discussing" => BehaviorPredicate::AvoidsDiscussing,
            "conflicts_with" => BehaviorPredicate::ConflictsWith,
            _ => BehaviorPredicate::Other(key),
        }
    }

    /// Human-readable phrase for prompt rendering.
    pub fn phrase(&self) -> String {
        self.as_str().replace('_', " ")
    }
}

impl From<String> for BehaviorPredicate {
    fn from(s: String) -> Self {
        BehaviorPredicate::parse(&s)
    }
}

impl From<BehaviorPredicate> for String {
    fn from(p: BehaviorPredicate) -> Self {
        p.as_str().to_string()
    }
}

impl std::fmt::Display for BehaviorPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorStatus {
    Active,
    Inactive,
}

impl BehaviorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorStatus::Active => "active",
            BehaviorStatus::Inactive => "inactive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BehaviorStatus::Active),
            "inactive" => Some(BehaviorStatus::Inactive),
            _ => None,
        }
    }
}

/// An observed behavior of the user toward an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Behavior {
    pub id: String,
    pub user_id: String,
    pub predicate: BehaviorPredicate,
    pub entity_id: String,
    /// Display name of the entity at detection time
    pub entity_name: String,
    pub topic: Option<String>,
    pub sentiment: f64,
    pub evidence: Option<String>,
    pub confidence: f64,
    pub reinforcement_count: i32,
    pub status: BehaviorStatus,
    pub source_note_id: Option<String>,
    pub first_detected_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
}

impl Behavior {
    pub fn new(
        user_id: impl Into<String>,
        predicate: BehaviorPredicate,
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            predicate,
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            topic: None,
            sentiment: 0.0,
            evidence: None,
            confidence: confidence.clamp(0.0, 1.0),
            reinforcement_count: 1,
            status: BehaviorStatus::Active,
            source_note_id: None,
            first_detected_at: ts,
            last_reinforced_at: ts,
        }
    }

    /// Dedup key: one behavior per (predicate, entity).
    pub fn key(&self) -> (BehaviorPredicate, String) {
        (self.predicate.clone(), self.entity_id.clone())
    }

    /// Apply a repeated detection.
    ///
    /// Confidence becomes the max of old and new.
    pub fn reinforce(&mut self, confidence: f64, evidence: Option<String>, at: DateTime<Utc>) {
        self.reinforcement_count += 1;
        self.confidence = self.confidence.max(confidence.clamp(0.0, 1.0));
        if evidence.is_some() {
            self.evidence = evidence;
        }
        self.status = BehaviorStatus::Active;
        if at > self.last_reinforced_at {
            self.last_reinforced_at = at;
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.predicate.phrase(), self.entity_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinforce_takes_max_confidence() {
        let mut b = Behavior::new("u1", BehaviorPredicate::TrustsOpinionOf, "e1", "Marcus", 0.8);
        let at = now();
        b.reinforce(0.6, None, at);
        assert_eq!(b.reinforcement_count, 2);
        assert_eq!(b.confidence, 0.8);

        b.reinforce(0.9, Some("asked Marcus again".into()), at);
        assert_eq!(b.reinforcement_count, 3);
        assert_eq!(b.confidence, 0.9);
        assert_eq!(b.evidence.as_deref(), Some("asked Marcus again"));
    }

    #[test]
    fn test_label() {
        let b = Behavior::new("u1", BehaviorPredicate::SeeksAdviceFrom, "e1", "Sarah", 0.7);
        assert_eq!(b.label(), "seeks advice from Sarah");
    }
}
