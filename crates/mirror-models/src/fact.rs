//! Fact model: subject-predicate-object triples with bi-temporal versioning.
//!
//! `valid_from`/`valid_to` record when a fact held in reality;
//! `created_at`/`invalidated_at` record when the system learned or
//! retracted it. Versions of one (entity, predicate) slot form a chain
//! through `previous_version_id` and `invalidated_by`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, normalize_name, now, Predicate};

/// Status of a fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Active,
    /// Soft-deleted, e.g. because its source note was deleted
    Inactive,
    Superseded,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Active => "active",
            FactStatus::Inactive => "inactive",
            FactStatus::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FactStatus::Active),
            "inactive" => Some(FactStatus::Inactive),
            "superseded" => Some(FactStatus::Superseded),
            _ => None,
        }
    }
}

impl Default for FactStatus {
    fn default() -> Self {
        FactStatus::Active
    }
}

impl std::fmt::Display for FactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A statement about an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub user_id: String,
    /// Subject entity
    pub entity_id: String,
    pub predicate: Predicate,
    pub object_text: String,
    /// Object entity, when the object resolves to a known entity
    pub object_entity_id: Option<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub status: FactStatus,

    // Valid time
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,

    // Transaction time
    pub created_at: DateTime<Utc>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidated_by: Option<String>,

    pub version: i32,
    pub previous_version_id: Option<String>,
    pub is_current: bool,

    pub source_note_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        predicate: Predicate,
        object_text: impl Into<String>,
    ) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            predicate,
            object_text: object_text.into(),
            object_entity_id: None,
            confidence: 0.8,
            status: FactStatus::Active,
            valid_from: Some(ts),
            valid_to: None,
            created_at: ts,
            invalidated_at: None,
            invalidated_by: None,
            version: 1,
            previous_version_id: None,
            is_current: true,
            source_note_id: None,
            updated_at: ts,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_source_note(mut self, note_id: impl Into<String>) -> Self {
        self.source_note_id = Some(note_id.into());
        self
    }

    pub fn with_object_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.object_entity_id = Some(entity_id.into());
        self
    }

    /// The (entity, predicate) slot this fact occupies.
    pub fn slot(&self) -> FactSlot {
        FactSlot {
            entity_id: self.entity_id.clone(),
            predicate: self.predicate.clone(),
        }
    }

    /// Whether this fact can be returned by retrieval.
    pub fn is_live(&self) -> bool {
        self.status == FactStatus::Active && self.is_current
    }

    /// Object comparison ignoring case and whitespace.
    pub fn same_object(&self, object_text: &str) -> bool {
        normalize_name(&self.object_text) == normalize_name(object_text)
    }

    /// Retire this row in favour of `successor_id`.
    pub fn retire(&mut self, successor_id: &str, at: DateTime<Utc>) {
        self.is_current = false;
        self.status = FactStatus::Superseded;
        self.valid_to = Some(at);
        self.invalidated_at = Some(at);
        self.invalidated_by = Some(successor_id.to_string());
        self.updated_at = at;
    }

    /// Link this (new) row as the next version after `previous`.
    pub fn follow(&mut self, previous: &Fact) {
        self.version = previous.version + 1;
        self.previous_version_id = Some(previous.id.clone());
    }

    /// Short label for audit lists.
    pub fn label(&self) -> String {
        format!("{} {}", self.predicate, self.object_text)
    }
}

/// Identity of a fact slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactSlot {
    pub entity_id: String,
    pub predicate: Predicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_and_follow_link_versions() {
        let mut old = Fact::new("u1", "e1", Predicate::WorksAt, "Acme");
        let mut new = Fact::new("u1", "e1", Predicate::WorksAt, "Notion");
        let at = now();

        new.follow(&old);
        old.retire(&new.id, at);

        assert_eq!(new.version, 2);
        assert_eq!(new.previous_version_id.as_deref(), Some(old.id.as_str()));
        assert!(!old.is_current);
        assert_eq!(old.invalidated_by.as_deref(), Some(new.id.as_str()));
        assert_eq!(old.valid_to, Some(at));
        assert!(!old.is_live());
    }

    #[test]
    fn test_same_object_is_case_insensitive() {
        let fact = Fact::new("u1", "e1", Predicate::LivesIn, "San  Francisco");
        assert!(fact.same_object("san francisco"));
        assert!(!fact.same_object("Tokyo"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let fact = Fact::new("u1", "e1", Predicate::Likes, "tea").with_confidence(1.7);
        assert_eq!(fact.confidence, 1.0);
    }
}
