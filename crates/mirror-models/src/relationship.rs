//! Relationship edges between two entities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, now};

/// Strength given to a newly observed edge.
pub const INITIAL_STRENGTH: f64 = 0.5;

/// Strength added on each reconfirmation inside the lookback window.
pub const STRENGTH_STEP: f64 = 0.1;

/// Typed link between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipType {
    ColleagueOf,
    ReportsTo,
    Manages,
    SiblingOf,
    FriendOf,
    PartnerOf,
    SpouseOf,
    ParentOf,
    ChildOf,
    MentorOf,
    Knows,
    Other(String),
}

impl RelationshipType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipType::ColleagueOf => "colleague_of",
            RelationshipType::ReportsTo => "reports_to",
            RelationshipType::Manages => "manages",
            RelationshipType::SiblingOf => "sibling_of",
            RelationshipType::FriendOf => "friend_of",
            RelationshipType::PartnerOf => "partner_of",
            RelationshipType::SpouseOf => "spouse_of",
            RelationshipType::ParentOf => "parent_of",
            RelationshipType::ChildOf => "child_of",
            RelationshipType::MentorOf => "mentor_of",
            RelationshipType::Knows => "knows",
            RelationshipType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        let key = s.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "colleague_of" | "colleague" | "coworker" => RelationshipType::ColleagueOf,
            "reports_to" => RelationshipType::ReportsTo,
            "manages" => RelationshipType::Manages,
            "sibling_of" | "sibling" => RelationshipType::SiblingOf,
            "friend_of" | "friend" => RelationshipType::FriendOf,
            "partner_of" | "partner" => RelationshipType::PartnerOf,
            "spouse_of" | "spouse" | "married_to" => RelationshipType::SpouseOf,
            "parent_of" => RelationshipType::ParentOf,
            "child_of" => RelationshipType::ChildOf,
            "mentor_of" | "mentor" => RelationshipType::MentorOf,
            "knows" => RelationshipType::Knows,
            _ => RelationshipType::Other(key),
        }
    }

    /// Symmetric edges are stored once with sorted endpoints.
    pub fn is_symmetric(&self) -> bool {
        match self {
            RelationshipType::ColleagueOf
            | RelationshipType::SiblingOf
            | RelationshipType::FriendOf
            | RelationshipType::PartnerOf
            | RelationshipType::SpouseOf
            | RelationshipType::Knows => true,
            RelationshipType::ReportsTo
            | RelationshipType::Manages
            | RelationshipType::ParentOf
            | RelationshipType::ChildOf
            | RelationshipType::MentorOf
            | RelationshipType::Other(_) => false,
        }
    }
}

impl From<String> for RelationshipType {
    fn from(s: String) -> Self {
        RelationshipType::parse(&s)
    }
}

impl From<RelationshipType> for String {
    fn from(t: RelationshipType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A relationship edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub user_id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: RelationshipType,
    /// Strength in [0, 1], grows with reconfirmation
    pub strength: f64,
    pub confidence: f64,
    pub is_active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_confirmed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        user_id: impl Into<String>,
        source_entity_id: &str,
        target_entity_id: &str,
        relationship_type: RelationshipType,
        confidence: f64,
    ) -> Self {
        let ts = now();
        let (source, target) = endpoints(&relationship_type, source_entity_id, target_entity_id);
        Self {
            id: new_id(),
            user_id: user_id.into(),
            source_entity_id: source,
            target_entity_id: target,
            relationship_type,
            strength: INITIAL_STRENGTH,
            confidence: confidence.clamp(0.0, 1.0),
            is_active: true,
            started_at: None,
            ended_at: None,
            last_confirmed_at: ts,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Record a reconfirmation at `at`.
    ///
    /// Strength grows by [`STRENGTH_STEP`] (capped at 1.0) only when the
    /// previous confirmation falls inside `lookback`; it never decreases.
    /// Returns whether strength changed.
    pub fn reinforce(&mut self, confidence: f64, at: DateTime<Utc>, lookback: Duration) -> bool {
        let within_window = at.signed_duration_since(self.last_confirmed_at) <= lookback;
        let before = self.strength;
        if within_window {
            self.strength = (self.strength + STRENGTH_STEP).min(1.0);
        }
        self.confidence = self.confidence.max(confidence.clamp(0.0, 1.0));
        self.is_active = true;
        self.ended_at = None;
        if at > self.last_confirmed_at {
            self.last_confirmed_at = at;
        }
        self.updated_at = at;
        self.strength > before
    }

    /// The endpoint opposite `entity_id`, if it is one of the two.
    pub fn other_endpoint(&self, entity_id: &str) -> Option<&str> {
        if self.source_entity_id == entity_id {
            Some(&self.target_entity_id)
        } else if self.target_entity_id == entity_id {
            Some(&self.source_entity_id)
        } else {
            None
        }
    }
}

/// Canonical endpoint order for an edge of the given type.
pub fn endpoints(relationship_type: &RelationshipType, a: &str, b: &str) -> (String, String) {
    if relationship_type.is_symmetric() && b < a {
        (b.to_string(), a.to_string())
    } else {
        (a.to_string(), b.to_string())
    }
}
