//! Entity model: people, places, projects and other things a user mentions.
//!
//! Entities and typed memories (preferences, events, goals, ...) share one
//! record shape, discriminated by [`MemoryType`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, normalize_name, now};

/// Five-level importance tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceTier {
    Trivial,
    Low,
    Medium,
    High,
    Critical,
}

impl ImportanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportanceTier::Trivial => "trivial",
            ImportanceTier::Low => "low",
            ImportanceTier::Medium => "medium",
            ImportanceTier::High => "high",
            ImportanceTier::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trivial" => Some(ImportanceTier::Trivial),
            "low" => Some(ImportanceTier::Low),
            "medium" => Some(ImportanceTier::Medium),
            "high" => Some(ImportanceTier::High),
            "critical" => Some(ImportanceTier::Critical),
            _ => None,
        }
    }

    /// Weight used by composite ranking, also the initial importance score.
    pub fn weight(&self) -> f64 {
        match self {
            ImportanceTier::Critical => 1.0,
            ImportanceTier::High => 0.8,
            ImportanceTier::Medium => 0.6,
            ImportanceTier::Low => 0.4,
            ImportanceTier::Trivial => 0.2,
        }
    }

    /// Multiplier applied to the importance score per elapsed week.
    /// `None` means the tier never decays.
    pub fn weekly_decay_factor(&self) -> Option<f64> {
        match self {
            ImportanceTier::Critical => None,
            ImportanceTier::High => Some(0.95),
            ImportanceTier::Medium => Some(0.90),
            ImportanceTier::Low => Some(0.85),
            ImportanceTier::Trivial => Some(0.80),
        }
    }

    /// Days after the last update before decay starts.
    pub fn grace_period_days(&self) -> i64 {
        match self {
            ImportanceTier::Critical => i64::MAX,
            ImportanceTier::High => 30,
            ImportanceTier::Medium => 14,
            ImportanceTier::Low => 7,
            ImportanceTier::Trivial => 3,
        }
    }

    pub fn all() -> &'static [ImportanceTier] {
        &[
            ImportanceTier::Trivial,
            ImportanceTier::Low,
            ImportanceTier::Medium,
            ImportanceTier::High,
            ImportanceTier::Critical,
        ]
    }
}

impl Default for ImportanceTier {
    fn default() -> Self {
        ImportanceTier::Medium
    }
}

impl std::fmt::Display for ImportanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of thing an entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Place,
    Project,
    Organization,
    Pet,
    Concept,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Place => "place",
            EntityType::Project => "project",
            EntityType::Organization => "organization",
            EntityType::Pet => "pet",
            EntityType::Concept => "concept",
            EntityType::Other => "other",
        }
    }

    /// Parse a type tag. Unknown tags map to [`EntityType::Other`].
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" | "people" => EntityType::Person,
            "place" | "location" => EntityType::Place,
            "project" => EntityType::Project,
            "organization" | "organisation" | "company" => EntityType::Organization,
            "pet" => EntityType::Pet,
            "concept" | "topic" => EntityType::Concept,
            _ => EntityType::Other,
        }
    }
}

impl Default for EntityType {
    fn default() -> Self {
        EntityType::Other
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Archived,
    Superseded,
    Deleted,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Archived => "archived",
            EntityStatus::Superseded => "superseded",
            EntityStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EntityStatus::Active),
            "archived" => Some(EntityStatus::Archived),
            "superseded" => Some(EntityStatus::Superseded),
            "deleted" => Some(EntityStatus::Deleted),
            _ => None,
        }
    }
}

impl Default for EntityStatus {
    fn default() -> Self {
        EntityStatus::Active
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discriminator for records stored in the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Entity,
    Fact,
    Preference,
    Event,
    Goal,
    Procedure,
    Decision,
    Action,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Entity => "entity",
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Event => "event",
            MemoryType::Goal => "goal",
            MemoryType::Procedure => "procedure",
            MemoryType::Decision => "decision",
            MemoryType::Action => "action",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(MemoryType::Entity),
            "fact" => Some(MemoryType::Fact),
            "preference" => Some(MemoryType::Preference),
            "event" => Some(MemoryType::Event),
            "goal" => Some(MemoryType::Goal),
            "procedure" => Some(MemoryType::Procedure),
            "decision" => Some(MemoryType::Decision),
            "action" => Some(MemoryType::Action),
            _ => None,
        }
    }

    /// Age in days after which a low-importance record of this type is
    /// considered stale by the cleanup sweep.
    pub fn stale_after_days(&self) -> i64 {
        match self {
            MemoryType::Action => 14,
            MemoryType::Event => 30,
            MemoryType::Goal => 90,
            MemoryType::Fact | MemoryType::Decision => 180,
            MemoryType::Entity | MemoryType::Preference | MemoryType::Procedure => 365,
        }
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::Entity
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How sensitive a memory is. Ordered from least to most restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    Normal,
    Sensitive,
    Private,
}

impl SensitivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Normal => "normal",
            SensitivityLevel::Sensitive => "sensitive",
            SensitivityLevel::Private => "private",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(SensitivityLevel::Normal),
            "sensitive" => Some(SensitivityLevel::Sensitive),
            "private" => Some(SensitivityLevel::Private),
            _ => None,
        }
    }
}

impl Default for SensitivityLevel {
    fn default() -> Self {
        SensitivityLevel::Normal
    }
}

/// A person, place, project or other memory known to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub entity_type: EntityType,
    /// Free text, e.g. "my manager", "sister"
    pub relationship: Option<String>,
    pub summary: Option<String>,
    pub importance: ImportanceTier,
    /// Numeric importance in [0, 1], decays over time.
    pub importance_score: f64,
    /// Average sentiment in [-1, 1].
    pub sentiment_average: f64,
    pub mention_count: i32,
    pub status: EntityStatus,
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    pub sensitivity: SensitivityLevel,

    // Temporal fields
    pub is_historical: bool,
    pub effective_from: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub recurrence_pattern: Option<String>,

    // Access tracking
    pub access_count: i32,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// End of the last whole week charged by decay.
    #[serde(default)]
    pub last_decayed_at: Option<DateTime<Utc>>,

    // Versioning
    pub version: i32,
    pub previous_version_id: Option<String>,
    pub superseded_by: Option<String>,

    /// Note this entity was first extracted from.
    pub source_note_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new active entity with medium importance.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, entity_type: EntityType) -> Self {
        let ts = now();
        let importance = ImportanceTier::default();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            name: name.into(),
            aliases: Vec::new(),
            entity_type,
            relationship: None,
            summary: None,
            importance,
            importance_score: importance.weight(),
            sentiment_average: 0.0,
            mention_count: 1,
            status: EntityStatus::Active,
            embedding: None,
            memory_type: MemoryType::Entity,
            sensitivity: SensitivityLevel::Normal,
            is_historical: false,
            effective_from: None,
            expires_at: None,
            recurrence_pattern: None,
            access_count: 0,
            last_accessed_at: None,
            last_decayed_at: None,
            version: 1,
            previous_version_id: None,
            superseded_by: None,
            source_note_id: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Set the importance tier and reset the score to the tier weight.
    pub fn with_importance(mut self, tier: ImportanceTier) -> Self {
        self.importance = tier;
        self.importance_score = tier.weight();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Whether this row is the current, retrievable version.
    pub fn is_current(&self) -> bool {
        self.status == EntityStatus::Active && self.superseded_by.is_none()
    }

    /// Case-insensitive substring match of `needle` against the name
    /// or any alias.
    pub fn matches_name(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        self.name.to_lowercase().contains(&needle)
            || self
                .aliases
                .iter()
                .any(|alias| alias.to_lowercase().contains(&needle))
    }

    /// Whether `effective_from` lies after `at`.
    pub fn is_future_dated(&self, at: DateTime<Utc>) -> bool {
        self.effective_from.map(|from| from > at).unwrap_or(false)
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= at).unwrap_or(false)
    }

    /// Short label for audit lists and logs.
    pub fn label(&self) -> String {
        match &self.relationship {
            Some(rel) if !rel.is_empty() => format!("{} ({})", self.name, rel),
            _ => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_tier_weights_are_ordered() {
        let weights: Vec<f64> = ImportanceTier::all().iter().map(|t| t.weight()).collect();
        assert!(weights.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_critical_never_decays() {
        assert!(ImportanceTier::Critical.weekly_decay_factor().is_none());
        assert_eq!(ImportanceTier::Trivial.weekly_decay_factor(), Some(0.80));
    }

    #[test]
    fn test_matches_name_uses_aliases() {
        let mut entity = Entity::new("u1", "Marcus Lee", EntityType::Person);
        entity.aliases.push("Marc".to_string());
        assert!(entity.matches_name("marcus"));
        assert!(entity.matches_name("MARC"));
        assert!(!entity.matches_name("Sarah"));
        assert!(!entity.matches_name("  "));
    }

    #[test]
    fn test_temporal_checks() {
        let at = now();
        let mut entity = Entity::new("u1", "Trip", EntityType::Other);
        assert!(!entity.is_future_dated(at));
        assert!(!entity.is_expired(at));

        entity.effective_from = Some(at + Duration::days(2));
        entity.expires_at = Some(at - Duration::days(1));
        assert!(entity.is_future_dated(at));
        assert!(entity.is_expired(at));
    }

    #[test]
    fn test_entity_type_parse_falls_back() {
        assert_eq!(EntityType::parse("Company"), EntityType::Organization);
        assert_eq!(EntityType::parse("spaceship"), EntityType::Other);
    }
}
