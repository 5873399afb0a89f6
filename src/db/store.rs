//! Queryable store boundary.
//!
//! Every memory category is reached through typed query structs carrying
//! filters, an ordering and a mandatory row limit. Implementations must
//! apply the limit before returning; callers still truncate defensively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Behavior, BehaviorPredicate, BehaviorStatus, Entity, EntityType, Fact, FactStatus, NoteMeta,
    Pattern, PatternStatus, Predicate, Relationship, RelationshipType, SensitivityLevel,
};

/// Backing tables, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Entities,
    Facts,
    Relationships,
    Behaviors,
    Patterns,
    Notes,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::Facts => "facts",
            Table::Relationships => "relationships",
            Table::Behaviors => "behaviors",
            Table::Patterns => "patterns",
            Table::Notes => "notes",
        }
    }
}

// ============================================================================
// Entity queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOrder {
    /// importance_score desc, then mention_count desc
    Importance,
    /// mention_count desc, then importance_score desc
    MentionCount,
    /// updated_at desc
    RecentlyUpdated,
    /// id asc, for cursor paging
    Id,
}

/// Query over current (active, non-superseded) entity rows.
#[derive(Debug, Clone)]
pub struct EntityQuery {
    pub user_id: String,
    /// Any-of, case-insensitive substring match against name or aliases
    pub name_contains: Vec<String>,
    pub ids: Option<Vec<String>>,
    pub entity_types: Option<Vec<EntityType>>,
    pub include_historical: bool,
    pub source_note_id: Option<String>,
    /// Skip rows whose `effective_from` lies after this instant
    pub visible_at: Option<DateTime<Utc>>,
    /// With `visible_at`, also skip rows whose `expires_at` has passed
    pub exclude_expired: bool,
    pub max_sensitivity: Option<SensitivityLevel>,
    /// Only ids strictly greater than this one
    pub after_id: Option<String>,
    pub order: EntityOrder,
    pub limit: usize,
}

impl EntityQuery {
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            name_contains: Vec::new(),
            ids: None,
            entity_types: None,
            include_historical: false,
            source_note_id: None,
            visible_at: None,
            exclude_expired: false,
            max_sensitivity: None,
            after_id: None,
            order: EntityOrder::Importance,
            limit,
        }
    }

    pub fn named(mut self, names: &[String]) -> Self {
        self.name_contains = names.to_vec();
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn of_types(mut self, types: &[EntityType]) -> Self {
        self.entity_types = Some(types.to_vec());
        self
    }

    pub fn including_historical(mut self) -> Self {
        self.include_historical = true;
        self
    }

    pub fn from_note(mut self, note_id: impl Into<String>) -> Self {
        self.source_note_id = Some(note_id.into());
        self
    }

    pub fn order_by(mut self, order: EntityOrder) -> Self {
        self.order = order;
        self
    }

    /// Hide rows not yet in effect at `at` and, when `exclude_expired`,
    /// rows expired by then. Applied before the limit.
    pub fn visible_at(mut self, at: DateTime<Utc>, exclude_expired: bool) -> Self {
        self.visible_at = Some(at);
        self.exclude_expired = exclude_expired;
        self
    }

    pub fn max_sensitivity(mut self, level: SensitivityLevel) -> Self {
        self.max_sensitivity = Some(level);
        self
    }

    /// Next page after `id` in id order.
    pub fn after(mut self, id: Option<String>) -> Self {
        self.after_id = id;
        self.order = EntityOrder::Id;
        self
    }

    /// Whether `entity` passes every filter of this query.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.user_id == self.user_id
            && entity.is_current()
            && (self.include_historical || !entity.is_historical)
            && (self.name_contains.is_empty()
                || self.name_contains.iter().any(|n| entity.matches_name(n)))
            && self
                .ids
                .as_ref()
                .map(|ids| ids.contains(&entity.id))
                .unwrap_or(true)
            && self
                .entity_types
                .as_ref()
                .map(|types| types.contains(&entity.entity_type))
                .unwrap_or(true)
            && self
                .source_note_id
                .as_ref()
                .map(|n| entity.source_note_id.as_ref() == Some(n))
                .unwrap_or(true)
            && self
                .visible_at
                .map(|at| {
                    !entity.is_future_dated(at) && !(self.exclude_expired && entity.is_expired(at))
                })
                .unwrap_or(true)
            && self
                .max_sensitivity
                .map(|max| entity.sensitivity <= max)
                .unwrap_or(true)
            && self
                .after_id
                .as_ref()
                .map(|after| entity.id.as_str() > after.as_str())
                .unwrap_or(true)
    }
}

// ============================================================================
// Fact queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactOrder {
    /// confidence desc, then created_at desc
    Confidence,
    /// created_at desc
    Recent,
}

#[derive(Debug, Clone)]
pub struct FactQuery {
    pub user_id: String,
    pub entity_ids: Option<Vec<String>>,
    pub predicates: Option<Vec<Predicate>>,
    /// Case-insensitive exact match on the object text
    pub object_equals: Option<String>,
    /// `None` matches every status
    pub status: Option<FactStatus>,
    pub current_only: bool,
    pub min_confidence: Option<f64>,
    pub source_note_id: Option<String>,
    pub order: FactOrder,
    pub limit: usize,
}

impl FactQuery {
    /// Active, current facts ordered by confidence.
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            entity_ids: None,
            predicates: None,
            object_equals: None,
            status: Some(FactStatus::Active),
            current_only: true,
            min_confidence: None,
            source_note_id: None,
            order: FactOrder::Confidence,
            limit,
        }
    }

    pub fn for_entities(mut self, ids: Vec<String>) -> Self {
        self.entity_ids = Some(ids);
        self
    }

    pub fn with_predicates(mut self, predicates: Vec<Predicate>) -> Self {
        self.predicates = Some(predicates);
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object_equals = Some(object.into());
        self
    }

    pub fn with_status(mut self, status: Option<FactStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn all_versions(mut self) -> Self {
        self.current_only = false;
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn from_note(mut self, note_id: impl Into<String>) -> Self {
        self.source_note_id = Some(note_id.into());
        self
    }

    pub fn order_by(mut self, order: FactOrder) -> Self {
        self.order = order;
        self
    }

    pub fn matches(&self, fact: &Fact) -> bool {
        fact.user_id == self.user_id
            && (!self.current_only || fact.is_current)
            && self.status.map(|s| fact.status == s).unwrap_or(true)
            && self
                .entity_ids
                .as_ref()
                .map(|ids| ids.contains(&fact.entity_id))
                .unwrap_or(true)
            && self
                .predicates
                .as_ref()
                .map(|ps| ps.contains(&fact.predicate))
                .unwrap_or(true)
            && self
                .object_equals
                .as_ref()
                .map(|o| fact.same_object(o))
                .unwrap_or(true)
            && self
                .min_confidence
                .map(|c| fact.confidence >= c)
                .unwrap_or(true)
            && self
                .source_note_id
                .as_ref()
                .map(|n| fact.source_note_id.as_ref() == Some(n))
                .unwrap_or(true)
    }
}

/// Atomic slot write: optionally retire one row, then insert another.
///
/// For single-valued predicates the store verifies that the slot's
/// current row is exactly `retire` (or that the slot is empty when
/// `retire` is `None`) and fails with [`crate::Error::Conflict`]
/// otherwise. A `retire` row that is no longer current also conflicts.
/// Inserting a non-current (historical) row never touches the slot.
#[derive(Debug, Clone)]
pub struct FactWrite {
    pub retire: Option<Fact>,
    pub insert: Fact,
}

/// Whether `stored` is still the revision `expected` was read from.
///
/// Retiring, deleting and in-place edits each change at least one of
/// these fields.
pub fn same_fact_revision(stored: &Fact, expected: &Fact) -> bool {
    stored.is_current == expected.is_current
        && stored.status == expected.status
        && stored.object_text == expected.object_text
        && stored.version == expected.version
}

// ============================================================================
// Other categories
// ============================================================================

/// Query over relationship edges, ordered by strength desc.
#[derive(Debug, Clone)]
pub struct RelationshipQuery {
    pub user_id: String,
    /// Match edges touching this entity at either endpoint
    pub entity_id: Option<String>,
    pub active_only: bool,
    pub limit: usize,
}

impl RelationshipQuery {
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            entity_id: None,
            active_only: true,
            limit,
        }
    }

    pub fn touching(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        rel.user_id == self.user_id
            && (!self.active_only || rel.is_active)
            && self
                .entity_id
                .as_deref()
                .map(|id| rel.other_endpoint(id).is_some())
                .unwrap_or(true)
    }
}

/// Query over behaviors, ordered by confidence desc then reinforcement
/// count desc.
#[derive(Debug, Clone)]
pub struct BehaviorQuery {
    pub user_id: String,
    pub entity_ids: Option<Vec<String>>,
    pub status: Option<BehaviorStatus>,
    pub source_note_id: Option<String>,
    pub limit: usize,
}

impl BehaviorQuery {
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            entity_ids: None,
            status: Some(BehaviorStatus::Active),
            source_note_id: None,
            limit,
        }
    }

    pub fn for_entities(mut self, ids: Vec<String>) -> Self {
        self.entity_ids = Some(ids);
        self
    }

    pub fn with_status(mut self, status: Option<BehaviorStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn from_note(mut self, note_id: impl Into<String>) -> Self {
        self.source_note_id = Some(note_id.into());
        self
    }

    pub fn matches(&self, behavior: &Behavior) -> bool {
        behavior.user_id == self.user_id
            && self.status.map(|s| behavior.status == s).unwrap_or(true)
            && self
                .entity_ids
                .as_ref()
                .map(|ids| ids.contains(&behavior.entity_id))
                .unwrap_or(true)
            && self
                .source_note_id
                .as_ref()
                .map(|n| behavior.source_note_id.as_ref() == Some(n))
                .unwrap_or(true)
    }
}

/// Query over patterns, ordered by confidence desc. Rejected patterns are
/// excluded unless `statuses` names them.
#[derive(Debug, Clone)]
pub struct PatternQuery {
    pub user_id: String,
    pub min_confidence: Option<f64>,
    pub statuses: Option<Vec<PatternStatus>>,
    pub limit: usize,
}

impl PatternQuery {
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            min_confidence: None,
            statuses: None,
            limit,
        }
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<PatternStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, pattern: &Pattern) -> bool {
        pattern.user_id == self.user_id
            && match &self.statuses {
                Some(statuses) => statuses.contains(&pattern.status),
                None => pattern.is_retrievable(),
            }
            && self
                .min_confidence
                .map(|c| pattern.confidence >= c)
                .unwrap_or(true)
    }
}

/// Query over note metadata, ordered by updated_at desc.
///
/// Matching is restricted to title and category: note bodies are
/// encrypted client-side and never stored here.
#[derive(Debug, Clone)]
pub struct NoteQuery {
    pub user_id: String,
    /// Any-of, case-insensitive substring match on title or category
    pub matching: Vec<String>,
    pub include_deleted: bool,
    pub limit: usize,
}

impl NoteQuery {
    pub fn new(user_id: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            matching: Vec::new(),
            include_deleted: false,
            limit,
        }
    }

    pub fn matching(mut self, terms: &[String]) -> Self {
        self.matching = terms.to_vec();
        self
    }

    pub fn matches(&self, note: &NoteMeta) -> bool {
        note.user_id == self.user_id
            && (self.include_deleted || !note.is_deleted)
            && (self.matching.is_empty() || self.matching.iter().any(|t| note.matches(t)))
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Storage boundary consumed by every service.
///
/// All reads are scoped to one user. Implementations must make
/// [`MemoryStore::write_fact`] and [`MemoryStore::supersede_entity`]
/// atomic.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // Entities
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>>;
    async fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>>;
    /// Current row for a normalized name, if any.
    async fn find_current_entity(&self, user_id: &str, normalized_name: &str)
        -> Result<Option<Entity>>;
    /// Fails with `AlreadyExists` when a current row holds the same
    /// normalized name.
    async fn insert_entity(&self, entity: &Entity) -> Result<()>;
    async fn update_entity(&self, entity: &Entity) -> Result<()>;
    /// Persist the retired row and insert its replacement in one step.
    async fn supersede_entity(&self, retired: &Entity, replacement: &Entity) -> Result<()>;
    async fn record_entity_access(
        &self,
        user_id: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<()>;

    // Facts
    async fn query_facts(&self, query: &FactQuery) -> Result<Vec<Fact>>;
    async fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<Fact>>;
    async fn write_fact(&self, write: &FactWrite) -> Result<()>;
    /// In-place edit of a row read as `expected`. Fails with `Conflict`
    /// when the stored row no longer matches it (see
    /// [`same_fact_revision`]), and with `NotFound` when it is gone.
    async fn update_fact(&self, expected: &Fact, updated: &Fact) -> Result<()>;
    /// Permanent removal.
    async fn delete_fact(&self, user_id: &str, id: &str) -> Result<()>;

    // Relationships
    async fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>>;
    async fn find_relationship(
        &self,
        user_id: &str,
        source_entity_id: &str,
        target_entity_id: &str,
        relationship_type: &RelationshipType,
    ) -> Result<Option<Relationship>>;
    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()>;

    // Behaviors
    async fn query_behaviors(&self, query: &BehaviorQuery) -> Result<Vec<Behavior>>;
    async fn find_behavior(
        &self,
        user_id: &str,
        predicate: &BehaviorPredicate,
        entity_id: &str,
    ) -> Result<Option<Behavior>>;
    async fn upsert_behavior(&self, behavior: &Behavior) -> Result<()>;

    // Patterns
    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>>;
    async fn get_pattern(&self, user_id: &str, id: &str) -> Result<Option<Pattern>>;
    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()>;

    // Notes
    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<NoteMeta>>;
    async fn get_note(&self, user_id: &str, id: &str) -> Result<Option<NoteMeta>>;
    async fn upsert_note(&self, note: &NoteMeta) -> Result<()>;
}
