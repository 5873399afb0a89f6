//! Structured output of the extraction collaborator.
//!
//! An extractor turns a note or message into candidate records. Nothing
//! here parses free text; the lifecycle manager consumes these candidates
//! as they are.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    BehaviorPredicate, EntityType, ImportanceTier, MemoryType, PatternCategory, Predicate,
    RelationshipType, SensitivityLevel,
};

/// Temporal and sensitivity flags attached to a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalMarkers {
    /// Held in the past, no longer true
    pub is_historical: bool,
    /// Not true yet; future-dated when after now
    pub effective_from: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form recurrence, e.g. "weekly on mondays"
    pub recurrence_pattern: Option<String>,
    pub sensitivity: SensitivityLevel,
}

impl TemporalMarkers {
    pub fn is_recurring(&self) -> bool {
        self.recurrence_pattern
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_future_dated(&self, at: DateTime<Utc>) -> bool {
        self.effective_from.map(|from| from > at).unwrap_or(false)
    }
}

fn default_confidence() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub name: String,
    #[serde(default)]
    pub entity_type: EntityType,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub importance: ImportanceTier,
    #[serde(default)]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub sentiment: Option<f64>,
    #[serde(default)]
    pub temporal: TemporalMarkers,
}

impl EntityCandidate {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
            aliases: Vec::new(),
            relationship: None,
            summary: None,
            importance: ImportanceTier::default(),
            memory_type: MemoryType::default(),
            sentiment: None,
            temporal: TemporalMarkers::default(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_importance(mut self, importance: ImportanceTier) -> Self {
        self.importance = importance;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCandidate {
    /// Subject entity name
    pub subject: String,
    pub predicate: Predicate,
    pub object: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// The statement retracts the object ("no longer works at Acme")
    #[serde(default)]
    pub negated: bool,
    /// The statement corrects a mistaken value rather than reporting a change
    #[serde(default)]
    pub is_correction: bool,
    #[serde(default)]
    pub temporal: TemporalMarkers,
}

impl FactCandidate {
    pub fn new(subject: impl Into<String>, predicate: Predicate, object: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            predicate,
            object: object.into(),
            confidence: default_confidence(),
            negated: false,
            is_correction: false,
            temporal: TemporalMarkers::default(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn historical(mut self) -> Self {
        self.temporal.is_historical = true;
        self
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn correction(mut self) -> Self {
        self.is_correction = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorCandidate {
    pub predicate: BehaviorPredicate,
    /// Entity name the behavior is about
    pub entity: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub category: PatternCategory,
    pub description: String,
    pub short_description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Everything extracted from one note or message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionResult {
    pub entities: Vec<EntityCandidate>,
    pub facts: Vec<FactCandidate>,
    pub relationships: Vec<RelationshipCandidate>,
    pub behaviors: Vec<BehaviorCandidate>,
    pub patterns: Vec<PatternCandidate>,
}

impl ExtractionResult {
    /// Parse an extractor's JSON reply.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.facts.is_empty()
            && self.relationships.is_empty()
            && self.behaviors.is_empty()
            && self.patterns.is_empty()
    }

    pub fn candidate_count(&self) -> usize {
        self.entities.len()
            + self.facts.len()
            + self.relationships.len()
            + self.behaviors.len()
            + self.patterns.len()
    }
}

/// Extraction collaborator, usually backed by a language model.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, user_id: &str, text: &str) -> Result<ExtractionResult>;
}
