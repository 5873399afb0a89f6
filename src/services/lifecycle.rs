//! Memory lifecycle management.
//!
//! Decides how extracted candidates change stored memory (ADD, UPDATE,
//! DELETE or NOOP) and runs the batch sweeps an external scheduler calls:
//! decay, expiry and cleanup. Fact slot writes are compare-and-swap, so two
//! writers racing on a single-valued slot can never both leave a current
//! row; the loser re-reads and supersedes the winner.
//!
//! Every operation produces an [`OperationRecord`], returned to the caller
//! and emitted on the audit target.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::db::{BehaviorQuery, EntityQuery, FactQuery, FactWrite, MemoryStore, PatternQuery};
use crate::error::{Error, Result};
use crate::models::{
    endpoints, new_id, normalize_name, Behavior, BehaviorStatus, Entity, EntityStatus, EntityType,
    Fact, FactStatus, Pattern, PatternStatus, Predicate, Relationship,
};
use crate::telemetry::AUDIT_TARGET;

use super::decay::{apply_decay, should_archive};
use super::embeddings::EmbeddingProvider;
use super::extraction::{
    BehaviorCandidate, EntityCandidate, ExtractionResult, FactCandidate, PatternCandidate,
    RelationshipCandidate,
};

/// Rows examined per sweep call.
const SWEEP_BATCH: usize = 1000;
/// Rows touched per note cascade.
const CASCADE_LIMIT: usize = 1000;
/// Current facts considered per (entity, predicate) decision.
const SLOT_HISTORY_LIMIT: usize = 50;

// ============================================================================
// Operations
// ============================================================================

/// How an UPDATE changes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Correct a value in place
    Replace,
    /// Merge new detail into the existing row in place
    Append,
    /// Retire the current row and insert the next version
    Supersede,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::Replace => "replace",
            UpdateStrategy::Append => "append",
            UpdateStrategy::Supersede => "supersede",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Add,
    Update { strategy: UpdateStrategy },
    Delete { hard: bool },
    Noop,
}

impl MemoryOperation {
    pub fn update(strategy: UpdateStrategy) -> Self {
        MemoryOperation::Update { strategy }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryOperation::Add => "ADD",
            MemoryOperation::Update { .. } => "UPDATE",
            MemoryOperation::Delete { .. } => "DELETE",
            MemoryOperation::Noop => "NOOP",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, MemoryOperation::Noop)
    }
}

impl std::fmt::Display for MemoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryOperation::Update { strategy } => write!(f, "UPDATE({})", strategy.as_str()),
            MemoryOperation::Delete { hard: true } => write!(f, "DELETE(hard)"),
            MemoryOperation::Delete { hard: false } => write!(f, "DELETE(soft)"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Kind of record an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Fact,
    Relationship,
    Behavior,
    Pattern,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entity => "entity",
            RecordKind::Fact => "fact",
            RecordKind::Relationship => "relationship",
            RecordKind::Behavior => "behavior",
            RecordKind::Pattern => "pattern",
        }
    }
}

/// Audit entry for one lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: MemoryOperation,
    pub kind: RecordKind,
    /// Row written or deleted
    pub record_id: Option<String>,
    /// Row retired by a supersede
    pub previous_id: Option<String>,
    pub label: String,
    pub reasoning: String,
    pub at: DateTime<Utc>,
}

impl OperationRecord {
    fn new(
        operation: MemoryOperation,
        kind: RecordKind,
        label: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            record_id: None,
            previous_id: None,
            label: label.into(),
            reasoning: reasoning.into(),
            at: Utc::now(),
        }
    }

    fn noop(kind: RecordKind, label: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self::new(MemoryOperation::Noop, kind, label, reasoning)
    }

    fn on(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    fn replacing(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    /// Emit on the audit target. Labels stay out of the log.
    fn emit(self, user_id: &str) -> Self {
        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            operation = %self.operation,
            kind = self.kind.as_str(),
            record_id = ?self.record_id,
            previous_id = ?self.previous_id,
            reasoning = %self.reasoning,
            "Lifecycle operation"
        );
        self
    }
}

/// Decision for one fact candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleDecision {
    pub operation: MemoryOperation,
    /// Existing fact the operation applies to
    pub target_id: Option<String>,
    pub reasoning: String,
}

impl LifecycleDecision {
    pub fn new(operation: MemoryOperation, reasoning: impl Into<String>) -> Self {
        Self {
            operation,
            target_id: None,
            reasoning: reasoning.into(),
        }
    }

    pub fn noop(reasoning: impl Into<String>) -> Self {
        Self::new(MemoryOperation::Noop, reasoning)
    }

    pub fn targeting(mut self, fact_id: impl Into<String>) -> Self {
        self.target_id = Some(fact_id.into());
        self
    }
}

/// Decides what a fact candidate does to the current facts of its
/// (subject, predicate) slot. May be backed by a classification model.
///
/// Returning an error or `None` makes the manager fall back to NOOP.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(
        &self,
        candidate: &FactCandidate,
        existing: &[Fact],
    ) -> Result<Option<LifecycleDecision>>;
}

/// Deterministic decision rules.
#[derive(Debug, Clone, Copy)]
pub struct RuleBasedDecider {
    min_confidence: f64,
}

impl RuleBasedDecider {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    pub fn decide_now(&self, candidate: &FactCandidate, existing: &[Fact]) -> LifecycleDecision {
        let object = normalize_name(&candidate.object);
        if object.is_empty() {
            return LifecycleDecision::noop("empty object");
        }
        if candidate.confidence < self.min_confidence {
            return LifecycleDecision::noop("below confidence threshold");
        }

        let same = existing.iter().find(|f| f.same_object(&candidate.object));

        if candidate.negated {
            return match same {
                Some(fact) => LifecycleDecision::new(
                    MemoryOperation::Delete { hard: false },
                    "statement retracted",
                )
                .targeting(&fact.id),
                None => LifecycleDecision::noop("nothing to retract"),
            };
        }
        if candidate.temporal.is_historical {
            return LifecycleDecision::new(MemoryOperation::Add, "historical record");
        }
        if same.is_some() {
            return LifecycleDecision::noop("equivalent fact exists");
        }

        if candidate.predicate.is_single_valued() {
            if let Some(current) = existing.first() {
                let (strategy, reasoning) = if candidate.is_correction {
                    (UpdateStrategy::Replace, "corrects current value")
                } else if object.contains(&normalize_name(&current.object_text)) {
                    (UpdateStrategy::Append, "adds detail to current value")
                } else {
                    (UpdateStrategy::Supersede, "contradicts current value")
                };
                return LifecycleDecision::new(MemoryOperation::update(strategy), reasoning)
                    .targeting(&current.id);
            }
        }

        LifecycleDecision::new(MemoryOperation::Add, "new information")
    }
}

#[async_trait]
impl DecisionProvider for RuleBasedDecider {
    async fn decide(
        &self,
        candidate: &FactCandidate,
        existing: &[Fact],
    ) -> Result<Option<LifecycleDecision>> {
        Ok(Some(self.decide_now(candidate, existing)))
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of a batch sweep or cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub changed: usize,
    pub failed: usize,
}

/// Records sourced from one note, flipped together on delete and restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadePlan {
    pub note_id: String,
    pub fact_ids: Vec<String>,
    pub behavior_ids: Vec<String>,
    /// Entities only this note mentioned
    pub entity_ids: Vec<String>,
}

impl CascadePlan {
    pub fn is_empty(&self) -> bool {
        self.fact_ids.is_empty() && self.behavior_ids.is_empty() && self.entity_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fact_ids.len() + self.behavior_ids.len() + self.entity_ids.len()
    }
}

/// Operation log for one extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub operations: Vec<OperationRecord>,
    /// Candidates whose store write failed
    pub failed: usize,
}

impl IngestReport {
    pub fn count(&self, operation: &str) -> usize {
        self.operations
            .iter()
            .filter(|r| r.operation.as_str() == operation)
            .count()
    }

    fn collect(&mut self, category: &'static str, user_id: &str, outcome: Result<OperationRecord>) {
        match outcome {
            Ok(record) => self.operations.push(record),
            Err(e) => {
                warn!(
                    category,
                    user_id = %user_id,
                    error_code = e.error_code(),
                    "Failed to ingest candidate"
                );
                self.failed += 1;
            }
        }
    }
}

/// Merge a more detailed value into an existing one.
fn merge_detail(old: &str, new: &str) -> String {
    let (old_key, new_key) = (normalize_name(old), normalize_name(new));
    if new_key.contains(&old_key) {
        new.trim().to_string()
    } else if old_key.contains(&new_key) {
        old.to_string()
    } else {
        format!("{}; {}", old.trim_end(), new.trim())
    }
}

fn merge_aliases(entity: &mut Entity, aliases: &[String]) {
    let own = entity.normalized_name();
    for alias in aliases {
        let key = normalize_name(alias);
        if key.is_empty() || key == own {
            continue;
        }
        if !entity.aliases.iter().any(|a| normalize_name(a) == key) {
            entity.aliases.push(alias.trim().to_string());
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn MemoryStore>,
    decider: Arc<dyn DecisionProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn MemoryStore>, config: LifecycleConfig) -> Self {
        Self {
            store,
            decider: Arc::new(RuleBasedDecider::new(config.min_fact_confidence)),
            embedder: None,
            config,
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn DecisionProvider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    // ------------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------------

    /// Route one fact candidate through the decision step and apply it.
    ///
    /// A failed or empty decision is a NOOP, never an error.
    pub async fn process_fact(
        &self,
        user_id: &str,
        candidate: &FactCandidate,
        source_note_id: Option<&str>,
    ) -> Result<OperationRecord> {
        let subject = self
            .resolve_subject(user_id, &candidate.subject, source_note_id)
            .await?;
        let existing = self
            .store
            .query_facts(
                &FactQuery::new(user_id, SLOT_HISTORY_LIMIT)
                    .for_entities(vec![subject.id.clone()])
                    .with_predicates(vec![candidate.predicate.clone()]),
            )
            .await?;

        let decision = match self.decider.decide(candidate, &existing).await {
            Ok(Some(decision)) => decision,
            Ok(None) => LifecycleDecision::noop("no decision returned"),
            Err(e) => {
                warn!(
                    target: AUDIT_TARGET,
                    user_id = %user_id,
                    error_code = e.error_code(),
                    "Lifecycle decision failed, defaulting to NOOP"
                );
                LifecycleDecision::noop("decision step failed")
            }
        };

        self.apply_fact_decision(user_id, &subject, candidate, decision, source_note_id)
            .await
    }

    async fn apply_fact_decision(
        &self,
        user_id: &str,
        subject: &Entity,
        candidate: &FactCandidate,
        decision: LifecycleDecision,
        source_note_id: Option<&str>,
    ) -> Result<OperationRecord> {
        let label = format!("{} {} {}", subject.name, candidate.predicate, candidate.object);

        match decision.operation {
            MemoryOperation::Noop => {
                Ok(OperationRecord::noop(RecordKind::Fact, label, decision.reasoning).emit(user_id))
            }
            MemoryOperation::Add
            | MemoryOperation::Update {
                strategy: UpdateStrategy::Supersede,
            } => {
                self.write_new_fact(user_id, subject, candidate, source_note_id, &decision.reasoning)
                    .await
            }
            MemoryOperation::Update { strategy } => {
                for _ in 0..self.config.max_write_attempts {
                    let target = match &decision.target_id {
                        Some(id) => self.store.get_fact(user_id, id).await?,
                        None => None,
                    };
                    let Some(read) = target.filter(|f| f.is_current) else {
                        // Target moved underneath us; the slot write sorts it out
                        return self
                            .write_new_fact(user_id, subject, candidate, source_note_id, &decision.reasoning)
                            .await;
                    };

                    let mut fact = read.clone();
                    fact.object_text = match strategy {
                        UpdateStrategy::Append => merge_detail(&fact.object_text, &candidate.object),
                        _ => candidate.object.trim().to_string(),
                    };
                    fact.object_entity_id = self.resolve_object_entity(user_id, &fact.object_text).await?;
                    fact.confidence = fact.confidence.max(candidate.confidence.clamp(0.0, 1.0));
                    fact.status = FactStatus::Active;
                    fact.updated_at = Utc::now();

                    match self.store.update_fact(&read, &fact).await {
                        Ok(()) => {
                            return Ok(OperationRecord::new(
                                MemoryOperation::update(strategy),
                                RecordKind::Fact,
                                label,
                                decision.reasoning,
                            )
                            .on(&fact.id)
                            .emit(user_id));
                        }
                        Err(Error::Conflict(_)) => {
                            debug!(user_id = %user_id, fact_id = %fact.id, "Fact changed during update, re-reading");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::Conflict(format!(
                    "Fact {} still contended after {} attempts",
                    decision.target_id.as_deref().unwrap_or_default(),
                    self.config.max_write_attempts
                )))
            }
            MemoryOperation::Delete { hard } => match &decision.target_id {
                Some(id) => self.delete_fact(user_id, id, hard).await,
                None => Ok(OperationRecord::noop(RecordKind::Fact, label, "delete without target")
                    .emit(user_id)),
            },
        }
    }

    /// Insert a fact, superseding the current row of a single-valued slot.
    ///
    /// Read-current, compare, retire and insert are applied as one
    /// compare-and-swap; on conflict the slot is re-read and the write
    /// retried up to `max_write_attempts` times.
    async fn write_new_fact(
        &self,
        user_id: &str,
        subject: &Entity,
        candidate: &FactCandidate,
        source_note_id: Option<&str>,
        reasoning: &str,
    ) -> Result<OperationRecord> {
        let label = format!("{} {} {}", subject.name, candidate.predicate, candidate.object);
        let object_entity_id = self.resolve_object_entity(user_id, &candidate.object).await?;

        for attempt in 1..=self.config.max_write_attempts {
            let now = Utc::now();
            let mut fact = Fact::new(
                user_id,
                &subject.id,
                candidate.predicate.clone(),
                candidate.object.trim(),
            )
            .with_confidence(candidate.confidence);
            fact.object_entity_id = object_entity_id.clone();
            fact.source_note_id = source_note_id.map(str::to_string);
            fact.valid_from = candidate.temporal.effective_from.or(fact.valid_from);
            fact.valid_to = candidate.temporal.expires_at;

            if candidate.temporal.is_historical {
                // Past state: kept for history, never occupies the slot
                fact.is_current = false;
                fact.valid_from = candidate.temporal.effective_from;
                let id = fact.id.clone();
                self.store
                    .write_fact(&FactWrite {
                        retire: None,
                        insert: fact,
                    })
                    .await?;
                return Ok(OperationRecord::new(MemoryOperation::Add, RecordKind::Fact, label, reasoning)
                    .on(id)
                    .emit(user_id));
            }

            let current = if candidate.predicate.is_single_valued() {
                self.current_in_slot(user_id, &subject.id, &candidate.predicate)
                    .await?
            } else {
                None
            };

            let (write, operation) = match current {
                Some(current) if current.is_live() && current.same_object(&candidate.object) => {
                    return Ok(OperationRecord::noop(
                        RecordKind::Fact,
                        label,
                        "equivalent fact already current",
                    )
                    .on(current.id)
                    .emit(user_id));
                }
                Some(mut current) => {
                    fact.follow(&current);
                    current.retire(&fact.id, now);
                    (
                        FactWrite {
                            retire: Some(current),
                            insert: fact,
                        },
                        MemoryOperation::update(UpdateStrategy::Supersede),
                    )
                }
                None => (
                    FactWrite {
                        retire: None,
                        insert: fact,
                    },
                    MemoryOperation::Add,
                ),
            };

            match self.store.write_fact(&write).await {
                Ok(()) => {
                    return Ok(OperationRecord::new(operation, RecordKind::Fact, label, reasoning)
                        .on(&write.insert.id)
                        .replacing(write.retire.map(|f| f.id))
                        .emit(user_id));
                }
                Err(Error::Conflict(_)) => {
                    debug!(
                        user_id = %user_id,
                        entity_id = %subject.id,
                        predicate = %candidate.predicate,
                        attempt,
                        "Fact slot moved, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "Fact slot {}/{} still contended after {} attempts",
            subject.id, candidate.predicate, self.config.max_write_attempts
        )))
    }

    /// Remove a fact: `hard` deletes the row permanently (explicit user
    /// request only), otherwise the row is flipped to inactive.
    pub async fn delete_fact(
        &self,
        user_id: &str,
        fact_id: &str,
        hard: bool,
    ) -> Result<OperationRecord> {
        let fact = self
            .store
            .get_fact(user_id, fact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Fact {}", fact_id)))?;
        let label = fact.label();

        if hard {
            self.store.delete_fact(user_id, fact_id).await?;
            return Ok(OperationRecord::new(
                MemoryOperation::Delete { hard: true },
                RecordKind::Fact,
                label,
                "permanent removal requested",
            )
            .on(fact_id)
            .emit(user_id));
        }

        let now = Utc::now();
        self.edit_fact(user_id, fact_id, |fact| {
            let mut fact = fact.clone();
            fact.status = FactStatus::Inactive;
            fact.invalidated_at = Some(now);
            fact.updated_at = now;
            Some(fact)
        })
        .await?;
        Ok(OperationRecord::new(
            MemoryOperation::Delete { hard: false },
            RecordKind::Fact,
            label,
            "archived",
        )
        .on(fact_id)
        .emit(user_id))
    }

    /// Read-modify-write of one fact row, re-read and retried when the row
    /// changes between the read and the write.
    ///
    /// `edit` returning `None` skips the row. Returns whether a write was
    /// applied.
    async fn edit_fact<F>(&self, user_id: &str, fact_id: &str, edit: F) -> Result<bool>
    where
        F: Fn(&Fact) -> Option<Fact>,
    {
        for _ in 0..self.config.max_write_attempts {
            let Some(read) = self.store.get_fact(user_id, fact_id).await? else {
                return Err(Error::NotFound(format!("Fact {}", fact_id)));
            };
            let Some(updated) = edit(&read) else {
                return Ok(false);
            };
            match self.store.update_fact(&read, &updated).await {
                Ok(()) => return Ok(true),
                Err(Error::Conflict(_)) => {
                    debug!(user_id = %user_id, fact_id = %fact_id, "Fact changed during edit, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "Fact {} still contended after {} attempts",
            fact_id, self.config.max_write_attempts
        )))
    }

    async fn current_in_slot(
        &self,
        user_id: &str,
        entity_id: &str,
        predicate: &Predicate,
    ) -> Result<Option<Fact>> {
        let rows = self
            .store
            .query_facts(
                &FactQuery::new(user_id, 1)
                    .for_entities(vec![entity_id.to_string()])
                    .with_predicates(vec![predicate.clone()])
                    .with_status(None),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn resolve_object_entity(&self, user_id: &str, object: &str) -> Result<Option<String>> {
        let name = normalize_name(object);
        if name.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .find_current_entity(user_id, &name)
            .await?
            .map(|e| e.id))
    }

    async fn resolve_subject(
        &self,
        user_id: &str,
        subject: &str,
        source_note_id: Option<&str>,
    ) -> Result<Entity> {
        if let Some(entity) = self
            .store
            .find_current_entity(user_id, &normalize_name(subject))
            .await?
        {
            return Ok(entity);
        }
        let candidate = EntityCandidate::new(subject, EntityType::Other);
        let (entity, _) = self.upsert_entity(user_id, &candidate, source_note_id).await?;
        Ok(entity)
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    /// Merge `candidate` into the current row for its name, or insert it.
    pub async fn upsert_entity(
        &self,
        user_id: &str,
        candidate: &EntityCandidate,
        source_note_id: Option<&str>,
    ) -> Result<(Entity, OperationRecord)> {
        let name = normalize_name(&candidate.name);
        if name.is_empty() {
            return Err(Error::Validation("Entity name is empty".to_string()));
        }

        // A concurrent insert of the same name turns into a merge on retry
        for _ in 0..2 {
            if let Some(mut existing) = self.store.find_current_entity(user_id, &name).await? {
                let summary_changed = self.merge_entity(&mut existing, candidate);
                if summary_changed {
                    self.embed_entity(&mut existing).await;
                }
                self.store.update_entity(&existing).await?;
                let record = OperationRecord::new(
                    MemoryOperation::update(UpdateStrategy::Append),
                    RecordKind::Entity,
                    existing.label(),
                    "mentioned again",
                )
                .on(&existing.id)
                .emit(user_id);
                return Ok((existing, record));
            }

            let mut entity = self.build_entity(user_id, candidate, source_note_id);
            self.embed_entity(&mut entity).await;
            match self.store.insert_entity(&entity).await {
                Ok(()) => {
                    let record = OperationRecord::new(
                        MemoryOperation::Add,
                        RecordKind::Entity,
                        entity.label(),
                        "new entity",
                    )
                    .on(&entity.id)
                    .emit(user_id);
                    return Ok((entity, record));
                }
                Err(Error::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!("Entity {} kept moving", candidate.name)))
    }

    /// Retire the current row of `entity_id` and insert the next version
    /// carrying `update`.
    pub async fn supersede_entity(
        &self,
        user_id: &str,
        entity_id: &str,
        update: &EntityCandidate,
    ) -> Result<(Entity, OperationRecord)> {
        let current = self
            .store
            .get_entity(user_id, entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Entity {}", entity_id)))?;
        if !current.is_current() {
            return Err(Error::Conflict(format!("Entity {} is not current", entity_id)));
        }

        let now = Utc::now();
        let mut replacement = current.clone();
        replacement.id = new_id();
        replacement.version = current.version + 1;
        replacement.previous_version_id = Some(current.id.clone());
        replacement.superseded_by = None;
        replacement.name = update.name.trim().to_string();
        if update.entity_type != EntityType::Other {
            replacement.entity_type = update.entity_type;
        }
        if update.summary.is_some() {
            replacement.summary = update.summary.clone();
        }
        if update.relationship.is_some() {
            replacement.relationship = update.relationship.clone();
        }
        replacement.importance = update.importance;
        replacement.importance_score = update.importance.weight();
        replacement.is_historical = update.temporal.is_historical;
        replacement.effective_from = update.temporal.effective_from;
        replacement.expires_at = update.temporal.expires_at;
        merge_aliases(&mut replacement, &update.aliases);
        merge_aliases(&mut replacement, std::slice::from_ref(&current.name));
        replacement.created_at = now;
        replacement.updated_at = now;
        self.embed_entity(&mut replacement).await;

        let mut retired = current;
        retired.status = EntityStatus::Superseded;
        retired.superseded_by = Some(replacement.id.clone());
        retired.updated_at = now;

        self.store.supersede_entity(&retired, &replacement).await?;

        let record = OperationRecord::new(
            MemoryOperation::update(UpdateStrategy::Supersede),
            RecordKind::Entity,
            replacement.label(),
            "entity changed",
        )
        .on(&replacement.id)
        .replacing(Some(retired.id))
        .emit(user_id);
        Ok((replacement, record))
    }

    fn build_entity(
        &self,
        user_id: &str,
        candidate: &EntityCandidate,
        source_note_id: Option<&str>,
    ) -> Entity {
        let mut entity = Entity::new(user_id, candidate.name.trim(), candidate.entity_type)
            .with_importance(candidate.importance)
            .with_memory_type(candidate.memory_type);
        merge_aliases(&mut entity, &candidate.aliases);
        entity.relationship = candidate.relationship.clone();
        entity.summary = candidate.summary.clone();
        entity.sentiment_average = candidate.sentiment.unwrap_or(0.0).clamp(-1.0, 1.0);
        entity.is_historical = candidate.temporal.is_historical;
        entity.effective_from = candidate.temporal.effective_from;
        entity.expires_at = candidate.temporal.expires_at;
        entity.recurrence_pattern = candidate.temporal.recurrence_pattern.clone();
        entity.sensitivity = candidate.temporal.sensitivity;
        entity.source_note_id = source_note_id.map(str::to_string);
        entity
    }

    /// Fold a repeated mention into `entity`. Returns whether the summary
    /// changed.
    fn merge_entity(&self, entity: &mut Entity, candidate: &EntityCandidate) -> bool {
        entity.mention_count += 1;
        merge_aliases(entity, &candidate.aliases);

        if let Some(sentiment) = candidate.sentiment {
            let n = entity.mention_count as f64;
            entity.sentiment_average =
                ((entity.sentiment_average * (n - 1.0) + sentiment) / n).clamp(-1.0, 1.0);
        }
        if entity.relationship.is_none() {
            entity.relationship = candidate.relationship.clone();
        }
        if entity.entity_type == EntityType::Other {
            entity.entity_type = candidate.entity_type;
        }
        if candidate.importance > entity.importance {
            entity.importance = candidate.importance;
            entity.importance_score = entity.importance_score.max(candidate.importance.weight());
        }

        let mut summary_changed = false;
        if let Some(new) = candidate.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            entity.summary = Some(match entity.summary.take() {
                Some(old) if old.to_lowercase().contains(&new.to_lowercase()) => old,
                Some(old) => {
                    summary_changed = true;
                    format!("{} {}", old.trim_end(), new)
                }
                None => {
                    summary_changed = true;
                    new.to_string()
                }
            });
        }

        entity.updated_at = Utc::now();
        summary_changed
    }

    async fn embed_entity(&self, entity: &mut Entity) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        let text = match &entity.summary {
            Some(summary) => format!("{} {}", entity.name, summary),
            None => entity.name.clone(),
        };
        match embedder.embed(&text).await {
            Ok(vector) => entity.embedding = Some(vector),
            Err(e) => {
                warn!(entity_id = %entity.id, error_code = e.error_code(), "Failed to embed entity");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Behaviors and relationships
    // ------------------------------------------------------------------------

    /// Create a behavior or reinforce the existing one for the same
    /// (predicate, entity).
    pub async fn record_behavior(
        &self,
        user_id: &str,
        candidate: &BehaviorCandidate,
        source_note_id: Option<&str>,
    ) -> Result<OperationRecord> {
        let label = format!("{} {}", candidate.predicate.phrase(), candidate.entity);
        let Some(entity) = self
            .store
            .find_current_entity(user_id, &normalize_name(&candidate.entity))
            .await?
        else {
            return Ok(OperationRecord::noop(RecordKind::Behavior, label, "unknown entity").emit(user_id));
        };
        if candidate.confidence < self.config.min_fact_confidence {
            return Ok(
                OperationRecord::noop(RecordKind::Behavior, label, "below confidence threshold")
                    .emit(user_id),
            );
        }

        let now = Utc::now();
        match self
            .store
            .find_behavior(user_id, &candidate.predicate, &entity.id)
            .await?
        {
            Some(mut behavior) => {
                behavior.reinforce(candidate.confidence, candidate.evidence.clone(), now);
                if behavior.topic.is_none() {
                    behavior.topic = candidate.topic.clone();
                }
                self.store.upsert_behavior(&behavior).await?;
                Ok(OperationRecord::new(
                    MemoryOperation::update(UpdateStrategy::Append),
                    RecordKind::Behavior,
                    behavior.label(),
                    "reinforced",
                )
                .on(behavior.id)
                .emit(user_id))
            }
            None => {
                let mut behavior = Behavior::new(
                    user_id,
                    candidate.predicate.clone(),
                    &entity.id,
                    &entity.name,
                    candidate.confidence,
                );
                behavior.topic = candidate.topic.clone();
                behavior.sentiment = candidate.sentiment.clamp(-1.0, 1.0);
                behavior.evidence = candidate.evidence.clone();
                behavior.source_note_id = source_note_id.map(str::to_string);
                self.store.upsert_behavior(&behavior).await?;
                Ok(OperationRecord::new(
                    MemoryOperation::Add,
                    RecordKind::Behavior,
                    behavior.label(),
                    "first detection",
                )
                .on(behavior.id)
                .emit(user_id))
            }
        }
    }

    /// Create an edge or reconfirm the existing one.
    pub async fn reinforce_relationship(
        &self,
        user_id: &str,
        candidate: &RelationshipCandidate,
    ) -> Result<OperationRecord> {
        let label = format!(
            "{} {} {}",
            candidate.source, candidate.relationship_type, candidate.target
        );
        let source = self
            .store
            .find_current_entity(user_id, &normalize_name(&candidate.source))
            .await?;
        let target = self
            .store
            .find_current_entity(user_id, &normalize_name(&candidate.target))
            .await?;
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(OperationRecord::noop(RecordKind::Relationship, label, "unknown endpoint")
                .emit(user_id));
        };
        if source.id == target.id {
            return Ok(OperationRecord::noop(RecordKind::Relationship, label, "self edge").emit(user_id));
        }

        let now = Utc::now();
        let (a, b) = endpoints(&candidate.relationship_type, &source.id, &target.id);
        match self
            .store
            .find_relationship(user_id, &a, &b, &candidate.relationship_type)
            .await?
        {
            Some(mut edge) => {
                let lookback = Duration::days(self.config.relationship_lookback_days);
                let strengthened = edge.reinforce(candidate.confidence, now, lookback);
                self.store.upsert_relationship(&edge).await?;
                let reasoning = if strengthened {
                    "reconfirmed within lookback"
                } else {
                    "reconfirmed"
                };
                Ok(OperationRecord::new(
                    MemoryOperation::update(UpdateStrategy::Append),
                    RecordKind::Relationship,
                    label,
                    reasoning,
                )
                .on(edge.id)
                .emit(user_id))
            }
            None => {
                let edge = Relationship::new(
                    user_id,
                    &source.id,
                    &target.id,
                    candidate.relationship_type.clone(),
                    candidate.confidence,
                );
                self.store.upsert_relationship(&edge).await?;
                Ok(
                    OperationRecord::new(MemoryOperation::Add, RecordKind::Relationship, label, "new edge")
                        .on(edge.id)
                        .emit(user_id),
                )
            }
        }
    }

    // ------------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------------

    /// Record a detected pattern, merging evidence into an existing one
    /// with the same category and description.
    pub async fn record_pattern(
        &self,
        user_id: &str,
        candidate: &PatternCandidate,
    ) -> Result<OperationRecord> {
        let key = normalize_name(&candidate.description);
        let label = candidate.short_description.clone();
        if key.is_empty() {
            return Ok(OperationRecord::noop(RecordKind::Pattern, label, "empty description").emit(user_id));
        }

        let existing = self
            .store
            .query_patterns(&PatternQuery::new(user_id, CASCADE_LIMIT).with_statuses(vec![
                PatternStatus::Detected,
                PatternStatus::Surfaced,
                PatternStatus::Confirmed,
                PatternStatus::Rejected,
            ]))
            .await?
            .into_iter()
            .find(|p| p.category == candidate.category && normalize_name(&p.description) == key);

        match existing {
            Some(pattern) if pattern.status == PatternStatus::Rejected => Ok(OperationRecord::noop(
                RecordKind::Pattern,
                label,
                "previously rejected",
            )
            .on(pattern.id)
            .emit(user_id)),
            Some(mut pattern) => {
                for item in &candidate.evidence {
                    if !pattern.evidence.contains(item) {
                        pattern.evidence.push(item.clone());
                    }
                }
                pattern.confidence = pattern.confidence.max(candidate.confidence.clamp(0.0, 1.0));
                pattern.updated_at = Utc::now();
                self.store.upsert_pattern(&pattern).await?;
                Ok(OperationRecord::new(
                    MemoryOperation::update(UpdateStrategy::Append),
                    RecordKind::Pattern,
                    label,
                    "more evidence",
                )
                .on(pattern.id)
                .emit(user_id))
            }
            None => {
                let mut pattern = Pattern::new(
                    user_id,
                    candidate.category,
                    candidate.description.trim(),
                    candidate.short_description.trim(),
                    candidate.confidence,
                );
                pattern.evidence = candidate.evidence.clone();
                self.store.upsert_pattern(&pattern).await?;
                Ok(
                    OperationRecord::new(MemoryOperation::Add, RecordKind::Pattern, label, "new pattern")
                        .on(pattern.id)
                        .emit(user_id),
                )
            }
        }
    }

    pub async fn surface_pattern(&self, user_id: &str, pattern_id: &str) -> Result<Pattern> {
        self.transition_pattern(user_id, pattern_id, PatternStatus::Surfaced)
            .await
    }

    pub async fn confirm_pattern(&self, user_id: &str, pattern_id: &str) -> Result<Pattern> {
        self.transition_pattern(user_id, pattern_id, PatternStatus::Confirmed)
            .await
    }

    pub async fn reject_pattern(&self, user_id: &str, pattern_id: &str) -> Result<Pattern> {
        self.transition_pattern(user_id, pattern_id, PatternStatus::Rejected)
            .await
    }

    /// detected -> surfaced -> confirmed, any -> rejected. Rejected is final.
    async fn transition_pattern(
        &self,
        user_id: &str,
        pattern_id: &str,
        target: PatternStatus,
    ) -> Result<Pattern> {
        let mut pattern = self
            .store
            .get_pattern(user_id, pattern_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Pattern {}", pattern_id)))?;

        let now = Utc::now();
        match (pattern.status, target) {
            (from, to) if from == to => return Ok(pattern),
            (PatternStatus::Rejected, _) => {
                return Err(Error::Validation(format!(
                    "Pattern {} was rejected",
                    pattern_id
                )))
            }
            // Already past surfacing
            (PatternStatus::Confirmed, PatternStatus::Surfaced) => return Ok(pattern),
            _ => {}
        }

        if matches!(target, PatternStatus::Surfaced | PatternStatus::Confirmed)
            && pattern.surfaced_at.is_none()
        {
            pattern.surfaced_at = Some(now);
        }
        pattern.status = target;
        pattern.updated_at = now;
        self.store.upsert_pattern(&pattern).await?;

        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            pattern_id = %pattern_id,
            status = target.as_str(),
            "Pattern status changed"
        );
        Ok(pattern)
    }

    // ------------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------------

    /// Charge every current entity of `user_id` the whole decay weeks
    /// elapsed since it was last charged.
    pub async fn run_decay_sweep(&self, user_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut cursor = None;
        loop {
            let page = self.sweep_page(user_id, cursor.take()).await?;
            let full = page.len() >= SWEEP_BATCH;
            cursor = page.last().map(|e| e.id.clone());

            for mut entity in page {
                report.examined += 1;
                if !apply_decay(&mut entity, now) {
                    continue;
                }
                match self.store.update_entity(&entity).await {
                    Ok(()) => report.changed += 1,
                    Err(e) => {
                        warn!(entity_id = %entity.id, error_code = e.error_code(), "Failed to persist decay");
                        report.failed += 1;
                    }
                }
            }
            if !full {
                break;
            }
        }

        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            examined = report.examined,
            changed = report.changed,
            failed = report.failed,
            "Decay sweep complete"
        );
        Ok(report)
    }

    /// Archive every current entity whose `expires_at` has passed.
    pub async fn run_expiry_sweep(&self, user_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        self.archive_where(user_id, "expiry", |e| e.is_expired(now))
            .await
    }

    /// Archive stale entities whose importance fell below the floor.
    pub async fn run_cleanup_sweep(&self, user_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        let floor = self.config.importance_floor;
        self.archive_where(user_id, "cleanup", |e| should_archive(e, floor, now))
            .await
    }

    async fn archive_where<F>(&self, user_id: &str, sweep: &'static str, pick: F) -> Result<SweepReport>
    where
        F: Fn(&Entity) -> bool,
    {
        let mut report = SweepReport::default();
        let mut cursor = None;
        loop {
            let page = self.sweep_page(user_id, cursor.take()).await?;
            let full = page.len() >= SWEEP_BATCH;
            cursor = page.last().map(|e| e.id.clone());

            for mut entity in page {
                report.examined += 1;
                if !pick(&entity) {
                    continue;
                }
                entity.status = EntityStatus::Archived;
                match self.store.update_entity(&entity).await {
                    Ok(()) => report.changed += 1,
                    Err(e) => {
                        warn!(entity_id = %entity.id, error_code = e.error_code(), "Failed to archive");
                        report.failed += 1;
                    }
                }
            }
            if !full {
                break;
            }
        }

        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            sweep,
            examined = report.examined,
            changed = report.changed,
            failed = report.failed,
            "Archive sweep complete"
        );
        Ok(report)
    }

    /// Next page of current entities in id order. Rows archived by the
    /// sweep itself do not shift later pages.
    async fn sweep_page(&self, user_id: &str, after: Option<String>) -> Result<Vec<Entity>> {
        self.store
            .query_entities(
                &EntityQuery::new(user_id, SWEEP_BATCH)
                    .including_historical()
                    .after(after),
            )
            .await
    }

    // ------------------------------------------------------------------------
    // Note cascade
    // ------------------------------------------------------------------------

    /// Records that deleting `note_id` would deactivate: its active facts
    /// and behaviors, and entities no other note mentioned.
    pub async fn plan_note_deletion(&self, user_id: &str, note_id: &str) -> Result<CascadePlan> {
        let facts = self
            .store
            .query_facts(
                &FactQuery::new(user_id, CASCADE_LIMIT)
                    .all_versions()
                    .from_note(note_id),
            )
            .await?;
        let behaviors = self
            .store
            .query_behaviors(&BehaviorQuery::new(user_id, CASCADE_LIMIT).from_note(note_id))
            .await?;
        let entities = self
            .store
            .query_entities(
                &EntityQuery::new(user_id, CASCADE_LIMIT)
                    .from_note(note_id)
                    .including_historical(),
            )
            .await?;

        Ok(CascadePlan {
            note_id: note_id.to_string(),
            fact_ids: facts.into_iter().map(|f| f.id).collect(),
            behavior_ids: behaviors.into_iter().map(|b| b.id).collect(),
            entity_ids: entities
                .into_iter()
                .filter(|e| e.mention_count <= 1)
                .map(|e| e.id)
                .collect(),
        })
    }

    /// Soft-delete the note and flip everything in `plan`.
    pub async fn apply_note_deletion(&self, user_id: &str, plan: &CascadePlan) -> Result<SweepReport> {
        let report = self.flip_cascade(user_id, plan, true).await?;
        self.mark_note_deleted(user_id, &plan.note_id, true).await?;
        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            note_id = %plan.note_id,
            changed = report.changed,
            failed = report.failed,
            "Note deletion cascaded"
        );
        Ok(report)
    }

    /// Undo [`Self::apply_note_deletion`] for exactly the records in `plan`.
    pub async fn restore_note(&self, user_id: &str, plan: &CascadePlan) -> Result<SweepReport> {
        let report = self.flip_cascade(user_id, plan, false).await?;
        self.mark_note_deleted(user_id, &plan.note_id, false).await?;
        info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            note_id = %plan.note_id,
            changed = report.changed,
            failed = report.failed,
            "Note restored"
        );
        Ok(report)
    }

    async fn flip_cascade(&self, user_id: &str, plan: &CascadePlan, delete: bool) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let (fact_from, fact_to) = if delete {
            (FactStatus::Active, FactStatus::Inactive)
        } else {
            (FactStatus::Inactive, FactStatus::Active)
        };
        for id in &plan.fact_ids {
            report.examined += 1;
            let outcome = self
                .edit_fact(user_id, id, |fact| {
                    if fact.status != fact_from {
                        return None;
                    }
                    let mut fact = fact.clone();
                    fact.status = fact_to;
                    fact.invalidated_at = if delete { Some(now) } else { None };
                    fact.updated_at = now;
                    Some(fact)
                })
                .await;
            match outcome {
                Ok(true) => report.changed += 1,
                Ok(false) | Err(Error::NotFound(_)) => {}
                Err(e) => self.tally(&mut report, Err(e)),
            }
        }

        let (behavior_from, behavior_to) = if delete {
            (BehaviorStatus::Active, BehaviorStatus::Inactive)
        } else {
            (BehaviorStatus::Inactive, BehaviorStatus::Active)
        };
        let wanted: HashSet<&String> = plan.behavior_ids.iter().collect();
        let behaviors = self
            .store
            .query_behaviors(
                &BehaviorQuery::new(user_id, CASCADE_LIMIT)
                    .from_note(&plan.note_id)
                    .with_status(Some(behavior_from)),
            )
            .await?;
        report.examined += plan.behavior_ids.len();
        for mut behavior in behaviors.into_iter().filter(|b| wanted.contains(&b.id)) {
            behavior.status = behavior_to;
            self.tally(&mut report, self.store.upsert_behavior(&behavior).await);
        }

        let (entity_from, entity_to) = if delete {
            (EntityStatus::Active, EntityStatus::Archived)
        } else {
            (EntityStatus::Archived, EntityStatus::Active)
        };
        for id in &plan.entity_ids {
            report.examined += 1;
            let Some(mut entity) = self.store.get_entity(user_id, id).await? else {
                continue;
            };
            if entity.status != entity_from {
                continue;
            }
            entity.status = entity_to;
            entity.updated_at = now;
            self.tally(&mut report, self.store.update_entity(&entity).await);
        }

        Ok(report)
    }

    fn tally(&self, report: &mut SweepReport, outcome: Result<()>) {
        match outcome {
            Ok(()) => report.changed += 1,
            Err(e) => {
                warn!(error_code = e.error_code(), "Cascade flip failed");
                report.failed += 1;
            }
        }
    }

    async fn mark_note_deleted(&self, user_id: &str, note_id: &str, deleted: bool) -> Result<()> {
        if let Some(mut note) = self.store.get_note(user_id, note_id).await? {
            note.is_deleted = deleted;
            note.updated_at = Utc::now();
            self.store.upsert_note(&note).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------------

    /// Route every candidate of one extraction through the lifecycle rules.
    ///
    /// Entities go first so facts, edges and behaviors can resolve them.
    /// A candidate whose write fails is counted and skipped.
    pub async fn ingest_extraction(
        &self,
        user_id: &str,
        extraction: &ExtractionResult,
        source_note_id: Option<&str>,
    ) -> IngestReport {
        let mut report = IngestReport::default();

        for candidate in &extraction.entities {
            let outcome = self
                .upsert_entity(user_id, candidate, source_note_id)
                .await
                .map(|(_, record)| record);
            report.collect("entities", user_id, outcome);
        }
        for candidate in &extraction.facts {
            let outcome = self.process_fact(user_id, candidate, source_note_id).await;
            report.collect("facts", user_id, outcome);
        }
        for candidate in &extraction.relationships {
            let outcome = self.reinforce_relationship(user_id, candidate).await;
            report.collect("relationships", user_id, outcome);
        }
        for candidate in &extraction.behaviors {
            let outcome = self.record_behavior(user_id, candidate, source_note_id).await;
            report.collect("behaviors", user_id, outcome);
        }
        for candidate in &extraction.patterns {
            let outcome = self.record_pattern(user_id, candidate).await;
            report.collect("patterns", user_id, outcome);
        }

        debug!(
            user_id = %user_id,
            operations = report.operations.len(),
            failed = report.failed,
            "Extraction ingested"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::models::{BehaviorPredicate, ImportanceTier, PatternCategory, RelationshipType};

    fn manager(store: Arc<InMemoryStore>) -> LifecycleManager {
        LifecycleManager::new(store, LifecycleConfig::default())
    }

    struct FailingDecider;

    #[async_trait]
    impl DecisionProvider for FailingDecider {
        async fn decide(&self, _: &FactCandidate, _: &[Fact]) -> Result<Option<LifecycleDecision>> {
            Err(Error::Classification("model unreachable".into()))
        }
    }

    #[test]
    fn test_rules() {
        let decider = RuleBasedDecider::new(0.5);
        let current = Fact::new("u1", "e1", Predicate::WorksAt, "Acme");
        let existing = vec![current.clone()];

        let same = FactCandidate::new("Marcus", Predicate::WorksAt, "acme");
        assert!(decider.decide_now(&same, &existing).operation.is_noop());

        let change = FactCandidate::new("Marcus", Predicate::WorksAt, "Notion");
        let decision = decider.decide_now(&change, &existing);
        assert_eq!(decision.operation, MemoryOperation::update(UpdateStrategy::Supersede));
        assert_eq!(decision.target_id.as_deref(), Some(current.id.as_str()));

        let detail = FactCandidate::new("Marcus", Predicate::WorksAt, "Acme Berlin office");
        assert_eq!(
            decider.decide_now(&detail, &existing).operation,
            MemoryOperation::update(UpdateStrategy::Append)
        );

        // A misspelling fix contains the old value but is still a correction
        let fix = FactCandidate::new("Marcus", Predicate::WorksAt, "Acmee").correction();
        assert_eq!(
            decider.decide_now(&fix, &existing).operation,
            MemoryOperation::update(UpdateStrategy::Replace)
        );

        let typo = FactCandidate::new("Marcus", Predicate::WorksAt, "Acne").correction();
        assert_eq!(
            decider.decide_now(&typo, &existing).operation,
            MemoryOperation::update(UpdateStrategy::Replace)
        );

        let weak = FactCandidate::new("Marcus", Predicate::Likes, "tea").with_confidence(0.2);
        assert!(decider.decide_now(&weak, &[]).operation.is_noop());

        let retract = FactCandidate::new("Marcus", Predicate::WorksAt, "Acme").negated();
        assert_eq!(
            decider.decide_now(&retract, &existing).operation,
            MemoryOperation::Delete { hard: false }
        );
    }

    #[test]
    fn test_merge_detail() {
        assert_eq!(merge_detail("Acme", "Acme Berlin office"), "Acme Berlin office");
        assert_eq!(merge_detail("Acme Berlin office", "acme"), "Acme Berlin office");
        assert_eq!(merge_detail("coffee", "tea"), "coffee; tea");
    }

    #[tokio::test]
    async fn test_contradiction_supersedes_and_links_versions() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());

        let first = lifecycle
            .process_fact("u1", &FactCandidate::new("Marcus", Predicate::WorksAt, "Acme"), None)
            .await
            .unwrap();
        assert_eq!(first.operation, MemoryOperation::Add);

        let second = lifecycle
            .process_fact("u1", &FactCandidate::new("Marcus", Predicate::WorksAt, "Notion"), None)
            .await
            .unwrap();
        assert_eq!(second.operation, MemoryOperation::update(UpdateStrategy::Supersede));
        assert_eq!(second.previous_id, first.record_id);

        let old = store
            .get_fact("u1", first.record_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        let new = store
            .get_fact("u1", second.record_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!old.is_current);
        assert_eq!(old.invalidated_by.as_deref(), Some(new.id.as_str()));
        assert!(old.valid_to.is_some());
        assert_eq!(new.version, old.version + 1);
        assert_eq!(new.previous_version_id.as_deref(), Some(old.id.as_str()));
    }

    #[tokio::test]
    async fn test_racing_writers_leave_one_current_row() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        lifecycle
            .upsert_entity("u1", &EntityCandidate::new("Marcus", EntityType::Person), None)
            .await
            .unwrap();

        let a = FactCandidate::new("Marcus", Predicate::LivesIn, "Tokyo");
        let b = FactCandidate::new("Marcus", Predicate::LivesIn, "Lisbon");
        let (ra, rb) = tokio::join!(
            lifecycle.process_fact("u1", &a, None),
            lifecycle.process_fact("u1", &b, None)
        );
        ra.unwrap();
        rb.unwrap();

        let current: Vec<Fact> = store
            .all_facts("u1")
            .await
            .into_iter()
            .filter(|f| f.predicate == Predicate::LivesIn && f.is_current)
            .collect();
        assert_eq!(current.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_decision_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone()).with_decider(Arc::new(FailingDecider));

        let record = lifecycle
            .process_fact("u1", &FactCandidate::new("Marcus", Predicate::Likes, "jazz"), None)
            .await
            .unwrap();
        assert!(record.operation.is_noop());
        assert!(store
            .all_facts("u1")
            .await
            .iter()
            .all(|f| f.predicate != Predicate::Likes));
    }

    #[tokio::test]
    async fn test_historical_fact_never_occupies_slot() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        lifecycle
            .process_fact("u1", &FactCandidate::new("Me", Predicate::LivesIn, "SF"), None)
            .await
            .unwrap();
        let record = lifecycle
            .process_fact(
                "u1",
                &FactCandidate::new("Me", Predicate::LivesIn, "Berlin").historical(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(record.operation, MemoryOperation::Add);

        let facts = store.all_facts("u1").await;
        let current: Vec<&Fact> = facts.iter().filter(|f| f.is_current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].object_text, "SF");
    }

    #[tokio::test]
    async fn test_soft_and_hard_delete() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        let added = lifecycle
            .process_fact("u1", &FactCandidate::new("Sam", Predicate::Likes, "climbing"), None)
            .await
            .unwrap();
        let id = added.record_id.unwrap();

        lifecycle.delete_fact("u1", &id, false).await.unwrap();
        let soft = store.get_fact("u1", &id).await.unwrap().unwrap();
        assert_eq!(soft.status, FactStatus::Inactive);

        lifecycle.delete_fact("u1", &id, true).await.unwrap();
        assert!(store.get_fact("u1", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_entity_merges_repeated_mentions() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());

        let (first, _) = lifecycle
            .upsert_entity(
                "u1",
                &EntityCandidate::new("Marcus", EntityType::Person).with_summary("My manager"),
                None,
            )
            .await
            .unwrap();
        let (second, record) = lifecycle
            .upsert_entity(
                "u1",
                &EntityCandidate::new("marcus", EntityType::Person)
                    .with_summary("Runs marathons")
                    .with_importance(ImportanceTier::High),
                None,
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(record.operation, MemoryOperation::update(UpdateStrategy::Append));
        assert_eq!(second.mention_count, 2);
        assert_eq!(second.importance, ImportanceTier::High);
        assert_eq!(second.summary.as_deref(), Some("My manager Runs marathons"));
    }

    #[tokio::test]
    async fn test_supersede_entity_keeps_one_current_row() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        let (old, _) = lifecycle
            .upsert_entity("u1", &EntityCandidate::new("Jon", EntityType::Person), None)
            .await
            .unwrap();

        let (new, record) = lifecycle
            .supersede_entity("u1", &old.id, &EntityCandidate::new("Jonathan", EntityType::Person))
            .await
            .unwrap();
        assert_eq!(record.previous_id.as_deref(), Some(old.id.as_str()));
        assert_eq!(new.version, 2);
        assert!(new.aliases.contains(&"Jon".to_string()));

        let current: Vec<Entity> = store
            .all_entities("u1")
            .await
            .into_iter()
            .filter(|e| e.is_current())
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, new.id);

        let again = lifecycle
            .supersede_entity("u1", &old.id, &EntityCandidate::new("Jonny", EntityType::Person))
            .await;
        assert!(matches!(again, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_behavior_reinforcement_does_not_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        lifecycle
            .upsert_entity("u1", &EntityCandidate::new("Marcus", EntityType::Person), None)
            .await
            .unwrap();

        let candidate = BehaviorCandidate {
            predicate: BehaviorPredicate::TrustsOpinionOf,
            entity: "Marcus".into(),
            topic: Some("career".into()),
            sentiment: 0.5,
            evidence: None,
            confidence: 0.7,
        };
        let first = lifecycle.record_behavior("u1", &candidate, None).await.unwrap();
        let second = lifecycle.record_behavior("u1", &candidate, None).await.unwrap();
        assert_eq!(first.operation, MemoryOperation::Add);
        assert_eq!(first.record_id, second.record_id);

        let behaviors = store
            .query_behaviors(&BehaviorQuery::new("u1", 10))
            .await
            .unwrap();
        assert_eq!(behaviors.len(), 1);
        assert_eq!(behaviors[0].reinforcement_count, 2);
    }

    #[tokio::test]
    async fn test_relationship_strength_grows_and_stays_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        for name in ["Ana", "Ben"] {
            lifecycle
                .upsert_entity("u1", &EntityCandidate::new(name, EntityType::Person), None)
                .await
                .unwrap();
        }

        let candidate = RelationshipCandidate {
            source: "Ben".into(),
            target: "Ana".into(),
            relationship_type: RelationshipType::SiblingOf,
            confidence: 0.8,
        };
        let mut ids = HashSet::new();
        for _ in 0..10 {
            let record = lifecycle.reinforce_relationship("u1", &candidate).await.unwrap();
            ids.insert(record.record_id.unwrap());
        }
        assert_eq!(ids.len(), 1);

        let edges = store
            .query_relationships(&crate::db::RelationshipQuery::new("u1", 10))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].strength, 1.0);
    }

    #[tokio::test]
    async fn test_pattern_lifecycle() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        let candidate = PatternCandidate {
            category: PatternCategory::Behavioral,
            description: "Writes late at night before big decisions".into(),
            short_description: "Late-night deciding".into(),
            confidence: 0.7,
            evidence: vec!["note a".into()],
        };

        let id = lifecycle
            .record_pattern("u1", &candidate)
            .await
            .unwrap()
            .record_id
            .unwrap();
        let surfaced = lifecycle.surface_pattern("u1", &id).await.unwrap();
        assert_eq!(surfaced.status, PatternStatus::Surfaced);
        assert!(surfaced.surfaced_at.is_some());

        lifecycle.reject_pattern("u1", &id).await.unwrap();
        assert!(matches!(
            lifecycle.confirm_pattern("u1", &id).await,
            Err(Error::Validation(_))
        ));
        let again = lifecycle.record_pattern("u1", &candidate).await.unwrap();
        assert!(again.operation.is_noop());
    }

    #[tokio::test]
    async fn test_expiry_sweep_archives_expired() {
        let store = Arc::new(InMemoryStore::new());
        let lifecycle = manager(store.clone());
        let now = Utc::now();
        let mut trip = Entity::new("u1", "Lisbon trip", EntityType::Other);
        trip.expires_at = Some(now - Duration::days(1));
        store.insert_entity(&trip).await.unwrap();
        store
            .insert_entity(&Entity::new("u1", "Home", EntityType::Place))
            .await
            .unwrap();

        let report = lifecycle.run_expiry_sweep("u1", now).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        let after = store.get_entity("u1", &trip.id).await.unwrap().unwrap();
        assert_eq!(after.status, EntityStatus::Archived);
    }
}
