//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use mirror::config::Config;
use mirror::db::{
    BehaviorQuery, EntityQuery, FactQuery, FactWrite, InMemoryStore, MemoryStore, NoteQuery,
    PatternQuery, RelationshipQuery,
};
use mirror::models::{
    Behavior, BehaviorPredicate, Entity, EntityType, Fact, NoteMeta, Pattern, Predicate,
    Relationship, RelationshipType,
};
use mirror::services::extraction::{ExtractionResult, MemoryExtractor};
use mirror::{MemoryLayer, Result};

pub const USER: &str = "user-1";

/// Memory layer over a fresh in-process store.
pub fn layer() -> (Arc<InMemoryStore>, MemoryLayer) {
    let store = Arc::new(InMemoryStore::new());
    let layer = MemoryLayer::with_store(store.clone(), &Config::default());
    (store, layer)
}

pub async fn seed_entity(store: &dyn MemoryStore, name: &str, entity_type: EntityType) -> Result<Entity> {
    let entity = Entity::new(USER, name, entity_type);
    store.insert_entity(&entity).await?;
    Ok(entity)
}

pub async fn seed_fact(
    store: &dyn MemoryStore,
    entity: &Entity,
    predicate: Predicate,
    object: &str,
    confidence: f64,
) -> Result<Fact> {
    let fact = Fact::new(USER, &entity.id, predicate, object).with_confidence(confidence);
    store
        .write_fact(&FactWrite {
            retire: None,
            insert: fact.clone(),
        })
        .await?;
    Ok(fact)
}

/// Extractor that replays a canned JSON reply.
pub struct ScriptedExtractor {
    reply: String,
}

impl ScriptedExtractor {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

#[async_trait]
impl MemoryExtractor for ScriptedExtractor {
    async fn extract(&self, _user_id: &str, _text: &str) -> Result<ExtractionResult> {
        ExtractionResult::from_json(&self.reply)
    }
}

/// Store that parks the first in-place fact edit until released, so a
/// competing writer can land between its read and its write.
pub struct GatedStore {
    inner: Arc<InMemoryStore>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl GatedStore {
    /// Returns the store plus (reached, release) signals.
    pub fn new(inner: Arc<InMemoryStore>) -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let store = Arc::new(Self {
            inner,
            gate: Mutex::new(Some((reached.clone(), release.clone()))),
        });
        (store, reached, release)
    }
}

#[async_trait]
impl MemoryStore for GatedStore {
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        self.inner.query_entities(query).await
    }
    async fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>> {
        self.inner.get_entity(user_id, id).await
    }
    async fn find_current_entity(&self, user_id: &str, normalized_name: &str) -> Result<Option<Entity>> {
        self.inner.find_current_entity(user_id, normalized_name).await
    }
    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.inner.insert_entity(entity).await
    }
    async fn update_entity(&self, entity: &Entity) -> Result<()> {
        self.inner.update_entity(entity).await
    }
    async fn supersede_entity(&self, retired: &Entity, replacement: &Entity) -> Result<()> {
        self.inner.supersede_entity(retired, replacement).await
    }
    async fn record_entity_access(&self, user_id: &str, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        self.inner.record_entity_access(user_id, ids, at).await
    }

    async fn query_facts(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        self.inner.query_facts(query).await
    }
    async fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<Fact>> {
        self.inner.get_fact(user_id, id).await
    }
    async fn write_fact(&self, write: &FactWrite) -> Result<()> {
        self.inner.write_fact(write).await
    }
    async fn update_fact(&self, expected: &Fact, updated: &Fact) -> Result<()> {
        let gate = self.gate.lock().ok().and_then(|mut g| g.take());
        if let Some((reached, release)) = gate {
            reached.notify_one();
            release.notified().await;
        }
        self.inner.update_fact(expected, updated).await
    }
    async fn delete_fact(&self, user_id: &str, id: &str) -> Result<()> {
        self.inner.delete_fact(user_id, id).await
    }

    async fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        self.inner.query_relationships(query).await
    }
    async fn find_relationship(
        &self,
        user_id: &str,
        source_entity_id: &str,
        target_entity_id: &str,
        relationship_type: &RelationshipType,
    ) -> Result<Option<Relationship>> {
        self.inner
            .find_relationship(user_id, source_entity_id, target_entity_id, relationship_type)
            .await
    }
    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
        self.inner.upsert_relationship(relationship).await
    }

    async fn query_behaviors(&self, query: &BehaviorQuery) -> Result<Vec<Behavior>> {
        self.inner.query_behaviors(query).await
    }
    async fn find_behavior(
        &self,
        user_id: &str,
        predicate: &BehaviorPredicate,
        entity_id: &str,
    ) -> Result<Option<Behavior>> {
        self.inner.find_behavior(user_id, predicate, entity_id).await
    }
    async fn upsert_behavior(&self, behavior: &Behavior) -> Result<()> {
        self.inner.upsert_behavior(behavior).await
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        self.inner.query_patterns(query).await
    }
    async fn get_pattern(&self, user_id: &str, id: &str) -> Result<Option<Pattern>> {
        self.inner.get_pattern(user_id, id).await
    }
    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.inner.upsert_pattern(pattern).await
    }

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<NoteMeta>> {
        self.inner.query_notes(query).await
    }
    async fn get_note(&self, user_id: &str, id: &str) -> Result<Option<NoteMeta>> {
        self.inner.get_note(user_id, id).await
    }
    async fn upsert_note(&self, note: &NoteMeta) -> Result<()> {
        self.inner.upsert_note(note).await
    }
}
