//! In-memory [`MemoryStore`] implementation.
//!
//! Honours the same query semantics as the SQLite store. Used by tests
//! and by embedders that keep memory in process. Individual tables can be
//! made to fail with [`InMemoryStore::fail_table`] to exercise degraded
//! paths.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::store::{
    same_fact_revision, BehaviorQuery, EntityOrder, EntityQuery, FactOrder, FactQuery, FactWrite,
    MemoryStore, NoteQuery, PatternQuery, RelationshipQuery, Table,
};
use crate::error::{Error, Result};
use crate::models::{
    Behavior, BehaviorPredicate, Entity, Fact, NoteMeta, Pattern, Relationship, RelationshipType,
};

#[derive(Default)]
struct State {
    entities: HashMap<String, Entity>,
    facts: HashMap<String, Fact>,
    relationships: HashMap<String, Relationship>,
    behaviors: HashMap<String, Behavior>,
    patterns: HashMap<String, Pattern>,
    notes: HashMap<String, NoteMeta>,
    failing: HashSet<Table>,
}

impl State {
    fn check(&self, table: Table) -> Result<()> {
        if self.failing.contains(&table) {
            return Err(Error::Store(format!("{} unavailable", table.as_str())));
        }
        Ok(())
    }

    /// Whether another current entity of the same user holds `entity`'s
    /// normalized name. `except` is ignored in addition to `entity` itself.
    fn name_taken(&self, entity: &Entity, except: Option<&str>) -> bool {
        let name = entity.normalized_name();
        self.entities.values().any(|e| {
            e.id != entity.id
                && Some(e.id.as_str()) != except
                && e.user_id == entity.user_id
                && e.is_current()
                && e.normalized_name() == name
        })
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `table` fail with a store error.
    pub async fn fail_table(&self, table: Table) {
        self.state.write().await.failing.insert(table);
    }

    pub async fn heal_table(&self, table: Table) {
        self.state.write().await.failing.remove(&table);
    }

    /// Every fact row for a user, any status or version.
    pub async fn all_facts(&self, user_id: &str) -> Vec<Fact> {
        let state = self.state.read().await;
        let mut facts: Vec<Fact> = state
            .facts
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect();
        facts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        facts
    }

    /// Every entity row for a user, any status or version.
    pub async fn all_entities(&self, user_id: &str) -> Vec<Entity> {
        let state = self.state.read().await;
        let mut entities: Vec<Entity> = state
            .entities
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entities
    }
}

fn desc_f64(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn sort_entities(entities: &mut [Entity], order: EntityOrder) {
    entities.sort_by(|a, b| {
        let primary = match order {
            EntityOrder::Importance => desc_f64(a.importance_score, b.importance_score)
                .then_with(|| b.mention_count.cmp(&a.mention_count)),
            EntityOrder::MentionCount => b
                .mention_count
                .cmp(&a.mention_count)
                .then_with(|| desc_f64(a.importance_score, b.importance_score)),
            EntityOrder::RecentlyUpdated => b.updated_at.cmp(&a.updated_at),
            EntityOrder::Id => Ordering::Equal,
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

fn sort_facts(facts: &mut [Fact], order: FactOrder) {
    facts.sort_by(|a, b| {
        let primary = match order {
            FactOrder::Confidence => desc_f64(a.confidence, b.confidence)
                .then_with(|| b.created_at.cmp(&a.created_at)),
            FactOrder::Recent => b.created_at.cmp(&a.created_at),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

fn limited<T>(mut rows: Vec<T>, limit: usize) -> Vec<T> {
    rows.truncate(limit);
    rows
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        state.check(Table::Entities)?;
        let mut rows: Vec<Entity> = state
            .entities
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_entities(&mut rows, query.order);
        Ok(limited(rows, query.limit))
    }

    async fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>> {
        let state = self.state.read().await;
        state.check(Table::Entities)?;
        Ok(state
            .entities
            .get(id)
            .filter(|e| e.user_id == user_id)
            .cloned())
    }

    async fn find_current_entity(
        &self,
        user_id: &str,
        normalized_name: &str,
    ) -> Result<Option<Entity>> {
        let state = self.state.read().await;
        state.check(Table::Entities)?;
        Ok(state
            .entities
            .values()
            .find(|e| e.user_id == user_id && e.is_current() && e.normalized_name() == normalized_name)
            .cloned())
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Entities)?;
        if state.entities.contains_key(&entity.id) {
            return Err(Error::AlreadyExists(format!("Entity {}", entity.id)));
        }
        if entity.is_current() && state.name_taken(entity, None) {
            return Err(Error::AlreadyExists(format!("Entity named {}", entity.name)));
        }
        state.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_entity(&self, entity: &Entity) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Entities)?;
        if entity.is_current() && state.name_taken(entity, None) {
            return Err(Error::AlreadyExists(format!("Entity named {}", entity.name)));
        }
        match state.entities.get_mut(&entity.id) {
            Some(existing) if existing.user_id == entity.user_id => {
                *existing = entity.clone();
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Entity {}", entity.id))),
        }
    }

    async fn supersede_entity(&self, retired: &Entity, replacement: &Entity) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Entities)?;
        match state.entities.get(&retired.id) {
            Some(existing) if existing.is_current() => {}
            Some(_) => {
                return Err(Error::Conflict(format!("Entity {} is not current", retired.id)))
            }
            None => return Err(Error::NotFound(format!("Entity {}", retired.id))),
        }
        if replacement.is_current() && state.name_taken(replacement, Some(&retired.id)) {
            return Err(Error::Conflict(format!(
                "Entity named {} already current",
                replacement.name
            )));
        }
        state.entities.insert(retired.id.clone(), retired.clone());
        state
            .entities
            .insert(replacement.id.clone(), replacement.clone());
        Ok(())
    }

    async fn record_entity_access(
        &self,
        user_id: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Entities)?;
        for id in ids {
            if let Some(entity) = state.entities.get_mut(id) {
                if entity.user_id == user_id {
                    entity.access_count += 1;
                    entity.last_accessed_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn query_facts(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        let state = self.state.read().await;
        state.check(Table::Facts)?;
        let mut rows: Vec<Fact> = state
            .facts
            .values()
            .filter(|f| query.matches(f))
            .cloned()
            .collect();
        sort_facts(&mut rows, query.order);
        Ok(limited(rows, query.limit))
    }

    async fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<Fact>> {
        let state = self.state.read().await;
        state.check(Table::Facts)?;
        Ok(state.facts.get(id).filter(|f| f.user_id == user_id).cloned())
    }

    async fn write_fact(&self, write: &FactWrite) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Facts)?;
        let insert = &write.insert;

        if insert.predicate.is_single_valued() && insert.is_current {
            let current = state
                .facts
                .values()
                .find(|f| {
                    f.user_id == insert.user_id
                        && f.entity_id == insert.entity_id
                        && f.predicate == insert.predicate
                        && f.is_current
                })
                .map(|f| f.id.clone());
            let expected = write.retire.as_ref().map(|f| f.id.clone());
            if current != expected {
                return Err(Error::Conflict(format!(
                    "Slot {}/{} moved",
                    insert.entity_id, insert.predicate
                )));
            }
        }

        if let Some(retired) = &write.retire {
            let still_current = state
                .facts
                .get(&retired.id)
                .map(|f| f.is_current && f.object_text == retired.object_text)
                .unwrap_or(false);
            if !still_current {
                return Err(Error::Conflict(format!("Fact {} is not current", retired.id)));
            }
        }
        if state.facts.contains_key(&insert.id) {
            return Err(Error::AlreadyExists(format!("Fact {}", insert.id)));
        }

        if let Some(retired) = &write.retire {
            state.facts.insert(retired.id.clone(), retired.clone());
        }
        state.facts.insert(insert.id.clone(), insert.clone());
        Ok(())
    }

    async fn update_fact(&self, expected: &Fact, updated: &Fact) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Facts)?;
        match state.facts.get_mut(&updated.id) {
            Some(existing) if existing.user_id == updated.user_id => {
                if !same_fact_revision(existing, expected) {
                    return Err(Error::Conflict(format!("Fact {} changed", updated.id)));
                }
                *existing = updated.clone();
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Fact {}", updated.id))),
        }
    }

    async fn delete_fact(&self, user_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Facts)?;
        match state.facts.get(id) {
            Some(f) if f.user_id == user_id => {
                state.facts.remove(id);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Fact {}", id))),
        }
    }

    async fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        state.check(Table::Relationships)?;
        let mut rows: Vec<Relationship> = state
            .relationships
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| desc_f64(a.strength, b.strength).then_with(|| a.id.cmp(&b.id)));
        Ok(limited(rows, query.limit))
    }

    async fn find_relationship(
        &self,
        user_id: &str,
        source_entity_id: &str,
        target_entity_id: &str,
        relationship_type: &RelationshipType,
    ) -> Result<Option<Relationship>> {
        let state = self.state.read().await;
        state.check(Table::Relationships)?;
        Ok(state
            .relationships
            .values()
            .find(|r| {
                r.user_id == user_id
                    && r.source_entity_id == source_entity_id
                    && r.target_entity_id == target_entity_id
                    && &r.relationship_type == relationship_type
            })
            .cloned())
    }

    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Relationships)?;
        state
            .relationships
            .insert(relationship.id.clone(), relationship.clone());
        Ok(())
    }

    async fn query_behaviors(&self, query: &BehaviorQuery) -> Result<Vec<Behavior>> {
        let state = self.state.read().await;
        state.check(Table::Behaviors)?;
        let mut rows: Vec<Behavior> = state
            .behaviors
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            desc_f64(a.confidence, b.confidence)
                .then_with(|| b.reinforcement_count.cmp(&a.reinforcement_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(limited(rows, query.limit))
    }

    async fn find_behavior(
        &self,
        user_id: &str,
        predicate: &BehaviorPredicate,
        entity_id: &str,
    ) -> Result<Option<Behavior>> {
        let state = self.state.read().await;
        state.check(Table::Behaviors)?;
        Ok(state
            .behaviors
            .values()
            .find(|b| b.user_id == user_id && &b.predicate == predicate && b.entity_id == entity_id)
            .cloned())
    }

    async fn upsert_behavior(&self, behavior: &Behavior) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Behaviors)?;
        state.behaviors.insert(behavior.id.clone(), behavior.clone());
        Ok(())
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        let state = self.state.read().await;
        state.check(Table::Patterns)?;
        let mut rows: Vec<Pattern> = state
            .patterns
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        rows.sort_by(|a, b| desc_f64(a.confidence, b.confidence).then_with(|| a.id.cmp(&b.id)));
        Ok(limited(rows, query.limit))
    }

    async fn get_pattern(&self, user_id: &str, id: &str) -> Result<Option<Pattern>> {
        let state = self.state.read().await;
        state.check(Table::Patterns)?;
        Ok(state
            .patterns
            .get(id)
            .filter(|p| p.user_id == user_id)
            .cloned())
    }

    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Patterns)?;
        state.patterns.insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<NoteMeta>> {
        let state = self.state.read().await;
        state.check(Table::Notes)?;
        let mut rows: Vec<NoteMeta> = state
            .notes
            .values()
            .filter(|n| query.matches(n))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(limited(rows, query.limit))
    }

    async fn get_note(&self, user_id: &str, id: &str) -> Result<Option<NoteMeta>> {
        let state = self.state.read().await;
        state.check(Table::Notes)?;
        Ok(state.notes.get(id).filter(|n| n.user_id == user_id).cloned())
    }

    async fn upsert_note(&self, note: &NoteMeta) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(Table::Notes)?;
        state.notes.insert(note.id.clone(), note.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, FactStatus, ImportanceTier, Predicate};

    #[tokio::test]
    async fn test_entity_query_filters_and_orders() {
        let store = InMemoryStore::new();
        let marcus = Entity::new("u1", "Marcus", EntityType::Person).with_importance(ImportanceTier::High);
        let acme = Entity::new("u1", "Acme", EntityType::Organization).with_importance(ImportanceTier::Low);
        let other_user = Entity::new("u2", "Marcus", EntityType::Person);
        for e in [&marcus, &acme, &other_user] {
            store.insert_entity(e).await.unwrap();
        }

        let all = store.query_entities(&EntityQuery::new("u1", 10)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Marcus");

        let people = store
            .query_entities(&EntityQuery::new("u1", 10).of_types(&[EntityType::Person]))
            .await
            .unwrap();
        assert_eq!(people.len(), 1);

        let capped = store.query_entities(&EntityQuery::new("u1", 1)).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_current_name_rejected() {
        let store = InMemoryStore::new();
        store
            .insert_entity(&Entity::new("u1", "Marcus", EntityType::Person))
            .await
            .unwrap();
        let err = store
            .insert_entity(&Entity::new("u1", "marcus", EntityType::Person))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_write_fact_detects_moved_slot() {
        let store = InMemoryStore::new();
        let first = Fact::new("u1", "e1", Predicate::WorksAt, "Acme");
        store
            .write_fact(&FactWrite { retire: None, insert: first.clone() })
            .await
            .unwrap();

        // A second writer that believes the slot is empty loses.
        let racer = Fact::new("u1", "e1", Predicate::WorksAt, "Globex");
        let err = store
            .write_fact(&FactWrite { retire: None, insert: racer })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Multi-valued predicates never conflict.
        for object in ["tea", "hiking"] {
            let fact = Fact::new("u1", "e1", Predicate::Likes, object);
            store
                .write_fact(&FactWrite { retire: None, insert: fact })
                .await
                .unwrap();
        }
        let live = store
            .query_facts(&FactQuery::new("u1", 10).with_status(Some(FactStatus::Active)))
            .await
            .unwrap();
        assert_eq!(live.len(), 3);
    }

    #[tokio::test]
    async fn test_update_fact_rejects_stale_revision() {
        let store = InMemoryStore::new();
        let acme = Fact::new("u1", "e1", Predicate::WorksAt, "Acme");
        store
            .write_fact(&FactWrite { retire: None, insert: acme.clone() })
            .await
            .unwrap();

        // Retired while another writer still holds the old copy
        let mut successor = Fact::new("u1", "e1", Predicate::WorksAt, "Notion");
        successor.follow(&acme);
        let mut retired = acme.clone();
        retired.retire(&successor.id, Utc::now());
        store
            .write_fact(&FactWrite { retire: Some(retired), insert: successor })
            .await
            .unwrap();

        let mut stale = acme.clone();
        stale.object_text = "Acme Berlin office".to_string();
        let err = store.update_fact(&acme, &stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let current = store
            .query_facts(&FactQuery::new("u1", 10).with_predicates(vec![Predicate::WorksAt]))
            .await
            .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].object_text, "Notion");
    }

    #[tokio::test]
    async fn test_visibility_filters_apply_before_limit() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            let mut gone = Entity::new("u1", format!("Expired {}", i), EntityType::Other)
                .with_importance(ImportanceTier::Critical);
            gone.expires_at = Some(now - chrono::Duration::days(1));
            store.insert_entity(&gone).await.unwrap();
        }
        let visible = Entity::new("u1", "Porto", EntityType::Place).with_importance(ImportanceTier::Low);
        store.insert_entity(&visible).await.unwrap();

        let rows = store
            .query_entities(&EntityQuery::new("u1", 3).visible_at(now, true))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, visible.id);
    }

    #[tokio::test]
    async fn test_entity_pages_follow_id_cursor() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .insert_entity(&Entity::new("u1", format!("Person {}", i), EntityType::Person))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .query_entities(&EntityQuery::new("u1", 2).after(cursor.clone()))
                .await
                .unwrap();
            cursor = page.last().map(|e| e.id.clone());
            seen.extend(page.iter().map(|e| e.id.clone()));
            if page.len() < 2 {
                break;
            }
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_failing_table_errors() {
        let store = InMemoryStore::new();
        store.fail_table(Table::Notes).await;
        assert!(store.query_notes(&NoteQuery::new("u1", 5)).await.is_err());
        store.heal_table(Table::Notes).await;
        assert!(store.query_notes(&NoteQuery::new("u1", 5)).await.is_ok());
    }
}
