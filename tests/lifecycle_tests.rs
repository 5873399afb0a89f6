//! Integration tests for the memory lifecycle.
//!
//! Drives extraction ingest, contradiction handling, the note cascade and
//! the maintenance sweeps through the public memory layer.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::{layer, seed_entity, GatedStore, ScriptedExtractor, USER};
use mirror::config::LifecycleConfig;
use mirror::db::{BehaviorQuery, FactQuery, InMemoryStore, MemoryStore};
use mirror::models::{
    BehaviorStatus, Entity, EntityStatus, EntityType, FactStatus, ImportanceTier, NoteMeta,
    Predicate,
};
use mirror::services::extraction::FactCandidate;
use mirror::services::lifecycle::{LifecycleManager, MemoryOperation, UpdateStrategy};
use mirror::{Error, Result};

const FIRST_NOTE: &str = r#"{
    "entities": [
        {"name": "Marcus", "entity_type": "person", "relationship": "manager",
         "summary": "Leads the platform team", "importance": "high"},
        {"name": "Acme", "entity_type": "organization"}
    ],
    "facts": [
        {"subject": "Marcus", "predicate": "works_at", "object": "Acme", "confidence": 0.9},
        {"subject": "Marcus", "predicate": "likes", "object": "trail running"}
    ],
    "behaviors": [
        {"predicate": "trusts_opinion_of", "entity": "Marcus", "topic": "career",
         "confidence": 0.8}
    ],
    "patterns": [
        {"category": "behavioral", "description": "Seeks Marcus's view before big moves",
         "short_description": "Checks with Marcus", "confidence": 0.6}
    ]
}"#;

const SECOND_NOTE: &str = r#"{
    "entities": [{"name": "Notion", "entity_type": "organization"}],
    "facts": [
        {"subject": "Marcus", "predicate": "works_at", "object": "Notion", "confidence": 0.9}
    ]
}"#;

fn current_employers(facts: &[mirror::models::Fact]) -> Vec<String> {
    facts
        .iter()
        .filter(|f| f.predicate == Predicate::WorksAt && f.is_current)
        .map(|f| f.object_text.clone())
        .collect()
}

#[tokio::test]
async fn test_ingest_note_routes_every_category() -> Result<()> {
    let (store, layer) = layer();
    let layer = layer.with_memory_extractor(Arc::new(ScriptedExtractor::new(FIRST_NOTE)));
    let note = NoteMeta::new(USER, Some("1:1 with Marcus".into()), Some("work".into()));

    let report = layer.ingest_note(USER, &note, "raw note text").await?;

    assert_eq!(report.failed, 0);
    assert_eq!(report.operations.len(), 6);
    assert_eq!(report.count("ADD"), 6);
    assert!(store.get_note(USER, &note.id).await?.is_some());

    let facts = store.all_facts(USER).await;
    assert!(facts.iter().all(|f| f.source_note_id.as_deref() == Some(note.id.as_str())));
    let works_at = facts
        .iter()
        .find(|f| f.predicate == Predicate::WorksAt)
        .map(|f| f.object_entity_id.is_some());
    assert_eq!(works_at, Some(true));
    Ok(())
}

#[tokio::test]
async fn test_ingest_without_extractor_is_an_error() {
    let (_store, layer) = layer();
    let note = NoteMeta::new(USER, None, None);
    let outcome = layer.ingest_note(USER, &note, "text").await;
    assert!(matches!(outcome, Err(Error::Internal(_))));
}

/// Acme then Notion for a single-valued predicate: Notion is current,
/// Acme is kept as history and linked to its successor.
#[tokio::test]
async fn test_contradiction_keeps_history() -> Result<()> {
    let (store, layer) = layer();
    let first = layer
        .clone()
        .with_memory_extractor(Arc::new(ScriptedExtractor::new(FIRST_NOTE)));
    let second = layer.with_memory_extractor(Arc::new(ScriptedExtractor::new(SECOND_NOTE)));

    first
        .ingest_note(USER, &NoteMeta::new(USER, None, None), "first")
        .await?;
    let report = second
        .ingest_note(USER, &NoteMeta::new(USER, None, None), "second")
        .await?;

    let superseded = report
        .operations
        .iter()
        .find(|r| r.operation == MemoryOperation::update(UpdateStrategy::Supersede))
        .cloned();
    assert!(superseded.is_some());

    let facts = store.all_facts(USER).await;
    assert_eq!(current_employers(&facts), vec!["Notion".to_string()]);

    let acme = facts
        .iter()
        .find(|f| f.predicate == Predicate::WorksAt && f.object_text == "Acme")
        .cloned();
    let acme = acme.ok_or_else(|| Error::NotFound("Acme fact".into()))?;
    assert_eq!(acme.status, FactStatus::Superseded);
    assert!(acme.valid_to.is_some());
    assert_eq!(acme.invalidated_by, superseded.and_then(|r| r.record_id));

    // Retrieval only sees the current employer
    let context = layer_context(&store).await;
    assert!(context.contains("Notion"));
    assert!(!context.contains("works at: Acme"));
    Ok(())
}

async fn layer_context(store: &Arc<InMemoryStore>) -> String {
    let layer = mirror::MemoryLayer::with_store(store.clone(), &mirror::config::Config::default());
    layer
        .build_context(USER, "Who is Marcus these days?")
        .await
        .formatted
        .text
}

/// However many contradicting writes land, one row stays current.
#[tokio::test]
async fn test_single_current_row_per_slot() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    // Every loser of a round re-reads; allow one retry per competing writer
    let config = LifecycleConfig {
        max_write_attempts: 10,
        ..Default::default()
    };
    let lifecycle = LifecycleManager::new(store.clone(), config);

    let cities = ["Tokyo", "Lisbon", "Oslo", "Lima", "Accra", "Hanoi"];
    let writes = cities.iter().map(|city| {
        let lifecycle = lifecycle.clone();
        let candidate = FactCandidate::new("Me", Predicate::LivesIn, *city);
        async move { lifecycle.process_fact(USER, &candidate, None).await }
    });
    // The subject must exist before the race so every writer shares it
    lifecycle
        .process_fact(USER, &FactCandidate::new("Me", Predicate::LivesIn, "Paris"), None)
        .await?;
    for outcome in futures::future::join_all(writes).await {
        outcome?;
    }

    let facts = store.all_facts(USER).await;
    let current: Vec<_> = facts.iter().filter(|f| f.is_current).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(facts.len(), cities.len() + 1);

    // Versions form one chain
    let mut versions: Vec<i32> = facts.iter().map(|f| f.version).collect();
    versions.sort();
    assert_eq!(versions, (1..=cities.len() as i32 + 1).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn test_retraction_soft_deletes() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let lifecycle = LifecycleManager::new(store.clone(), LifecycleConfig::default());
    lifecycle
        .process_fact(USER, &FactCandidate::new("Sam", Predicate::Likes, "karaoke"), None)
        .await?;

    let record = lifecycle
        .process_fact(
            USER,
            &FactCandidate::new("Sam", Predicate::Likes, "Karaoke").negated(),
            None,
        )
        .await?;
    assert_eq!(record.operation, MemoryOperation::Delete { hard: false });

    let live = store
        .query_facts(&FactQuery::new(USER, 10).with_predicates(vec![Predicate::Likes]))
        .await?;
    assert!(live.is_empty());
    assert_eq!(store.all_facts(USER).await.len(), 1);
    Ok(())
}

/// Deleting a note deactivates what only it produced; restoring brings
/// back exactly that set.
#[tokio::test]
async fn test_note_cascade_and_restore() -> Result<()> {
    let (store, layer) = layer();
    let layer = layer.with_memory_extractor(Arc::new(ScriptedExtractor::new(FIRST_NOTE)));
    let note = NoteMeta::new(USER, Some("1:1".into()), None);
    layer.ingest_note(USER, &note, "text").await?;

    // Inactive before the deletion; must stay inactive after restore
    let old = store
        .query_facts(&FactQuery::new(USER, 10).with_predicates(vec![Predicate::Likes]))
        .await?;
    let untouched = old
        .first()
        .cloned()
        .ok_or_else(|| Error::NotFound("likes fact".into()))?;
    layer.lifecycle.delete_fact(USER, &untouched.id, false).await?;

    let plan = layer.delete_note(USER, &note.id).await?;
    assert_eq!(plan.fact_ids.len(), 1);
    assert_eq!(plan.behavior_ids.len(), 1);
    assert_eq!(plan.entity_ids.len(), 2);

    let deleted = store.get_note(USER, &note.id).await?.map(|n| n.is_deleted);
    assert_eq!(deleted, Some(true));
    for id in &plan.entity_ids {
        let status = store.get_entity(USER, id).await?.map(|e| e.status);
        assert_eq!(status, Some(EntityStatus::Archived));
    }
    let behaviors = store
        .query_behaviors(&BehaviorQuery::new(USER, 10).with_status(Some(BehaviorStatus::Active)))
        .await?;
    assert!(behaviors.is_empty());

    let restored = layer.restore_note(USER, &plan).await?;
    assert_eq!(restored.changed, plan.len());
    assert_eq!(store.get_note(USER, &note.id).await?.map(|n| n.is_deleted), Some(false));
    for id in &plan.fact_ids {
        let status = store.get_fact(USER, id).await?.map(|f| f.status);
        assert_eq!(status, Some(FactStatus::Active));
    }
    let still_inactive = store.get_fact(USER, &untouched.id).await?.map(|f| f.status);
    assert_eq!(still_inactive, Some(FactStatus::Inactive));
    Ok(())
}

#[tokio::test]
async fn test_entities_mentioned_elsewhere_survive_note_deletion() -> Result<()> {
    let (store, layer) = layer();
    let layer = layer.with_memory_extractor(Arc::new(ScriptedExtractor::new(FIRST_NOTE)));
    let note = NoteMeta::new(USER, None, None);
    layer.ingest_note(USER, &note, "text").await?;
    // A second mention from another note
    layer
        .ingest_note(USER, &NoteMeta::new(USER, None, None), "text")
        .await?;

    let plan = layer.lifecycle.plan_note_deletion(USER, &note.id).await?;
    assert!(plan.entity_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_maintenance_sweeps() -> Result<()> {
    let (store, layer) = layer();
    let now = Utc::now();

    let mut stale = Entity::new(USER, "Old acquaintance", EntityType::Person)
        .with_importance(ImportanceTier::Trivial);
    stale.importance_score = 0.05;
    stale.updated_at = now - Duration::days(400);
    store.insert_entity(&stale).await?;

    let mut expired = Entity::new(USER, "Conference", EntityType::Other);
    expired.expires_at = Some(now - Duration::hours(1));
    store.insert_entity(&expired).await?;

    let keeper = seed_entity(store.as_ref(), "Mom", EntityType::Person).await?;

    let report = layer.run_maintenance(USER, now).await?;
    assert_eq!(report.decay.examined, 3);
    assert_eq!(report.expiry.changed, 1);
    assert_eq!(report.cleanup.changed, 1);

    let status = |id: String| {
        let store = store.clone();
        async move { store.get_entity(USER, &id).await.map(|e| e.map(|e| e.status)) }
    };
    assert_eq!(status(stale.id.clone()).await?, Some(EntityStatus::Archived));
    assert_eq!(status(expired.id.clone()).await?, Some(EntityStatus::Archived));
    assert_eq!(status(keeper.id.clone()).await?, Some(EntityStatus::Active));
    Ok(())
}

fn current_rows(facts: Vec<mirror::models::Fact>, predicate: Predicate) -> Vec<mirror::models::Fact> {
    facts
        .into_iter()
        .filter(|f| f.predicate == predicate && f.is_current)
        .collect()
}

/// An in-place edit whose row is superseded between its read and its
/// write goes back through the slot instead of reviving the retired row.
#[tokio::test]
async fn test_in_place_update_racing_supersede_keeps_one_current() -> Result<()> {
    let inner = Arc::new(InMemoryStore::new());
    let direct = LifecycleManager::new(inner.clone(), LifecycleConfig::default());
    direct
        .process_fact(USER, &FactCandidate::new("Marcus", Predicate::WorksAt, "Acme"), None)
        .await?;

    let (gated, reached, release) = GatedStore::new(inner.clone());
    let slow = LifecycleManager::new(gated, LifecycleConfig::default());
    let append = tokio::spawn(async move {
        let detail = FactCandidate::new("Marcus", Predicate::WorksAt, "Acme Berlin office");
        slow.process_fact(USER, &detail, None).await
    });

    reached.notified().await;
    let moved = direct
        .process_fact(USER, &FactCandidate::new("Marcus", Predicate::WorksAt, "Notion"), None)
        .await?;
    assert_eq!(moved.operation, MemoryOperation::update(UpdateStrategy::Supersede));
    release.notify_one();

    let appended = append
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    assert_eq!(appended.operation, MemoryOperation::update(UpdateStrategy::Supersede));

    let current = current_rows(inner.all_facts(USER).await, Predicate::WorksAt);
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].object_text, "Acme Berlin office");
    assert_eq!(current[0].version, 3);
    Ok(())
}

#[tokio::test]
async fn test_soft_delete_racing_supersede_keeps_one_current() -> Result<()> {
    let inner = Arc::new(InMemoryStore::new());
    let direct = LifecycleManager::new(inner.clone(), LifecycleConfig::default());
    let added = direct
        .process_fact(USER, &FactCandidate::new("Marcus", Predicate::WorksAt, "Acme"), None)
        .await?;
    let acme_id = added
        .record_id
        .clone()
        .ok_or_else(|| Error::NotFound("Acme fact".into()))?;

    let (gated, reached, release) = GatedStore::new(inner.clone());
    let slow = LifecycleManager::new(gated, LifecycleConfig::default());
    let target = acme_id.clone();
    let delete = tokio::spawn(async move { slow.delete_fact(USER, &target, false).await });

    reached.notified().await;
    direct
        .process_fact(USER, &FactCandidate::new("Marcus", Predicate::WorksAt, "Notion"), None)
        .await?;
    release.notify_one();
    delete
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

    let current = current_rows(inner.all_facts(USER).await, Predicate::WorksAt);
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].object_text, "Notion");
    assert_eq!(current[0].status, FactStatus::Active);

    let acme = inner.get_fact(USER, &acme_id).await?;
    assert_eq!(acme.map(|f| (f.is_current, f.status)), Some((false, FactStatus::Inactive)));
    Ok(())
}

/// More entities than one sweep page: the low-importance tail is still
/// reached.
#[tokio::test]
async fn test_sweeps_reach_every_page() -> Result<()> {
    let (store, layer) = layer();
    let now = Utc::now();
    for i in 0..1000 {
        let colleague = Entity::new(USER, format!("Colleague {}", i), EntityType::Person)
            .with_importance(ImportanceTier::High);
        store.insert_entity(&colleague).await?;
    }
    let mut stale = Entity::new(USER, "Old acquaintance", EntityType::Person)
        .with_importance(ImportanceTier::Trivial);
    stale.importance_score = 0.01;
    stale.updated_at = now - Duration::days(400);
    store.insert_entity(&stale).await?;

    let cleanup = layer.lifecycle.run_cleanup_sweep(USER, now).await?;
    assert_eq!(cleanup.examined, 1001);
    assert_eq!(cleanup.changed, 1);
    let status = store.get_entity(USER, &stale.id).await?.map(|e| e.status);
    assert_eq!(status, Some(EntityStatus::Archived));

    let decay = layer.lifecycle.run_decay_sweep(USER, now).await?;
    assert_eq!(decay.examined, 1000);
    assert_eq!(decay.changed, 0);
    Ok(())
}

/// Decay depends on elapsed time, not on how often the sweep runs.
#[tokio::test]
async fn test_decay_sweep_is_idempotent_at_one_instant() -> Result<()> {
    let (store, layer) = layer();
    let now = Utc::now();
    let mut buddy = Entity::new(USER, "Conference buddy", EntityType::Person);
    buddy.updated_at = now - Duration::days(40);
    store.insert_entity(&buddy).await?;

    let first = layer.lifecycle.run_decay_sweep(USER, now).await?;
    assert_eq!(first.changed, 1);
    for _ in 0..6 {
        let again = layer.lifecycle.run_decay_sweep(USER, now).await?;
        assert_eq!(again.changed, 0);
    }

    // 26 days past the medium grace period: three whole weeks
    let score = store.get_entity(USER, &buddy.id).await?.map(|e| e.importance_score);
    let expected = 0.6 * 0.9_f64.powi(3);
    assert!(score.map(|s| (s - expected).abs() < 1e-9).unwrap_or(false));

    let next_week = layer
        .lifecycle
        .run_decay_sweep(USER, now + Duration::days(7))
        .await?;
    assert_eq!(next_week.changed, 1);
    Ok(())
}
