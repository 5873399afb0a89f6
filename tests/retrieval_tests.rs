//! Integration tests for context building.
//!
//! Exercises classification, strategy caps, visibility filters, graph
//! traversal and degraded stores through the public memory layer.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rstest::rstest;

use common::{layer, seed_entity, seed_fact, USER};
use mirror::config::RetrievalConfig;
use mirror::db::{InMemoryStore, MemoryStore, Table};
use mirror::models::{
    Entity, EntityType, ImportanceTier, NoteMeta, Predicate, Relationship, RelationshipType,
    SensitivityLevel,
};
use mirror::services::context::ContextItemType;
use mirror::services::graph::GraphService;
use mirror::services::retrieval::{RetrievalEngine, RetrievalRequest};
use mirror::services::strategy::strategy_for;
use mirror::services::TaskType;
use mirror::Result;

// ============================================================================
// Classification
// ============================================================================

#[rstest]
#[case("Should I take the offer from Notion?", TaskType::Decision)]
#[case("I feel so overwhelmed today", TaskType::Emotional)]
#[case("Had a fight with my sister again", TaskType::Relationship)]
#[case("Help me plan next week", TaskType::Planning)]
#[case("Looking back on this year", TaskType::Reflection)]
#[case("What if I moved abroad", TaskType::Exploration)]
#[case("Who is Marcus?", TaskType::KnowledgeQuery)]
#[case("Nice weather out", TaskType::General)]
#[tokio::test]
async fn test_context_reports_task_type(#[case] message: &str, #[case] expected: TaskType) {
    let (_store, layer) = layer();
    let context = layer.build_context(USER, message).await;
    assert_eq!(context.task_type, expected);
    assert_eq!(context.strategy.task_type, expected);
}

// ============================================================================
// Caps and ordering
// ============================================================================

/// 200 stored facts, a 20-fact plan: at most 20 come back, best first.
#[tokio::test]
async fn test_fact_cap_is_enforced_in_confidence_order() -> Result<()> {
    let (store, layer) = layer();
    let marcus = seed_entity(store.as_ref(), "Marcus", EntityType::Person).await?;
    for i in 0..200 {
        let confidence = 0.6 + (i % 40) as f64 * 0.01;
        seed_fact(
            store.as_ref(),
            &marcus,
            Predicate::Likes,
            &format!("hobby {}", i),
            confidence,
        )
        .await?;
    }

    let context = layer
        .build_context(USER, "Should I ask Marcus to mentor me?")
        .await;
    assert_eq!(context.task_type, TaskType::Decision);

    let facts = &context.result.facts;
    assert!(!facts.is_empty());
    assert!(facts.len() <= 20);
    assert!(facts.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    assert!(facts.iter().all(|f| f.confidence >= 0.6));
    Ok(())
}

#[tokio::test]
async fn test_category_limit_ceiling_caps_every_plan() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let marcus = seed_entity(store.as_ref(), "Marcus", EntityType::Person).await?;
    for i in 0..50 {
        seed_fact(store.as_ref(), &marcus, Predicate::Expertise, &format!("skill {}", i), 0.9).await?;
    }
    let config = RetrievalConfig {
        max_category_limit: 7,
        ..Default::default()
    };
    let engine = RetrievalEngine::new(store.clone(), config);

    let request = RetrievalRequest::new(USER, strategy_for(TaskType::KnowledgeQuery))
        .mentioning(vec!["Marcus".to_string()]);
    let result = engine.retrieve(&request).await;
    assert_eq!(result.facts.len(), 7);
    Ok(())
}

// ============================================================================
// Visibility
// ============================================================================

#[rstest]
#[case(true, false)]
#[case(false, true)]
#[tokio::test]
async fn test_expired_entities_follow_config(
    #[case] exclude_expired: bool,
    #[case] expect_expired: bool,
) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let mut trip = Entity::new(USER, "Lisbon trip", EntityType::Other);
    trip.expires_at = Some(Utc::now() - Duration::days(2));
    store.insert_entity(&trip).await?;
    let porto = seed_entity(store.as_ref(), "Porto", EntityType::Place).await?;

    let config = RetrievalConfig {
        exclude_expired,
        ..Default::default()
    };
    let engine = RetrievalEngine::new(store.clone(), config);
    let request = RetrievalRequest::new(USER, strategy_for(TaskType::Decision))
        .mentioning(vec!["Lisbon trip".to_string(), "Porto".to_string()]);
    let result = engine.retrieve(&request).await;

    let ids: Vec<&str> = result.entities.iter().map(|e| e.id.as_str()).collect();
    assert!(ids.contains(&porto.id.as_str()));
    assert_eq!(ids.contains(&trip.id.as_str()), expect_expired);
    Ok(())
}

/// Rows retrieval would hide must not take up the cap ahead of visible
/// ones.
#[tokio::test]
async fn test_hidden_entities_do_not_use_up_the_cap() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    for i in 0..10 {
        let mut gone = Entity::new(USER, format!("Past event {}", i), EntityType::Other)
            .with_importance(ImportanceTier::Critical);
        gone.expires_at = Some(now - Duration::days(1));
        store.insert_entity(&gone).await?;
    }
    for i in 0..3 {
        let mut secret = Entity::new(USER, format!("Secret {}", i), EntityType::Other)
            .with_importance(ImportanceTier::High);
        secret.sensitivity = SensitivityLevel::Private;
        store.insert_entity(&secret).await?;
    }
    let mut upcoming = Entity::new(USER, "Wedding", EntityType::Other)
        .with_importance(ImportanceTier::Critical);
    upcoming.effective_from = Some(now + Duration::days(30));
    store.insert_entity(&upcoming).await?;
    let porto = Entity::new(USER, "Porto", EntityType::Place).with_importance(ImportanceTier::Low);
    store.insert_entity(&porto).await?;

    let engine = RetrievalEngine::new(store.clone(), RetrievalConfig::default());
    let request = RetrievalRequest::new(USER, strategy_for(TaskType::Reflection));
    let result = engine.retrieve(&request).await;

    let ids: Vec<&str> = result.entities.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![porto.id.as_str()]);
    Ok(())
}

#[tokio::test]
async fn test_future_dated_entities_are_hidden() -> Result<()> {
    let (store, layer) = layer();
    let mut wedding = Entity::new(USER, "Wedding", EntityType::Other);
    wedding.effective_from = Some(Utc::now() + Duration::days(30));
    store.insert_entity(&wedding).await?;

    let context = layer
        .build_context(USER, "Should I give a speech at the Wedding?")
        .await;
    assert!(context.result.entities.iter().all(|e| e.id != wedding.id));
    Ok(())
}

// ============================================================================
// Graph
// ============================================================================

/// A-B-C-A cycle, traversed far deeper than it is: three nodes, once each.
#[tokio::test]
async fn test_traversal_terminates_on_cycle() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let a = seed_entity(store.as_ref(), "Ana", EntityType::Person).await?;
    let b = seed_entity(store.as_ref(), "Ben", EntityType::Person).await?;
    let c = seed_entity(store.as_ref(), "Cleo", EntityType::Person).await?;
    for (x, y) in [(&a, &b), (&b, &c), (&c, &a)] {
        let edge = Relationship::new(USER, &x.id, &y.id, RelationshipType::FriendOf, 0.9);
        store.upsert_relationship(&edge).await?;
    }

    let graph = GraphService::new(store.clone());
    let result = graph.traverse(USER, &a.id, 5).await?;

    let mut ids = result.node_ids();
    ids.sort();
    ids.dedup();
    assert_eq!(result.nodes.len(), 3);
    assert_eq!(ids.len(), 3);
    assert_eq!(result.edges.len(), 2);

    // Depth beyond the ceiling is clamped, not rejected
    let deep = graph.traverse(USER, &a.id, 50).await?;
    assert_eq!(deep.nodes.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_traverse_many_keeps_seed_order() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let a = seed_entity(store.as_ref(), "Ana", EntityType::Person).await?;
    let b = seed_entity(store.as_ref(), "Ben", EntityType::Person).await?;

    let graph = GraphService::new(store.clone());
    let results = graph
        .traverse_many(USER, &[b.id.clone(), "missing".to_string(), a.id.clone()], 2)
        .await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().map(|r| r.root_id.clone()).ok(), Some(b.id.clone()));
    assert!(results[1].as_ref().map(|r| r.nodes.is_empty()).unwrap_or(false));
    assert_eq!(results[2].as_ref().map(|r| r.root_id.clone()).ok(), Some(a.id.clone()));
    Ok(())
}

// ============================================================================
// Degradation and assembly
// ============================================================================

#[tokio::test]
async fn test_failed_categories_degrade_to_empty() -> Result<()> {
    let (store, layer) = layer();
    let marcus = seed_entity(store.as_ref(), "Marcus", EntityType::Person).await?;
    seed_fact(store.as_ref(), &marcus, Predicate::WorksAt, "Acme", 0.9).await?;
    store.fail_table(Table::Facts).await;
    store.fail_table(Table::Notes).await;

    let context = layer
        .build_context(USER, "Should I ask Marcus for a referral?")
        .await;
    assert!(context.result.facts.is_empty());
    assert!(context.result.notes.is_empty());
    assert!(context.result.entities.iter().any(|e| e.id == marcus.id));
    assert!(context.text().contains("## People and things"));
    assert!(!context.text().contains("## Facts"));

    store.heal_table(Table::Facts).await;
    let healed = layer
        .build_context(USER, "Should I ask Marcus for a referral?")
        .await;
    assert_eq!(healed.result.facts.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_context_block_and_audit_list() -> Result<()> {
    let (store, layer) = layer();
    let marcus = seed_entity(store.as_ref(), "Marcus", EntityType::Person).await?;
    seed_fact(store.as_ref(), &marcus, Predicate::WorksAt, "Acme", 0.9).await?;
    store
        .upsert_note(&NoteMeta::new(USER, Some("Marcus 1:1".into()), Some("work".into())))
        .await?;

    let context = layer
        .build_context(USER, "Should I tell Marcus about the offer?")
        .await;

    assert!(context.mentioned.iter().any(|m| m == "Marcus"));
    let text = context.text();
    assert!(text.contains("- Marcus works at: Acme"));
    assert!(text.contains("\"Marcus 1:1\" (work)"));

    let kinds: Vec<ContextItemType> = context.used().iter().map(|u| u.item_type).collect();
    assert!(kinds.contains(&ContextItemType::Entity));
    assert!(kinds.contains(&ContextItemType::Fact));
    assert!(kinds.contains(&ContextItemType::Note));
    Ok(())
}

#[tokio::test]
async fn test_retrieval_is_scoped_per_user() -> Result<()> {
    let (store, layer) = layer();
    let other = Entity::new("someone-else", "Marcus", EntityType::Person);
    store.insert_entity(&other).await?;

    let context = layer.build_context(USER, "Should I call Marcus?").await;
    assert!(context.result.entities.is_empty());
    assert!(!context.text().contains("Marcus"));
    Ok(())
}
