//! Graph traversal over entities.
//!
//! Entities connect through connecting-predicate facts (employer, family,
//! reporting line, membership, school) and through relationship edges.
//! Traversal is breadth-first from one seed, bounded by depth and a
//! per-node fan-out cap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MAX_GRAPH_DEPTH_CEILING;
use crate::db::{EntityQuery, FactQuery, MemoryStore, RelationshipQuery};
use crate::error::Result;
use crate::models::{normalize_name, ConnectionKind, Entity, EntityType, Fact, Predicate};

/// Default cap on neighbours examined per node and per query.
pub const DEFAULT_FAN_OUT: usize = 25;

/// Service for expanding a seed entity into its neighbourhood.
#[derive(Clone)]
pub struct GraphService {
    store: Arc<dyn MemoryStore>,
    fan_out: usize,
}

/// A node in the traversal result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub depth: usize,
}

/// An edge in the traversal result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    /// Predicate, connection kind or relationship type that found the target
    pub label: String,
}

/// Traversal result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphResult {
    pub root_id: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphResult {
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

fn connecting_predicates() -> Vec<Predicate> {
    [
        ConnectionKind::Colleague,
        ConnectionKind::Direct,
        ConnectionKind::Hierarchy,
        ConnectionKind::CoMembership,
        ConnectionKind::Alumni,
    ]
    .into_iter()
    .flat_map(|kind| Predicate::with_connection(kind).iter().cloned())
    .collect()
}

impl GraphService {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Breadth-first expansion from `seed_id`.
    ///
    /// The seed sits at depth 0 and nothing beyond `max_depth` (clamped to
    /// [`MAX_GRAPH_DEPTH_CEILING`]) is expanded. Every node appears once and
    /// every edge points at a node discovered through it, so cycles can
    /// neither loop nor duplicate edges. An unknown seed gives an empty
    /// result.
    pub async fn traverse(
        &self,
        user_id: &str,
        seed_id: &str,
        max_depth: usize,
    ) -> Result<GraphResult> {
        let max_depth = max_depth.min(MAX_GRAPH_DEPTH_CEILING);
        let mut result = GraphResult {
            root_id: seed_id.to_string(),
            ..Default::default()
        };

        let seed = match self.store.get_entity(user_id, seed_id).await? {
            Some(seed) if seed.is_current() => seed,
            _ => return Ok(result),
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Entity, usize)> = VecDeque::new();

        visited.insert(seed.id.clone());
        result.nodes.push(node(&seed, 0));
        queue.push_back((seed, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            for (neighbour, label) in self.neighbours(user_id, &current).await? {
                if !visited.insert(neighbour.id.clone()) {
                    continue;
                }
                result.edges.push(GraphEdge {
                    source_id: current.id.clone(),
                    target_id: neighbour.id.clone(),
                    label,
                });
                result.nodes.push(node(&neighbour, depth + 1));
                queue.push_back((neighbour, depth + 1));
            }
        }

        debug!(
            user_id = %user_id,
            seed = %seed_id,
            nodes = result.nodes.len(),
            "Graph traversal complete"
        );

        Ok(result)
    }

    /// Traverse several seeds concurrently. Results keep seed order.
    pub async fn traverse_many(
        &self,
        user_id: &str,
        seed_ids: &[String],
        max_depth: usize,
    ) -> Vec<Result<GraphResult>> {
        join_all(
            seed_ids
                .iter()
                .map(|seed| self.traverse(user_id, seed, max_depth)),
        )
        .await
    }

    /// Direct neighbours of `entity` with the label that connects them,
    /// capped at the fan-out and deduplicated by id (first label wins).
    async fn neighbours(&self, user_id: &str, entity: &Entity) -> Result<Vec<(Entity, String)>> {
        let mut found: Vec<(String, String)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(entity.id.clone());
        let mut add = |id: &str, label: &str, found: &mut Vec<(String, String)>| {
            if seen.insert(id.to_string()) {
                found.push((id.to_string(), label.to_string()));
            }
        };

        // Outgoing connecting facts: "E works_at Acme", "E knows Sam"
        let facts = self
            .store
            .query_facts(
                &FactQuery::new(user_id, self.fan_out)
                    .for_entities(vec![entity.id.clone()])
                    .with_predicates(connecting_predicates()),
            )
            .await?;

        for fact in &facts {
            let Some(kind) = fact.predicate.connection() else {
                continue;
            };

            if let Some(object) = self.resolve_object(user_id, fact).await? {
                add(&object.id, fact.predicate.as_str(), &mut found);
            }

            if kind.shares_object() {
                // Same employer, group or school
                for peer in self.peers_sharing(user_id, kind, &fact.object_text).await? {
                    if peer.entity_id != entity.id {
                        add(&peer.entity_id, kind.as_str(), &mut found);
                    }
                }
            }
        }

        // Incoming facts naming this entity: "Sam reports_to E"
        for kind in [ConnectionKind::Direct, ConnectionKind::Hierarchy] {
            for fact in self.peers_sharing(user_id, kind, &entity.name).await? {
                add(&fact.entity_id, fact.predicate.as_str(), &mut found);
            }
        }

        // Relationship edges
        let edges = self
            .store
            .query_relationships(&RelationshipQuery::new(user_id, self.fan_out).touching(&entity.id))
            .await?;
        for edge in &edges {
            if let Some(other) = edge.other_endpoint(&entity.id) {
                add(other, edge.relationship_type.as_str(), &mut found);
            }
        }

        found.truncate(self.fan_out);
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = found.iter().map(|(id, _)| id.clone()).collect();
        let entities: HashMap<String, Entity> = self
            .store
            .query_entities(
                &EntityQuery::new(user_id, ids.len())
                    .with_ids(ids)
                    .including_historical(),
            )
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        Ok(found
            .into_iter()
            .filter_map(|(id, label)| entities.get(&id).cloned().map(|e| (e, label)))
            .collect())
    }

    /// Facts whose object equals `object_text` under any predicate of `kind`.
    async fn peers_sharing(
        &self,
        user_id: &str,
        kind: ConnectionKind,
        object_text: &str,
    ) -> Result<Vec<Fact>> {
        if normalize_name(object_text).is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .query_facts(
                &FactQuery::new(user_id, self.fan_out)
                    .with_predicates(Predicate::with_connection(kind).to_vec())
                    .with_object(object_text),
            )
            .await
    }

    /// Resolve a fact's object to an entity: linked id first, then exact
    /// normalized name, then substring match.
    async fn resolve_object(&self, user_id: &str, fact: &Fact) -> Result<Option<Entity>> {
        if let Some(id) = &fact.object_entity_id {
            if let Some(entity) = self.store.get_entity(user_id, id).await? {
                if entity.is_current() {
                    return Ok(Some(entity));
                }
            }
        }

        let name = normalize_name(&fact.object_text);
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(entity) = self.store.find_current_entity(user_id, &name).await? {
            return Ok(Some(entity));
        }

        let fuzzy = self
            .store
            .query_entities(
                &EntityQuery::new(user_id, 1)
                    .named(&[fact.object_text.clone()])
                    .including_historical(),
            )
            .await?;
        Ok(fuzzy.into_iter().next())
    }
}

fn node(entity: &Entity, depth: usize) -> GraphNode {
    GraphNode {
        id: entity.id.clone(),
        name: entity.name.clone(),
        entity_type: entity.entity_type,
        depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::models::{Relationship, RelationshipType};

    async fn person(store: &InMemoryStore, name: &str) -> Entity {
        let e = Entity::new("u1", name, EntityType::Person);
        store.insert_entity(&e).await.unwrap();
        e
    }

    #[tokio::test]
    async fn test_colleagues_found_through_shared_employer() {
        let store = Arc::new(InMemoryStore::new());
        let marcus = person(&store, "Marcus").await;
        let priya = person(&store, "Priya").await;
        let acme = Entity::new("u1", "Acme", EntityType::Organization);
        store.insert_entity(&acme).await.unwrap();
        for who in [&marcus, &priya] {
            let fact = Fact::new("u1", &who.id, Predicate::WorksAt, "acme");
            store
                .write_fact(&crate::db::FactWrite { retire: None, insert: fact })
                .await
                .unwrap();
        }

        let graph = GraphService::new(store.clone());
        let result = graph.traverse("u1", &marcus.id, 1).await.unwrap();

        let labels: HashMap<String, String> = result
            .edges
            .iter()
            .map(|e| (e.target_id.clone(), e.label.clone()))
            .collect();
        assert_eq!(labels.get(&acme.id).map(String::as_str), Some("works_at"));
        assert_eq!(labels.get(&priya.id).map(String::as_str), Some("colleague"));
        assert_eq!(result.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_depth_zero_returns_only_seed() {
        let store = Arc::new(InMemoryStore::new());
        let a = person(&store, "A").await;
        let b = person(&store, "B").await;
        let rel = Relationship::new("u1", &a.id, &b.id, RelationshipType::FriendOf, 0.9);
        store.upsert_relationship(&rel).await.unwrap();

        let graph = GraphService::new(store.clone());
        let result = graph.traverse("u1", &a.id, 0).await.unwrap();
        assert_eq!(result.node_ids(), vec![a.id.clone()]);
        assert!(result.edges.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_seed_is_empty() {
        let store = Arc::new(InMemoryStore::new());
        let graph = GraphService::new(store);
        let result = graph.traverse("u1", "missing", 3).await.unwrap();
        assert!(result.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_hierarchy_fact_connects_manager_to_report() {
        let store = Arc::new(InMemoryStore::new());
        let dana = person(&store, "Dana").await;
        let sam = person(&store, "Sam").await;
        let fact = Fact::new("u1", &sam.id, Predicate::ReportsTo, "Dana");
        store
            .write_fact(&crate::db::FactWrite { retire: None, insert: fact })
            .await
            .unwrap();

        let graph = GraphService::new(store.clone());
        let from_manager = graph.traverse("u1", &dana.id, 1).await.unwrap();
        assert!(from_manager.node_ids().contains(&sam.id));
    }
}
