//! Retrieval engine.
//!
//! Runs one bounded query per memory category for a strategy. The five
//! category fetches are independent and run concurrently; a category whose
//! store fails degrades to an empty list so the caller always gets a
//! result.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::db::{
    BehaviorQuery, EntityOrder, EntityQuery, FactOrder, FactQuery, MemoryStore, NoteQuery,
    PatternQuery,
};
use crate::error::Result;
use crate::models::{
    Behavior, Entity, EntityType, Fact, NoteMeta, Pattern, SensitivityLevel,
};

use super::embeddings::EmbeddingProvider;
use super::graph::GraphService;
use super::scoring::{RelevanceScorer, ScoreOptions, ScoredCandidate};
use super::strategy::{CategoryPlan, Strategy, SubStrategy};

/// Minimum confidence for the `relevant` fact and pattern sub-strategy.
pub const RELEVANT_MIN_CONFIDENCE: f64 = 0.6;

/// Minimum confidence for the `high_confidence` sub-strategy.
pub const HIGH_CONFIDENCE_MIN: f64 = 0.7;

/// Rows considered by semantic matching before scoring.
const SEMANTIC_CANDIDATE_POOL: usize = 500;

/// Inputs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub user_id: String,
    pub strategy: Strategy,
    /// Names mentioned in the message
    pub mentioned: Vec<String>,
    pub topics: Vec<String>,
    /// Message text, used for semantic matching when a provider is set
    pub query: Option<String>,
}

impl RetrievalRequest {
    pub fn new(user_id: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            user_id: user_id.into(),
            strategy,
            mentioned: Vec::new(),
            topics: Vec::new(),
            query: None,
        }
    }

    pub fn mentioning(mut self, names: Vec<String>) -> Self {
        self.mentioned = names;
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Raw candidates per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub entities: Vec<Entity>,
    pub facts: Vec<Fact>,
    pub notes: Vec<NoteMeta>,
    pub patterns: Vec<Pattern>,
    pub behaviors: Vec<Behavior>,
    /// Display names of fact subjects, keyed by entity id
    #[serde(default)]
    pub subject_names: HashMap<String, String>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.facts.is_empty()
            && self.notes.is_empty()
            && self.patterns.is_empty()
            && self.behaviors.is_empty()
    }

    /// Display name for a fact's subject.
    pub fn subject_name(&self, entity_id: &str) -> Option<&str> {
        self.subject_names.get(entity_id).map(String::as_str)
    }
}

/// Await a category fetch, degrading failures to an empty list and
/// enforcing the cap.
async fn settle<T, F>(category: &'static str, user_id: &str, limit: usize, fetch: F) -> Vec<T>
where
    F: Future<Output = Result<Vec<T>>>,
{
    match fetch.await {
        Ok(mut rows) => {
            rows.truncate(limit);
            rows
        }
        Err(e) => {
            warn!(
                category,
                user_id = %user_id,
                error_code = e.error_code(),
                "Category fetch failed, continuing without it"
            );
            Vec::new()
        }
    }
}

/// Strategy-driven fetcher over a [`MemoryStore`].
#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn MemoryStore>,
    graph: GraphService,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    scorer: RelevanceScorer,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn MemoryStore>, config: RetrievalConfig) -> Self {
        Self {
            graph: GraphService::new(store.clone()),
            store,
            embedder: None,
            scorer: RelevanceScorer::new(),
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Fetch every category of `request.strategy`.
    ///
    /// Never fails: a category whose fetch errors comes back empty.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult {
        let strategy = request.strategy.clone().capped(self.config.max_category_limit);
        let user_id = request.user_id.as_str();
        let now = Utc::now();

        let (entities, facts, notes, patterns, behaviors) = tokio::join!(
            settle(
                "entities",
                user_id,
                strategy.entities.limit,
                self.fetch_entities(request, strategy.entities, now),
            ),
            settle(
                "facts",
                user_id,
                strategy.facts.limit,
                self.fetch_facts(request, strategy.facts),
            ),
            settle(
                "notes",
                user_id,
                strategy.notes.limit,
                self.fetch_notes(request, strategy.notes),
            ),
            settle(
                "patterns",
                user_id,
                strategy.patterns.limit,
                self.fetch_patterns(request, strategy.patterns),
            ),
            settle(
                "behaviors",
                user_id,
                strategy.behaviors.limit,
                self.fetch_behaviors(request, strategy.behaviors.limit),
            ),
        );

        let mut result = RetrievalResult {
            entities,
            facts,
            notes,
            patterns,
            behaviors,
            subject_names: HashMap::new(),
        };

        self.resolve_subject_names(user_id, &mut result).await;
        self.record_access(user_id, &result.entities, now).await;

        debug!(
            user_id = %user_id,
            task = %strategy.task_type,
            entities = result.entities.len(),
            facts = result.facts.len(),
            notes = result.notes.len(),
            patterns = result.patterns.len(),
            behaviors = result.behaviors.len(),
            "Retrieval complete"
        );

        result
    }

    /// Semantic match over the user's entity-table records, ranked by the
    /// composite score.
    ///
    /// Without an embedding provider every candidate gets neutral
    /// similarity and ranking falls back to importance, recency and access.
    pub async fn match_entities(
        &self,
        user_id: &str,
        query_text: &str,
        options: &ScoreOptions,
    ) -> Result<Vec<ScoredCandidate<Entity>>> {
        let query_vector = match &self.embedder {
            Some(embedder) if !query_text.trim().is_empty() => Some(embedder.embed(query_text).await?),
            _ => None,
        };

        let candidates = self
            .store
            .query_entities(
                &EntityQuery::new(user_id, SEMANTIC_CANDIDATE_POOL)
                    .including_historical()
                    .visible_at(Utc::now(), !options.include_expired)
                    .max_sensitivity(options.max_sensitivity),
            )
            .await?;

        Ok(self
            .scorer
            .rank(candidates, query_vector.as_deref(), options, Utc::now()))
    }

    /// Score options matching this engine's configuration.
    pub fn score_options(&self, limit: usize) -> ScoreOptions {
        ScoreOptions {
            similarity_threshold: self.config.similarity_threshold,
            include_expired: !self.config.exclude_expired,
            limit,
            ..ScoreOptions::default()
        }
    }

    // ========================================================================
    // Category fetches
    // ========================================================================

    async fn fetch_entities(
        &self,
        request: &RetrievalRequest,
        plan: CategoryPlan,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entity>> {
        if !plan.is_enabled() {
            return Ok(Vec::new());
        }
        let user_id = request.user_id.as_str();
        let mentioned = &request.mentioned;
        let base = self.visible_entities(user_id, plan.limit, now);

        let rows = match plan.sub {
            SubStrategy::MentionedOnly if !mentioned.is_empty() => {
                self.store.query_entities(&base.named(mentioned)).await?
            }
            SubStrategy::MentionedPlusRelated if !mentioned.is_empty() => {
                let found = self.store.query_entities(&base.named(mentioned)).await?;
                self.with_related(user_id, found, plan.limit, now).await?
            }
            SubStrategy::SupportiveRelationships => {
                self.store
                    .query_entities(
                        &base
                            .of_types(&[EntityType::Person])
                            .order_by(EntityOrder::MentionCount),
                    )
                    .await?
            }
            SubStrategy::RelevantPeople => {
                let people = base.of_types(&[EntityType::Person]);
                let query = if mentioned.is_empty() {
                    people
                } else {
                    people.named(mentioned)
                };
                self.store.query_entities(&query).await?
            }
            SubStrategy::BroadSearch => match (&self.embedder, &request.query) {
                (Some(_), Some(text)) => self
                    .match_entities(user_id, text, &self.score_options(plan.limit))
                    .await?
                    .into_iter()
                    .map(|scored| scored.item)
                    .collect(),
                _ => self.store.query_entities(&base).await?,
            },
            SubStrategy::Recent => {
                self.store
                    .query_entities(&base.order_by(EntityOrder::RecentlyUpdated))
                    .await?
            }
            // Nothing mentioned, or an ordering-only plan
            _ => self.store.query_entities(&base).await?,
        };

        Ok(rows)
    }

    /// Append direct graph neighbours of `found` until `limit`.
    async fn with_related(
        &self,
        user_id: &str,
        mut found: Vec<Entity>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entity>> {
        if found.len() >= limit || found.is_empty() {
            return Ok(found);
        }

        let seeds: Vec<String> = found.iter().map(|e| e.id.clone()).collect();
        let mut seen: HashSet<String> = seeds.iter().cloned().collect();
        let mut related: Vec<String> = Vec::new();

        for traversal in self.graph.traverse_many(user_id, &seeds, 1).await {
            match traversal {
                Ok(graph) => {
                    for node in graph.nodes {
                        if seen.insert(node.id.clone()) {
                            related.push(node.id);
                        }
                    }
                }
                Err(e) => {
                    debug!(user_id = %user_id, error_code = e.error_code(), "Skipping related entities");
                }
            }
        }

        related.truncate(limit - found.len());
        if related.is_empty() {
            return Ok(found);
        }

        let neighbours = self
            .store
            .query_entities(&self.visible_entities(user_id, related.len(), now).with_ids(related))
            .await?;
        found.extend(neighbours);
        Ok(found)
    }

    async fn fetch_facts(&self, request: &RetrievalRequest, plan: CategoryPlan) -> Result<Vec<Fact>> {
        if !plan.is_enabled() {
            return Ok(Vec::new());
        }
        let user_id = request.user_id.as_str();
        let entity_ids = self.resolve_mentioned(user_id, &request.mentioned).await?;
        let scoped = |query: FactQuery| {
            if entity_ids.is_empty() {
                query
            } else {
                query.for_entities(entity_ids.clone())
            }
        };
        let base = FactQuery::new(user_id, plan.limit);

        let query = match plan.sub {
            SubStrategy::AllForEntity
            | SubStrategy::MentionedOnly
            | SubStrategy::MentionedPlusRelated => {
                if entity_ids.is_empty() {
                    return Ok(Vec::new());
                }
                base.for_entities(entity_ids.clone())
            }
            SubStrategy::Relevant => scoped(base.min_confidence(RELEVANT_MIN_CONFIDENCE)),
            SubStrategy::HighConfidence => scoped(base.min_confidence(HIGH_CONFIDENCE_MIN)),
            SubStrategy::Recent => scoped(base.order_by(FactOrder::Recent)),
            _ => scoped(base),
        };

        let mut facts = self.store.query_facts(&query).await?;
        facts.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(facts)
    }

    /// Note matching only ever looks at title and category.
    async fn fetch_notes(
        &self,
        request: &RetrievalRequest,
        plan: CategoryPlan,
    ) -> Result<Vec<NoteMeta>> {
        if !plan.is_enabled() {
            return Ok(Vec::new());
        }
        let terms: Vec<String> = request
            .mentioned
            .iter()
            .chain(request.topics.iter())
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect();

        let query = NoteQuery::new(&request.user_id, plan.limit);
        let query = match plan.sub {
            SubStrategy::Recent => query,
            _ if terms.is_empty() => query,
            _ => query.matching(&terms),
        };
        self.store.query_notes(&query).await
    }

    async fn fetch_patterns(
        &self,
        request: &RetrievalRequest,
        plan: CategoryPlan,
    ) -> Result<Vec<Pattern>> {
        if !plan.is_enabled() {
            return Ok(Vec::new());
        }
        let base = PatternQuery::new(&request.user_id, plan.limit);

        match plan.sub {
            SubStrategy::HighConfidence => {
                self.store
                    .query_patterns(&base.min_confidence(HIGH_CONFIDENCE_MIN))
                    .await
            }
            SubStrategy::Relevant => {
                self.store
                    .query_patterns(&base.min_confidence(RELEVANT_MIN_CONFIDENCE))
                    .await
            }
            SubStrategy::Recent => {
                // Store orders by confidence; widen the window, then reorder
                let window = PatternQuery::new(&request.user_id, self.config.max_category_limit);
                let mut rows = self.store.query_patterns(&window).await?;
                rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                rows.truncate(plan.limit);
                Ok(rows)
            }
            _ => self.store.query_patterns(&base).await,
        }
    }

    /// Behaviors for mentioned entities first, then the highest-confidence
    /// ones, one per (predicate, entity).
    async fn fetch_behaviors(
        &self,
        request: &RetrievalRequest,
        limit: usize,
    ) -> Result<Vec<Behavior>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let user_id = request.user_id.as_str();
        let entity_ids = self.resolve_mentioned(user_id, &request.mentioned).await?;

        let mut behaviors = Vec::new();
        if !entity_ids.is_empty() {
            behaviors = self
                .store
                .query_behaviors(&BehaviorQuery::new(user_id, limit).for_entities(entity_ids))
                .await?;
        }
        if behaviors.len() < limit {
            let top = self
                .store
                .query_behaviors(&BehaviorQuery::new(user_id, limit))
                .await?;
            behaviors.extend(top);
        }

        let mut seen = HashSet::new();
        behaviors.retain(|b| seen.insert(b.key()));
        behaviors.truncate(limit);
        Ok(behaviors)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Ids of current entities matching any mentioned name.
    async fn resolve_mentioned(&self, user_id: &str, mentioned: &[String]) -> Result<Vec<String>> {
        if mentioned.is_empty() {
            return Ok(Vec::new());
        }
        let entities = self
            .store
            .query_entities(&EntityQuery::new(user_id, self.config.max_category_limit).named(mentioned))
            .await?;
        Ok(entities.into_iter().map(|e| e.id).collect())
    }

    /// Entity query hiding future-dated, expired (per config) and private
    /// rows. The store filters before applying `limit`.
    fn visible_entities(&self, user_id: &str, limit: usize, now: DateTime<Utc>) -> EntityQuery {
        EntityQuery::new(user_id, limit)
            .visible_at(now, self.config.exclude_expired)
            .max_sensitivity(SensitivityLevel::Sensitive)
    }

    async fn resolve_subject_names(&self, user_id: &str, result: &mut RetrievalResult) {
        for entity in &result.entities {
            result
                .subject_names
                .insert(entity.id.clone(), entity.name.clone());
        }

        let missing: Vec<String> = result
            .facts
            .iter()
            .map(|f| f.entity_id.clone())
            .filter(|id| !result.subject_names.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return;
        }

        let query = EntityQuery::new(user_id, missing.len())
            .with_ids(missing)
            .including_historical();
        match self.store.query_entities(&query).await {
            Ok(subjects) => {
                for subject in subjects {
                    result.subject_names.insert(subject.id, subject.name);
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error_code = e.error_code(), "Failed to resolve fact subjects");
            }
        }
    }

    async fn record_access(&self, user_id: &str, entities: &[Entity], now: DateTime<Utc>) {
        if entities.is_empty() {
            return;
        }
        let ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        if let Err(e) = self.store.record_entity_access(user_id, &ids, now).await {
            warn!(user_id = %user_id, error_code = e.error_code(), "Failed to record entity access");
        }
    }
}
