//! Memory layer state for Mirror.
//!
//! Holds the shared services every caller goes through: retrieval for
//! building context, lifecycle for changing memory. Cloning is cheap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::db::{EntityOrder, EntityQuery, MemoryStore, SqliteStore};
use crate::models::NoteMeta;
use crate::services::context::{ContextAssembler, RetrievalContext};
use crate::services::embeddings::{EmbeddingProvider, HashEmbeddingProvider};
use crate::services::extraction::MemoryExtractor;
use crate::services::graph::GraphService;
use crate::services::lifecycle::{CascadePlan, IngestReport, LifecycleManager, SweepReport};
use crate::services::retrieval::{RetrievalEngine, RetrievalRequest};
use crate::services::strategy::strategy_for;
use crate::services::{classify, HeuristicExtractor, TextExtractor};
use crate::{Error, Result};

/// Names offered to the mention extractor per message.
const KNOWN_NAMES_LIMIT: usize = 200;

/// Reports of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub decay: SweepReport,
    pub expiry: SweepReport,
    pub cleanup: SweepReport,
}

/// Shared memory services.
#[derive(Clone)]
pub struct MemoryLayer {
    /// Storage boundary.
    pub store: Arc<dyn MemoryStore>,
    /// Strategy-driven retrieval.
    pub retrieval: RetrievalEngine,
    /// Graph traversal.
    pub graph: GraphService,
    /// ADD/UPDATE/DELETE/NOOP decisions and sweeps.
    pub lifecycle: LifecycleManager,
    /// Prompt block rendering.
    pub assembler: ContextAssembler,
    text_extractor: Arc<dyn TextExtractor>,
    memory_extractor: Option<Arc<dyn MemoryExtractor>>,
}

impl MemoryLayer {
    /// Open the configured SQLite database and wire every service.
    pub async fn new() -> Result<Self> {
        let config = config::config();
        let store = SqliteStore::connect(&config.database.path).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Wire every service over an existing store.
    pub fn with_store(store: Arc<dyn MemoryStore>, config: &Config) -> Self {
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HashEmbeddingProvider::from_config(&config.embedding));

        let retrieval = RetrievalEngine::new(store.clone(), config.retrieval.clone())
            .with_embedder(embedder.clone());
        let lifecycle =
            LifecycleManager::new(store.clone(), config.lifecycle.clone()).with_embedder(embedder);
        let graph = GraphService::new(store.clone());

        Self {
            store,
            retrieval,
            graph,
            lifecycle,
            assembler: ContextAssembler::new(),
            text_extractor: Arc::new(HeuristicExtractor),
            memory_extractor: None,
        }
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = extractor;
        self
    }

    pub fn with_memory_extractor(mut self, extractor: Arc<dyn MemoryExtractor>) -> Self {
        self.memory_extractor = Some(extractor);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleManager) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Classify `message`, retrieve what its task type calls for, and
    /// render the result. Never fails; unavailable categories are empty.
    pub async fn build_context(&self, user_id: &str, message: &str) -> RetrievalContext {
        let task_type = classify(message);
        let known = self.known_names(user_id).await;
        let mentioned = self.text_extractor.mentioned_entities(message, &known);
        let topics = self.text_extractor.topics(message);
        let strategy = strategy_for(task_type);

        let request = RetrievalRequest::new(user_id, strategy.clone())
            .mentioning(mentioned.clone())
            .with_topics(topics.clone())
            .with_query(message);
        let result = self.retrieval.retrieve(&request).await;
        let formatted = self.assembler.assemble(&result, &topics);

        info!(
            user_id = %user_id,
            task_type = task_type.as_str(),
            mentioned = mentioned.len(),
            used = formatted.used.len(),
            "Context built"
        );

        RetrievalContext {
            task_type,
            strategy,
            mentioned,
            topics,
            result,
            formatted,
        }
    }

    /// Store the note metadata, extract candidates from `text` and route
    /// them through the lifecycle rules.
    pub async fn ingest_note(&self, user_id: &str, note: &NoteMeta, text: &str) -> Result<IngestReport> {
        let extractor = self
            .memory_extractor
            .as_ref()
            .ok_or_else(|| Error::Internal("No memory extractor configured".to_string()))?;

        self.store.upsert_note(note).await?;
        let extraction = extractor.extract(user_id, text).await?;
        debug!(
            user_id = %user_id,
            note_id = %note.id,
            candidates = extraction.candidate_count(),
            "Extraction received"
        );

        Ok(self
            .lifecycle
            .ingest_extraction(user_id, &extraction, Some(&note.id))
            .await)
    }

    /// Soft-delete a note and everything sourced only from it. The
    /// returned plan restores exactly those records.
    pub async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<CascadePlan> {
        let plan = self.lifecycle.plan_note_deletion(user_id, note_id).await?;
        self.lifecycle.apply_note_deletion(user_id, &plan).await?;
        Ok(plan)
    }

    pub async fn restore_note(&self, user_id: &str, plan: &CascadePlan) -> Result<SweepReport> {
        self.lifecycle.restore_note(user_id, plan).await
    }

    /// Decay, expiry and cleanup in that order. Meant for a scheduler.
    pub async fn run_maintenance(&self, user_id: &str, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            decay: self.lifecycle.run_decay_sweep(user_id, now).await?,
            expiry: self.lifecycle.run_expiry_sweep(user_id, now).await?,
            cleanup: self.lifecycle.run_cleanup_sweep(user_id, now).await?,
        })
    }

    /// Names and aliases of the most-mentioned entities. Best effort.
    async fn known_names(&self, user_id: &str) -> Vec<String> {
        let query = EntityQuery::new(user_id, KNOWN_NAMES_LIMIT).order_by(EntityOrder::MentionCount);
        match self.store.query_entities(&query).await {
            Ok(entities) => entities
                .into_iter()
                .flat_map(|e| std::iter::once(e.name).chain(e.aliases))
                .collect(),
            Err(e) => {
                warn!(user_id = %user_id, error_code = e.error_code(), "Failed to load known names");
                Vec::new()
            }
        }
    }
}
