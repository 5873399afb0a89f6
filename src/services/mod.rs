//! Service layer for Mirror.
//!
//! Contains the retrieval pipeline and the memory lifecycle:
//! - Classifier (task type, mentioned entities, topics)
//! - Strategy (per-task retrieval plans)
//! - Retrieval (concurrent category fetches with graceful degradation)
//! - Scoring (composite relevance over similarity, importance, recency, access)
//! - Graph (bounded breadth-first expansion)
//! - Context (prompt block and audit list)
//! - Extraction (candidate records from the extraction collaborator)
//! - Lifecycle (ADD/UPDATE/DELETE/NOOP decisions, sweeps, note cascade)
//! - Decay (importance decay and staleness)
//! - Embeddings (vector provider boundary)

pub mod classifier;
pub mod context;
pub mod decay;
pub mod embeddings;
pub mod extraction;
pub mod graph;
pub mod lifecycle;
pub mod retrieval;
pub mod scoring;
pub mod strategy;

pub use classifier::{classify, HeuristicExtractor, TaskType, TextExtractor};
pub use context::{ContextAssembler, ContextItemType, ContextUsed, FormattedContext, RetrievalContext};
pub use embeddings::{EmbeddingProvider, HashEmbeddingProvider};
pub use extraction::{ExtractionResult, MemoryExtractor};
pub use graph::{GraphResult, GraphService};
pub use lifecycle::{
    CascadePlan, DecisionProvider, IngestReport, LifecycleManager, MemoryOperation,
    OperationRecord, RuleBasedDecider, SweepReport, UpdateStrategy,
};
pub use retrieval::{RetrievalEngine, RetrievalRequest, RetrievalResult};
pub use scoring::{RelevanceScorer, ScoreOptions, ScoredCandidate};
pub use strategy::{strategy_for, Strategy, SubStrategy};
