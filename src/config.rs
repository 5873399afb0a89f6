//! Configuration management for Mirror.
//!
//! Loads configuration from environment variables (after reading a `.env`
//! file if present). Components take the section they need through their
//! constructors; the global accessor exists for binaries that embed the
//! memory layer.

use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Hard ceiling for graph traversal depth regardless of configuration.
pub const MAX_GRAPH_DEPTH_CEILING: usize = 5;

/// Hard ceiling for any per-category result cap.
pub const MAX_CATEGORY_LIMIT_CEILING: usize = 200;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub retrieval: RetrievalConfig,
    pub lifecycle: LifecycleConfig,
    pub embedding: EmbeddingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/mirror.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default traversal depth (clamped to [`MAX_GRAPH_DEPTH_CEILING`])
    pub max_graph_depth: usize,
    /// Upper bound applied to every strategy cap
    pub max_category_limit: usize,
    /// Minimum rescaled cosine similarity for semantic matches
    pub similarity_threshold: f64,
    /// Exclude records whose `expires_at` has passed
    pub exclude_expired: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_graph_depth: 3,
            max_category_limit: 50,
            similarity_threshold: 0.5,
            exclude_expired: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Candidates below this confidence are not stored
    pub min_fact_confidence: f64,
    /// Window inside which reconfirming a relationship strengthens it
    pub relationship_lookback_days: i64,
    /// Compare-and-swap retries for a contended fact slot
    pub max_write_attempts: u32,
    /// Importance score below which stale records are archived
    pub importance_floor: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_fact_confidence: 0.5,
            relationship_lookback_days: 90,
            max_write_attempts: 3,
            importance_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        // Hash placeholder dimension
        Self { dimension: 384 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "mirror=info".to_string(),
            json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to defaults; limits are clamped to
    /// their hard ceilings.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str, default: String| lookup(key).unwrap_or(default);

        Self {
            database: DatabaseConfig {
                path: get("MIRROR_DATABASE_PATH", defaults.database.path),
            },
            retrieval: RetrievalConfig {
                max_graph_depth: parse_or(
                    lookup("MIRROR_MAX_GRAPH_DEPTH"),
                    defaults.retrieval.max_graph_depth,
                )
                .min(MAX_GRAPH_DEPTH_CEILING),
                max_category_limit: parse_or(
                    lookup("MIRROR_MAX_CATEGORY_LIMIT"),
                    defaults.retrieval.max_category_limit,
                )
                .clamp(1, MAX_CATEGORY_LIMIT_CEILING),
                similarity_threshold: parse_or(
                    lookup("MIRROR_SIMILARITY_THRESHOLD"),
                    defaults.retrieval.similarity_threshold,
                )
                .clamp(0.0, 1.0),
                exclude_expired: parse_or(
                    lookup("MIRROR_EXCLUDE_EXPIRED"),
                    defaults.retrieval.exclude_expired,
                ),
            },
            lifecycle: LifecycleConfig {
                min_fact_confidence: parse_or(
                    lookup("MIRROR_MIN_FACT_CONFIDENCE"),
                    defaults.lifecycle.min_fact_confidence,
                )
                .clamp(0.0, 1.0),
                relationship_lookback_days: parse_or(
                    lookup("MIRROR_RELATIONSHIP_LOOKBACK_DAYS"),
                    defaults.lifecycle.relationship_lookback_days,
                )
                .max(1),
                max_write_attempts: parse_or(
                    lookup("MIRROR_MAX_WRITE_ATTEMPTS"),
                    defaults.lifecycle.max_write_attempts,
                )
                .max(1),
                importance_floor: parse_or(
                    lookup("MIRROR_IMPORTANCE_FLOOR"),
                    defaults.lifecycle.importance_floor,
                )
                .clamp(0.0, 1.0),
            },
            embedding: EmbeddingConfig {
                dimension: parse_or(lookup("MIRROR_EMBEDDING_DIMENSION"), defaults.embedding.dimension)
                    .max(1),
            },
            logging: LoggingConfig {
                filter: get("MIRROR_LOG_FILTER", defaults.logging.filter),
                json: parse_or(lookup("MIRROR_LOG_JSON"), defaults.logging.json),
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
