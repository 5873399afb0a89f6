//! Composite relevance scoring.
//!
//! Final score is a fixed blend of four signals:
//! 50% semantic similarity, 20% importance tier, 15% recency and 15% access
//! frequency. Candidates are filtered before ranking in a fixed order:
//! similarity threshold, temporal filters, sensitivity, importance floor.

use chrono::{DateTime, Utc};

use crate::models::{Entity, SensitivityLevel};

pub const SIMILARITY_WEIGHT: f64 = 0.50;
pub const IMPORTANCE_WEIGHT: f64 = 0.20;
pub const RECENCY_WEIGHT: f64 = 0.15;
pub const ACCESS_WEIGHT: f64 = 0.15;

/// Recency multiplier per week of age.
pub const WEEKLY_RECENCY_FACTOR: f64 = 0.95;

/// Similarity assigned to every candidate when there is no query vector.
pub const NEUTRAL_SIMILARITY: f64 = 0.5;

/// Cosine similarity in [-1, 1]. Mismatched or zero-length vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Map cosine similarity from [-1, 1] onto [0, 1].
pub fn rescale_similarity(cosine: f64) -> f64 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// `0.95^(age in weeks)`. Future timestamps count as age zero.
pub fn recency_boost(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = now.signed_duration_since(updated_at).num_seconds().max(0) as f64;
    let weeks = seconds / (7.0 * 86_400.0);
    WEEKLY_RECENCY_FACTOR.powf(weeks)
}

/// `min(1, 0.5 + ln(1 + access_count) / 5)`.
pub fn access_boost(access_count: i32) -> f64 {
    let count = access_count.max(0) as f64;
    (0.5 + (1.0 + count).ln() / 5.0).min(1.0)
}

/// Weighted sum of the four signals.
pub fn composite_score(similarity: f64, importance: f64, recency: f64, access: f64) -> f64 {
    SIMILARITY_WEIGHT * similarity
        + IMPORTANCE_WEIGHT * importance
        + RECENCY_WEIGHT * recency
        + ACCESS_WEIGHT * access
}

/// Filters applied before ranking.
#[derive(Debug, Clone)]
pub struct ScoreOptions {
    /// Minimum rescaled similarity. Ignored without a query vector.
    pub similarity_threshold: f64,
    pub include_expired: bool,
    pub include_historical: bool,
    /// Most sensitive level that may be returned
    pub max_sensitivity: SensitivityLevel,
    /// Minimum decayed importance score
    pub importance_floor: Option<f64>,
    pub limit: usize,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            include_expired: false,
            include_historical: false,
            max_sensitivity: SensitivityLevel::Sensitive,
            importance_floor: None,
            limit: 10,
        }
    }
}

/// A candidate with its signal breakdown.
#[derive(Debug, Clone)]
pub struct ScoredCandidate<T> {
    pub item: T,
    pub similarity: f64,
    pub importance: f64,
    pub recency: f64,
    pub access: f64,
    pub score: f64,
}

impl<T> ScoredCandidate<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScoredCandidate<U> {
        ScoredCandidate {
            item: f(self.item),
            similarity: self.similarity,
            importance: self.importance,
            recency: self.recency,
            access: self.access,
            score: self.score,
        }
    }
}

/// Re-rank by final score, highest first.
pub fn rerank_by_score<T>(results: &mut [ScoredCandidate<T>]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Scores entity-table records (entities and typed memories).
#[derive(Debug, Clone, Copy, Default)]
pub struct RelevanceScorer;

impl RelevanceScorer {
    pub fn new() -> Self {
        Self
    }

    /// Similarity of one candidate against an optional query vector.
    ///
    /// Without a query every candidate is neutral; a candidate without an
    /// embedding never matches a query.
    pub fn similarity(&self, candidate: &Entity, query: Option<&[f32]>) -> f64 {
        match (query, candidate.embedding.as_deref()) {
            (None, _) => NEUTRAL_SIMILARITY,
            (Some(_), None) => 0.0,
            (Some(q), Some(e)) => rescale_similarity(cosine_similarity(q, e)),
        }
    }

    /// Final score for one candidate, without any filtering.
    pub fn score(
        &self,
        candidate: &Entity,
        query: Option<&[f32]>,
        now: DateTime<Utc>,
    ) -> ScoredCandidate<()> {
        let similarity = self.similarity(candidate, query);
        let importance = candidate.importance.weight();
        let recency = recency_boost(candidate.updated_at, now);
        let access = access_boost(candidate.access_count);
        ScoredCandidate {
            item: (),
            similarity,
            importance,
            recency,
            access,
            score: composite_score(similarity, importance, recency, access),
        }
    }

    /// Filter, score and rank candidates.
    pub fn rank(
        &self,
        candidates: Vec<Entity>,
        query: Option<&[f32]>,
        options: &ScoreOptions,
        now: DateTime<Utc>,
    ) -> Vec<ScoredCandidate<Entity>> {
        let mut scored: Vec<ScoredCandidate<Entity>> = candidates
            .into_iter()
            .map(|c| {
                let s = self.score(&c, query, now);
                s.map(|_| c)
            })
            .filter(|s| query.is_none() || s.similarity >= options.similarity_threshold)
            .filter(|s| {
                let e = &s.item;
                !e.is_future_dated(now)
                    && (options.include_expired || !e.is_expired(now))
                    && (options.include_historical || !e.is_historical)
            })
            .filter(|s| s.item.sensitivity <= options.max_sensitivity)
            .filter(|s| {
                options
                    .importance_floor
                    .map(|floor| s.item.importance_score >= floor)
                    .unwrap_or(true)
            })
            .collect();

        rerank_by_score(&mut scored);
        scored.truncate(options.limit);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ImportanceTier};
    use chrono::Duration;

    fn entity(name: &str, embedding: Vec<f32>) -> Entity {
        let mut e = Entity::new("u1", name, EntityType::Person);
        e.embedding = Some(embedding);
        e
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rescale_similarity() {
        assert_eq!(rescale_similarity(-1.0), 0.0);
        assert_eq!(rescale_similarity(0.0), 0.5);
        assert_eq!(rescale_similarity(1.0), 1.0);
    }

    #[test]
    fn test_recency_boost_decays_weekly() {
        let now = Utc::now();
        assert!((recency_boost(now, now) - 1.0).abs() < 1e-9);
        let week_old = recency_boost(now - Duration::weeks(1), now);
        assert!((week_old - 0.95).abs() < 1e-6);
        assert!((recency_boost(now + Duration::days(3), now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_access_boost() {
        assert!((access_boost(0) - 0.5).abs() < 1e-9);
        assert!(access_boost(10) > access_boost(1));
        assert_eq!(access_boost(100_000), 1.0);
    }

    #[test]
    fn test_composite_weights_sum_to_one() {
        assert!((composite_score(1.0, 1.0, 1.0, 1.0) - 1.0).abs() < 1e-9);
        assert!((composite_score(1.0, 0.0, 0.0, 0.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rank_orders_by_similarity_then_importance() {
        let scorer = RelevanceScorer::new();
        let now = Utc::now();
        let close = entity("Close", vec![1.0, 0.1]);
        let far = entity("Far", vec![0.2, 1.0]);
        let opts = ScoreOptions {
            similarity_threshold: 0.0,
            ..Default::default()
        };

        let ranked = scorer.rank(vec![far, close], Some(&[1.0, 0.0]), &opts, now);
        assert_eq!(ranked[0].item.name, "Close");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_rank_threshold_excludes_dissimilar() {
        let scorer = RelevanceScorer::new();
        let opposite = entity("Opposite", vec![-1.0, 0.0]);
        let missing = Entity::new("u1", "NoVector", EntityType::Person);
        let ranked = scorer.rank(
            vec![opposite, missing],
            Some(&[1.0, 0.0]),
            &ScoreOptions::default(),
            Utc::now(),
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_without_query_skips_threshold() {
        let scorer = RelevanceScorer::new();
        let a = Entity::new("u1", "A", EntityType::Person).with_importance(ImportanceTier::Critical);
        let b = Entity::new("u1", "B", EntityType::Person).with_importance(ImportanceTier::Low);
        let opts = ScoreOptions {
            similarity_threshold: 0.9,
            ..Default::default()
        };
        let ranked = scorer.rank(vec![b, a], None, &opts, Utc::now());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].item.name, "A");
    }

    #[test]
    fn test_temporal_filters() {
        let scorer = RelevanceScorer::new();
        let now = Utc::now();
        let mut future = entity("Future", vec![1.0, 0.0]);
        future.effective_from = Some(now + Duration::days(2));
        let mut expired = entity("Expired", vec![1.0, 0.0]);
        expired.expires_at = Some(now - Duration::days(1));
        let mut historical = entity("Historical", vec![1.0, 0.0]);
        historical.is_historical = true;

        let candidates = vec![future.clone(), expired.clone(), historical.clone()];
        let ranked = scorer.rank(candidates, Some(&[1.0, 0.0]), &ScoreOptions::default(), now);
        assert!(ranked.is_empty());

        let opts = ScoreOptions {
            include_expired: true,
            include_historical: true,
            ..Default::default()
        };
        let ranked = scorer.rank(vec![future, expired, historical], Some(&[1.0, 0.0]), &opts, now);
        let names: Vec<_> = ranked.iter().map(|s| s.item.name.as_str()).collect();
        // Future-dated records never come back
        assert!(!names.contains(&"Future"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_sensitivity_and_floor() {
        let scorer = RelevanceScorer::new();
        let mut private = entity("Private", vec![1.0, 0.0]);
        private.sensitivity = SensitivityLevel::Private;
        let mut faded = entity("Faded", vec![1.0, 0.0]);
        faded.importance_score = 0.05;
        let opts = ScoreOptions {
            importance_floor: Some(0.1),
            ..Default::default()
        };
        let ranked = scorer.rank(vec![private, faded], Some(&[1.0, 0.0]), &opts, Utc::now());
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_applies_limit() {
        let scorer = RelevanceScorer::new();
        let candidates = (0..20)
            .map(|i| Entity::new("u1", format!("E{i}"), EntityType::Concept))
            .collect();
        let opts = ScoreOptions {
            limit: 3,
            ..Default::default()
        };
        assert_eq!(scorer.rank(candidates, None, &opts, Utc::now()).len(), 3);
    }
}
