//! Static retrieval strategies per task type.

use serde::{Deserialize, Serialize};

use super::classifier::TaskType;

/// How one memory category is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStrategy {
    /// Skip the category
    None,
    MentionedOnly,
    /// Mentioned entities plus their direct graph neighbours
    MentionedPlusRelated,
    TopByImportance,
    /// People the user leans on, by mention frequency
    SupportiveRelationships,
    /// People, narrowed to mentioned names when there are any
    RelevantPeople,
    /// Every fact for the mentioned entities
    AllForEntity,
    /// Confidence >= 0.6
    Relevant,
    /// Confidence >= 0.7
    HighConfidence,
    Recent,
    /// Semantic match when an embedding provider is present
    BroadSearch,
    /// Title/category match on mentioned names and topics
    TopicMatch,
}

impl SubStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStrategy::None => "none",
            SubStrategy::MentionedOnly => "mentioned_only",
            SubStrategy::MentionedPlusRelated => "mentioned_plus_related",
            SubStrategy::TopByImportance => "top_by_importance",
            SubStrategy::SupportiveRelationships => "supportive_relationships",
            SubStrategy::RelevantPeople => "relevant_people",
            SubStrategy::AllForEntity => "all_for_entity",
            SubStrategy::Relevant => "relevant",
            SubStrategy::HighConfidence => "high_confidence",
            SubStrategy::Recent => "recent",
            SubStrategy::BroadSearch => "broad_search",
            SubStrategy::TopicMatch => "topic_match",
        }
    }
}

impl std::fmt::Display for SubStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-strategy and result cap for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub sub: SubStrategy,
    pub limit: usize,
}

impl CategoryPlan {
    pub const fn new(sub: SubStrategy, limit: usize) -> Self {
        Self { sub, limit }
    }

    pub const fn skip() -> Self {
        Self {
            sub: SubStrategy::None,
            limit: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sub != SubStrategy::None && self.limit > 0
    }
}

/// Which categories to retrieve for a task, and how.
///
/// Behaviors are always loaded; their plan only carries the cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub task_type: TaskType,
    pub entities: CategoryPlan,
    pub facts: CategoryPlan,
    pub notes: CategoryPlan,
    pub patterns: CategoryPlan,
    pub behaviors: CategoryPlan,
}

impl Strategy {
    /// Clamp every cap to `max`.
    pub fn capped(mut self, max: usize) -> Self {
        for plan in [
            &mut self.entities,
            &mut self.facts,
            &mut self.notes,
            &mut self.patterns,
            &mut self.behaviors,
        ] {
            plan.limit = plan.limit.min(max);
        }
        self
    }
}

/// Look up the strategy for a task type.
pub fn strategy_for(task_type: TaskType) -> Strategy {
    use SubStrategy::{
        AllForEntity, BroadSearch, HighConfidence, MentionedOnly, MentionedPlusRelated, Recent,
        Relevant, RelevantPeople, SupportiveRelationships, TopByImportance, TopicMatch,
    };

    let plan = CategoryPlan::new;
    let (entities, facts, notes, patterns, behaviors) = match task_type {
        TaskType::Decision => (
            plan(MentionedPlusRelated, 10),
            plan(Relevant, 20),
            plan(TopicMatch, 5),
            plan(HighConfidence, 5),
            plan(MentionedPlusRelated, 10),
        ),
        TaskType::Emotional => (
            plan(SupportiveRelationships, 5),
            plan(HighConfidence, 10),
            plan(Recent, 5),
            plan(HighConfidence, 5),
            plan(MentionedPlusRelated, 10),
        ),
        TaskType::Relationship => (
            plan(RelevantPeople, 10),
            plan(AllForEntity, 20),
            plan(TopicMatch, 5),
            plan(HighConfidence, 3),
            plan(MentionedPlusRelated, 10),
        ),
        TaskType::Planning => (
            plan(MentionedOnly, 5),
            plan(Relevant, 15),
            plan(Recent, 10),
            CategoryPlan::skip(),
            plan(MentionedPlusRelated, 5),
        ),
        TaskType::Reflection => (
            plan(TopByImportance, 10),
            plan(HighConfidence, 15),
            plan(Recent, 10),
            plan(HighConfidence, 10),
            plan(MentionedPlusRelated, 10),
        ),
        TaskType::Exploration => (
            plan(BroadSearch, 15),
            plan(Relevant, 20),
            plan(BroadSearch, 10),
            plan(Recent, 5),
            plan(MentionedPlusRelated, 5),
        ),
        TaskType::KnowledgeQuery => (
            plan(MentionedOnly, 5),
            plan(AllForEntity, 30),
            plan(TopicMatch, 5),
            CategoryPlan::skip(),
            plan(MentionedPlusRelated, 5),
        ),
        TaskType::General => (
            plan(MentionedPlusRelated, 5),
            plan(Relevant, 10),
            plan(Recent, 3),
            plan(HighConfidence, 3),
            plan(MentionedPlusRelated, 5),
        ),
    };
    Strategy {
        task_type,
        entities,
        facts,
        notes,
        patterns,
        behaviors,
    }
}

/// Look up a strategy by task label. Unknown labels get the general
/// strategy.
pub fn strategy_for_label(label: &str) -> Strategy {
    strategy_for(TaskType::from_str(label).unwrap_or(TaskType::General))
}

/// The fallback strategy.
pub fn default_strategy() -> Strategy {
    strategy_for(TaskType::General)
}
