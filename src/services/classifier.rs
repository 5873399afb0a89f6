//! Task classification and lexical extraction for incoming messages.
//!
//! Everything here is pure and deterministic: patterns are tried in a fixed
//! priority order and the first hit wins, with [`TaskType::General`] as the
//! fallback.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What the user is trying to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Decision,
    Emotional,
    Relationship,
    Planning,
    Reflection,
    Exploration,
    KnowledgeQuery,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Decision => "decision",
            TaskType::Emotional => "emotional",
            TaskType::Relationship => "relationship",
            TaskType::Planning => "planning",
            TaskType::Reflection => "reflection",
            TaskType::Exploration => "exploration",
            TaskType::KnowledgeQuery => "knowledge_query",
            TaskType::General => "general",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(TaskType::Decision),
            "emotional" => Some(TaskType::Emotional),
            "relationship" => Some(TaskType::Relationship),
            "planning" => Some(TaskType::Planning),
            "reflection" => Some(TaskType::Reflection),
            "exploration" => Some(TaskType::Exploration),
            "knowledge_query" => Some(TaskType::KnowledgeQuery),
            "general" => Some(TaskType::General),
            _ => None,
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::Decision,
            TaskType::Emotional,
            TaskType::Relationship,
            TaskType::Planning,
            TaskType::Reflection,
            TaskType::Exploration,
            TaskType::KnowledgeQuery,
            TaskType::General,
        ]
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|e| panic!("invalid task pattern {re}: {e}"))
}

/// Priority-ordered task patterns. Order matters: a message asking
/// "should I" while upset is treated as a decision.
static TASK_PATTERNS: Lazy<Vec<(TaskType, Regex)>> = Lazy::new(|| {
    vec![
        (
            TaskType::Decision,
            pattern(
                r"(?i)\b(should i|should we|or should|whether (to|or)|decide|deciding|decision|choose|choosing|torn between|pros and cons|trade-?offs?|which (one|option)|worth it)\b",
            ),
        ),
        (
            TaskType::Emotional,
            pattern(
                r"(?i)\b(feel|feeling|felt|anxious|anxiety|stressed|stress|sad|upset|angry|lonely|overwhelmed|depressed|hurt|scared|afraid|worried|frustrated|heartbroken|grief|grieving|crying|exhausted|burned out|burnt out)\b",
            ),
        ),
        (
            TaskType::Relationship,
            pattern(
                r"(?i)\b(my (wife|husband|partner|boyfriend|girlfriend|mom|mother|dad|father|sister|brother|friend|boss|manager|coworker|colleague)|relationship with|get along|argument with|fight with|falling out)\b",
            ),
        ),
        (
            TaskType::Planning,
            pattern(
                r"(?i)\b(plan|planning|schedule|next week|next month|tomorrow|goals?|roadmap|deadline|to-?do|organi[sz]e|prepare|prep for)\b",
            ),
        ),
        (
            TaskType::Reflection,
            pattern(
                r"(?i)\b(reflect|reflecting|looking back|lately|past (few|couple)|this (week|month|year)|patterns?|progress|growth|journey|how have i been)\b",
            ),
        ),
        (
            TaskType::Exploration,
            pattern(
                r"(?i)\b(what if|imagine|curious|wonder|wondering|explore|brainstorm|ideas?|possibilities|thinking about)\b",
            ),
        ),
        (
            TaskType::KnowledgeQuery,
            pattern(
                r"(?i)(^\s*(who|what|when|where|which|how many|how much)\b|\b(do you (know|remember)|did i|have i|remind me|tell me about|what did|when did|who is|where does)\b)",
            ),
        ),
    ]
});

/// Classify a message into a [`TaskType`].
pub fn classify(message: &str) -> TaskType {
    TASK_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(task, _)| *task)
        .unwrap_or(TaskType::General)
}

// ============================================================================
// Lexical extraction
// ============================================================================

/// Pluggable entity and topic extraction.
///
/// Implementations must not fail: the worst case is an empty list.
pub trait TextExtractor: Send + Sync {
    /// Proper nouns and known names mentioned in `message`.
    fn mentioned_entities(&self, message: &str, known_names: &[String]) -> Vec<String>;

    /// Topic labels touched by `message`.
    fn topics(&self, message: &str) -> Vec<String>;
}

/// Capitalized words that start sentences or questions rather than name
/// anything.
static NON_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "i", "i'm", "i've", "i'd", "i'll", "a", "an", "the", "and", "but", "or", "so", "if",
        "then", "should", "would", "could", "can", "will", "what", "when", "where", "why", "how",
        "who", "which", "is", "are", "was", "were", "do", "does", "did", "my", "me", "we", "you",
        "he", "she", "they", "it", "this", "that", "these", "those", "there", "here", "today",
        "tomorrow", "yesterday", "monday", "tuesday", "wednesday", "thursday", "friday",
        "saturday", "sunday", "maybe", "also", "just", "yes", "no", "ok", "okay", "hi", "hey",
        "thanks", "please", "let", "let's", "am", "have", "has", "had", "not", "for", "in", "on",
        "at", "to", "of", "with", "about", "after", "before", "since", "still", "really",
    ]
    .into_iter()
    .collect()
});

static WORD: Lazy<Regex> = Lazy::new(|| pattern(r"[A-Za-z][A-Za-z'\-]*"));

/// Topic label and the keywords that signal it, in output order.
const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("work", &["job", "work", "career", "boss", "manager", "office", "promotion", "interview", "salary", "coworker", "colleague", "team", "project"]),
    ("relationships", &["relationship", "partner", "boyfriend", "girlfriend", "wife", "husband", "dating", "friend", "friends", "breakup"]),
    ("family", &["family", "mom", "mother", "dad", "father", "sister", "brother", "parents", "kids", "son", "daughter"]),
    ("health", &["health", "sleep", "exercise", "gym", "doctor", "therapy", "therapist", "sick", "diet", "run", "running"]),
    ("money", &["money", "budget", "rent", "savings", "debt", "finance", "finances", "invest", "investing"]),
    ("home", &["home", "apartment", "house", "move", "moving", "relocate", "city", "neighborhood"]),
    ("travel", &["travel", "trip", "flight", "vacation", "visit", "abroad"]),
    ("learning", &["learn", "learning", "study", "course", "school", "class", "degree", "university"]),
    ("creativity", &["write", "writing", "draw", "drawing", "music", "paint", "painting", "novel", "art"]),
    ("emotions", &["anxious", "anxiety", "stress", "stressed", "sad", "happy", "lonely", "angry", "overwhelmed"]),
];

/// Keyword and capitalization heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    /// Upper bound on names returned for one message.
    pub const MAX_MENTIONS: usize = 10;
    pub const MAX_TOPICS: usize = 5;
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
}

fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix('\''))
        .unwrap_or(word)
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, name: String) {
    let key = name.to_lowercase();
    if !key.is_empty() && seen.insert(key) {
        out.push(name);
    }
}

fn flush(run: &mut Vec<&str>, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    if !run.is_empty() {
        push_unique(out, seen, run.join(" "));
        run.clear();
    }
}

impl TextExtractor for HeuristicExtractor {
    fn mentioned_entities(&self, message: &str, known_names: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        // Known names first, matched as whole words in any case
        let lower = message.to_lowercase();
        for name in known_names {
            let needle = name.trim().to_lowercase();
            if needle.is_empty() {
                continue;
            }
            let hit = lower.match_indices(&needle).any(|(start, _)| {
                let end = start + needle.len();
                let before_ok = lower[..start]
                    .chars()
                    .next_back()
                    .map(|c| !c.is_alphanumeric())
                    .unwrap_or(true);
                let after_ok = lower[end..]
                    .chars()
                    .next()
                    .map(|c| !c.is_alphanumeric())
                    .unwrap_or(true);
                before_ok && after_ok
            });
            if hit {
                push_unique(&mut out, &mut seen, name.trim().to_string());
            }
        }

        // Runs of adjacent capitalized words form one name
        let mut run: Vec<&str> = Vec::new();
        let mut run_end = 0usize;
        for m in WORD.find_iter(message) {
            let word = strip_possessive(m.as_str());
            let gap = &message[run_end..m.start()];
            let adjacent = !run.is_empty() && gap.chars().all(|c| c == ' ');
            if !adjacent {
                flush(&mut run, &mut out, &mut seen);
            }
            if is_capitalized(word) && !NON_NAMES.contains(word.to_lowercase().as_str()) {
                run.push(word);
                run_end = m.end();
            } else {
                flush(&mut run, &mut out, &mut seen);
            }
        }
        flush(&mut run, &mut out, &mut seen);

        out.truncate(Self::MAX_MENTIONS);
        out
    }

    fn topics(&self, message: &str) -> Vec<String> {
        let words: HashSet<String> = WORD
            .find_iter(message)
            .map(|m| strip_possessive(m.as_str()).to_lowercase())
            .collect();

        TOPIC_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| words.contains(*k)))
            .map(|(topic, _)| topic.to_string())
            .take(Self::MAX_TOPICS)
            .collect()
    }
}

/// [`TextExtractor::mentioned_entities`] with the default heuristics.
pub fn extract_mentioned_entities(message: &str, known_names: &[String]) -> Vec<String> {
    HeuristicExtractor.mentioned_entities(message, known_names)
}

/// [`TextExtractor::topics`] with the default heuristics.
pub fn extract_topics(message: &str) -> Vec<String> {
    HeuristicExtractor.topics(message)
}
