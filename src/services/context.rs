//! Context assembly.
//!
//! Renders a retrieval result as a plain-text block for a downstream
//! model, plus a flat audit list of what was used. Sections always appear
//! in the same order and empty sections are left out. Item previews are
//! cut to fixed lengths to bound prompt size.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::classifier::TaskType;
use super::retrieval::RetrievalResult;
use super::strategy::Strategy;

/// Longest fact object shown, ellipsis included.
pub const FACT_OBJECT_PREVIEW: usize = 30;
/// Longest note title shown, ellipsis included.
pub const NOTE_TITLE_PREVIEW: usize = 40;
/// Longest entity summary shown, ellipsis included.
pub const ENTITY_SUMMARY_PREVIEW: usize = 80;
/// Longest pattern description shown, ellipsis included.
pub const PATTERN_PREVIEW: usize = 80;
/// Longest entity label, pattern short description or behavior line.
pub const LABEL_PREVIEW: usize = 60;
/// Longest single topic shown.
pub const TOPIC_PREVIEW: usize = 30;

const ELLIPSIS: &str = "...";

/// Kind of record in the audit list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextItemType {
    Entity,
    Fact,
    Note,
    Pattern,
    Behavior,
}

impl ContextItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextItemType::Entity => "entity",
            ContextItemType::Fact => "fact",
            ContextItemType::Note => "note",
            ContextItemType::Pattern => "pattern",
            ContextItemType::Behavior => "behavior",
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsed {
    pub item_type: ContextItemType,
    pub label: String,
}

/// Per-category caps on the audit list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCaps {
    pub entities: usize,
    pub facts: usize,
    pub notes: usize,
    pub patterns: usize,
    pub behaviors: usize,
}

impl Default for AuditCaps {
    fn default() -> Self {
        Self {
            entities: 5,
            facts: 5,
            notes: 3,
            patterns: 3,
            behaviors: 3,
        }
    }
}

/// Rendered block and audit list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedContext {
    pub text: String,
    pub used: Vec<ContextUsed>,
}

impl FormattedContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Everything gathered for one message. Built per request and dropped
/// once the response is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalContext {
    pub task_type: TaskType,
    pub strategy: Strategy,
    pub mentioned: Vec<String>,
    pub topics: Vec<String>,
    pub result: RetrievalResult,
    pub formatted: FormattedContext,
}

impl RetrievalContext {
    pub fn text(&self) -> &str {
        &self.formatted.text
    }

    pub fn used(&self) -> &[ContextUsed] {
        &self.formatted.used
    }
}

/// Cut `text` to at most `max` characters, ending in an ellipsis when cut.
pub fn truncate_preview(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler {
    caps: AuditCaps,
}

impl ContextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caps(caps: AuditCaps) -> Self {
        Self { caps }
    }

    /// Render `result` and `topics`.
    ///
    /// Section order: entities, facts, notes, patterns, behaviors, topics.
    pub fn assemble(&self, result: &RetrievalResult, topics: &[String]) -> FormattedContext {
        let mut sections: Vec<String> = Vec::new();
        let mut used: Vec<ContextUsed> = Vec::new();

        if !result.entities.is_empty() {
            let mut section = String::from("## People and things\n");
            for entity in &result.entities {
                let _ = write!(
                    section,
                    "- {} [{}]",
                    truncate_preview(&entity.label(), LABEL_PREVIEW),
                    entity.entity_type
                );
                if let Some(summary) = entity.summary.as_deref().filter(|s| !s.trim().is_empty()) {
                    let _ = write!(section, ": {}", truncate_preview(summary, ENTITY_SUMMARY_PREVIEW));
                }
                section.push('\n');
            }
            sections.push(section);
            used.extend(
                result
                    .entities
                    .iter()
                    .take(self.caps.entities)
                    .map(|e| {
                        audit(
                            ContextItemType::Entity,
                            truncate_preview(&e.label(), LABEL_PREVIEW),
                        )
                    }),
            );
        }

        if !result.facts.is_empty() {
            let mut section = String::from("## Facts\n");
            for fact in &result.facts {
                let subject = result.subject_name(&fact.entity_id).unwrap_or("Unknown");
                let _ = writeln!(
                    section,
                    "- {} {}: {}",
                    subject,
                    fact.predicate.as_str().replace('_', " "),
                    truncate_preview(&fact.object_text, FACT_OBJECT_PREVIEW)
                );
            }
            sections.push(section);
            used.extend(result.facts.iter().take(self.caps.facts).map(|f| {
                let subject = result.subject_name(&f.entity_id).unwrap_or("Unknown");
                audit(
                    ContextItemType::Fact,
                    format!(
                        "{} {}",
                        subject,
                        truncate_preview(&f.label(), FACT_OBJECT_PREVIEW)
                    ),
                )
            }));
        }

        if !result.notes.is_empty() {
            let mut section = String::from("## Related notes\n");
            for note in &result.notes {
                let title = truncate_preview(&note.label(), NOTE_TITLE_PREVIEW);
                match note.category.as_deref().filter(|c| !c.is_empty()) {
                    Some(category) => {
                        let _ = writeln!(section, "- \"{}\" ({})", title, category);
                    }
                    None => {
                        let _ = writeln!(section, "- \"{}\"", title);
                    }
                }
            }
            sections.push(section);
            used.extend(result.notes.iter().take(self.caps.notes).map(|n| {
                audit(
                    ContextItemType::Note,
                    truncate_preview(&n.label(), NOTE_TITLE_PREVIEW),
                )
            }));
        }

        if !result.patterns.is_empty() {
            let mut section = String::from("## Patterns\n");
            for pattern in &result.patterns {
                let _ = writeln!(
                    section,
                    "- {} ({})",
                    truncate_preview(&pattern.description, PATTERN_PREVIEW),
                    pattern.category
                );
            }
            sections.push(section);
            used.extend(
                result
                    .patterns
                    .iter()
                    .take(self.caps.patterns)
                    .map(|p| {
                        audit(
                            ContextItemType::Pattern,
                            truncate_preview(&p.short_description, LABEL_PREVIEW),
                        )
                    }),
            );
        }

        if !result.behaviors.is_empty() {
            let mut section = String::from("## How the user relates to people\n");
            for behavior in &result.behaviors {
                let _ = writeln!(section, "- {}", truncate_preview(&behavior.label(), LABEL_PREVIEW));
            }
            sections.push(section);
            used.extend(
                result
                    .behaviors
                    .iter()
                    .take(self.caps.behaviors)
                    .map(|b| {
                        audit(
                            ContextItemType::Behavior,
                            truncate_preview(&b.label(), LABEL_PREVIEW),
                        )
                    }),
            );
        }

        let topics: Vec<String> = topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| truncate_preview(t, TOPIC_PREVIEW))
            .collect();
        if !topics.is_empty() {
            sections.push(format!("## Topics\n{}\n", topics.join(", ")));
        }

        FormattedContext {
            text: sections.join("\n").trim_end().to_string(),
            used,
        }
    }
}

fn audit(item_type: ContextItemType, label: String) -> ContextUsed {
    ContextUsed { item_type, label }
}
