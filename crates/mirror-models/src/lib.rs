//! Data models for Mirror.
//!
//! Defines the memory records extracted from a user's notes: entities,
//! facts, relationship edges, behaviors, patterns and note metadata.
//!
//! This crate has no I/O. Loosely typed vocabularies from the extraction
//! layer (predicates, relationship labels) are closed enums with an
//! `Other` fallback so lookup tables stay exhaustive.

mod behavior;
mod entity;
mod fact;
mod note;
mod pattern;
mod predicate;
mod relationship;

pub use behavior::*;
pub use entity::*;
pub use fact::*;
pub use note::*;
pub use pattern::*;
pub use predicate::*;
pub use relationship::*;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new UUID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Normalize a display name for identity comparison.
///
/// Lowercases and collapses internal whitespace, so "Marcus  Lee" and
/// "marcus lee" refer to the same entity slot.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
