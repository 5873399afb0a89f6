//! Note metadata.
//!
//! Note bodies are end-to-end encrypted and never reach this layer, so the
//! record carries only the fields that can be matched server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, now};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMeta {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoteMeta {
    pub fn new(user_id: impl Into<String>, title: Option<String>, category: Option<String>) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            title,
            category,
            is_deleted: false,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Case-insensitive match of `needle` against title or category.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        let hit = |field: &Option<String>| {
            field
                .as_deref()
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        hit(&self.title) || hit(&self.category)
    }

    pub fn label(&self) -> String {
        self.title.clone().unwrap_or_else(|| "Untitled".to_string())
    }
}
