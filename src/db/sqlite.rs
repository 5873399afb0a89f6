//! SQLite-backed [`MemoryStore`].
//!
//! Enumerations are stored as their snake_case labels, lists and
//! embeddings as JSON text. Filtering that SQLite cannot express exactly
//! (unicode case folding) is kept to ASCII-insensitive `LIKE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::debug;

use super::store::{
    BehaviorQuery, EntityOrder, EntityQuery, FactOrder, FactQuery, FactWrite, MemoryStore,
    NoteQuery, PatternQuery, RelationshipQuery,
};
use super::DbPool;
use crate::error::{Error, Result};
use crate::models::{
    normalize_name, Behavior, BehaviorPredicate, BehaviorStatus, Entity, EntityStatus, EntityType,
    Fact, FactStatus, ImportanceTier, MemoryType, NoteMeta, Pattern, PatternCategory,
    PatternStatus, Predicate, Relationship, RelationshipType, SensitivityLevel,
};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const ENTITY_COLUMNS: &[&str] = &[
    "user_id",
    "name",
    "normalized_name",
    "aliases",
    "entity_type",
    "relationship",
    "summary",
    "importance",
    "importance_score",
    "sentiment_average",
    "mention_count",
    "status",
    "embedding",
    "memory_type",
    "sensitivity",
    "is_historical",
    "effective_from",
    "expires_at",
    "recurrence_pattern",
    "access_count",
    "last_accessed_at",
    "last_decayed_at",
    "version",
    "previous_version_id",
    "superseded_by",
    "source_note_id",
    "created_at",
    "updated_at",
];

const FACT_COLUMNS: &[&str] = &[
    "user_id",
    "entity_id",
    "predicate",
    "single_valued",
    "object_text",
    "object_key",
    "object_entity_id",
    "confidence",
    "status",
    "valid_from",
    "valid_to",
    "created_at",
    "invalidated_at",
    "invalidated_by",
    "version",
    "previous_version_id",
    "is_current",
    "source_note_id",
    "updated_at",
];

const RELATIONSHIP_COLUMNS: &[&str] = &[
    "user_id",
    "source_entity_id",
    "target_entity_id",
    "relationship_type",
    "strength",
    "confidence",
    "is_active",
    "started_at",
    "ended_at",
    "last_confirmed_at",
    "created_at",
    "updated_at",
];

const BEHAVIOR_COLUMNS: &[&str] = &[
    "user_id",
    "predicate",
    "entity_id",
    "entity_name",
    "topic",
    "sentiment",
    "evidence",
    "confidence",
    "reinforcement_count",
    "status",
    "source_note_id",
    "first_detected_at",
    "last_reinforced_at",
];

const PATTERN_COLUMNS: &[&str] = &[
    "user_id",
    "category",
    "description",
    "short_description",
    "confidence",
    "evidence",
    "status",
    "surfaced_at",
    "created_at",
    "updated_at",
];

const NOTE_COLUMNS: &[&str] = &[
    "user_id",
    "title",
    "category",
    "is_deleted",
    "created_at",
    "updated_at",
];

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len() + 1].join(", ");
    format!(
        "INSERT INTO {} (id, {}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    )
}

fn upsert_sql(table: &str, columns: &[&str]) -> String {
    let updates = columns
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} ON CONFLICT(id) DO UPDATE SET {}",
        insert_sql(table, columns),
        updates
    )
}

/// `UPDATE` binding every column, then `id` and `user_id`, plus an
/// optional extra guard.
fn update_sql(table: &str, columns: &[&str], guard: &str) -> String {
    let sets = columns
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE id = ? AND user_id = ?{}",
        table, sets, guard
    )
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn invalid(what: &str, value: &str) -> Error {
    Error::Store(format!("Invalid {} value in store: {}", what, value))
}

fn map_unique(err: sqlx::Error, conflict: impl FnOnce() -> Error) -> Error {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => conflict(),
        _ => Error::Database(err),
    }
}

/// Lock contention on a write transaction: another writer got there
/// first. Reported as `Conflict` so the caller re-reads and retries.
fn map_contention(err: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    match err {
        sqlx::Error::Database(ref db_err) if is_busy_code(db_err.code().as_deref()) => {
            Error::Conflict(what())
        }
        _ => Error::Database(err),
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED and their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    matches!(code, Some("5" | "6" | "261" | "262" | "517"))
}

fn limit_value(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Append `AND (<col> LIKE ? OR ...)` over non-empty terms. A term list
/// made only of blanks matches nothing.
fn push_like_any(qb: &mut QueryBuilder<'_, Sqlite>, columns: &[&str], terms: &[String]) {
    if terms.is_empty() {
        return;
    }
    let terms: Vec<&String> = terms.iter().filter(|t| !t.trim().is_empty()).collect();
    if terms.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND (");
    let mut first = true;
    for term in terms {
        let pattern = like_pattern(term);
        for column in columns {
            if !first {
                qb.push(" OR ");
            }
            first = false;
            qb.push(format!("LOWER(COALESCE({column}, '')) LIKE "));
            qb.push_bind(pattern.clone());
            qb.push(" ESCAPE '\\'");
        }
    }
    qb.push(")");
}

fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push_bind(value);
    }
    qb.push(")");
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    user_id: String,
    name: String,
    aliases: String,
    entity_type: String,
    relationship: Option<String>,
    summary: Option<String>,
    importance: String,
    importance_score: f64,
    sentiment_average: f64,
    mention_count: i32,
    status: String,
    embedding: Option<String>,
    memory_type: String,
    sensitivity: String,
    is_historical: bool,
    effective_from: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    recurrence_pattern: Option<String>,
    access_count: i32,
    last_accessed_at: Option<DateTime<Utc>>,
    last_decayed_at: Option<DateTime<Utc>>,
    version: i32,
    previous_version_id: Option<String>,
    superseded_by: Option<String>,
    source_note_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn into_model(self) -> Result<Entity> {
        let embedding = match self.embedding {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Entity {
            importance: ImportanceTier::from_str(&self.importance)
                .ok_or_else(|| invalid("importance", &self.importance))?,
            status: EntityStatus::from_str(&self.status)
                .ok_or_else(|| invalid("entity status", &self.status))?,
            memory_type: MemoryType::from_str(&self.memory_type)
                .ok_or_else(|| invalid("memory type", &self.memory_type))?,
            sensitivity: SensitivityLevel::from_str(&self.sensitivity)
                .ok_or_else(|| invalid("sensitivity", &self.sensitivity))?,
            entity_type: EntityType::parse(&self.entity_type),
            aliases: serde_json::from_str(&self.aliases)?,
            embedding,
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            relationship: self.relationship,
            summary: self.summary,
            importance_score: self.importance_score,
            sentiment_average: self.sentiment_average,
            mention_count: self.mention_count,
            is_historical: self.is_historical,
            effective_from: self.effective_from,
            expires_at: self.expires_at,
            recurrence_pattern: self.recurrence_pattern,
            access_count: self.access_count,
            last_accessed_at: self.last_accessed_at,
            last_decayed_at: self.last_decayed_at,
            version: self.version,
            previous_version_id: self.previous_version_id,
            superseded_by: self.superseded_by,
            source_note_id: self.source_note_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Column values that need encoding before binding.
struct EncodedEntity {
    normalized_name: String,
    aliases: String,
    embedding: Option<String>,
}

impl EncodedEntity {
    fn new(entity: &Entity) -> Result<Self> {
        Ok(Self {
            normalized_name: entity.normalized_name(),
            aliases: serde_json::to_string(&entity.aliases)?,
            embedding: entity
                .embedding
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }
}

fn bind_entity<'q>(q: SqliteQuery<'q>, e: &'q Entity, enc: &'q EncodedEntity) -> SqliteQuery<'q> {
    q.bind(&e.user_id)
        .bind(&e.name)
        .bind(&enc.normalized_name)
        .bind(&enc.aliases)
        .bind(e.entity_type.as_str())
        .bind(&e.relationship)
        .bind(&e.summary)
        .bind(e.importance.as_str())
        .bind(e.importance_score)
        .bind(e.sentiment_average)
        .bind(e.mention_count)
        .bind(e.status.as_str())
        .bind(&enc.embedding)
        .bind(e.memory_type.as_str())
        .bind(e.sensitivity.as_str())
        .bind(e.is_historical)
        .bind(e.effective_from)
        .bind(e.expires_at)
        .bind(&e.recurrence_pattern)
        .bind(e.access_count)
        .bind(e.last_accessed_at)
        .bind(e.last_decayed_at)
        .bind(e.version)
        .bind(&e.previous_version_id)
        .bind(&e.superseded_by)
        .bind(&e.source_note_id)
        .bind(e.created_at)
        .bind(e.updated_at)
}

#[derive(Debug, FromRow)]
struct FactRow {
    id: String,
    user_id: String,
    entity_id: String,
    predicate: String,
    object_text: String,
    object_entity_id: Option<String>,
    confidence: f64,
    status: String,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    invalidated_at: Option<DateTime<Utc>>,
    invalidated_by: Option<String>,
    version: i32,
    previous_version_id: Option<String>,
    is_current: bool,
    source_note_id: Option<String>,
    updated_at: DateTime<Utc>,
}

impl FactRow {
    fn into_model(self) -> Result<Fact> {
        Ok(Fact {
            status: FactStatus::from_str(&self.status)
                .ok_or_else(|| invalid("fact status", &self.status))?,
            predicate: Predicate::parse(&self.predicate),
            id: self.id,
            user_id: self.user_id,
            entity_id: self.entity_id,
            object_text: self.object_text,
            object_entity_id: self.object_entity_id,
            confidence: self.confidence,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            created_at: self.created_at,
            invalidated_at: self.invalidated_at,
            invalidated_by: self.invalidated_by,
            version: self.version,
            previous_version_id: self.previous_version_id,
            is_current: self.is_current,
            source_note_id: self.source_note_id,
            updated_at: self.updated_at,
        })
    }
}

fn bind_fact<'q>(q: SqliteQuery<'q>, f: &'q Fact, object_key: &'q str) -> SqliteQuery<'q> {
    q.bind(&f.user_id)
        .bind(&f.entity_id)
        .bind(f.predicate.as_str())
        .bind(f.predicate.is_single_valued())
        .bind(&f.object_text)
        .bind(object_key)
        .bind(&f.object_entity_id)
        .bind(f.confidence)
        .bind(f.status.as_str())
        .bind(f.valid_from)
        .bind(f.valid_to)
        .bind(f.created_at)
        .bind(f.invalidated_at)
        .bind(&f.invalidated_by)
        .bind(f.version)
        .bind(&f.previous_version_id)
        .bind(f.is_current)
        .bind(&f.source_note_id)
        .bind(f.updated_at)
}

#[derive(Debug, FromRow)]
struct RelationshipRow {
    id: String,
    user_id: String,
    source_entity_id: String,
    target_entity_id: String,
    relationship_type: String,
    strength: f64,
    confidence: f64,
    is_active: bool,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_confirmed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RelationshipRow> for Relationship {
    fn from(row: RelationshipRow) -> Self {
        Self {
            relationship_type: RelationshipType::parse(&row.relationship_type),
            id: row.id,
            user_id: row.user_id,
            source_entity_id: row.source_entity_id,
            target_entity_id: row.target_entity_id,
            strength: row.strength,
            confidence: row.confidence,
            is_active: row.is_active,
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_confirmed_at: row.last_confirmed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BehaviorRow {
    id: String,
    user_id: String,
    predicate: String,
    entity_id: String,
    entity_name: String,
    topic: Option<String>,
    sentiment: f64,
    evidence: Option<String>,
    confidence: f64,
    reinforcement_count: i32,
    status: String,
    source_note_id: Option<String>,
    first_detected_at: DateTime<Utc>,
    last_reinforced_at: DateTime<Utc>,
}

impl BehaviorRow {
    fn into_model(self) -> Result<Behavior> {
        Ok(Behavior {
            status: BehaviorStatus::from_str(&self.status)
                .ok_or_else(|| invalid("behavior status", &self.status))?,
            predicate: BehaviorPredicate::parse(&self.predicate),
            id: self.id,
            user_id: self.user_id,
            entity_id: self.entity_id,
            entity_name: self.entity_name,
            topic: self.topic,
            sentiment: self.sentiment,
            evidence: self.evidence,
            confidence: self.confidence,
            reinforcement_count: self.reinforcement_count,
            source_note_id: self.source_note_id,
            first_detected_at: self.first_detected_at,
            last_reinforced_at: self.last_reinforced_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PatternRow {
    id: String,
    user_id: String,
    category: String,
    description: String,
    short_description: String,
    confidence: f64,
    evidence: String,
    status: String,
    surfaced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PatternRow {
    fn into_model(self) -> Result<Pattern> {
        Ok(Pattern {
            category: PatternCategory::from_str(&self.category)
                .ok_or_else(|| invalid("pattern category", &self.category))?,
            status: PatternStatus::from_str(&self.status)
                .ok_or_else(|| invalid("pattern status", &self.status))?,
            evidence: serde_json::from_str(&self.evidence)?,
            id: self.id,
            user_id: self.user_id,
            description: self.description,
            short_description: self.short_description,
            confidence: self.confidence,
            surfaced_at: self.surfaced_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct NoteRow {
    id: String,
    user_id: String,
    title: Option<String>,
    category: Option<String>,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<NoteRow> for NoteMeta {
    fn from(row: NoteRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            category: row.category,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// [`MemoryStore`] over a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and apply the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = super::init_pool(path).await?;
        super::initialize_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM entities WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        qb.push(" AND status = 'active' AND superseded_by IS NULL");
        if !query.include_historical {
            qb.push(" AND is_historical = 0");
        }
        push_like_any(&mut qb, &["name", "aliases"], &query.name_contains);
        if let Some(ids) = &query.ids {
            push_in(&mut qb, "id", ids.clone());
        }
        if let Some(types) = &query.entity_types {
            push_in(
                &mut qb,
                "entity_type",
                types.iter().map(|t| t.as_str().to_string()).collect(),
            );
        }
        if let Some(note_id) = &query.source_note_id {
            qb.push(" AND source_note_id = ");
            qb.push_bind(note_id.clone());
        }
        if let Some(at) = query.visible_at {
            qb.push(" AND (effective_from IS NULL OR julianday(effective_from) <= julianday(");
            qb.push_bind(at);
            qb.push("))");
            if query.exclude_expired {
                qb.push(" AND (expires_at IS NULL OR julianday(expires_at) > julianday(");
                qb.push_bind(at);
                qb.push("))");
            }
        }
        if let Some(max) = query.max_sensitivity {
            push_in(
                &mut qb,
                "sensitivity",
                [SensitivityLevel::Normal, SensitivityLevel::Sensitive, SensitivityLevel::Private]
                    .into_iter()
                    .filter(|level| *level <= max)
                    .map(|level| level.as_str().to_string())
                    .collect(),
            );
        }
        if let Some(after) = &query.after_id {
            qb.push(" AND id > ");
            qb.push_bind(after.clone());
        }
        qb.push(match query.order {
            EntityOrder::Importance => {
                " ORDER BY importance_score DESC, mention_count DESC, id ASC"
            }
            EntityOrder::MentionCount => {
                " ORDER BY mention_count DESC, importance_score DESC, id ASC"
            }
            EntityOrder::RecentlyUpdated => " ORDER BY updated_at DESC, id ASC",
            EntityOrder::Id => " ORDER BY id ASC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb.build_query_as::<EntityRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(EntityRow::into_model).collect()
    }

    async fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>> {
        sqlx::query_as::<_, EntityRow>("SELECT * FROM entities WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(EntityRow::into_model)
            .transpose()
    }

    async fn find_current_entity(
        &self,
        user_id: &str,
        normalized_name: &str,
    ) -> Result<Option<Entity>> {
        sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT * FROM entities
            WHERE user_id = ? AND normalized_name = ?
              AND status = 'active' AND superseded_by IS NULL
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?
        .map(EntityRow::into_model)
        .transpose()
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let encoded = EncodedEntity::new(entity)?;
        let sql = insert_sql("entities", ENTITY_COLUMNS);
        bind_entity(sqlx::query(&sql).bind(&entity.id), entity, &encoded)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    Error::AlreadyExists(format!("Entity named {}", entity.name))
                })
            })?;
        Ok(())
    }

    async fn update_entity(&self, entity: &Entity) -> Result<()> {
        let encoded = EncodedEntity::new(entity)?;
        let sql = update_sql("entities", ENTITY_COLUMNS, "");
        let result = bind_entity(sqlx::query(&sql), entity, &encoded)
            .bind(&entity.id)
            .bind(&entity.user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    Error::AlreadyExists(format!("Entity named {}", entity.name))
                })
            })?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Entity {}", entity.id)));
        }
        Ok(())
    }

    async fn supersede_entity(&self, retired: &Entity, replacement: &Entity) -> Result<()> {
        let retired_enc = EncodedEntity::new(retired)?;
        let replacement_enc = EncodedEntity::new(replacement)?;
        let update = update_sql(
            "entities",
            ENTITY_COLUMNS,
            " AND status = 'active' AND superseded_by IS NULL",
        );
        let insert = insert_sql("entities", ENTITY_COLUMNS);

        let mut tx = self.pool.begin().await?;
        let result = bind_entity(sqlx::query(&update), retired, &retired_enc)
            .bind(&retired.id)
            .bind(&retired.user_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!("Entity {} is not current", retired.id)));
        }
        bind_entity(sqlx::query(&insert).bind(&replacement.id), replacement, &replacement_enc)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    Error::Conflict(format!("Entity named {} already current", replacement.name))
                })
            })?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_entity_access(
        &self,
        user_id: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE entities
                SET access_count = access_count + 1, last_accessed_at = ?
                WHERE id = ? AND user_id = ?
                "#,
            )
            .bind(at)
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_facts(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM facts WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        if query.current_only {
            qb.push(" AND is_current = 1");
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(ids) = &query.entity_ids {
            push_in(&mut qb, "entity_id", ids.clone());
        }
        if let Some(predicates) = &query.predicates {
            push_in(
                &mut qb,
                "predicate",
                predicates.iter().map(|p| p.as_str().to_string()).collect(),
            );
        }
        if let Some(object) = &query.object_equals {
            qb.push(" AND object_key = ");
            qb.push_bind(normalize_name(object));
        }
        if let Some(min) = query.min_confidence {
            qb.push(" AND confidence >= ");
            qb.push_bind(min);
        }
        if let Some(note_id) = &query.source_note_id {
            qb.push(" AND source_note_id = ");
            qb.push_bind(note_id.clone());
        }
        qb.push(match query.order {
            FactOrder::Confidence => " ORDER BY confidence DESC, created_at DESC, id ASC",
            FactOrder::Recent => " ORDER BY created_at DESC, id ASC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb.build_query_as::<FactRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(FactRow::into_model).collect()
    }

    async fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<Fact>> {
        sqlx::query_as::<_, FactRow>("SELECT * FROM facts WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(FactRow::into_model)
            .transpose()
    }

    async fn write_fact(&self, write: &FactWrite) -> Result<()> {
        let insert = &write.insert;
        let insert_key = normalize_name(&insert.object_text);
        let insert_sql = insert_sql("facts", FACT_COLUMNS);
        let contended = || format!("Slot {}/{} contended", insert.entity_id, insert.predicate);

        let mut tx = self.pool.begin().await?;

        if insert.predicate.is_single_valued() && insert.is_current {
            let current: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM facts
                WHERE user_id = ? AND entity_id = ? AND predicate = ? AND is_current = 1
                LIMIT 1
                "#,
            )
            .bind(&insert.user_id)
            .bind(&insert.entity_id)
            .bind(insert.predicate.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_contention(e, contended))?;
            let current_id = current.map(|(id,)| id);
            let expected = write.retire.as_ref().map(|f| f.id.clone());
            if current_id != expected {
                debug!(entity_id = %insert.entity_id, predicate = %insert.predicate, "Fact slot moved");
                return Err(Error::Conflict(format!(
                    "Slot {}/{} moved",
                    insert.entity_id, insert.predicate
                )));
            }
        }

        if let Some(retired) = &write.retire {
            let retired_key = normalize_name(&retired.object_text);
            let update = update_sql(
                "facts",
                FACT_COLUMNS,
                " AND is_current = 1 AND object_text = ?",
            );
            let result = bind_fact(sqlx::query(&update), retired, &retired_key)
                .bind(&retired.id)
                .bind(&retired.user_id)
                .bind(&retired.object_text)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_contention(e, contended))?;
            if result.rows_affected() == 0 {
                return Err(Error::Conflict(format!("Fact {} is not current", retired.id)));
            }
        }

        bind_fact(sqlx::query(&insert_sql).bind(&insert.id), insert, &insert_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    Error::Conflict(format!(
                        "Slot {}/{} already has a current fact",
                        insert.entity_id, insert.predicate
                    ))
                }
                e => map_contention(e, contended),
            })?;

        tx.commit().await.map_err(|e| map_contention(e, contended))?;
        Ok(())
    }

    async fn update_fact(&self, expected: &Fact, updated: &Fact) -> Result<()> {
        let key = normalize_name(&updated.object_text);
        let sql = update_sql(
            "facts",
            FACT_COLUMNS,
            " AND is_current = ? AND status = ? AND object_text = ? AND version = ?",
        );
        let result = bind_fact(sqlx::query(&sql), updated, &key)
            .bind(&updated.id)
            .bind(&updated.user_id)
            .bind(expected.is_current)
            .bind(expected.status.as_str())
            .bind(&expected.object_text)
            .bind(expected.version)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    Error::Conflict(format!("Fact {}", updated.id))
                }
                e => map_contention(e, || format!("Fact {} contended", updated.id)),
            })?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_fact(&updated.user_id, &updated.id).await? {
            Some(_) => Err(Error::Conflict(format!("Fact {} changed", updated.id))),
            None => Err(Error::NotFound(format!("Fact {}", updated.id))),
        }
    }

    async fn delete_fact(&self, user_id: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM facts WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Fact {}", id)));
        }
        Ok(())
    }

    async fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM relationships WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        if query.active_only {
            qb.push(" AND is_active = 1");
        }
        if let Some(entity_id) = &query.entity_id {
            qb.push(" AND (source_entity_id = ");
            qb.push_bind(entity_id.clone());
            qb.push(" OR target_entity_id = ");
            qb.push_bind(entity_id.clone());
            qb.push(")");
        }
        qb.push(" ORDER BY strength DESC, id ASC LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb
            .build_query_as::<RelationshipRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Relationship::from).collect())
    }

    async fn find_relationship(
        &self,
        user_id: &str,
        source_entity_id: &str,
        target_entity_id: &str,
        relationship_type: &RelationshipType,
    ) -> Result<Option<Relationship>> {
        let row = sqlx::query_as::<_, RelationshipRow>(
            r#"
            SELECT * FROM relationships
            WHERE user_id = ? AND source_entity_id = ? AND target_entity_id = ?
              AND relationship_type = ?
            "#,
        )
        .bind(user_id)
        .bind(source_entity_id)
        .bind(target_entity_id)
        .bind(relationship_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Relationship::from))
    }

    async fn upsert_relationship(&self, r: &Relationship) -> Result<()> {
        let sql = upsert_sql("relationships", RELATIONSHIP_COLUMNS);
        sqlx::query(&sql)
            .bind(&r.id)
            .bind(&r.user_id)
            .bind(&r.source_entity_id)
            .bind(&r.target_entity_id)
            .bind(r.relationship_type.as_str())
            .bind(r.strength)
            .bind(r.confidence)
            .bind(r.is_active)
            .bind(r.started_at)
            .bind(r.ended_at)
            .bind(r.last_confirmed_at)
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    Error::AlreadyExists(format!(
                        "Relationship {} -> {} ({})",
                        r.source_entity_id, r.target_entity_id, r.relationship_type
                    ))
                })
            })?;
        Ok(())
    }

    async fn query_behaviors(&self, query: &BehaviorQuery) -> Result<Vec<Behavior>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM behaviors WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        if let Some(status) = query.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(ids) = &query.entity_ids {
            push_in(&mut qb, "entity_id", ids.clone());
        }
        if let Some(note_id) = &query.source_note_id {
            qb.push(" AND source_note_id = ");
            qb.push_bind(note_id.clone());
        }
        qb.push(" ORDER BY confidence DESC, reinforcement_count DESC, id ASC LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb.build_query_as::<BehaviorRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(BehaviorRow::into_model).collect()
    }

    async fn find_behavior(
        &self,
        user_id: &str,
        predicate: &BehaviorPredicate,
        entity_id: &str,
    ) -> Result<Option<Behavior>> {
        sqlx::query_as::<_, BehaviorRow>(
            "SELECT * FROM behaviors WHERE user_id = ? AND predicate = ? AND entity_id = ?",
        )
        .bind(user_id)
        .bind(predicate.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?
        .map(BehaviorRow::into_model)
        .transpose()
    }

    async fn upsert_behavior(&self, b: &Behavior) -> Result<()> {
        let sql = upsert_sql("behaviors", BEHAVIOR_COLUMNS);
        sqlx::query(&sql)
            .bind(&b.id)
            .bind(&b.user_id)
            .bind(b.predicate.as_str())
            .bind(&b.entity_id)
            .bind(&b.entity_name)
            .bind(&b.topic)
            .bind(b.sentiment)
            .bind(&b.evidence)
            .bind(b.confidence)
            .bind(b.reinforcement_count)
            .bind(b.status.as_str())
            .bind(&b.source_note_id)
            .bind(b.first_detected_at)
            .bind(b.last_reinforced_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    Error::AlreadyExists(format!("Behavior {} {}", b.predicate, b.entity_id))
                })
            })?;
        Ok(())
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM patterns WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        match &query.statuses {
            Some(statuses) => push_in(
                &mut qb,
                "status",
                statuses.iter().map(|s| s.as_str().to_string()).collect(),
            ),
            None => {
                qb.push(" AND status != 'rejected'");
            }
        }
        if let Some(min) = query.min_confidence {
            qb.push(" AND confidence >= ");
            qb.push_bind(min);
        }
        qb.push(" ORDER BY confidence DESC, id ASC LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb.build_query_as::<PatternRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(PatternRow::into_model).collect()
    }

    async fn get_pattern(&self, user_id: &str, id: &str) -> Result<Option<Pattern>> {
        sqlx::query_as::<_, PatternRow>("SELECT * FROM patterns WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(PatternRow::into_model)
            .transpose()
    }

    async fn upsert_pattern(&self, p: &Pattern) -> Result<()> {
        let evidence = serde_json::to_string(&p.evidence)?;
        let sql = upsert_sql("patterns", PATTERN_COLUMNS);
        sqlx::query(&sql)
            .bind(&p.id)
            .bind(&p.user_id)
            .bind(p.category.as_str())
            .bind(&p.description)
            .bind(&p.short_description)
            .bind(p.confidence)
            .bind(&evidence)
            .bind(p.status.as_str())
            .bind(p.surfaced_at)
            .bind(p.created_at)
            .bind(p.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<NoteMeta>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM notes WHERE user_id = ");
        qb.push_bind(query.user_id.clone());
        if !query.include_deleted {
            qb.push(" AND is_deleted = 0");
        }
        push_like_any(&mut qb, &["title", "category"], &query.matching);
        qb.push(" ORDER BY updated_at DESC, id ASC LIMIT ");
        qb.push_bind(limit_value(query.limit));

        let rows = qb.build_query_as::<NoteRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(NoteMeta::from).collect())
    }

    async fn get_note(&self, user_id: &str, id: &str) -> Result<Option<NoteMeta>> {
        let row = sqlx::query_as::<_, NoteRow>("SELECT * FROM notes WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(NoteMeta::from))
    }

    async fn upsert_note(&self, n: &NoteMeta) -> Result<()> {
        let sql = upsert_sql("notes", NOTE_COLUMNS);
        sqlx::query(&sql)
            .bind(&n.id)
            .bind(&n.user_id)
            .bind(&n.title)
            .bind(&n.category)
            .bind(n.is_deleted)
            .bind(n.created_at)
            .bind(n.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
