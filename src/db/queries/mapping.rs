//! Mapping set queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::types::{MappingRule, MappingSet};

#[derive(Debug, FromRow)]
struct MappingSetRow {
    id: Uuid,
    name: String,
    version: i32,
    rules: Json<Vec<MappingRule>>,
    created_at: DateTime<Utc>,
}

impl From<MappingSetRow> for MappingSet {
    fn from(row: MappingSetRow) -> Self {
        MappingSet {
            id: row.id,
            name: row.name,
            version: row.version,
            rules: row.rules.0,
            created_at: row.created_at,
        }
    }
}

/// Get one stored version by id
pub async fn get_mapping_set(pool: &PgPool, id: Uuid) -> Result<Option<MappingSet>> {
    let row: Option<MappingSetRow> = sqlx::query_as(
        "SELECT id, name, version, rules, created_at FROM mapping_sets WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(MappingSet::from))
}

/// Highest version of the named set
pub async fn latest_mapping_set(pool: &PgPool, name: &str) -> Result<Option<MappingSet>> {
    let row: Option<MappingSetRow> = sqlx::query_as(
        r#"
        SELECT id, name, version, rules, created_at
        FROM mapping_sets
        WHERE name = $1
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(MappingSet::from))
}

/// Store `rules` as the next version of `name` (version 1 for a new name).
/// Earlier versions stay untouched so jobs pinned to them keep working.
pub async fn create_mapping_version(
    pool: &PgPool,
    name: &str,
    rules: Vec<MappingRule>,
) -> Result<MappingSet> {
    let mut tx = pool.begin().await?;

    // Serialize concurrent edits of the same set
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(name)
        .execute(&mut *tx)
        .await?;

    let current: Option<i32> =
        sqlx::query_scalar("SELECT MAX(version) FROM mapping_sets WHERE name = $1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

    let mut set = MappingSet::new(name, rules);
    set.version = current.unwrap_or(0) + 1;

    sqlx::query(
        r#"
        INSERT INTO mapping_sets (id, name, version, rules, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(set.id)
    .bind(&set.name)
    .bind(set.version)
    .bind(Json(&set.rules))
    .bind(set.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(set)
}
