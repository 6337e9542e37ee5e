//! Queries against caller-named tables (job sources and destinations)
//!
//! Table and column names come from job descriptors, so they are validated and
//! quoted here; values always travel as bind parameters. Rows are exchanged as
//! JSON and converted by Postgres via `jsonb_populate_recordset` / `to_jsonb`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

/// Quote a table or column name, allowing one `schema.` prefix
pub fn quote_ident(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        bail!("invalid identifier '{}'", name);
    }
    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let valid = part
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63;
        if !valid {
            bail!("invalid identifier '{}'", name);
        }
        quoted.push(format!("\"{}\"", part));
    }
    Ok(quoted.join("."))
}

fn quote_columns(columns: &[String]) -> Result<Vec<String>> {
    columns.iter().map(|c| quote_ident(c)).collect()
}

/// Whether `table` resolves to an existing relation
pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let table = quote_ident(table)?;
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(&table)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Rows with a non-null key
pub async fn count_keyed_rows(pool: &PgPool, table: &str, key_column: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT({}) FROM {}",
        quote_ident(key_column)?,
        quote_ident(table)?
    );
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

/// Keyset page: rows whose key (as text, byte order) sorts after `after`
pub async fn read_page_after(
    pool: &PgPool,
    table: &str,
    key_column: &str,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<(String, Value)>> {
    let sql = page_sql(table, key_column)?;
    let rows: Vec<(String, Value)> = sqlx::query_as(&sql)
        .bind(after)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

fn page_sql(table: &str, key_column: &str) -> Result<String> {
    let key = format!("(src.{})::text COLLATE \"C\"", quote_ident(key_column)?);
    Ok(format!(
        "SELECT {key} AS k, to_jsonb(src) AS r FROM {table} AS src \
         WHERE src.{col} IS NOT NULL AND ($1::text IS NULL OR {key} > $1) \
         ORDER BY {key} LIMIT $2",
        key = key,
        table = quote_ident(table)?,
        col = quote_ident(key_column)?,
    ))
}

/// Insert JSON objects; missing columns take NULL
pub async fn insert_rows(pool: &PgPool, table: &str, columns: &[String], rows: &Value) -> Result<u64> {
    let table = quote_ident(table)?;
    let columns = quote_columns(columns)?.join(", ");
    let sql = format!(
        "INSERT INTO {table} ({columns}) \
         SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)",
        table = table,
        columns = columns,
    );
    let result = sqlx::query(&sql).bind(rows).execute(pool).await?;
    Ok(result.rows_affected())
}

/// Insert or update on `conflict_key`; NULL incoming values keep the stored column
pub async fn upsert_rows(
    pool: &PgPool,
    table: &str,
    columns: &[String],
    conflict_key: &str,
    rows: &Value,
) -> Result<u64> {
    let sql = upsert_sql(table, columns, conflict_key)?;
    let result = sqlx::query(&sql).bind(rows).execute(pool).await?;
    Ok(result.rows_affected())
}

fn upsert_sql(table: &str, columns: &[String], conflict_key: &str) -> Result<String> {
    let table = quote_ident(table)?;
    let key = quote_ident(conflict_key)?;
    let quoted = quote_columns(columns)?;

    let updates: Vec<String> = quoted
        .iter()
        .filter(|c| **c != key)
        .map(|c| format!("{c} = COALESCE(EXCLUDED.{c}, dst.{c})", c = c))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let columns = quoted.join(", ");
    Ok(format!(
        "INSERT INTO {table} AS dst ({columns}) \
         SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({key}) {on_conflict}",
        table = table,
        columns = columns,
        key = key,
        on_conflict = on_conflict,
    ))
}

/// Stored timestamps for the given keys (keys compared as text)
pub async fn existing_versions(
    pool: &PgPool,
    table: &str,
    key_column: &str,
    timestamp_column: &str,
    keys: &[String],
) -> Result<Vec<(String, Option<DateTime<Utc>>)>> {
    let sql = versions_sql(table, key_column, timestamp_column)?;
    let rows: Vec<(String, Option<DateTime<Utc>>)> = sqlx::query_as(&sql)
        .bind(keys)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

fn versions_sql(table: &str, key_column: &str, timestamp_column: &str) -> Result<String> {
    let key = quote_ident(key_column)?;
    Ok(format!(
        "SELECT {key}::text, {ts}::timestamptz FROM {table} WHERE {key}::text = ANY($1)",
        key = key,
        ts = quote_ident(timestamp_column)?,
        table = quote_ident(table)?,
    ))
}
