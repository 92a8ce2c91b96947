//! Resolved-Timestamp Log
//!
//! The durable record of resolved checkpoints per target schema. Sources
//! promise that no further mutations will appear at or before a resolved
//! timestamp; this log orders those promises and tracks which of them have
//! been fully applied to the target.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::{SchemaName, TableName};

/// Outcome of [`ResolvedLog::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marked {
    /// The checkpoint advanced the schema's frontier and was recorded.
    Accepted,
    /// The checkpoint did not advance the frontier; nothing was written.
    Ignored,
}

/// Durable log of resolved checkpoints per target schema.
#[async_trait]
pub trait ResolvedLog: Send + Sync {
    /// Conditionally insert a new checkpoint. Accepted only if strictly
    /// greater, in `(nanos, logical)` tuple order, than every existing
    /// checkpoint for the schema.
    async fn mark(&self, schema: &SchemaName, ts: Hlc) -> Result<Marked>;

    /// Unconditionally upsert the checkpoint with `applied_at = now()`,
    /// acknowledging it as applied (or, in pass-through mode, recording a
    /// checkpoint that was already delivered inline).
    async fn record(&self, schema: &SchemaName, ts: Hlc) -> Result<()>;

    /// The least unapplied checkpoint at or after `after` for the schema.
    /// Fails with [`Error::NoWork`] if none exists.
    async fn select_timestamp(&self, schema: &SchemaName, after: Hlc) -> Result<Hlc>;

    /// All schemas with at least one unapplied checkpoint. Used at startup
    /// to revive resolver loops.
    async fn scan_for_target_schemas(&self) -> Result<Vec<SchemaName>>;
}

// The secondary index allows the latest-known checkpoint for a schema to be
// found without running into locks held on a dequeued row. That rev-scan is
// what serializes concurrent markers.
const SCHEMA_TEMPLATE: &str = r#"
CREATE TABLE IF NOT EXISTS {TABLE} (
  target_schema     STRING NOT NULL,
  source_nanos      INT8   NOT NULL,
  source_logical    INT8   NOT NULL,
  target_applied_at TIMESTAMPTZ,
  PRIMARY KEY (target_schema, source_nanos, source_logical),
  INDEX (target_schema, source_nanos DESC, source_logical DESC)
)"#;

// Conditionally inserts a new mark for a target schema if there is no
// previous mark or the proposed mark is after the latest-known mark.
//
// $1 = target_schema, $2 = source_nanos, $3 = source_logical
const MARK_TEMPLATE: &str = r#"
WITH
not_before AS (
  SELECT source_nanos, source_logical FROM {TABLE}
  WHERE target_schema = $1
  ORDER BY source_nanos DESC, source_logical DESC
  FOR UPDATE
  LIMIT 1),
to_insert AS (
  SELECT $1::STRING, $2::INT8, $3::INT8
  WHERE (SELECT count(*) FROM not_before) = 0
     OR ($2::INT8, $3::INT8) > (SELECT (source_nanos, source_logical) FROM not_before))
INSERT INTO {TABLE} (target_schema, source_nanos, source_logical)
SELECT * FROM to_insert"#;

const RECORD_TEMPLATE: &str = r#"
UPSERT INTO {TABLE} (target_schema, source_nanos, source_logical, target_applied_at)
VALUES ($1, $2, $3, now())"#;

// $1 = target_schema, $2 = last_known_nanos, $3 = last_known_logical
const SELECT_TIMESTAMP_TEMPLATE: &str = r#"
SELECT source_nanos, source_logical
  FROM {TABLE}
 WHERE target_schema = $1
   AND (source_nanos, source_logical) >= ($2, $3)
   AND target_applied_at IS NULL
 ORDER BY source_nanos, source_logical
 LIMIT 1"#;

const SCAN_TEMPLATE: &str = r#"
SELECT DISTINCT target_schema
FROM {TABLE}
WHERE target_applied_at IS NULL"#;

/// SQL-backed [`ResolvedLog`] over the meta table in the staging schema.
pub struct SqlResolvedLog {
    pool: PgPool,
    sql: ResolvedSql,
}

struct ResolvedSql {
    mark: String,
    record: String,
    select_timestamp: String,
    scan: String,
}

impl SqlResolvedLog {
    /// Create the meta table if needed and return a log bound to it.
    pub async fn new(pool: PgPool, staging_schema: &SchemaName) -> Result<Self> {
        let table = TableName::new(staging_schema.clone(), "resolved_timestamps");
        sqlx::query(&SCHEMA_TEMPLATE.replace("{TABLE}", &table.quoted()))
            .execute(&pool)
            .await?;

        let quoted = table.quoted();
        let sql = ResolvedSql {
            mark: MARK_TEMPLATE.replace("{TABLE}", &quoted),
            record: RECORD_TEMPLATE.replace("{TABLE}", &quoted),
            select_timestamp: SELECT_TIMESTAMP_TEMPLATE.replace("{TABLE}", &quoted),
            scan: SCAN_TEMPLATE.replace("{TABLE}", &quoted),
        };
        Ok(Self { pool, sql })
    }
}

#[async_trait]
impl ResolvedLog for SqlResolvedLog {
    async fn mark(&self, schema: &SchemaName, ts: Hlc) -> Result<Marked> {
        let result = sqlx::query(&self.sql.mark)
            .bind(schema.raw())
            .bind(ts.nanos())
            .bind(i64::from(ts.logical()))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            tracing::trace!(%schema, resolved = %ts, "ignoring no-op resolved timestamp");
            return Ok(Marked::Ignored);
        }
        tracing::trace!(%schema, resolved = %ts, "marked new resolved timestamp");
        Ok(Marked::Accepted)
    }

    async fn record(&self, schema: &SchemaName, ts: Hlc) -> Result<()> {
        sqlx::query(&self.sql.record)
            .bind(schema.raw())
            .bind(ts.nanos())
            .bind(i64::from(ts.logical()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_timestamp(&self, schema: &SchemaName, after: Hlc) -> Result<Hlc> {
        let row: Option<(i64, i64)> = sqlx::query_as(&self.sql.select_timestamp)
            .bind(schema.raw())
            .bind(after.nanos())
            .bind(i64::from(after.logical()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((nanos, logical)) => Ok(Hlc::new(nanos, logical as i32)),
            None => Err(Error::NoWork),
        }
    }

    async fn scan_for_target_schemas(&self) -> Result<Vec<SchemaName>> {
        let rows: Vec<(String,)> = sqlx::query_as(&self.sql.scan)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(raw,)| SchemaName::new(raw)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The SQL templates are interpolated once at construction; make sure
    // the placeholder substitution is total.
    #[test]
    fn test_templates_fully_interpolated() {
        let quoted = TableName::parse("_stagehand.resolved_timestamps").unwrap().quoted();
        for template in [
            SCHEMA_TEMPLATE,
            MARK_TEMPLATE,
            RECORD_TEMPLATE,
            SELECT_TIMESTAMP_TEMPLATE,
            SCAN_TEMPLATE,
        ] {
            let sql = template.replace("{TABLE}", &quoted);
            assert!(!sql.contains("{TABLE}"));
            assert!(sql.contains("\"_stagehand\".\"resolved_timestamps\""));
        }
    }
}
