//! SQL Staging Implementation
//!
//! Staging tables live in the staging schema, one per target table, named
//! `<target_schema>_<target_table>`. All queries address a single staging
//! table; the multi-table scan in `select_many` sequences per-table queries
//! so equal-timestamp rows come out in `(table, key)` order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::{SchemaName, TableName};
use crate::staging::{Stager, Stagers};
use crate::types::{Mutation, SelectManyCursor};

/// Rows deleted per retire statement, bounding transaction size.
const RETIRE_CHUNK: i64 = 10_000;

const SCHEMA_TEMPLATE: &str = r#"
CREATE TABLE IF NOT EXISTS {TABLE} (
  nanos   INT8  NOT NULL,
  logical INT8  NOT NULL,
  key     BYTES NOT NULL,
  mut     BYTES NOT NULL,
  PRIMARY KEY (nanos, logical, key)
)"#;

const STORE_TEMPLATE: &str = r#"
INSERT INTO {TABLE} (nanos, logical, key, mut)
SELECT * FROM unnest($1::INT8[], $2::INT8[], $3::BYTEA[], $4::BYTEA[])
ON CONFLICT DO NOTHING"#;

// $1 = nanos, $2 = logical, $3 = key floor (empty bytes admit every key)
const SELECT_AT_TIME_TEMPLATE: &str = r#"
SELECT key, mut FROM {TABLE}
WHERE nanos = $1 AND logical = $2 AND key > $3
ORDER BY key"#;

// Next distinct timestamp in ((nanos $1, logical $2), (nanos $3, logical $4)]
const NEXT_TIME_TEMPLATE: &str = r#"
SELECT nanos, logical FROM {TABLE}
WHERE (nanos, logical) > ($1, $2) AND (nanos, logical) <= ($3, $4)
ORDER BY nanos, logical
LIMIT 1"#;

// Range scan in (time, key) order, resuming strictly after the offset
// triple ($5, $6, $7).
const SELECT_BACKFILL_TEMPLATE: &str = r#"
SELECT nanos, logical, key, mut FROM {TABLE}
WHERE (nanos, logical) > ($1, $2)
  AND (nanos, logical) <= ($3, $4)
  AND (nanos, logical, key) > ($5, $6, $7)
ORDER BY nanos, logical, key
LIMIT $8"#;

const RETIRE_TEMPLATE: &str = r#"
DELETE FROM {TABLE}
WHERE (nanos, logical, key) IN (
  SELECT nanos, logical, key FROM {TABLE}
  WHERE (nanos, logical) <= ($1, $2)
  LIMIT $3
)"#;

const TRANSACTION_TIMES_TEMPLATE: &str = r#"
SELECT DISTINCT nanos, logical FROM {TABLE}
WHERE (nanos, logical) > ($1, $2) AND (nanos, logical) <= ($3, $4)
ORDER BY nanos, logical"#;

struct StagerSql {
    store: String,
    select_at_time: String,
    next_time: String,
    select_backfill: String,
    retire: String,
    transaction_times: String,
}

/// SQL-backed [`Stager`] for one target table.
pub struct SqlStager {
    target: TableName,
    pool: PgPool,
    sql: StagerSql,
}

impl SqlStager {
    async fn new(pool: PgPool, target: &TableName, staging_schema: &SchemaName) -> Result<Self> {
        let staging = target.staging_table(staging_schema);
        sqlx::query(&SCHEMA_TEMPLATE.replace("{TABLE}", &staging.quoted()))
            .execute(&pool)
            .await?;

        let quoted = staging.quoted();
        let sql = StagerSql {
            store: STORE_TEMPLATE.replace("{TABLE}", &quoted),
            select_at_time: SELECT_AT_TIME_TEMPLATE.replace("{TABLE}", &quoted),
            next_time: NEXT_TIME_TEMPLATE.replace("{TABLE}", &quoted),
            select_backfill: SELECT_BACKFILL_TEMPLATE.replace("{TABLE}", &quoted),
            retire: RETIRE_TEMPLATE.replace("{TABLE}", &quoted),
            transaction_times: TRANSACTION_TIMES_TEMPLATE.replace("{TABLE}", &quoted),
        };
        Ok(Self { target: target.clone(), pool, sql })
    }

    /// Rows at exactly `ts` with key strictly greater than `key_floor`,
    /// ordered by key.
    async fn select_at_time(&self, ts: Hlc, key_floor: &[u8]) -> Result<Vec<Mutation>> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(&self.sql.select_at_time)
            .bind(ts.nanos())
            .bind(i64::from(ts.logical()))
            .bind(key_floor)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, data)| Mutation { key, data, time: ts, meta: None })
            .collect())
    }

    /// Least timestamp in `(after, before]`, if any.
    async fn next_time(&self, after: Hlc, before: Hlc) -> Result<Option<Hlc>> {
        let row: Option<(i64, i64)> = sqlx::query_as(&self.sql.next_time)
            .bind(after.nanos())
            .bind(i64::from(after.logical()))
            .bind(before.nanos())
            .bind(i64::from(before.logical()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(nanos, logical)| Hlc::new(nanos, logical as i32)))
    }

    /// Up to `limit` rows in `(start, end]` strictly after the offset
    /// `(time, key)`, in `(time, key)` order.
    async fn select_backfill(
        &self,
        start: Hlc,
        end: Hlc,
        offset_time: Hlc,
        offset_key: &[u8],
        limit: i64,
    ) -> Result<Vec<Mutation>> {
        let rows: Vec<(i64, i64, Vec<u8>, Vec<u8>)> = sqlx::query_as(&self.sql.select_backfill)
            .bind(start.nanos())
            .bind(i64::from(start.logical()))
            .bind(end.nanos())
            .bind(i64::from(end.logical()))
            .bind(offset_time.nanos())
            .bind(i64::from(offset_time.logical()))
            .bind(offset_key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(nanos, logical, key, data)| Mutation {
                key,
                data,
                time: Hlc::new(nanos, logical as i32),
                meta: None,
            })
            .collect())
    }
}

#[async_trait]
impl Stager for SqlStager {
    async fn store(&self, muts: &[Mutation]) -> Result<()> {
        if muts.is_empty() {
            return Ok(());
        }
        let mut nanos = Vec::with_capacity(muts.len());
        let mut logicals = Vec::with_capacity(muts.len());
        let mut keys = Vec::with_capacity(muts.len());
        let mut data = Vec::with_capacity(muts.len());
        for m in muts {
            if m.key.is_empty() {
                return Err(Error::EmptyKey { table: self.target.to_string() });
            }
            nanos.push(m.time.nanos());
            logicals.push(i64::from(m.time.logical()));
            keys.push(m.key.clone());
            data.push(m.data.clone());
        }

        sqlx::query(&self.sql.store)
            .bind(&nanos)
            .bind(&logicals)
            .bind(&keys)
            .bind(&data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retire(&self, end: Hlc) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(&self.sql.retire)
                .bind(end.nanos())
                .bind(i64::from(end.logical()))
                .bind(RETIRE_CHUNK)
                .execute(&self.pool)
                .await?;
            total += result.rows_affected();
            if result.rows_affected() < RETIRE_CHUNK as u64 {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(table = %self.target, rows = total, through = %end, "retired staged mutations");
        }
        Ok(total)
    }

    async fn transaction_times(&self, after: Hlc, before: Hlc) -> Result<Vec<Hlc>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(&self.sql.transaction_times)
            .bind(after.nanos())
            .bind(i64::from(after.logical()))
            .bind(before.nanos())
            .bind(i64::from(before.logical()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(nanos, logical)| Hlc::new(nanos, logical as i32))
            .collect())
    }
}

/// SQL-backed [`Stagers`] factory with a per-table cache.
pub struct SqlStagers {
    pool: PgPool,
    staging_schema: SchemaName,
    instances: RwLock<HashMap<TableName, Arc<SqlStager>>>,
}

impl SqlStagers {
    pub fn new(pool: PgPool, staging_schema: SchemaName) -> Self {
        Self { pool, staging_schema, instances: RwLock::new(HashMap::new()) }
    }

    async fn stager(&self, table: &TableName) -> Result<Arc<SqlStager>> {
        if let Some(found) = self.instances.read().await.get(table) {
            return Ok(found.clone());
        }

        let mut instances = self.instances.write().await;
        // Re-check under the write lock.
        if let Some(found) = instances.get(table) {
            return Ok(found.clone());
        }
        let created =
            Arc::new(SqlStager::new(self.pool.clone(), table, &self.staging_schema).await?);
        instances.insert(table.clone(), created.clone());
        Ok(created)
    }

    /// Transactional-mode scan: whole epochs in timestamp order.
    async fn select_transactional(
        &self,
        cursor: &mut SelectManyCursor,
    ) -> Result<Vec<(TableName, Mutation)>> {
        // FK grouping is irrelevant when whole source transactions are
        // applied atomically; equal-time rows use the (table, key)
        // tie-break.
        let mut tables = cursor.flattened();
        tables.sort();
        tables.dedup();

        let mut out = Vec::new();
        // The epoch currently being emitted, with the mid-epoch resume
        // position when this call continues an interrupted scan.
        let mut resume: Option<(TableName, Vec<u8>)> = None;
        let mut epoch = if cursor.offset_time.is_zero() {
            None
        } else {
            resume = cursor.offset_table.clone().map(|t| (t, cursor.offset_key.clone()));
            Some(cursor.offset_time)
        };
        let mut last_done = if cursor.offset_time.is_zero() {
            cursor.start
        } else {
            cursor.offset_time
        };

        loop {
            let ts = match epoch.take() {
                Some(ts) => ts,
                None => match self.next_epoch(&tables, last_done, cursor.end).await? {
                    Some(ts) => ts,
                    None => break,
                },
            };

            let skip = resume.take();
            for table in &tables {
                let key_floor: &[u8] = match &skip {
                    Some((skip_table, _)) if table < skip_table => continue,
                    Some((skip_table, key)) if table == skip_table => key,
                    _ => &[],
                };
                let stager = self.stager(table).await?;
                for mutation in stager.select_at_time(ts, key_floor).await? {
                    cursor.advance(table, ts, &mutation.key);
                    out.push((table.clone(), mutation));
                }
            }

            last_done = ts;
            if out.len() >= cursor.limit {
                break;
            }
        }

        Ok(out)
    }

    /// Least staged timestamp across `tables` in `(after, end]`.
    async fn next_epoch(
        &self,
        tables: &[TableName],
        after: Hlc,
        end: Hlc,
    ) -> Result<Option<Hlc>> {
        let mut next: Option<Hlc> = None;
        for table in tables {
            let stager = self.stager(table).await?;
            if let Some(ts) = stager.next_time(after, end).await? {
                next = Some(match next {
                    Some(cur) if cur <= ts => cur,
                    _ => ts,
                });
            }
        }
        Ok(next)
    }

    /// Backfill-mode scan: FK groups in order, tables within a group in
    /// name order, rows by (time, key).
    async fn select_backfill(
        &self,
        cursor: &mut SelectManyCursor,
    ) -> Result<Vec<(TableName, Mutation)>> {
        let groups: Vec<Vec<TableName>> = cursor
            .targets
            .iter()
            .map(|group| {
                let mut tables = group.clone();
                tables.sort();
                tables.dedup();
                tables
            })
            .collect();

        // Skip ahead to the table the previous call stopped in; if the
        // schema changed underneath us, restart from the first table and
        // let target-side idempotence absorb the replay.
        let mut skipping = cursor
            .offset_table
            .as_ref()
            .map(|t| groups.iter().flatten().any(|g| g == t))
            .unwrap_or(false);

        let mut out = Vec::new();
        for group in &groups {
            for table in group {
                let (mut floor_time, mut floor_key) = if skipping {
                    if Some(table) != cursor.offset_table.as_ref() {
                        continue;
                    }
                    skipping = false;
                    (cursor.offset_time, cursor.offset_key.clone())
                } else {
                    (Hlc::ZERO, Vec::new())
                };

                let stager = self.stager(table).await?;
                loop {
                    let remaining = cursor.limit.saturating_sub(out.len());
                    if remaining == 0 {
                        return Ok(out);
                    }
                    let rows = stager
                        .select_backfill(
                            cursor.start,
                            cursor.end,
                            floor_time,
                            &floor_key,
                            remaining as i64,
                        )
                        .await?;
                    let fetched = rows.len();
                    for mutation in rows {
                        floor_time = mutation.time;
                        floor_key = mutation.key.clone();
                        cursor.advance(table, mutation.time, &mutation.key);
                        out.push((table.clone(), mutation));
                    }
                    if fetched < remaining {
                        break; // table exhausted
                    }
                }
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl Stagers for SqlStagers {
    async fn get(&self, table: &TableName) -> Result<Arc<dyn Stager>> {
        let stager: Arc<dyn Stager> = self.stager(table).await?;
        Ok(stager)
    }

    async fn select_many(
        &self,
        cursor: &mut SelectManyCursor,
    ) -> Result<Vec<(TableName, Mutation)>> {
        if cursor.backfill {
            self.select_backfill(cursor).await
        } else {
            self.select_transactional(cursor).await
        }
    }
}
