//! Memo Store
//!
//! A durable key/value store on the staging database. The resolver loops
//! use it to persist their consistent points across restarts.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::ident::{SchemaName, TableName};

/// A key store that persists a value associated to a key.
#[async_trait]
pub trait Memo: Send + Sync {
    /// Retrieve the value associated to the given key, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value associated to the key, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

const SCHEMA_TEMPLATE: &str = r#"
CREATE TABLE IF NOT EXISTS {TABLE} (
  key        STRING NOT NULL PRIMARY KEY,
  value      BYTES,
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

// $1 = key
const GET_TEMPLATE: &str = "SELECT value FROM {TABLE} WHERE key = $1";

// $1 = key, $2 = value
const PUT_TEMPLATE: &str =
    "UPSERT INTO {TABLE} (key, value, updated_at) VALUES ($1, $2, now())";

/// SQL-backed [`Memo`] implementation.
pub struct SqlMemo {
    pool: PgPool,
    sql: MemoSql,
}

struct MemoSql {
    get: String,
    put: String,
}

impl SqlMemo {
    /// Create the memo table if needed and return a store bound to it.
    pub async fn new(pool: PgPool, staging_schema: &SchemaName) -> Result<Self> {
        let table = TableName::new(staging_schema.clone(), "memo");
        sqlx::query(&SCHEMA_TEMPLATE.replace("{TABLE}", &table.quoted()))
            .execute(&pool)
            .await?;

        let quoted = table.quoted();
        let sql = MemoSql {
            get: GET_TEMPLATE.replace("{TABLE}", &quoted),
            put: PUT_TEMPLATE.replace("{TABLE}", &quoted),
        };
        Ok(Self { pool, sql })
    }
}

#[async_trait]
impl Memo for SqlMemo {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(&self.sql.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(&self.sql.put)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_fully_interpolated() {
        let quoted = TableName::new(SchemaName::new("_stagehand"), "memo").quoted();
        for template in [SCHEMA_TEMPLATE, GET_TEMPLATE, PUT_TEMPLATE] {
            let sql = template.replace("{TABLE}", &quoted);
            assert!(!sql.contains("{TABLE}"));
            assert!(sql.contains("\"_stagehand\".\"memo\""));
        }
    }

    #[test]
    fn test_bind_parameter_counts() {
        // get binds the key; put binds the key and the value.
        assert!(GET_TEMPLATE.contains("$1"));
        assert!(!GET_TEMPLATE.contains("$2"));
        assert!(PUT_TEMPLATE.contains("$1"));
        assert!(PUT_TEMPLATE.contains("$2"));
        assert!(!PUT_TEMPLATE.contains("$3"));
    }
}
