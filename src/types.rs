//! Core Data Types
//!
//! The mutation record exchanged between ingesters, the staging layer and
//! the resolver loop, plus the schema-metadata contract supplied by an
//! external watcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hlc::Hlc;
use crate::ident::{SchemaName, TableName};

/// A single row mutation to upsert into (or delete from) a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Canonical JSON-array encoding of the source primary key, e.g. `[1,"a"]`.
    pub key: Vec<u8>,
    /// Post-image as a JSON object; empty or the literal `null` for deletes.
    pub data: Vec<u8>,
    /// Effective HLC time of the mutation.
    pub time: Hlc,
    /// Upstream annotations; opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

const NULL_BYTES: &[u8] = b"null";

impl Mutation {
    /// True if this mutation deletes the row.
    pub fn is_delete(&self) -> bool {
        self.data.is_empty() || self.data == NULL_BYTES
    }
}

/// SQL column metadata, as reported by the schema watcher.
///
/// Primary-key columns come first, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnData {
    pub name: String,
    pub primary: bool,
    pub data_type: String,
}

/// A snapshot of the target schema's tables.
#[derive(Debug, Clone, Default)]
pub struct SchemaData {
    pub columns: HashMap<TableName, Vec<ColumnData>>,

    /// Foreign-key equivalency groups: once all updates for the tables in
    /// `order[n]` are applied, updates in `order[n+1]` may be applied.
    pub order: Vec<Vec<TableName>>,
}

impl SchemaData {
    /// Count of primary-key columns for a table, if known.
    pub fn primary_key_arity(&self, table: &TableName) -> Option<usize> {
        self.columns
            .get(table)
            .map(|cols| cols.iter().filter(|c| c.primary).count())
    }
}

/// Observes table metadata for one target schema.
pub trait Watcher: Send + Sync {
    /// A snapshot of all tables in the target schema. The returned value
    /// must not be modified.
    fn get(&self) -> Arc<SchemaData>;
}

/// Factory for [`Watcher`] instances.
pub trait Watchers: Send + Sync {
    fn get(&self, schema: &SchemaName) -> Result<Arc<dyn Watcher>>;
}

/// Converts mutations into target-database writes for one table.
///
/// Implementations are external to the core: they own the upsert/delete
/// dialect of the target.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        muts: &[Mutation],
    ) -> Result<()>;
}

/// Factory for [`Applier`] instances.
#[async_trait]
pub trait Appliers: Send + Sync {
    async fn get(&self, table: &TableName) -> Result<Arc<dyn Applier>>;
}

/// Cursor state for [`crate::staging::Stagers::select_many`].
///
/// The offset fields are advanced to the last emitted row on every call,
/// so an interrupted scan resumes strictly after it.
#[derive(Debug, Clone, Default)]
pub struct SelectManyCursor {
    /// Exclusive lower bound.
    pub start: Hlc,
    /// Inclusive upper bound.
    pub end: Hlc,
    /// Foreign-key equivalency groups to scan, outer order significant.
    pub targets: Vec<Vec<TableName>>,
    /// Soft cap on mutations emitted per call.
    pub limit: usize,

    /// If true, read all updates for parent tables before children with no
    /// transactional-boundary guarantees. If false, read whole HLC epochs
    /// in timestamp order.
    pub backfill: bool,

    pub offset_table: Option<TableName>,
    pub offset_key: Vec<u8>,
    pub offset_time: Hlc,
}

impl SelectManyCursor {
    /// Record that `table`/`mut` was the last row handed to the caller.
    pub fn advance(&mut self, table: &TableName, time: Hlc, key: &[u8]) {
        self.offset_table = Some(table.clone());
        self.offset_time = time;
        self.offset_key = key.to_vec();
    }

    /// All targets flattened to one list, preserving group order.
    pub fn flattened(&self) -> Vec<TableName> {
        self.targets.iter().flatten().cloned().collect()
    }
}
