//! Schema and Table Identifiers
//!
//! Lightweight newtypes naming target schemas and tables, plus the mapping
//! from a target table to the staging table that queues its mutations.

use serde::{Deserialize, Serialize};

/// A target schema (database) name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A fully-qualified target table name.
///
/// The derived ordering (schema, then table) is the tie-break order used
/// when mutations share an HLC timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: SchemaName,
    pub table: String,
}

impl TableName {
    pub fn new(schema: SchemaName, table: impl Into<String>) -> Self {
        Self { schema, table: table.into() }
    }

    /// Parse a `schema.table` string.
    pub fn parse(raw: &str) -> Option<Self> {
        let (schema, table) = raw.split_once('.')?;
        if schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(SchemaName::new(schema), table))
    }

    /// The name of the staging table that queues mutations for this target
    /// table, inside the given staging schema.
    pub fn staging_table(&self, staging_schema: &SchemaName) -> TableName {
        TableName::new(
            staging_schema.clone(),
            format!("{}_{}", self.schema.raw(), self.table),
        )
    }

    /// Double-quoted `"schema"."table"` form for interpolation into SQL.
    pub fn quoted(&self) -> String {
        format!(
            "\"{}\".\"{}\"",
            self.schema.raw().replace('"', "\"\""),
            self.table.replace('"', "\"\"")
        )
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}
