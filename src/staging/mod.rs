//! Mutation Staging
//!
//! A durable queue of unapplied mutations, one staging table per target
//! table. Upstream ingesters insert mutations as they arrive; the resolver
//! loop drains them in order once a resolved checkpoint covers them; the
//! retire path deletes them after the consistent point has moved past.

mod sql;

pub use sql::SqlStagers;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::hlc::Hlc;
use crate::ident::TableName;
use crate::types::{Mutation, SelectManyCursor};

/// Durably persists mutations for one target table.
#[async_trait]
pub trait Stager: Send + Sync {
    /// Idempotent insert of a batch: re-staging an existing
    /// `(time, key)` pair is a no-op.
    async fn store(&self, muts: &[Mutation]) -> Result<()>;

    /// Delete staged mutations with `time <= end`. May take arbitrarily
    /// long and is not bound to a single database transaction; safe to
    /// interleave with concurrent stores and selects.
    async fn retire(&self, end: Hlc) -> Result<u64>;

    /// Distinct HLC timestamps present in `(after, before]`.
    async fn transaction_times(&self, after: Hlc, before: Hlc) -> Result<Vec<Hlc>>;
}

/// Factory for [`Stager`] instances plus the cross-table range scan.
#[async_trait]
pub trait Stagers: Send + Sync {
    /// The stager for a target table, creating its staging table on first
    /// use.
    async fn get(&self, table: &TableName) -> Result<Arc<dyn Stager>>;

    /// Return the next ordered batch of staged mutations in
    /// `(cursor.start, cursor.end]`, restricted to `cursor.targets`, and
    /// advance the cursor offsets to the last emitted row so the following
    /// call resumes strictly after it. An empty batch means the range is
    /// exhausted.
    ///
    /// Transactional mode emits whole HLC epochs in timestamp order, rows
    /// within an epoch ordered by `(table, key)`; `cursor.limit` is only
    /// checked at epoch boundaries, so a batch may run past it to finish
    /// the epoch it started. Backfill mode walks FK groups in order,
    /// tables within a group in name order, rows by `(time, key)`, honors
    /// the limit exactly, and is resumable at any row.
    async fn select_many(&self, cursor: &mut SelectManyCursor)
        -> Result<Vec<(TableName, Mutation)>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mutation, MemoryStagers};

    fn table(raw: &str) -> TableName {
        TableName::parse(raw).unwrap()
    }

    fn cursor(targets: Vec<Vec<TableName>>, end: Hlc, limit: usize) -> SelectManyCursor {
        SelectManyCursor { end, targets, limit, ..Default::default() }
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        let stager = stagers.stager(&t);
        stager.store(&[mutation("[1]", 10, "first")]).await.unwrap();
        stager.store(&[mutation("[1]", 10, "second")]).await.unwrap();
        assert_eq!(stager.staged().len(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_empty_key() {
        let stagers = MemoryStagers::new();
        let stager = stagers.stager(&table("app.t"));
        let mut m = mutation("[1]", 10, "{}");
        m.key.clear();
        assert!(matches!(
            stager.store(&[m]).await.unwrap_err(),
            crate::Error::EmptyKey { .. }
        ));
    }

    #[tokio::test]
    async fn test_transactional_order_and_tie_break() {
        let stagers = MemoryStagers::new();
        let a = table("app.a");
        let b = table("app.b");
        stagers
            .stager(&a)
            .store(&[mutation("[2]", 10, "{}"), mutation("[1]", 20, "{}")])
            .await
            .unwrap();
        stagers
            .stager(&b)
            .store(&[mutation("[1]", 10, "{}"), mutation("[3]", 10, "{}")])
            .await
            .unwrap();

        let mut cursor = cursor(vec![vec![b.clone(), a.clone()]], Hlc::new(100, 0), 1000);
        let rows = stagers.select_many(&mut cursor).await.unwrap();

        // HLC order across tables; within the epoch, (table, key) order.
        let emitted: Vec<(TableName, i64, Vec<u8>)> =
            rows.iter().map(|(t, m)| (t.clone(), m.time.nanos(), m.key.clone())).collect();
        assert_eq!(
            emitted,
            vec![
                (a.clone(), 10, b"[2]".to_vec()),
                (b.clone(), 10, b"[1]".to_vec()),
                (b.clone(), 10, b"[3]".to_vec()),
                (a.clone(), 20, b"[1]".to_vec()),
            ]
        );

        // Range exhausted: the next call is empty.
        assert!(stagers.select_many(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transactional_never_splits_epoch() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        stagers
            .stager(&t)
            .store(&[
                mutation("[1]", 10, "{}"),
                mutation("[2]", 10, "{}"),
                mutation("[3]", 10, "{}"),
                mutation("[4]", 20, "{}"),
            ])
            .await
            .unwrap();

        // A limit of 1 still returns the whole epoch at t=10.
        let mut cursor = cursor(vec![vec![t.clone()]], Hlc::new(100, 0), 1);
        let rows = stagers.select_many(&mut cursor).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|(_, m)| m.time == Hlc::new(10, 0)));

        let rows = stagers.select_many(&mut cursor).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.time, Hlc::new(20, 0));
    }

    #[tokio::test]
    async fn test_transactional_resumes_mid_epoch() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        stagers
            .stager(&t)
            .store(&[
                mutation("[1]", 10, "{}"),
                mutation("[2]", 10, "{}"),
                mutation("[3]", 10, "{}"),
            ])
            .await
            .unwrap();

        // A restarted scan with persisted offsets picks up strictly after
        // the offset row.
        let mut cursor = cursor(vec![vec![t.clone()]], Hlc::new(100, 0), 1000);
        cursor.offset_table = Some(t.clone());
        cursor.offset_time = Hlc::new(10, 0);
        cursor.offset_key = b"[1]".to_vec();

        let rows = stagers.select_many(&mut cursor).await.unwrap();
        let keys: Vec<Vec<u8>> = rows.iter().map(|(_, m)| m.key.clone()).collect();
        assert_eq!(keys, vec![b"[2]".to_vec(), b"[3]".to_vec()]);
    }

    #[tokio::test]
    async fn test_backfill_honors_limit_and_resumes() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        let muts: Vec<_> =
            (1..=5).map(|i| mutation(&format!("[{}]", i), 10 + i, "{}")).collect();
        stagers.stager(&t).store(&muts).await.unwrap();

        let mut cursor = cursor(vec![vec![t.clone()]], Hlc::new(100, 0), 2);
        cursor.backfill = true;

        let mut seen = Vec::new();
        loop {
            let rows = stagers.select_many(&mut cursor).await.unwrap();
            if rows.is_empty() {
                break;
            }
            assert!(rows.len() <= 2);
            seen.extend(rows.into_iter().map(|(_, m)| m.key));
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_backfill_group_order() {
        let stagers = MemoryStagers::new();
        let parent = table("app.parent");
        let child = table("app.child");
        stagers
            .stager(&parent)
            .store(&[mutation("[1]", 30, "{}"), mutation("[2]", 10, "{}")])
            .await
            .unwrap();
        stagers
            .stager(&child)
            .store(&[mutation("[9]", 5, "{}")])
            .await
            .unwrap();

        // Parent rows come first even though the child row is earliest.
        let mut cursor =
            cursor(vec![vec![parent.clone()], vec![child.clone()]], Hlc::new(100, 0), 1000);
        cursor.backfill = true;
        let rows = stagers.select_many(&mut cursor).await.unwrap();
        let tables: Vec<TableName> = rows.iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(tables, vec![parent.clone(), parent, child]);
    }

    #[tokio::test]
    async fn test_retire_boundary() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        stagers
            .stager(&t)
            .store(&[
                mutation("[1]", 10, "{}"),
                mutation("[2]", 20, "{}"),
                mutation("[3]", 30, "{}"),
            ])
            .await
            .unwrap();

        let removed = stagers.stager(&t).retire(Hlc::new(20, 0)).await.unwrap();
        assert_eq!(removed, 2);
        let staged = stagers.stager(&t).staged();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, Hlc::new(30, 0));
    }

    #[tokio::test]
    async fn test_transaction_times() {
        let stagers = MemoryStagers::new();
        let t = table("app.t");
        stagers
            .stager(&t)
            .store(&[
                mutation("[1]", 10, "{}"),
                mutation("[2]", 10, "{}"),
                mutation("[3]", 20, "{}"),
                mutation("[4]", 30, "{}"),
            ])
            .await
            .unwrap();

        let times = stagers
            .stager(&t)
            .transaction_times(Hlc::new(10, 0), Hlc::new(30, 0))
            .await
            .unwrap();
        assert_eq!(times, vec![Hlc::new(20, 0), Hlc::new(30, 0)]);
    }
}
