//! Transaction-Preserving Events
//!
//! The production [`Events`] implementation: each batch is one transaction
//! on the target database, mutations are routed to the external appliers,
//! and the consistent point is persisted through the loop's memo entry.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};
use crate::ident::{SchemaName, TableName};
use crate::logical::{Batch, Events, LoopState, State};
use crate::resolver::stamp::ResolvedStamp;
use crate::types::{Applier, Appliers, Mutation, Watcher};

/// Serial, transaction-preserving [`Events`].
pub struct SerialEvents {
    appliers: Arc<dyn Appliers>,
    target_pool: PgPool,
    watcher: Arc<dyn Watcher>,
    state: Arc<LoopState>,
}

impl SerialEvents {
    pub fn new(
        appliers: Arc<dyn Appliers>,
        target_pool: PgPool,
        watcher: Arc<dyn Watcher>,
        state: Arc<LoopState>,
    ) -> Self {
        Self { appliers, target_pool, watcher, state }
    }
}

impl State for SerialEvents {
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>) {
        self.state.get_consistent_point()
    }

    fn stopping(&self) -> watch::Receiver<bool> {
        self.state.stopping()
    }
}

#[async_trait]
impl Events for SerialEvents {
    async fn on_begin(&self) -> Result<Box<dyn Batch>> {
        let tx = self.target_pool.begin().await?;
        Ok(Box::new(SerialBatch {
            appliers: self.appliers.clone(),
            watcher: self.watcher.clone(),
            tx: Some(tx),
        }))
    }

    async fn set_consistent_point(&self, stamp: &ResolvedStamp) -> Result<()> {
        self.state.persist(stamp).await
    }
}

struct SerialBatch {
    appliers: Arc<dyn Appliers>,
    watcher: Arc<dyn Watcher>,
    // Dropping the transaction without a commit rolls it back, which is
    // what a cancelled flush relies on.
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
}

impl SerialBatch {
    /// Reject mutations whose key arity disagrees with the target table's
    /// primary key. A secondary PK column that is nullable or defaulted
    /// upstream would otherwise silently mis-address rows.
    fn check_key_arity(&self, table: &TableName, muts: &[Mutation]) -> Result<()> {
        let Some(want) = self.watcher.get().primary_key_arity(table) else {
            return Ok(());
        };
        for m in muts {
            let got = match serde_json::from_slice::<serde_json::Value>(&m.key)? {
                serde_json::Value::Array(parts) => parts.len(),
                _ => {
                    return Err(Error::Internal(format!(
                        "mutation key for {} is not a JSON array",
                        table
                    )))
                }
            };
            if got != want {
                return Err(Error::KeyArity { table: table.to_string(), want, got });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Batch for SerialBatch {
    async fn on_data(
        &mut self,
        _source: &SchemaName,
        table: &TableName,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        self.check_key_arity(table, &muts)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::Internal("on_data after commit".into()))?;
        let applier = self.appliers.get(table).await?;
        applier.apply(tx, &muts).await
    }

    async fn flush(&mut self) -> Result<()> {
        // on_data writes through immediately; nothing is buffered here.
        Ok(())
    }

    fn on_commit(mut self: Box<Self>) -> oneshot::Receiver<Result<()>> {
        let (done, rx) = oneshot::channel();
        let tx = self.tx.take();
        tokio::spawn(async move {
            let result = match tx {
                Some(tx) => tx.commit().await.map_err(Error::from),
                None => Err(Error::Internal("on_commit without transaction".into())),
            };
            let _ = done.send(result);
        });
        rx
    }

    async fn on_rollback(mut self: Box<Self>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.rollback().await;
        }
    }
}
