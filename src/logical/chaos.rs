//! Chaos Injection
//!
//! Wraps a dialect and everything it touches with probabilistic error
//! injection at each externally-visible entry point. Property tests use
//! this to validate that the loop's state machine makes deterministic
//! progress under arbitrary failure schedules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::ident::{SchemaName, TableName};
use crate::leases::Lease;
use crate::logical::{Batch, Dialect, Events, Message, State};
use crate::resolver::stamp::ResolvedStamp;
use crate::types::Mutation;

/// Wrap `delegate` with error injection at probability `prob` per entry
/// point. A probability at or below zero returns plain pass-through.
pub fn with_chaos<D: Dialect + 'static>(delegate: Arc<D>, prob: f32) -> Arc<dyn Dialect> {
    if prob <= 0.0 {
        return delegate;
    }
    Arc::new(ChaosDialect { delegate, prob })
}

fn draw(prob: f32) -> bool {
    rand::random::<f32>() < prob
}

fn chaos(entry: &'static str) -> Error {
    Error::Chaos(entry)
}

struct ChaosDialect<D> {
    delegate: Arc<D>,
    prob: f32,
}

#[async_trait]
impl<D: Dialect> Dialect for ChaosDialect<D> {
    async fn read_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("ReadInto"));
        }
        self.delegate.read_into(tx, state).await
    }

    async fn process(&self, rx: mpsc::Receiver<Message>, events: Arc<dyn Events>) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("Process"));
        }
        let events: Arc<dyn Events> = Arc::new(ChaosEvents { delegate: events, prob: self.prob });
        self.delegate.process(rx, events).await
    }

    fn zero_stamp(&self) -> ResolvedStamp {
        self.delegate.zero_stamp()
    }

    async fn backfill_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("BackfillInto"));
        }
        self.delegate.backfill_into(tx, state).await
    }

    async fn acquire(&self) -> Result<Option<Box<dyn Lease>>> {
        if draw(self.prob) {
            return Err(Error::LeaseBusy {
                expiration: Utc::now() + Duration::from_millis(1),
            });
        }
        if draw(self.prob) {
            return Err(chaos("Acquire"));
        }
        self.delegate.acquire().await
    }
}

struct ChaosEvents {
    delegate: Arc<dyn Events>,
    prob: f32,
}

impl State for ChaosEvents {
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>) {
        self.delegate.get_consistent_point()
    }

    fn stopping(&self) -> watch::Receiver<bool> {
        self.delegate.stopping()
    }
}

#[async_trait]
impl Events for ChaosEvents {
    async fn on_begin(&self) -> Result<Box<dyn Batch>> {
        if draw(self.prob) {
            return Err(chaos("OnBegin"));
        }
        let delegate = self.delegate.on_begin().await?;
        Ok(Box::new(ChaosBatch { delegate, prob: self.prob }))
    }

    async fn set_consistent_point(&self, stamp: &ResolvedStamp) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("SetConsistentPoint"));
        }
        self.delegate.set_consistent_point(stamp).await
    }
}

struct ChaosBatch {
    delegate: Box<dyn Batch>,
    prob: f32,
}

#[async_trait]
impl Batch for ChaosBatch {
    async fn on_data(
        &mut self,
        source: &SchemaName,
        table: &TableName,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("OnData"));
        }
        self.delegate.on_data(source, table, muts).await
    }

    async fn flush(&mut self) -> Result<()> {
        if draw(self.prob) {
            return Err(chaos("Flush"));
        }
        self.delegate.flush().await
    }

    fn on_commit(self: Box<Self>) -> oneshot::Receiver<Result<()>> {
        if draw(self.prob) {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(chaos("OnCommit")));
            return rx;
        }
        self.delegate.on_commit()
    }

    async fn on_rollback(self: Box<Self>) {
        // Rollback is injected as a no-op failure in the original; the
        // delegate must still unwind its transaction.
        self.delegate.on_rollback().await
    }
}
