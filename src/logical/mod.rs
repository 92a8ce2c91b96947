//! Logical Loop Machinery
//!
//! The capability interface between a dialect (here: the resolver) and the
//! per-schema loop that drives it: a Reader task produces stamp proposals,
//! a Processor task consumes them, and the loop restarts both with backoff
//! when a transient failure surfaces.

pub mod chaos;
mod driver;
mod serial;

pub use driver::{run, LoopConfig, LoopState};
pub use serial::SerialEvents;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Result;
use crate::ident::{SchemaName, TableName};
use crate::leases::Lease;
use crate::resolver::stamp::ResolvedStamp;
use crate::types::Mutation;

/// A value exchanged from Reader to Processor.
#[derive(Debug, Clone)]
pub enum Message {
    /// A stamp to make progress toward.
    Stamp(ResolvedStamp),
    /// The loop restarted; any in-flight processor state is invalid.
    Rollback,
}

impl Message {
    pub fn is_rollback(&self) -> bool {
        matches!(self, Message::Rollback)
    }
}

/// The capabilities a loop needs from the logic it drives.
///
/// `backfill_into` and `acquire` are optional refinements: the defaults
/// fall back to the transactional reader and to lease-free operation.
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Produce stamp proposals until stopped. Sends race the stop signal;
    /// a closed receiver is a clean shutdown.
    async fn read_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()>;

    /// Consume proposals and drain their mutations. Returns when the
    /// channel closes.
    async fn process(&self, rx: mpsc::Receiver<Message>, events: Arc<dyn Events>) -> Result<()>;

    /// The initial stamp for a loop with no persisted progress.
    fn zero_stamp(&self) -> ResolvedStamp;

    /// Bulk-load variant of [`Dialect::read_into`].
    async fn backfill_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()> {
        self.read_into(tx, state).await
    }

    /// The exclusive lease gating this dialect's work, if it needs one.
    async fn acquire(&self) -> Result<Option<Box<dyn Lease>>> {
        Ok(None)
    }
}

/// Read access to a loop's progress, shared by Reader and Processor.
pub trait State: Send + Sync {
    /// The current consistent point and a subscription that fires when it
    /// next changes.
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>);

    /// Fires when the loop is asked to shut down cleanly.
    fn stopping(&self) -> watch::Receiver<bool>;
}

/// Target-side operations available to the Processor.
#[async_trait]
pub trait Events: State {
    /// Start a target-side unit of work.
    async fn on_begin(&self) -> Result<Box<dyn Batch>>;

    /// Durably persist the resumption cursor.
    async fn set_consistent_point(&self, stamp: &ResolvedStamp) -> Result<()>;
}

/// One target-side unit of work, owned by a single flush.
///
/// Implementations must roll back when dropped without a commit, so a
/// cancelled flush cannot leave a transaction open.
#[async_trait]
pub trait Batch: Send {
    /// Apply mutations for one target table.
    async fn on_data(
        &mut self,
        source: &SchemaName,
        table: &TableName,
        muts: Vec<Mutation>,
    ) -> Result<()>;

    /// Drain any writes buffered inside the batch.
    async fn flush(&mut self) -> Result<()>;

    /// Commit asynchronously; the returned channel reports the outcome.
    /// Callers must select the channel against cancellation.
    fn on_commit(self: Box<Self>) -> oneshot::Receiver<Result<()>>;

    /// Abort the unit of work.
    async fn on_rollback(self: Box<Self>);
}
