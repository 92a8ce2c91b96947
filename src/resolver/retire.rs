//! Staged-Mutation Retirement
//!
//! A background task per schema that deletes staged mutations once the
//! committed point has moved past them, keeping a configurable window of
//! history behind the consistent point for diagnostics.

use tokio::sync::watch;

use crate::resolver::Resolver;
use crate::staging::{Stager, Stagers};
use crate::types::Watcher;

impl Resolver {
    /// Retirement task body. Runs until the stop signal fires; individual
    /// table failures are logged and retried on the next committed
    /// advance, since durability is not at risk.
    pub(crate) async fn retire_loop(&self, mut stop: watch::Receiver<bool>) {
        let (mut next, mut next_updated) = self.retirements.get();
        loop {
            if !next.is_zero() {
                // Retain staged data for an extra amount of time. The
                // offset is applied exactly once per wakeup, not per
                // table.
                let through = next.before_offset(self.cfg.retire_offset());
                tracing::trace!(schema = %self.target, %through, "retiring applied mutations");

                let tables: Vec<_> = self.watcher.get().columns.keys().cloned().collect();
                for table in tables {
                    let stager = match self.stagers.get(&table).await {
                        Ok(stager) => stager,
                        Err(err) => {
                            tracing::warn!(%table, error = %err, "could not acquire stager");
                            continue;
                        }
                    };
                    if let Err(err) = stager.retire(through).await {
                        tracing::warn!(%table, error = %err, "error while retiring staged mutations");
                    }
                }
            }

            tokio::select! {
                _ = next_updated.changed() => {
                    (next, next_updated) = self.retirements.get();
                }
                _ = stop.changed() => return,
            }
        }
    }
}
