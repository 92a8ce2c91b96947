//! Proposal Processing
//!
//! Drains the staged mutations covered by one proposed checkpoint,
//! applying them to the target in flush-sized batches and persisting the
//! stamp after every committed flush so a restart resumes mid-drain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::TableName;
use crate::logical::{Batch, Events, State};
use crate::resolved::ResolvedLog;
use crate::resolver::stamp::ResolvedStamp;
use crate::resolver::Resolver;
use crate::staging::Stagers;
use crate::types::{Mutation, SelectManyCursor, Watcher};

/// Per-table buffers accumulated between flushes.
type Buffer = BTreeMap<TableName, Vec<Mutation>>;

impl Resolver {
    /// Make incremental progress in fulfilling one proposed stamp.
    pub(crate) async fn process_stamp(
        &self,
        mut rs: ResolvedStamp,
        events: &Arc<dyn Events>,
    ) -> Result<()> {
        let start = Instant::now();
        let backfill = rs.backfill;
        let targets = self.watcher.get().order.clone();
        if targets.is_empty() {
            return Err(Error::EmptySchema(self.target.to_string()));
        }

        let mut cursor = SelectManyCursor {
            backfill,
            start: rs.committed_time,
            end: rs.proposed_time,
            limit: self.cfg.select_batch_size,
            targets: targets.clone(),
            offset_table: rs.offset_table.clone(),
            offset_key: rs.offset_key.clone(),
            offset_time: rs.offset_time,
        };

        let mut buffer = Buffer::new();
        // Offsets of the last buffered row; an interim flush persists
        // these so a restart resumes strictly after the flushed rows.
        let mut last_buffered: Option<(TableName, Hlc, Vec<u8>)> = None;
        let mut epoch = Hlc::ZERO;
        let mut flush_count = 0usize;
        let mut total = 0usize;

        loop {
            let batch = self.stagers.select_many(&mut cursor).await?;
            if batch.is_empty() {
                break;
            }

            for (table, mutation) in batch {
                // Check for flush before accumulating.
                let needs_flush = if backfill {
                    // Data arrives in table order and can resume at any
                    // row, so a bare size threshold suffices.
                    flush_count >= self.cfg.ideal_flush_batch_size
                } else if self.cfg.flush_every_timestamp {
                    // Preserve every intermediate row state by flushing
                    // on each MVCC boundary change.
                    !epoch.is_zero() && mutation.time > epoch
                } else {
                    // Flush on an epoch change once enough mutations have
                    // accumulated, so a source transaction is never split
                    // across target transactions.
                    flush_count >= self.cfg.ideal_flush_batch_size && mutation.time > epoch
                };

                // The predicate can only fire once a row has been
                // buffered, so the offsets are always present here.
                if needs_flush {
                    if let Some((table, time, key)) = last_buffered.as_ref() {
                        let next = rs.progress_at(table, *time, key);
                        rs = self
                            .flush(events, &targets, &mut buffer, next, backfill, false)
                            .await?;
                        total += flush_count;
                        flush_count = 0;
                    }
                }

                flush_count += 1;
                epoch = mutation.time;
                last_buffered = Some((table.clone(), mutation.time, mutation.key.clone()));
                buffer.entry(table).or_default().push(mutation);
            }
        }

        // Final flush cycle commits the proposed timestamp.
        let committed_time = rs.proposed_time;
        let committed = rs.new_committed()?;
        self.flush(events, &targets, &mut buffer, committed, backfill, true).await?;
        total += flush_count;

        tracing::debug!(
            schema = %self.target,
            committed = %committed_time,
            count = total,
            elapsed = ?start.elapsed(),
            "processed resolved timestamp"
        );
        Ok(())
    }

    /// Apply the buffered mutations as one target batch, then persist the
    /// advanced stamp. A final flush also records the checkpoint as
    /// applied in the resolved log.
    async fn flush(
        &self,
        events: &Arc<dyn Events>,
        targets: &[Vec<TableName>],
        buffer: &mut Buffer,
        next: ResolvedStamp,
        backfill: bool,
        is_final: bool,
    ) -> Result<ResolvedStamp> {
        let flush_start = Instant::now();
        let deadline = self.cfg.flush_timeout(backfill);

        let apply = async {
            let mut batch = events.on_begin().await?;

            // Apply in FK-group order, skipping empty buffers.
            let mut failed = None;
            'groups: for group in targets {
                for table in group {
                    let muts = match buffer.get(table) {
                        Some(muts) if !muts.is_empty() => muts.clone(),
                        _ => continue,
                    };
                    if let Err(err) = batch.on_data(&self.target, table, muts).await {
                        failed = Some(err);
                        break 'groups;
                    }
                }
            }
            if failed.is_none() {
                if let Err(err) = batch.flush().await {
                    failed = Some(err);
                }
            }
            if let Some(err) = failed {
                batch.on_rollback().await;
                return Err(err);
            }

            // OnCommit is asynchronous; wait for the data to be durable,
            // racing the stop signal.
            let mut stop = events.stopping();
            let committed = batch.on_commit();
            tokio::select! {
                outcome = committed => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::Internal("commit result channel dropped".into())),
                },
                _ = stop.changed() => Err(Error::Cancelled),
            }
        };

        match tokio::time::timeout(deadline, apply).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            // The batch future was dropped mid-apply; its transaction
            // unwinds on drop.
            Err(_) => return Err(Error::ApplyTimeout(deadline)),
        }

        // Advance and save the stamp once the flush has completed.
        if is_final {
            self.resolved.record(&self.target, next.committed_time).await?;
        }
        events.set_consistent_point(&next).await?;

        for muts in buffer.values_mut() {
            muts.clear();
        }

        tracing::debug!(
            schema = %self.target,
            elapsed = ?flush_start.elapsed(),
            "flushed mutations"
        );
        Ok(next)
    }
}
