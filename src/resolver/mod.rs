//! Resolved-Timestamp Resolver
//!
//! One resolver per target schema. The Reader half watches the resolved
//! log for checkpoints and proposes them; the Processor half drains the
//! staged mutations a proposal covers and advances the schema's consistent
//! point; a background task retires staged data the consistent point has
//! moved past.

mod factory;
mod process;
mod retire;
pub mod stamp;

pub use factory::Resolvers;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::SchemaName;
use crate::leases::{Lease, Leases};
use crate::logical::{Dialect, Events, Message, State};
use crate::notify::Var;
use crate::resolved::{Marked, ResolvedLog};
use crate::staging::Stagers;
use crate::types::Watcher;
use stamp::ResolvedStamp;

/// Records incoming resolved timestamps for one target schema and
/// asynchronously applies the mutations they cover.
pub struct Resolver {
    cfg: ResolverConfig,
    leases: Arc<dyn Leases>,
    /// Fired whenever `mark` accepts a checkpoint.
    marked: Var<Hlc>,
    resolved: Arc<dyn ResolvedLog>,
    /// Latest committed time; drives the retirement task.
    retirements: Var<Hlc>,
    stagers: Arc<dyn Stagers>,
    target: SchemaName,
    watcher: Arc<dyn Watcher>,
}

impl Resolver {
    pub fn new(
        cfg: ResolverConfig,
        leases: Arc<dyn Leases>,
        resolved: Arc<dyn ResolvedLog>,
        stagers: Arc<dyn Stagers>,
        target: SchemaName,
        watcher: Arc<dyn Watcher>,
    ) -> Self {
        Self {
            cfg,
            leases,
            marked: Var::new(Hlc::ZERO),
            resolved,
            retirements: Var::new(Hlc::ZERO),
            stagers,
            target,
            watcher,
        }
    }

    /// The schema this resolver drives.
    pub fn target(&self) -> &SchemaName {
        &self.target
    }

    /// Record a checkpoint from the source. Accepted only if it advances
    /// past every previously-marked checkpoint; older checkpoints are a
    /// no-op. An accepted mark wakes the local reader immediately.
    pub async fn mark(&self, ts: Hlc) -> Result<Marked> {
        let outcome = self.resolved.mark(&self.target, ts).await?;
        if outcome == Marked::Accepted {
            self.marked.set(ts);
        }
        Ok(outcome)
    }

    /// Record a checkpoint as already applied. Used in pass-through mode
    /// where mutations were delivered inline.
    pub async fn record(&self, ts: Hlc) -> Result<()> {
        self.resolved.record(&self.target, ts).await
    }

    /// Load the next unresolved checkpoint and roll the stamp forward to
    /// it. Propagates the [`Error::NoWork`] sentinel.
    async fn next_proposed_stamp(
        &self,
        prev: &ResolvedStamp,
        backfill: bool,
    ) -> Result<ResolvedStamp> {
        let next = self
            .resolved
            .select_timestamp(&self.target, prev.committed_time)
            .await?;
        let mut proposed = prev.new_proposed(next)?;
        proposed.backfill = backfill;
        Ok(proposed)
    }

    /// Reader task body shared by the transactional and backfill modes.
    async fn reader(
        &self,
        tx: mpsc::Sender<Message>,
        state: Arc<dyn State>,
        backfill: bool,
    ) -> Result<()> {
        // This is either from a previous iteration or the zero stamp.
        let (cp, mut cp_updated) = state.get_consistent_point();

        // Resume deletions on restart.
        if !cp.committed_time.is_zero() {
            self.retirements.set(cp.committed_time);
        }

        let mut stop = state.stopping();
        let (_, mut wakeup) = self.marked.get();
        // Kept until a proposal is actually sent; NoWork leaves it in
        // place so the next wakeup retries from the same committed point.
        let mut resume_from = Some(cp);
        // Proposals handed to the processor must be strictly monotone.
        let mut last_sent = Hlc::ZERO;

        loop {
            if let Some(resume) = resume_from.clone() {
                let to_send = if resume.in_progress() {
                    // Restarted in the middle of a drain; replay the
                    // persisted stamp unchanged.
                    tracing::trace!(schema = %self.target, resume = %resume, "loop resuming from partial progress");
                    Some(resume)
                } else {
                    match self.next_proposed_stamp(&resume, backfill).await {
                        Ok(proposed) => {
                            tracing::trace!(schema = %self.target, %proposed, "loop advancing from consistent");
                            Some(proposed)
                        }
                        Err(Error::NoWork) => None,
                        Err(err) => return Err(err),
                    }
                };

                if let Some(next) = to_send {
                    if next.proposed_time > last_sent {
                        last_sent = next.proposed_time;
                        resume_from = None;
                        tokio::select! {
                            sent = tx.send(Message::Stamp(next)) => {
                                if sent.is_err() {
                                    // Processor went away; clean shutdown.
                                    return Ok(());
                                }
                            }
                            _ = stop.changed() => return Ok(()),
                        }
                    } else {
                        // Already in flight; wait for progress.
                        resume_from = None;
                    }
                }
            }

            tokio::select! {
                changed = cp_updated.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    // Once the consistent point has advanced to a
                    // committed state, look for the next checkpoint and
                    // let applied mutations be deleted.
                    let (next, updated) = state.get_consistent_point();
                    cp_updated = updated;
                    if !next.in_progress() {
                        self.retirements.set(next.committed_time);
                        tracing::trace!(schema = %self.target, resume = %next, "loop is resuming");
                        resume_from = Some(next);
                    }
                }
                _ = wakeup.changed() => {
                    // Triggered when mark() accepts a new checkpoint.
                    let (_, next_wakeup) = self.marked.get();
                    wakeup = next_wakeup;
                }
                _ = tokio::time::sleep(self.cfg.backup_polling()) => {
                    // Look for work recorded by peer replicas.
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Dialect for Resolver {
    async fn read_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()> {
        self.reader(tx, state, false).await
    }

    async fn process(&self, mut rx: mpsc::Receiver<Message>, events: Arc<dyn Events>) -> Result<()> {
        while let Some(message) = rx.recv().await {
            match message {
                // No processor-local state needs to be unwound.
                Message::Rollback => continue,
                Message::Stamp(stamp) => self.process_stamp(stamp, &events).await?,
            }
        }
        Ok(())
    }

    fn zero_stamp(&self) -> ResolvedStamp {
        ResolvedStamp::default()
    }

    async fn backfill_into(&self, tx: mpsc::Sender<Message>, state: Arc<dyn State>) -> Result<()> {
        self.reader(tx, state, true).await
    }

    async fn acquire(&self) -> Result<Option<Box<dyn Lease>>> {
        let lease = self.leases.acquire(self.target.raw()).await?;
        Ok(Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::TableName;
    use crate::logical::{chaos, LoopConfig, LoopState};
    use crate::staging::Stager;
    use crate::testing::{
        mutation, FixtureWatcher, MemoryLeases, MemoryMemo, MemoryResolvedLog, MemoryStagers,
        RecordingEvents,
    };
    use std::time::Duration;

    struct Fixture {
        resolver: Arc<Resolver>,
        stagers: Arc<MemoryStagers>,
        resolved: Arc<MemoryResolvedLog>,
        memo: Arc<MemoryMemo>,
        schema: SchemaName,
    }

    fn fixture(cfg: ResolverConfig, groups: &[&[&str]]) -> Fixture {
        let schema = SchemaName::new("app");
        let stagers = Arc::new(MemoryStagers::new());
        let resolved = Arc::new(MemoryResolvedLog::default());
        let memo = Arc::new(MemoryMemo::default());
        let leases: Arc<dyn Leases> = Arc::new(MemoryLeases::new(Duration::from_secs(600)));
        let watcher: Arc<dyn Watcher> = Arc::new(FixtureWatcher::new(groups));
        let resolver = Arc::new(Resolver::new(
            cfg,
            leases,
            resolved.clone(),
            stagers.clone(),
            schema.clone(),
            watcher,
        ));
        Fixture { resolver, stagers, resolved, memo, schema }
    }

    async fn loop_state(fx: &Fixture) -> Arc<LoopState> {
        LoopState::load("changefeed-app", fx.memo.clone(), ResolvedStamp::default())
            .await
            .unwrap()
    }

    fn table(raw: &str) -> TableName {
        TableName::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_simple_advance() {
        let fx = fixture(ResolverConfig::default(), &[&["app.t"]]);
        let t = table("app.t");
        fx.stagers
            .stager(&t)
            .store(&[
                mutation("[\"a\"]", 10, "{\"v\":1}"),
                mutation("[\"b\"]", 10, "{\"v\":2}"),
                mutation("[\"c\"]", 20, "{\"v\":3}"),
            ])
            .await
            .unwrap();

        assert_eq!(fx.resolver.mark(Hlc::new(15, 0)).await.unwrap(), Marked::Accepted);

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);

        let proposal = ResolvedStamp::default().new_proposed(Hlc::new(15, 0)).unwrap();
        fx.resolver.process_stamp(proposal, &events).await.unwrap();

        // Only the two mutations at t=10 were applied.
        let applied = log.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 2);
        assert!(applied.contains(&(t.clone(), Hlc::new(10, 0), b"[\"a\"]".to_vec())));
        assert!(applied.contains(&(t.clone(), Hlc::new(10, 0), b"[\"b\"]".to_vec())));

        // The later mutation is still staged.
        let staged = fx.stagers.stager(&t).staged();
        assert!(staged.contains(&(Hlc::new(20, 0), b"[\"c\"]".to_vec())));

        // The checkpoint was recorded as applied and the consistent point
        // advanced.
        assert!(matches!(
            fx.resolved.select_timestamp(&fx.schema, Hlc::ZERO).await,
            Err(Error::NoWork)
        ));
        let (point, _) = state.get_consistent_point();
        assert_eq!(point.committed_time, Hlc::new(15, 0));
        assert!(!point.in_progress());
    }

    #[tokio::test]
    async fn test_idempotent_mark() {
        let fx = fixture(ResolverConfig::default(), &[&["app.t"]]);

        assert_eq!(fx.resolver.mark(Hlc::new(100, 0)).await.unwrap(), Marked::Accepted);
        assert_eq!(fx.resolver.mark(Hlc::new(50, 0)).await.unwrap(), Marked::Ignored);
        assert_eq!(fx.resolver.mark(Hlc::new(100, 0)).await.unwrap(), Marked::Ignored);

        let next = fx.resolved.select_timestamp(&fx.schema, Hlc::ZERO).await.unwrap();
        assert_eq!(next, Hlc::new(100, 0));
    }

    #[tokio::test]
    async fn test_partial_flush_resume() {
        let cfg = ResolverConfig { ideal_flush_batch_size: 2, ..Default::default() };
        let fx = fixture(cfg, &[&["app.t"]]);
        let t = table("app.t");
        let muts: Vec<_> = (1..=5)
            .map(|i| mutation(&format!("[{}]", i), 10, "{\"v\":1}"))
            .collect();
        fx.stagers.stager(&t).store(&muts).await.unwrap();
        fx.resolver.mark(Hlc::new(10, 0)).await.unwrap();

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);

        // Backfill mode flushes on the size threshold alone, so five rows
        // make two interim flushes plus the final one. Fail the third
        // commit to simulate a crash after the second interim flush.
        let mut proposal = ResolvedStamp::default().new_proposed(Hlc::new(10, 0)).unwrap();
        proposal.backfill = true;
        log.fail_commit(3);
        let err = fx.resolver.process_stamp(proposal, &events).await.unwrap_err();
        assert!(matches!(err, Error::Chaos("OnCommit")));
        assert_eq!(log.applied_count(), 4);

        // Restart: the persisted stamp still carries the proposal and the
        // offsets of the last flushed row.
        let (resume, _) = state.get_consistent_point();
        assert!(resume.in_progress());
        assert_eq!(resume.offset_key, b"[4]".to_vec());

        log.fail_commits.lock().unwrap().clear();
        fx.resolver.process_stamp(resume, &events).await.unwrap();

        let (point, _) = state.get_consistent_point();
        assert_eq!(point.committed_time, Hlc::new(10, 0));
        // Exactly five distinct rows were applied, and nothing before the
        // resume offset was replayed.
        assert_eq!(log.applied_count(), 5);
        assert_eq!(log.committed_rows.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_backfill_fk_ordering() {
        let fx = fixture(ResolverConfig::default(), &[&["app.parent"], &["app.child"]]);
        let parent = table("app.parent");
        let child = table("app.child");
        fx.stagers
            .stager(&parent)
            .store(&[
                mutation("[1]", 18, "{}"),
                mutation("[2]", 5, "{}"),
                mutation("[3]", 12, "{}"),
            ])
            .await
            .unwrap();
        fx.stagers
            .stager(&child)
            .store(&[
                mutation("[10]", 3, "{}"),
                mutation("[11]", 19, "{}"),
                mutation("[12]", 8, "{}"),
            ])
            .await
            .unwrap();
        fx.resolver.mark(Hlc::new(20, 0)).await.unwrap();

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);

        let mut proposal = ResolvedStamp::default().new_proposed(Hlc::new(20, 0)).unwrap();
        proposal.backfill = true;
        fx.resolver.process_stamp(proposal, &events).await.unwrap();

        let rows = log.committed_rows.lock().unwrap().clone();
        assert_eq!(rows.len(), 6);
        let last_parent = rows.iter().rposition(|(t, _, _)| *t == parent).unwrap();
        let first_child = rows.iter().position(|(t, _, _)| *t == child).unwrap();
        assert!(last_parent < first_child, "all parent rows must precede child rows");
    }

    #[tokio::test]
    async fn test_retirement_offset() {
        const SEC: i64 = 1_000_000_000;
        let cfg = ResolverConfig { retire_offset_ms: 5_000, ..Default::default() };
        let fx = fixture(cfg, &[&["app.t"]]);
        let t = table("app.t");
        let muts: Vec<_> = (91..=100)
            .map(|s| mutation(&format!("[{}]", s), s * SEC, "{}"))
            .collect();
        fx.stagers.stager(&t).store(&muts).await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let retiring = fx.resolver.clone();
        let task = tokio::spawn(async move { retiring.retire_loop(stop_rx).await });

        // Committed point reaches t=100s; rows at or before 95s go away.
        fx.resolver.retirements.set(Hlc::new(100 * SEC, 0));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let staged = fx.stagers.stager(&t).staged();
        let times: Vec<i64> = staged.iter().map(|(time, _)| time.nanos() / SEC).collect();
        assert_eq!(times, vec![96, 97, 98, 99, 100]);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_schema_fails_proposal() {
        let fx = fixture(ResolverConfig::default(), &[]);
        let state = loop_state(&fx).await;
        let events: Arc<dyn Events> = Arc::new(RecordingEvents::new(state));

        let proposal = ResolvedStamp::default().new_proposed(Hlc::new(10, 0)).unwrap();
        let err = fx.resolver.process_stamp(proposal, &events).await.unwrap_err();
        assert!(matches!(err, Error::EmptySchema(_)));
    }

    #[tokio::test]
    async fn test_source_transactions_not_split() {
        // Three rows share one epoch; with a flush threshold of 1 the
        // default mode must still hold them to a single flush.
        let cfg = ResolverConfig { ideal_flush_batch_size: 1, ..Default::default() };
        let fx = fixture(cfg, &[&["app.t"]]);
        let t = table("app.t");
        fx.stagers
            .stager(&t)
            .store(&[
                mutation("[1]", 10, "{}"),
                mutation("[2]", 10, "{}"),
                mutation("[3]", 10, "{}"),
                mutation("[4]", 20, "{}"),
            ])
            .await
            .unwrap();
        fx.resolver.mark(Hlc::new(20, 0)).await.unwrap();

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);

        let proposal = ResolvedStamp::default().new_proposed(Hlc::new(20, 0)).unwrap();
        fx.resolver.process_stamp(proposal, &events).await.unwrap();

        // One interim flush at the epoch boundary, one final flush.
        assert_eq!(log.commits.load(std::sync::atomic::Ordering::SeqCst), 2);
        let rows = log.committed_rows.lock().unwrap().clone();
        assert_eq!(rows.len(), 4);
        // The epoch-10 rows all landed in the first flush.
        assert!(rows[..3].iter().all(|(_, time, _)| *time == Hlc::new(10, 0)));
    }

    #[tokio::test]
    async fn test_full_loop_advances() {
        let cfg = ResolverConfig {
            backup_polling_ms: 20,
            ..Default::default()
        };
        let fx = fixture(cfg, &[&["app.t"]]);
        let t = table("app.t");
        fx.stagers
            .stager(&t)
            .store(&[mutation("[1]", 10, "{}"), mutation("[2]", 30, "{}")])
            .await
            .unwrap();

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);
        let dialect: Arc<dyn Dialect> = fx.resolver.clone();

        let mut loop_cfg = LoopConfig::new("changefeed-app");
        loop_cfg.min_backoff = Duration::from_millis(1);
        let running = tokio::spawn(crate::logical::run(loop_cfg, dialect, state.clone(), events));

        fx.resolver.mark(Hlc::new(15, 0)).await.unwrap();
        fx.resolver.mark(Hlc::new(40, 0)).await.unwrap();

        let (mut point, mut updated) = state.get_consistent_point();
        tokio::time::timeout(Duration::from_secs(10), async {
            while point.committed_time < Hlc::new(40, 0) {
                updated.changed().await.unwrap();
                point = updated.borrow().clone();
            }
        })
        .await
        .expect("loop should reach the marked checkpoint");

        state.request_stop();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

        assert_eq!(log.applied_count(), 2);

        // Consistent-point monotonicity across every persisted stamp.
        let stamps = log.stamps.lock().unwrap().clone();
        for pair in stamps.windows(2) {
            assert!(pair[1].order_key() >= pair[0].order_key());
        }
    }

    #[tokio::test]
    async fn test_chaos_convergence() {
        let cfg = ResolverConfig {
            backup_polling_ms: 10,
            ideal_flush_batch_size: 2,
            ..Default::default()
        };
        let fx = fixture(cfg, &[&["app.t"]]);
        let t = table("app.t");
        let muts: Vec<_> = (1..=12)
            .map(|i| mutation(&format!("[{}]", i), (i % 4 + 1) * 10, "{}"))
            .collect();
        fx.stagers.stager(&t).store(&muts).await.unwrap();

        let state = loop_state(&fx).await;
        let recording = RecordingEvents::new(state.clone());
        let log = recording.log.clone();
        let events: Arc<dyn Events> = Arc::new(recording);
        let dialect = chaos::with_chaos(fx.resolver.clone(), 0.1);

        let mut loop_cfg = LoopConfig::new("changefeed-app");
        loop_cfg.min_backoff = Duration::from_millis(1);
        loop_cfg.max_backoff = Duration::from_millis(10);
        let running = tokio::spawn(crate::logical::run(loop_cfg, dialect, state.clone(), events));

        for ts in [Hlc::new(20, 0), Hlc::new(35, 0), Hlc::new(50, 0)] {
            fx.resolver.mark(ts).await.unwrap();
        }

        let (mut point, mut updated) = state.get_consistent_point();
        tokio::time::timeout(Duration::from_secs(60), async {
            while point.committed_time < Hlc::new(50, 0) {
                updated.changed().await.unwrap();
                point = updated.borrow().clone();
            }
        })
        .await
        .expect("loop should converge under chaos");

        state.request_stop();
        tokio::time::timeout(Duration::from_secs(10), running).await.unwrap().unwrap();

        // Application completeness: every staged mutation at or below the
        // final checkpoint was applied at least once.
        let applied = log.applied.lock().unwrap().clone();
        for m in &muts {
            assert!(
                applied.contains(&(t.clone(), m.time, m.key.clone())),
                "mutation {:?} was never applied",
                m.key
            );
        }

        // Consistent-point monotonicity held through every restart.
        let stamps = log.stamps.lock().unwrap().clone();
        for pair in stamps.windows(2) {
            assert!(pair[1].committed_time >= pair[0].committed_time);
        }
    }
}
