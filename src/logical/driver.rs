//! Per-Schema Loop Driver
//!
//! Owns one schema's persisted consistent point and runs the Reader and
//! Processor halves of a dialect against it, restarting with backoff after
//! transient failures and gating everything behind the dialect's lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::leases::Lease;
use crate::logical::{Dialect, Events, Message, State};
use crate::memo::Memo;
use crate::notify::Var;
use crate::resolver::stamp::ResolvedStamp;

/// Configuration for one loop instance.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Loop name, also the memo key suffix for the consistent point.
    pub name: String,
    /// Reader-to-processor channel depth.
    pub channel_depth: usize,
    /// Initial restart delay after a failure.
    pub min_backoff: Duration,
    /// Restart delay ceiling.
    pub max_backoff: Duration,
    /// When set, run the backfill reader while the consistent point lags
    /// the wall clock by more than this window.
    pub backfill_window: Option<Duration>,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel_depth: 16,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backfill_window: None,
        }
    }
}

/// The durable and in-memory progress of one loop.
pub struct LoopState {
    key: String,
    memo: Arc<dyn Memo>,
    point: Var<ResolvedStamp>,
    stop: watch::Sender<bool>,
}

impl LoopState {
    /// Load the persisted consistent point for `name`, or start from
    /// `zero` when none was saved.
    pub async fn load(name: &str, memo: Arc<dyn Memo>, zero: ResolvedStamp) -> Result<Arc<Self>> {
        let key = format!("consistent-point/{}", name);
        let stamp = match memo.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => zero,
        };
        let (stop, _) = watch::channel(false);
        Ok(Arc::new(Self { key, memo, point: Var::new(stamp), stop }))
    }

    /// Durably persist a new consistent point, then publish it to
    /// in-memory observers.
    pub async fn persist(&self, stamp: &ResolvedStamp) -> Result<()> {
        let encoded = serde_json::to_vec(stamp)?;
        self.memo.put(&self.key, &encoded).await?;
        self.point.set(stamp.clone());
        Ok(())
    }

    /// Ask the loop to shut down cleanly.
    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl State for LoopState {
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>) {
        self.point.get()
    }

    fn stopping(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

/// Drive the dialect until a clean stop.
pub async fn run(
    cfg: LoopConfig,
    dialect: Arc<dyn Dialect>,
    state: Arc<LoopState>,
    events: Arc<dyn Events>,
) {
    let mut backoff = cfg.min_backoff;
    let mut rollback = false;
    let mut stop = state.stopping();

    loop {
        if *stop.borrow() {
            return;
        }

        let lease = match dialect.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                let wait = match err.lease_busy() {
                    Some(expiration) => (expiration - Utc::now()).to_std().unwrap_or_default(),
                    None => {
                        tracing::warn!(name = %cfg.name, error = %err, "lease acquisition failed");
                        backoff
                    }
                };
                let wait = wait.max(Duration::from_millis(100));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = stop.changed() => return,
                }
            }
        };

        let lease_cancel = lease.as_ref().map(|l| l.cancelled());
        let result = run_once(&cfg, &dialect, &state, &events, rollback, lease_cancel).await;
        if let Some(lease) = lease {
            lease.release().await;
        }

        match result {
            Ok(()) => return,
            Err(err) if err.is_cancellation() => {
                // Lease lost; re-acquire and resume from the persisted
                // stamp.
                tracing::debug!(name = %cfg.name, "loop cancelled; re-acquiring");
                rollback = true;
            }
            Err(err) => {
                tracing::warn!(name = %cfg.name, error = %err, delay = ?backoff, "loop restarting after error");
                rollback = true;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop.changed() => return,
                }
                backoff = (backoff * 2).min(cfg.max_backoff);
            }
        }
    }
}

async fn run_once(
    cfg: &LoopConfig,
    dialect: &Arc<dyn Dialect>,
    state: &Arc<LoopState>,
    events: &Arc<dyn Events>,
    rollback: bool,
    lease_cancel: Option<watch::Receiver<bool>>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(cfg.channel_depth);
    if rollback {
        // Invalidate any processor state from the previous incarnation.
        let _ = tx.send(Message::Rollback).await;
    }

    let backfill = should_backfill(cfg, state.as_ref());
    let reader_dialect = dialect.clone();
    let reader_state: Arc<dyn State> = state.clone();
    let reader = async move {
        if backfill {
            reader_dialect.backfill_into(tx, reader_state).await
        } else {
            reader_dialect.read_into(tx, reader_state).await
        }
    };
    let processor = dialect.process(rx, events.clone());

    match lease_cancel {
        Some(mut cancel) => {
            tokio::select! {
                result = async { tokio::try_join!(reader, processor) } => result.map(|_| ()),
                _ = cancel.changed() => Err(Error::Cancelled),
            }
        }
        None => tokio::try_join!(reader, processor).map(|_| ()),
    }
}

/// Backfill while the committed point lags the wall clock by more than the
/// configured window.
fn should_backfill(cfg: &LoopConfig, state: &LoopState) -> bool {
    let Some(window) = cfg.backfill_window else {
        return false;
    };
    let (point, _) = state.get_consistent_point();
    if point.committed_time.is_zero() {
        return true;
    }
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    now_ns.saturating_sub(point.committed_time.nanos()) > window.as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use crate::testing::MemoryMemo;

    #[tokio::test]
    async fn test_state_roundtrip() {
        let memo: Arc<dyn Memo> = Arc::new(MemoryMemo::default());
        let state = LoopState::load("changefeed-app", memo.clone(), ResolvedStamp::default())
            .await
            .unwrap();

        let (point, _) = state.get_consistent_point();
        assert_eq!(point, ResolvedStamp::default());

        let advanced = ResolvedStamp {
            committed_time: Hlc::new(42, 1),
            ..Default::default()
        };
        state.persist(&advanced).await.unwrap();

        // A fresh load sees the persisted stamp.
        let reloaded = LoopState::load("changefeed-app", memo, ResolvedStamp::default())
            .await
            .unwrap();
        let (point, _) = reloaded.get_consistent_point();
        assert_eq!(point, advanced);
    }

    #[tokio::test]
    async fn test_persist_wakes_observers() {
        let memo: Arc<dyn Memo> = Arc::new(MemoryMemo::default());
        let state = LoopState::load("changefeed-app", memo, ResolvedStamp::default())
            .await
            .unwrap();

        let (_, mut updated) = state.get_consistent_point();
        let advanced = ResolvedStamp {
            committed_time: Hlc::new(7, 0),
            ..Default::default()
        };
        state.persist(&advanced).await.unwrap();
        updated.changed().await.unwrap();
        assert_eq!(updated.borrow().committed_time, Hlc::new(7, 0));
    }

    #[tokio::test]
    async fn test_should_backfill_window() {
        let memo: Arc<dyn Memo> = Arc::new(MemoryMemo::default());
        let state = LoopState::load("changefeed-app", memo, ResolvedStamp::default())
            .await
            .unwrap();

        let mut cfg = LoopConfig::new("changefeed-app");
        assert!(!should_backfill(&cfg, &state), "no window means no backfill");

        cfg.backfill_window = Some(Duration::from_secs(60));
        // Zero committed point: always backfill.
        assert!(should_backfill(&cfg, &state));

        // A current committed point is inside the window.
        let now = Utc::now().timestamp_nanos_opt().unwrap();
        state
            .persist(&ResolvedStamp { committed_time: Hlc::new(now, 0), ..Default::default() })
            .await
            .unwrap();
        assert!(!should_backfill(&cfg, &state));

        // A committed point older than the window flips to backfill.
        let stale = now - Duration::from_secs(300).as_nanos() as i64;
        state
            .persist(&ResolvedStamp { committed_time: Hlc::new(stale, 0), ..Default::default() })
            .await
            .unwrap();
        assert!(should_backfill(&cfg, &state));
    }
}
