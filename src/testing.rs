//! In-Memory Test Fixtures
//!
//! Memory-backed implementations of the persistence contracts plus a
//! recording `Events`, so the resolver loop's state machine can be
//! exercised without a database. The staging fixture mirrors the SQL
//! implementation's ordering and cursor semantics exactly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::{SchemaName, TableName};
use crate::leases::{Lease, Leases};
use crate::logical::{Batch, Events, LoopState, State};
use crate::memo::Memo;
use crate::resolved::{Marked, ResolvedLog};
use crate::resolver::stamp::ResolvedStamp;
use crate::staging::{Stager, Stagers};
use crate::types::{
    Applier, Appliers, ColumnData, Mutation, SchemaData, SelectManyCursor, Watcher, Watchers,
};

/// Build a mutation with a JSON-array key and object payload.
pub fn mutation(key: &str, nanos: i64, data: &str) -> Mutation {
    Mutation {
        key: key.as_bytes().to_vec(),
        data: data.as_bytes().to_vec(),
        time: Hlc::new(nanos, 0),
        meta: None,
    }
}

/// A watcher serving a fixed schema snapshot.
pub struct FixtureWatcher {
    data: Mutex<Arc<SchemaData>>,
}

impl FixtureWatcher {
    /// Tables named `schema.table`, grouped by FK dependency order, each
    /// with a single primary-key column `id`.
    pub fn new(groups: &[&[&str]]) -> Self {
        let mut data = SchemaData::default();
        for group in groups {
            let mut tables = Vec::new();
            for raw in *group {
                let table = TableName::parse(raw).expect("fixture table name");
                data.columns.insert(
                    table.clone(),
                    vec![ColumnData {
                        name: "id".into(),
                        primary: true,
                        data_type: "INT8".into(),
                    }],
                );
                tables.push(table);
            }
            data.order.push(tables);
        }
        Self { data: Mutex::new(Arc::new(data)) }
    }

}

impl Watcher for FixtureWatcher {
    fn get(&self) -> Arc<SchemaData> {
        self.data.lock().unwrap().clone()
    }
}

/// A [`Watchers`] factory that serves the same fixture for every schema.
pub struct FixtureWatchers(pub Arc<FixtureWatcher>);

impl Watchers for FixtureWatchers {
    fn get(&self, _schema: &SchemaName) -> Result<Arc<dyn Watcher>> {
        Ok(self.0.clone())
    }
}

/// Appliers that accept everything without touching the target.
pub struct NullAppliers;

#[async_trait]
impl Appliers for NullAppliers {
    async fn get(&self, _table: &TableName) -> Result<Arc<dyn Applier>> {
        Ok(Arc::new(NullApplier))
    }
}

struct NullApplier;

#[async_trait]
impl Applier for NullApplier {
    async fn apply(
        &self,
        _tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        _muts: &[Mutation],
    ) -> Result<()> {
        Ok(())
    }
}

/// Memory-backed [`Memo`].
#[derive(Default)]
pub struct MemoryMemo {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl Memo for MemoryMemo {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Memory-backed [`ResolvedLog`] with the same monotone-mark rule as the
/// SQL implementation.
#[derive(Default)]
pub struct MemoryResolvedLog {
    entries: Mutex<HashMap<SchemaName, BTreeMap<Hlc, Option<DateTime<Utc>>>>>,
}

#[async_trait]
impl ResolvedLog for MemoryResolvedLog {
    async fn mark(&self, schema: &SchemaName, ts: Hlc) -> Result<Marked> {
        let mut entries = self.entries.lock().unwrap();
        let log = entries.entry(schema.clone()).or_default();
        if let Some((max, _)) = log.iter().next_back() {
            if ts <= *max {
                return Ok(Marked::Ignored);
            }
        }
        log.insert(ts, None);
        Ok(Marked::Accepted)
    }

    async fn record(&self, schema: &SchemaName, ts: Hlc) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .entry(schema.clone())
            .or_default()
            .insert(ts, Some(Utc::now()));
        Ok(())
    }

    async fn select_timestamp(&self, schema: &SchemaName, after: Hlc) -> Result<Hlc> {
        let entries = self.entries.lock().unwrap();
        let Some(log) = entries.get(schema) else {
            return Err(Error::NoWork);
        };
        log.range(after..)
            .find(|(_, applied)| applied.is_none())
            .map(|(ts, _)| *ts)
            .ok_or(Error::NoWork)
    }

    async fn scan_for_target_schemas(&self) -> Result<Vec<SchemaName>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(_, log)| log.values().any(|applied| applied.is_none()))
            .map(|(schema, _)| schema.clone())
            .collect())
    }
}

/// Memory-backed [`Leases`]. No background renewal; fixtures use lifetimes
/// far longer than any test.
pub struct MemoryLeases {
    duration: Duration,
    held: Arc<Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>>,
}

impl MemoryLeases {
    pub fn new(duration: Duration) -> Self {
        Self { duration, held: Arc::new(Mutex::new(HashMap::new())) }
    }
}

#[async_trait]
impl Leases for MemoryLeases {
    async fn acquire(&self, name: &str) -> Result<Box<dyn Lease>> {
        let mut held = self.held.lock().unwrap();
        if let Some((_, expiration)) = held.get(name) {
            if *expiration > Utc::now() {
                return Err(Error::LeaseBusy { expiration: *expiration });
            }
        }
        let owner = Uuid::new_v4();
        held.insert(name.to_string(), (owner, Utc::now() + self.duration));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(Box::new(MemoryLease {
            name: name.to_string(),
            owner,
            held: self.held.clone(),
            cancel_rx,
            _cancel_tx: cancel_tx,
        }))
    }
}

#[derive(Debug)]
struct MemoryLease {
    name: String,
    owner: Uuid,
    held: Arc<Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>>,
    cancel_rx: watch::Receiver<bool>,
    _cancel_tx: watch::Sender<bool>,
}

#[async_trait]
impl Lease for MemoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    async fn release(self: Box<Self>) {
        let mut held = self.held.lock().unwrap();
        let ours = held.get(&self.name).map(|(owner, _)| *owner == self.owner).unwrap_or(false);
        if ours {
            held.remove(&self.name);
        }
    }
}

type RowMap = BTreeMap<(Hlc, Vec<u8>), Vec<u8>>;

/// Memory-backed [`Stager`] for one table.
pub struct MemoryStager {
    target: TableName,
    rows: Mutex<RowMap>,
}

impl MemoryStager {
    fn select_at_time(&self, ts: Hlc, key_floor: &[u8]) -> Vec<Mutation> {
        let rows = self.rows.lock().unwrap();
        rows.range((ts, Vec::new())..)
            .take_while(|((time, _), _)| *time == ts)
            .filter(|((_, key), _)| key.as_slice() > key_floor)
            .map(|((time, key), data)| Mutation {
                key: key.clone(),
                data: data.clone(),
                time: *time,
                meta: None,
            })
            .collect()
    }

    fn next_time(&self, after: Hlc, before: Hlc) -> Option<Hlc> {
        let rows = self.rows.lock().unwrap();
        rows.keys()
            .map(|(time, _)| *time)
            .find(|time| *time > after && *time <= before)
    }

    fn select_backfill(
        &self,
        start: Hlc,
        end: Hlc,
        offset_time: Hlc,
        offset_key: &[u8],
        limit: usize,
    ) -> Vec<Mutation> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .filter(|((time, key), _)| {
                *time > start
                    && *time <= end
                    && (*time, key.as_slice()) > (offset_time, offset_key)
            })
            .take(limit)
            .map(|((time, key), data)| Mutation {
                key: key.clone(),
                data: data.clone(),
                time: *time,
                meta: None,
            })
            .collect()
    }

    /// Snapshot of every staged `(time, key)` pair, for assertions.
    pub fn staged(&self) -> Vec<(Hlc, Vec<u8>)> {
        self.rows.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl Stager for MemoryStager {
    async fn store(&self, muts: &[Mutation]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for m in muts {
            if m.key.is_empty() {
                return Err(Error::EmptyKey { table: self.target.to_string() });
            }
            rows.entry((m.time, m.key.clone())).or_insert_with(|| m.data.clone());
        }
        Ok(())
    }

    async fn retire(&self, end: Hlc) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(time, _), _| *time > end);
        Ok((before - rows.len()) as u64)
    }

    async fn transaction_times(&self, after: Hlc, before: Hlc) -> Result<Vec<Hlc>> {
        let rows = self.rows.lock().unwrap();
        let mut times: Vec<Hlc> = rows
            .keys()
            .map(|(time, _)| *time)
            .filter(|time| *time > after && *time <= before)
            .collect();
        times.dedup();
        Ok(times)
    }
}

/// Memory-backed [`Stagers`] mirroring the SQL scan semantics.
#[derive(Default)]
pub struct MemoryStagers {
    tables: Mutex<HashMap<TableName, Arc<MemoryStager>>>,
}

impl MemoryStagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stager(&self, table: &TableName) -> Arc<MemoryStager> {
        self.tables
            .lock()
            .unwrap()
            .entry(table.clone())
            .or_insert_with(|| {
                Arc::new(MemoryStager { target: table.clone(), rows: Mutex::new(RowMap::new()) })
            })
            .clone()
    }

    fn select_transactional(&self, cursor: &mut SelectManyCursor) -> Vec<(TableName, Mutation)> {
        let mut tables = cursor.flattened();
        tables.sort();
        tables.dedup();

        let mut out = Vec::new();
        let mut resume: Option<(TableName, Vec<u8>)> = None;
        let mut epoch = if cursor.offset_time.is_zero() {
            None
        } else {
            resume = cursor.offset_table.clone().map(|t| (t, cursor.offset_key.clone()));
            Some(cursor.offset_time)
        };
        let mut last_done = if cursor.offset_time.is_zero() {
            cursor.start
        } else {
            cursor.offset_time
        };

        loop {
            let ts = match epoch.take() {
                Some(ts) => ts,
                None => {
                    let next = tables
                        .iter()
                        .filter_map(|t| self.stager(t).next_time(last_done, cursor.end))
                        .min();
                    match next {
                        Some(ts) => ts,
                        None => break,
                    }
                }
            };

            let skip = resume.take();
            for table in &tables {
                let key_floor: &[u8] = match &skip {
                    Some((skip_table, _)) if table < skip_table => continue,
                    Some((skip_table, key)) if table == skip_table => key,
                    _ => &[],
                };
                for m in self.stager(table).select_at_time(ts, key_floor) {
                    cursor.advance(table, ts, &m.key);
                    out.push((table.clone(), m));
                }
            }

            last_done = ts;
            if out.len() >= cursor.limit {
                break;
            }
        }
        out
    }

    fn select_backfill(&self, cursor: &mut SelectManyCursor) -> Vec<(TableName, Mutation)> {
        let groups: Vec<Vec<TableName>> = cursor
            .targets
            .iter()
            .map(|group| {
                let mut tables = group.clone();
                tables.sort();
                tables.dedup();
                tables
            })
            .collect();

        let mut skipping = cursor
            .offset_table
            .as_ref()
            .map(|t| groups.iter().flatten().any(|g| g == t))
            .unwrap_or(false);

        let mut out = Vec::new();
        for group in &groups {
            for table in group {
                let (mut floor_time, mut floor_key) = if skipping {
                    if Some(table) != cursor.offset_table.as_ref() {
                        continue;
                    }
                    skipping = false;
                    (cursor.offset_time, cursor.offset_key.clone())
                } else {
                    (Hlc::ZERO, Vec::new())
                };

                loop {
                    let remaining = cursor.limit.saturating_sub(out.len());
                    if remaining == 0 {
                        return out;
                    }
                    let rows = self.stager(table).select_backfill(
                        cursor.start,
                        cursor.end,
                        floor_time,
                        &floor_key,
                        remaining,
                    );
                    let fetched = rows.len();
                    for m in rows {
                        floor_time = m.time;
                        floor_key = m.key.clone();
                        cursor.advance(table, m.time, &m.key);
                        out.push((table.clone(), m));
                    }
                    if fetched < remaining {
                        break;
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl Stagers for MemoryStagers {
    async fn get(&self, table: &TableName) -> Result<Arc<dyn Stager>> {
        let stager: Arc<dyn Stager> = self.stager(table);
        Ok(stager)
    }

    async fn select_many(
        &self,
        cursor: &mut SelectManyCursor,
    ) -> Result<Vec<(TableName, Mutation)>> {
        if cursor.backfill {
            Ok(self.select_backfill(cursor))
        } else {
            Ok(self.select_transactional(cursor))
        }
    }
}

/// A committed row observation: `(table, time, key)`.
pub type AppliedRow = (TableName, Hlc, Vec<u8>);

/// Shared observation log behind [`RecordingEvents`].
#[derive(Default)]
pub struct RecordingLog {
    /// Rows from committed batches, in `on_data` order, with multiplicity.
    pub committed_rows: Mutex<Vec<AppliedRow>>,
    /// Distinct committed rows.
    pub applied: Mutex<BTreeSet<AppliedRow>>,
    /// Every persisted stamp, in order.
    pub stamps: Mutex<Vec<ResolvedStamp>>,
    /// Successful commit count.
    pub commits: AtomicUsize,
    /// 1-based commit ordinals that fail instead of applying.
    pub fail_commits: Mutex<BTreeSet<usize>>,
}

impl RecordingLog {
    /// Make the n-th (1-based) commit attempt fail.
    pub fn fail_commit(&self, ordinal: usize) {
        self.fail_commits.lock().unwrap().insert(ordinal);
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

/// Recording [`Events`]: batches buffer their `on_data` calls and append
/// them to the shared log when the commit succeeds, so tests can assert
/// on ordering, completeness, and replay behavior.
pub struct RecordingEvents {
    state: Arc<LoopState>,
    pub log: Arc<RecordingLog>,
}

impl RecordingEvents {
    pub fn new(state: Arc<LoopState>) -> Self {
        Self { state, log: Arc::new(RecordingLog::default()) }
    }
}

impl State for RecordingEvents {
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>) {
        self.state.get_consistent_point()
    }

    fn stopping(&self) -> watch::Receiver<bool> {
        self.state.stopping()
    }
}

#[async_trait]
impl Events for RecordingEvents {
    async fn on_begin(&self) -> Result<Box<dyn Batch>> {
        Ok(Box::new(RecordingBatch { log: self.log.clone(), pending: Vec::new() }))
    }

    async fn set_consistent_point(&self, stamp: &ResolvedStamp) -> Result<()> {
        self.state.persist(stamp).await?;
        self.log.stamps.lock().unwrap().push(stamp.clone());
        Ok(())
    }
}

struct RecordingBatch {
    log: Arc<RecordingLog>,
    pending: Vec<AppliedRow>,
}

#[async_trait]
impl Batch for RecordingBatch {
    async fn on_data(
        &mut self,
        _source: &SchemaName,
        table: &TableName,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        for m in muts {
            self.pending.push((table.clone(), m.time, m.key));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_commit(self: Box<Self>) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let ordinal = self.log.commits.load(Ordering::SeqCst) + 1;
        let result = if self.log.fail_commits.lock().unwrap().contains(&ordinal) {
            Err(Error::Chaos("OnCommit"))
        } else {
            let mut committed = self.log.committed_rows.lock().unwrap();
            let mut applied = self.log.applied.lock().unwrap();
            for row in self.pending {
                committed.push(row.clone());
                applied.insert(row);
            }
            self.log.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let _ = tx.send(result);
        rx
    }

    async fn on_rollback(self: Box<Self>) {
        // Pending rows are simply discarded.
    }
}

/// A [`State`] whose consistent point never changes; used by wrapper
/// tests that only need the interface satisfied.
struct NullState {
    point: crate::notify::Var<ResolvedStamp>,
    stop: watch::Sender<bool>,
}

pub fn null_state() -> Arc<dyn State> {
    let (stop, _) = watch::channel(false);
    Arc::new(NullState { point: crate::notify::Var::new(ResolvedStamp::default()), stop })
}

impl State for NullState {
    fn get_consistent_point(&self) -> (ResolvedStamp, watch::Receiver<ResolvedStamp>) {
        self.point.get()
    }

    fn stopping(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}
