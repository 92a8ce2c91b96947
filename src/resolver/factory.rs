//! Resolver Factory
//!
//! Creates and owns the per-schema resolver loops: looks up or starts the
//! loop for a schema, revives loops for schemas with unapplied checkpoints
//! at startup, and drains everything at shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::StagehandConfig;
use crate::error::Result;
use crate::hlc::Hlc;
use crate::ident::SchemaName;
use crate::leases::Leases;
use crate::logical::{self, chaos, Dialect, Events, LoopConfig, LoopState, SerialEvents, State};
use crate::memo::Memo;
use crate::resolved::{Marked, ResolvedLog};
use crate::resolver::Resolver;
use crate::staging::Stagers;
use crate::types::{Appliers, Watchers};

struct Handle {
    resolver: Arc<Resolver>,
    state: Arc<LoopState>,
    tasks: Vec<JoinHandle<()>>,
}

/// Factory for [`Resolver`] instances and their loops.
pub struct Resolvers {
    appliers: Arc<dyn Appliers>,
    cfg: Arc<StagehandConfig>,
    leases: Arc<dyn Leases>,
    memo: Arc<dyn Memo>,
    resolved: Arc<dyn ResolvedLog>,
    stagers: Arc<dyn Stagers>,
    target_pool: PgPool,
    watchers: Arc<dyn Watchers>,

    instances: Mutex<HashMap<SchemaName, Handle>>,
}

impl Resolvers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<StagehandConfig>,
        appliers: Arc<dyn Appliers>,
        leases: Arc<dyn Leases>,
        memo: Arc<dyn Memo>,
        resolved: Arc<dyn ResolvedLog>,
        stagers: Arc<dyn Stagers>,
        target_pool: PgPool,
        watchers: Arc<dyn Watchers>,
    ) -> Self {
        Self {
            appliers,
            cfg,
            leases,
            memo,
            resolved,
            stagers,
            target_pool,
            watchers,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Look up or start the resolver loop for a target schema.
    pub async fn get(&self, target: &SchemaName) -> Result<Arc<Resolver>> {
        let mut instances = self.instances.lock().await;
        if let Some(found) = instances.get(target) {
            return Ok(found.resolver.clone());
        }

        let watcher = self.watchers.get(target)?;
        let resolver = Arc::new(Resolver::new(
            self.cfg.resolver.clone(),
            self.leases.clone(),
            self.resolved.clone(),
            self.stagers.clone(),
            target.clone(),
            watcher.clone(),
        ));

        let loop_name = format!("changefeed-{}", target);
        let state =
            LoopState::load(&loop_name, self.memo.clone(), resolver.zero_stamp()).await?;
        let events: Arc<dyn Events> = Arc::new(SerialEvents::new(
            self.appliers.clone(),
            self.target_pool.clone(),
            watcher,
            state.clone(),
        ));
        let dialect: Arc<dyn Dialect> =
            chaos::with_chaos(resolver.clone(), self.cfg.resolver.chaos_prob);

        let mut loop_cfg = LoopConfig::new(loop_name);
        loop_cfg.backfill_window = self.cfg.resolver.backfill_window();

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(logical::run(
            loop_cfg,
            dialect,
            state.clone(),
            events,
        )));

        let retiring = resolver.clone();
        let retire_stop = state.stopping();
        tasks.push(tokio::spawn(async move {
            retiring.retire_loop(retire_stop).await;
        }));

        tracing::info!(schema = %target, "started resolver loop");
        instances.insert(target.clone(), Handle { resolver: resolver.clone(), state, tasks });
        Ok(resolver)
    }

    /// Route a source checkpoint to the schema's resolver, starting its
    /// loop if needed.
    pub async fn mark(&self, target: &SchemaName, ts: Hlc) -> Result<Marked> {
        let resolver = self.get(target).await?;
        resolver.mark(ts).await
    }

    /// Revive a loop for every schema that still has unapplied
    /// checkpoints. Called once at process start.
    pub async fn bootstrap(&self) -> Result<Vec<SchemaName>> {
        let schemas = self.resolved.scan_for_target_schemas().await?;
        for schema in &schemas {
            self.get(schema).await?;
        }
        Ok(schemas)
    }

    /// Stop every loop and wait for shutdown.
    pub async fn close(&self) {
        let mut instances = self.instances.lock().await;
        for handle in instances.values() {
            handle.state.request_stop();
        }
        for (target, handle) in instances.drain() {
            for task in handle.tasks {
                if let Err(err) = task.await {
                    if !err.is_cancelled() {
                        tracing::warn!(schema = %target, error = %err, "loop task panicked");
                    }
                }
            }
        }
    }
}
