//! Leases
//!
//! Named, time-bounded exclusive locks stored in the staging database.
//! Each resolver loop acquires the lease named after its target schema, so
//! at most one replica drives a schema at any instant. Holders renew in the
//! background; a failed renewal fires the lease's cancellation signal,
//! which must abort in-flight work promptly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::ident::{SchemaName, TableName};

/// A held lease.
#[async_trait]
pub trait Lease: Send + Sync + std::fmt::Debug {
    /// The lease name.
    fn name(&self) -> &str;

    /// Fires `true` when the lease is lost (renewal failed or the holder
    /// was displaced). Work guarded by the lease must observe this.
    fn cancelled(&self) -> watch::Receiver<bool>;

    /// Terminate the lease, releasing the name for other holders.
    async fn release(self: Box<Self>);
}

/// Coordinates exclusive work across replicas.
#[async_trait]
pub trait Leases: Send + Sync {
    /// Acquire the named lease. Fails with [`Error::LeaseBusy`] if another
    /// caller currently holds it.
    async fn acquire(&self, name: &str) -> Result<Box<dyn Lease>>;
}

/// Run `work` whenever the named lease is held.
///
/// The lease is released when `work` returns, when it cannot be renewed, or
/// when `stop` fires. `work` is retried under a re-acquired lease unless it
/// returned [`Error::CancelSingleton`]; other errors are logged.
pub async fn singleton<F, Fut>(
    leases: Arc<dyn Leases>,
    name: &str,
    mut stop: watch::Receiver<bool>,
    work: F,
) where
    F: Fn(watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        if *stop.borrow() {
            return;
        }

        let lease = match leases.acquire(name).await {
            Ok(lease) => lease,
            Err(err) => {
                let wait = match err.lease_busy() {
                    Some(expiration) => {
                        let until = expiration - Utc::now();
                        until.to_std().unwrap_or_default()
                    }
                    None => {
                        tracing::warn!(name, error = %err, "could not acquire lease");
                        std::time::Duration::from_secs(1)
                    }
                };
                // Never spin on a lease that expires immediately.
                let wait = wait.max(std::time::Duration::from_millis(100));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = stop.changed() => return,
                }
            }
        };

        let outcome = tokio::select! {
            result = work(lease.cancelled()) => Some(result),
            _ = stop.changed() => None,
        };
        lease.release().await;

        match outcome {
            None => return,
            Some(Err(Error::CancelSingleton)) => return,
            Some(Err(err)) => {
                tracing::warn!(name, error = %err, "lease-guarded work failed; will retry");
            }
            Some(Ok(())) => {}
        }
    }
}

const SCHEMA_TEMPLATE: &str = r#"
CREATE TABLE IF NOT EXISTS {TABLE} (
  name    STRING      NOT NULL PRIMARY KEY,
  owner   UUID        NOT NULL,
  expires TIMESTAMPTZ NOT NULL
)"#;

// Takes the lease iff it is absent or expired. Returns the granted
// expiration, or no row when another holder is still live.
//
// $1 = name, $2 = owner, $3 = expires
const ACQUIRE_TEMPLATE: &str = r#"
INSERT INTO {TABLE} AS l (name, owner, expires)
VALUES ($1, $2, $3)
ON CONFLICT (name) DO UPDATE SET owner = excluded.owner, expires = excluded.expires
WHERE l.expires < now()
RETURNING expires"#;

const PEEK_TEMPLATE: &str = "SELECT expires FROM {TABLE} WHERE name = $1";

// $1 = name, $2 = owner, $3 = new expiration
const RENEW_TEMPLATE: &str =
    "UPDATE {TABLE} SET expires = $3 WHERE name = $1 AND owner = $2";

const RELEASE_TEMPLATE: &str = "DELETE FROM {TABLE} WHERE name = $1 AND owner = $2";

#[derive(Debug)]
struct LeaseSql {
    acquire: String,
    peek: String,
    renew: String,
    release: String,
}

/// SQL-backed [`Leases`] implementation.
pub struct SqlLeases {
    pool: PgPool,
    cfg: LeaseConfig,
    sql: Arc<LeaseSql>,
}

impl SqlLeases {
    /// Create the leases table if needed and return a coordinator bound
    /// to it.
    pub async fn new(pool: PgPool, staging_schema: &SchemaName, cfg: LeaseConfig) -> Result<Self> {
        let table = TableName::new(staging_schema.clone(), "leases");
        sqlx::query(&SCHEMA_TEMPLATE.replace("{TABLE}", &table.quoted()))
            .execute(&pool)
            .await?;

        let quoted = table.quoted();
        let sql = Arc::new(LeaseSql {
            acquire: ACQUIRE_TEMPLATE.replace("{TABLE}", &quoted),
            peek: PEEK_TEMPLATE.replace("{TABLE}", &quoted),
            renew: RENEW_TEMPLATE.replace("{TABLE}", &quoted),
            release: RELEASE_TEMPLATE.replace("{TABLE}", &quoted),
        });
        Ok(Self { pool, cfg, sql })
    }
}

#[async_trait]
impl Leases for SqlLeases {
    async fn acquire(&self, name: &str) -> Result<Box<dyn Lease>> {
        let owner = Uuid::new_v4();
        let expires = Utc::now() + self.cfg.duration();

        let granted: Option<(DateTime<Utc>,)> = sqlx::query_as(&self.sql.acquire)
            .bind(name)
            .bind(owner)
            .bind(expires)
            .fetch_optional(&self.pool)
            .await?;

        if granted.is_none() {
            let held: Option<(DateTime<Utc>,)> = sqlx::query_as(&self.sql.peek)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            let expiration = held.map(|(e,)| e).unwrap_or_else(Utc::now);
            return Err(Error::LeaseBusy { expiration });
        }

        tracing::debug!(name, %owner, "acquired lease");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let renewal = tokio::spawn(renew_loop(
            self.pool.clone(),
            self.sql.clone(),
            name.to_string(),
            owner,
            self.cfg.clone(),
            cancel_tx,
        ));

        Ok(Box::new(SqlLease {
            name: name.to_string(),
            owner,
            pool: self.pool.clone(),
            sql: self.sql.clone(),
            cancel_rx,
            renewal,
        }))
    }
}

/// Keeps the lease row ahead of its expiration until aborted or lost.
async fn renew_loop(
    pool: PgPool,
    sql: Arc<LeaseSql>,
    name: String,
    owner: Uuid,
    cfg: LeaseConfig,
    cancel_tx: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.renewal_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        ticker.tick().await;
        let expires = Utc::now() + cfg.duration();
        match sqlx::query(&sql.renew)
            .bind(&name)
            .bind(owner)
            .bind(expires)
            .execute(&pool)
            .await
        {
            Ok(result) if result.rows_affected() == 1 => {}
            Ok(_) => {
                tracing::warn!(%name, "lease was taken by another holder");
                let _ = cancel_tx.send(true);
                return;
            }
            Err(err) => {
                tracing::warn!(%name, error = %err, "lease renewal failed");
                let _ = cancel_tx.send(true);
                return;
            }
        }
    }
}

#[derive(Debug)]
struct SqlLease {
    name: String,
    owner: Uuid,
    pool: PgPool,
    sql: Arc<LeaseSql>,
    cancel_rx: watch::Receiver<bool>,
    renewal: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Lease for SqlLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    async fn release(self: Box<Self>) {
        self.renewal.abort();
        if let Err(err) = sqlx::query(&self.sql.release)
            .bind(&self.name)
            .bind(self.owner)
            .execute(&self.pool)
            .await
        {
            // Best effort; the row expires on its own.
            tracing::debug!(name = %self.name, error = %err, "lease release failed");
        }
    }
}
