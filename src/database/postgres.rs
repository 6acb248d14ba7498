//! PostgreSQL-family implementation of the [`Backend`] contract.
//!
//! The adapter owns at most one pool resource behind a read-write lock. Structural
//! transitions (`connect`, `close`, discarding a dead pool) take the exclusive lock;
//! every other operation takes the shared lock only long enough to clone the pool
//! reference and then queries without holding it. A dead pool is never replaced
//! implicitly: after a failed liveness check every operation fails with
//! [`Error::ConnectionFailed`] until `connect` is called again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::backend::{
    Backend, ConnectionState, DownstreamPeer, HealthReport, ReplicationPosition,
    ReplicationStatus, Role, SyncMode, Transition, UpstreamPeer,
};
use super::config::{DatabaseConfig, DEFAULT_APPLICATION_NAME, DEFAULT_PORT};
use super::pool::{Connector, PgConnector, PoolStats, SqlPool};
use super::sql::{self, PrimaryConnInfo};
use super::Row;
use crate::error::{Error, Result};

/// Engine family tag carried by every [`ReplicationPosition`] this adapter returns
pub const ENGINE_FAMILY: &str = "postgresql";

const READ_ONLY_SETTLE_ATTEMPTS: u32 = 20;
const READ_ONLY_SETTLE_INTERVAL: Duration = Duration::from_millis(50);

/// Connection usage (percent of `max_connections`) above which a node reports unhealthy
const CONNECTION_USAGE_LIMIT_PERCENT: i64 = 90;

/// Backend for a single PostgreSQL node
pub struct PostgresBackend<C: Connector = PgConnector> {
    config: DatabaseConfig,
    node_id: String,
    connector: C,
    pool: RwLock<Option<Arc<C::Pool>>>,
    state: Mutex<ConnectionState>,
}

impl<C: Connector> fmt::Debug for PostgresBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("node", &self.node_id)
            .field("state", &*self.state.lock())
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Creates an unconnected backend that opens bb8 pools over tokio-postgres
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        Self::with_connector(config, PgConnector)
    }
}

impl<C: Connector> PostgresBackend<C> {
    /// Creates an unconnected backend with a custom pool connector.
    ///
    /// The configuration is validated and defaults are applied here, before any I/O.
    pub fn with_connector(mut config: DatabaseConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let node_id = config.address();
        Ok(Self {
            config,
            node_id,
            connector,
            pool: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
        })
    }

    /// Validated configuration of this node
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Raw pool resource, if connected.
    ///
    /// This is an escape hatch: statements issued through it bypass the timeouts,
    /// logging and role checks of the contract operations, and the returned handle
    /// stays usable by the caller even after [`Backend::close`].
    pub async fn pool(&self) -> Option<Arc<C::Pool>> {
        self.pool.read().await.clone()
    }

    /// Runs an arbitrary row-returning statement.
    ///
    /// Bypasses the contract's guarantees; prefer the [`Backend`] operations.
    pub async fn execute_query(&self, query: &str) -> Result<Vec<Row>> {
        let pool = self.snapshot().await?;
        debug!(node = %self.node_id, "executing ad-hoc query");
        self.query(&pool, "ad-hoc query", query).await
    }

    /// Runs an arbitrary statement and returns the affected row count.
    ///
    /// Bypasses the contract's guarantees; prefer the [`Backend`] operations.
    pub async fn execute_command(&self, command: &str) -> Result<u64> {
        let pool = self.snapshot().await?;
        debug!(node = %self.node_id, "executing ad-hoc command");
        self.execute(&pool, "ad-hoc command", command).await
    }

    /// Pool statistics, if connected
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.read().await.as_ref().map(|pool| pool.stats())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    async fn snapshot(&self) -> Result<Arc<C::Pool>> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::connection(format!("not connected to {}", self.node_id)))
    }

    /// Removes `dead` from the handle unless a concurrent `connect` already replaced it
    async fn discard(&self, dead: &Arc<C::Pool>) {
        let removed = {
            let mut slot = self.pool.write().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, dead) => {
                    self.set_state(ConnectionState::Disconnected);
                    slot.take()
                }
                _ => None,
            }
        };
        if let Some(pool) = removed {
            self.release(pool).await;
        }
    }

    async fn release(&self, pool: Arc<C::Pool>) {
        if let Err(e) = pool.close().await {
            warn!(node = %self.node_id, error = %e, "error while closing pool");
        }
    }

    async fn bounded<T, F>(&self, what: &str, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{} on {} did not finish within {:?}",
                what, self.node_id, limit
            ))),
        }
    }

    async fn query(&self, pool: &C::Pool, what: &str, query: &str) -> Result<Vec<Row>> {
        self.bounded(what, self.config.operation_timeout, pool.query(query))
            .await
    }

    async fn query_one(&self, pool: &C::Pool, what: &str, query: &str) -> Result<Row> {
        self.query(pool, what, query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::query(format!("{} returned no rows", what)))
    }

    async fn execute(&self, pool: &C::Pool, what: &str, command: &str) -> Result<u64> {
        self.bounded(what, self.config.operation_timeout, pool.execute(command))
            .await
    }

    async fn reload(&self, pool: &C::Pool) -> Result<()> {
        self.query(pool, "configuration reload", sql::RELOAD_CONF)
            .await
            .map(|_| ())
    }

    /// Opens a pool and proves it can reach the engine
    async fn open_live(&self) -> Result<C::Pool> {
        let pool = self
            .connector
            .open(&self.config)
            .await
            .map_err(into_connect_error)?;
        if let Err(e) = pool.ping().await {
            if let Err(close_err) = pool.close().await {
                debug!(node = %self.node_id, error = %close_err, "error closing unusable pool");
            }
            return Err(into_connect_error(e));
        }
        Ok(pool)
    }

    async fn role_with(&self, pool: &C::Pool) -> Result<Role> {
        let rows = self.query(pool, "role query", sql::IS_IN_RECOVERY).await?;
        let in_recovery = match rows.first() {
            Some(row) => row.get::<Option<bool>>("in_recovery")?,
            None => None,
        };
        Ok(match in_recovery {
            Some(true) => Role::Secondary,
            Some(false) => Role::Primary,
            None => {
                warn!(
                    node = %self.node_id,
                    "recovery state not reported; candidate and arbiter roles cannot be derived from it"
                );
                Role::Unknown
            }
        })
    }

    async fn ensure_promote_supported(&self, pool: &C::Pool) -> Result<()> {
        let row = self
            .query_one(pool, "pg_promote lookup", sql::HAS_PG_PROMOTE)
            .await?;
        if row.get::<bool>("supported")? {
            Ok(())
        } else {
            Err(Error::not_supported(
                "pg_promote() is not available on this engine version",
            ))
        }
    }

    async fn conninfo_setting(&self, pool: &C::Pool) -> Result<ConnInfoSetting> {
        let rows = self
            .query(pool, "primary_conninfo lookup", sql::PRIMARY_CONNINFO_SETTING)
            .await?;
        let row = rows.first().ok_or_else(|| {
            Error::not_supported(
                "primary_conninfo is not a server setting on this engine version",
            )
        })?;
        Ok(ConnInfoSetting {
            value: row.get::<Option<String>>("setting")?.unwrap_or_default(),
            context: row.get::<Option<String>>("context")?.unwrap_or_default(),
        })
    }

    async fn receiver(&self, pool: &C::Pool) -> Result<Option<UpstreamPeer>> {
        let rows = self
            .query(pool, "wal receiver query", sql::WAL_RECEIVER)
            .await?;
        rows.first()
            .map(|row| -> Result<UpstreamPeer> {
                Ok(UpstreamPeer {
                    host: row.get("sender_host")?,
                    port: row
                        .get::<Option<i64>>("sender_port")?
                        .and_then(|p| u16::try_from(p).ok()),
                    status: row.get::<Option<String>>("status")?.unwrap_or_default(),
                })
            })
            .transpose()
    }

    async fn downstream(&self, pool: &C::Pool) -> Result<Vec<DownstreamPeer>> {
        let rows = self
            .query(pool, "downstream query", sql::DOWNSTREAM_PEERS)
            .await?;
        rows.iter()
            .map(|row| -> Result<DownstreamPeer> {
                Ok(DownstreamPeer {
                    application_name: row
                        .get::<Option<String>>("application_name")?
                        .unwrap_or_default(),
                    address: row.get("client_addr")?,
                    state: row.get::<Option<String>>("state")?.unwrap_or_default(),
                    sync_mode: row
                        .get::<Option<String>>("sync_state")?
                        .map_or(SyncMode::Unknown, |s| SyncMode::from_engine(&s)),
                    replay_lag: seconds(row.get("replay_lag_seconds")?),
                })
            })
            .collect()
    }

    async fn replay_lag(&self, pool: &C::Pool) -> Result<Option<Duration>> {
        let row = self.query_one(pool, "replay lag query", sql::REPLAY_LAG).await?;
        Ok(seconds(row.get("lag_seconds")?))
    }

    async fn position_with(&self, pool: &C::Pool) -> Result<Option<ReplicationPosition>> {
        let row = self
            .query_one(pool, "replication position query", sql::REPLICATION_POSITION)
            .await?;
        match row.get::<Option<String>>("lsn")? {
            Some(raw) => {
                let offset = sql::parse_lsn(&raw)?;
                Ok(Some(ReplicationPosition::new(ENGINE_FAMILY, raw, offset)))
            }
            None => Ok(None),
        }
    }

    async fn read_only_with(&self, pool: &C::Pool) -> Result<bool> {
        let row = self
            .query_one(pool, "read-only query", sql::SHOW_READ_ONLY)
            .await?;
        row.get("default_transaction_read_only")
    }

    /// Writes the read-only default, reloads and waits until new sessions see it
    async fn apply_read_only(&self, pool: &C::Pool, read_only: bool) -> Result<()> {
        self.execute(pool, "read-only update", &sql::set_read_only(read_only))
            .await?;
        self.reload(pool).await?;

        for _ in 0..READ_ONLY_SETTLE_ATTEMPTS {
            if self.read_only_with(pool).await? == read_only {
                return Ok(());
            }
            tokio::time::sleep(READ_ONLY_SETTLE_INTERVAL).await;
        }
        Err(Error::query(format!(
            "default_transaction_read_only did not become {} after reload",
            if read_only { "on" } else { "off" }
        )))
    }

    fn conninfo_for(&self, host: String, port: u16, user: String, password: String) -> PrimaryConnInfo {
        PrimaryConnInfo {
            host,
            port,
            user,
            password,
            application_name: self.application_name(),
        }
    }

    /// Replication tag reported upstream; the crate default is replaced by the node id
    fn application_name(&self) -> String {
        if self.config.application_name == DEFAULT_APPLICATION_NAME {
            self.node_id.replace(':', "_")
        } else {
            self.config.application_name.clone()
        }
    }

    /// Writes `primary_conninfo` and reloads, skipping the write when it already matches
    async fn write_conninfo(
        &self,
        pool: &C::Pool,
        setting: &ConnInfoSetting,
        target: &PrimaryConnInfo,
    ) -> Result<()> {
        let desired = target.render();
        if setting.value == desired {
            debug!(node = %self.node_id, conninfo = %target.masked(), "replication source already set");
            return Ok(());
        }
        self.execute(
            pool,
            "primary_conninfo update",
            &sql::set_primary_conninfo(&desired),
        )
        .await?;
        self.reload(pool).await?;
        info!(node = %self.node_id, conninfo = %target.masked(), "replication source updated");
        Ok(())
    }

    /// Points a secondary at a new source
    async fn rewire(
        &self,
        pool: &C::Pool,
        setting: &ConnInfoSetting,
        target: &PrimaryConnInfo,
    ) -> Result<Transition> {
        self.write_conninfo(pool, setting, target).await?;

        if !setting.is_reloadable() {
            return Ok(Transition::scheduled(format!(
                "primary_conninfo for {}:{} takes effect after a server restart",
                target.host, target.port
            )));
        }

        let upstream = self.receiver(pool).await?;
        if streams_from(upstream.as_ref(), &target.host, target.port) {
            Ok(Transition::Completed)
        } else {
            Ok(Transition::scheduled(format!(
                "wal receiver has not connected to {}:{} yet",
                target.host, target.port
            )))
        }
    }

    /// Shared precondition of both promotion flavours. `Ok(false)` means already primary.
    async fn prepare_promotion(&self, pool: &C::Pool) -> Result<bool> {
        match self.role_with(pool).await? {
            Role::Primary => {
                info!(node = %self.node_id, "node is already primary; promotion skipped");
                Ok(false)
            }
            Role::Secondary => {
                self.ensure_promote_supported(pool).await?;
                Ok(true)
            }
            other => Err(Error::query(format!(
                "cannot promote {}: role is {}",
                self.node_id, other
            ))),
        }
    }
}

#[async_trait]
impl<C: Connector> Backend for PostgresBackend<C> {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.pool.write().await;

        if let Some(existing) = slot.as_ref() {
            match self
                .bounded("liveness check", self.config.connect_timeout, existing.ping())
                .await
            {
                Ok(()) => {
                    debug!(node = %self.node_id, "connection already live");
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, "discarding dead connection");
                    // the slot is emptied before closing, so the state must not say Connected
                    self.set_state(ConnectionState::Disconnected);
                    if let Some(dead) = slot.take() {
                        self.release(dead).await;
                    }
                }
            }
        }

        let attempt = ConnectAttempt::start(&self.state);
        info!(node = %self.node_id, dsn = %self.config.masked_dsn(), "connecting");

        let limit = self.config.connect_timeout;
        let pool = match tokio::time::timeout(limit, self.open_live()).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                error!(node = %self.node_id, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                error!(node = %self.node_id, timeout = ?limit, "connect timed out");
                return Err(Error::connection(format!(
                    "no live connection to {} within {:?}",
                    self.node_id, limit
                )));
            }
        };

        *slot = Some(Arc::new(pool));
        attempt.finish();
        info!(node = %self.node_id, "connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let taken = {
            let mut slot = self.pool.write().await;
            self.set_state(ConnectionState::Disconnected);
            slot.take()
        };
        match taken {
            Some(pool) => {
                info!(node = %self.node_id, "closing connection");
                self.release(pool).await;
            }
            None => debug!(node = %self.node_id, "already closed"),
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn ping(&self) -> Result<()> {
        let pool = self.snapshot().await?;
        if let Err(e) = self
            .bounded("ping", self.config.operation_timeout, pool.ping())
            .await
        {
            warn!(node = %self.node_id, error = %e, "liveness check failed; connect is required");
            self.discard(&pool).await;
            return Err(match e {
                Error::Timeout(msg) => Error::connection(msg),
                other => other,
            });
        }
        Ok(())
    }

    async fn get_role(&self) -> Result<Role> {
        let pool = self.snapshot().await?;
        self.role_with(&pool).await
    }

    async fn health_check(&self) -> Result<HealthReport> {
        self.ping().await?;
        let pool = self.snapshot().await?;

        let mut report = HealthReport::new();
        report.detail("node", &self.node_id);
        report.detail("ping", "ok");

        let role = match self.role_with(&pool).await {
            Ok(Role::Unknown) => {
                report.detail("role", Role::Unknown);
                report.fail("role could not be determined");
                Role::Unknown
            }
            Ok(role) => {
                report.detail("role", role);
                role
            }
            Err(e) => {
                report.detail("role", "error");
                report.fail(format!("role query failed: {}", e));
                Role::Unknown
            }
        };

        match self.read_only_with(&pool).await {
            Ok(read_only) => report.detail("read_only", read_only),
            Err(e) => report.fail(format!("read-only query failed: {}", e)),
        }

        if role == Role::Secondary {
            match self.receiver(&pool).await {
                Ok(Some(peer)) => report.detail("wal_receiver", peer.status),
                Ok(None) => report.detail("wal_receiver", "none"),
                Err(e) => report.fail(format!("wal receiver query failed: {}", e)),
            }

            match self.replay_lag(&pool).await {
                Ok(Some(lag)) => {
                    report.detail("replay_lag_seconds", format!("{:.3}", lag.as_secs_f64()));
                    if let Some(limit) = self.config.max_replication_lag {
                        if lag > limit {
                            report.fail(format!(
                                "replication lag {:?} exceeds limit {:?}",
                                lag, limit
                            ));
                        }
                    }
                }
                Ok(None) => report.detail("replay_lag_seconds", "unknown"),
                Err(e) => report.fail(format!("replication lag query failed: {}", e)),
            }
        }

        match self
            .query_one(&pool, "connection usage query", sql::CONNECTION_USAGE)
            .await
            .and_then(|row| Ok((row.get::<i64>("used")?, row.get::<i64>("max")?)))
        {
            Ok((used, max)) => {
                report.detail("connections", format!("{}/{}", used, max));
                if max > 0 && used * 100 >= max * CONNECTION_USAGE_LIMIT_PERCENT {
                    report.fail(format!("connection usage {}/{} is near the limit", used, max));
                }
            }
            Err(e) => report.fail(format!("connection usage query failed: {}", e)),
        }

        if report.healthy {
            report.message = "node is healthy".to_string();
            debug!(node = %self.node_id, "health check passed");
        } else {
            warn!(node = %self.node_id, reason = %report.message, "health check failed");
        }
        Ok(report)
    }

    async fn promote_to_leader(&self) -> Result<()> {
        let pool = self.snapshot().await?;
        if !self.prepare_promotion(&pool).await? {
            return Ok(());
        }

        let wait = self.config.promote_timeout;
        info!(node = %self.node_id, timeout = ?wait, "promoting to primary");
        let row = self
            .bounded(
                "promotion",
                wait + self.config.operation_timeout,
                pool.query(&sql::promote(true, wait.as_secs())),
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::query("pg_promote returned no rows"))?;

        if !row.get::<bool>("promoted")? {
            return Err(Error::query(format!(
                "promotion of {} did not finish within {:?}",
                self.node_id, wait
            )));
        }

        match self.role_with(&pool).await? {
            Role::Primary => {
                info!(node = %self.node_id, "promotion finished");
                Ok(())
            }
            other => Err(Error::query(format!(
                "{} still reports {} after promotion",
                self.node_id, other
            ))),
        }
    }

    async fn start_failover_promotion(&self) -> Result<Transition> {
        let pool = self.snapshot().await?;
        if !self.prepare_promotion(&pool).await? {
            return Ok(Transition::Completed);
        }

        warn!(node = %self.node_id, "starting failover promotion without waiting for recovery to end");
        let row = self
            .query_one(
                &pool,
                "failover promotion",
                &sql::promote(false, self.config.promote_timeout.as_secs()),
            )
            .await?;
        if !row.get::<bool>("promoted")? {
            return Err(Error::query(format!(
                "engine refused to signal promotion of {}",
                self.node_id
            )));
        }

        match self.role_with(&pool).await? {
            Role::Primary => Ok(Transition::Completed),
            _ => Ok(Transition::scheduled("promotion signalled; recovery is ending")),
        }
    }

    async fn demote_to_follower(&self, new_leader_address: &str) -> Result<Transition> {
        let (host, port) = sql::split_address(new_leader_address, DEFAULT_PORT)?;
        let pool = self.snapshot().await?;
        let setting = self.conninfo_setting(&pool).await?;
        let target = self.conninfo_for(
            host,
            port,
            self.config.user.clone(),
            self.config.password.clone(),
        );

        match self.role_with(&pool).await? {
            Role::Primary => {
                info!(node = %self.node_id, leader = %new_leader_address, "demoting primary");
                self.apply_read_only(&pool, true).await?;
                self.write_conninfo(&pool, &setting, &target).await?;
                Ok(Transition::scheduled(format!(
                    "node is fenced read-only and must be restarted as a standby of {}:{}",
                    target.host, target.port
                )))
            }
            Role::Secondary => self.rewire(&pool, &setting, &target).await,
            other => Err(Error::query(format!(
                "cannot demote {}: role is {}",
                self.node_id, other
            ))),
        }
    }

    async fn get_replication_position(&self) -> Result<ReplicationPosition> {
        let pool = self.snapshot().await?;
        self.position_with(&pool)
            .await?
            .ok_or_else(|| Error::query("engine reported no WAL position"))
    }

    async fn get_replication_status(&self) -> Result<ReplicationStatus> {
        let pool = self.snapshot().await?;
        let role = self.role_with(&pool).await?;

        let (upstream, replay_lag) = if role == Role::Secondary {
            (self.receiver(&pool).await?, self.replay_lag(&pool).await?)
        } else {
            (None, None)
        };

        Ok(ReplicationStatus {
            role,
            upstream,
            downstream: self.downstream(&pool).await?,
            replay_lag,
            position: self.position_with(&pool).await?,
        })
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let pool = self.snapshot().await?;
        self.apply_read_only(&pool, read_only).await?;
        info!(node = %self.node_id, read_only, "read-only default updated");
        Ok(())
    }

    async fn is_read_only(&self) -> Result<bool> {
        let pool = self.snapshot().await?;
        self.read_only_with(&pool).await
    }

    async fn stop_replication(&self) -> Result<Transition> {
        let pool = self.snapshot().await?;
        match self.role_with(&pool).await? {
            Role::Primary => {
                debug!(node = %self.node_id, "primary does not replicate; nothing to stop");
                return Ok(Transition::Completed);
            }
            Role::Secondary => {}
            other => {
                return Err(Error::query(format!(
                    "cannot stop replication on {}: role is {}",
                    self.node_id, other
                )))
            }
        }

        let setting = self.conninfo_setting(&pool).await?;
        if !setting.value.is_empty() {
            self.execute(&pool, "primary_conninfo reset", sql::RESET_PRIMARY_CONNINFO)
                .await?;
            self.reload(&pool).await?;
            info!(node = %self.node_id, "replication source removed");
        }

        let streaming = self
            .receiver(&pool)
            .await?
            .map_or(false, |peer| peer.status == "streaming");
        if !streaming {
            Ok(Transition::Completed)
        } else if setting.is_reloadable() {
            Ok(Transition::scheduled("wal receiver is shutting down"))
        } else {
            Ok(Transition::scheduled(
                "wal receiver stops after a server restart",
            ))
        }
    }

    async fn start_replication_with(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Transition> {
        if host.trim().is_empty() {
            return Err(Error::config("replication source host is empty"));
        }
        if port == 0 {
            return Err(Error::config("replication source port is 0"));
        }
        if user.trim().is_empty() {
            return Err(Error::config("replication user is empty"));
        }

        let pool = self.snapshot().await?;
        let setting = self.conninfo_setting(&pool).await?;
        let target = self.conninfo_for(
            host.trim().to_string(),
            port,
            user.to_string(),
            password.to_string(),
        );

        match self.role_with(&pool).await? {
            Role::Secondary => self.rewire(&pool, &setting, &target).await,
            Role::Primary => {
                self.write_conninfo(&pool, &setting, &target).await?;
                Ok(Transition::scheduled(format!(
                    "node is a primary; restart it as a standby to replicate from {}:{}",
                    target.host, target.port
                )))
            }
            other => Err(Error::query(format!(
                "cannot start replication on {}: role is {}",
                self.node_id, other
            ))),
        }
    }

    async fn get_node_id(&self) -> Result<String> {
        Ok(self.node_id.clone())
    }
}

/// `primary_conninfo` as reported by `pg_settings`
struct ConnInfoSetting {
    value: String,
    context: String,
}

impl ConnInfoSetting {
    fn is_reloadable(&self) -> bool {
        self.context == "sighup"
    }
}

/// Marks the handle `Connecting` and falls back to `Disconnected` unless finished
struct ConnectAttempt<'a> {
    state: &'a Mutex<ConnectionState>,
    finished: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn start(state: &'a Mutex<ConnectionState>) -> Self {
        *state.lock() = ConnectionState::Connecting;
        Self {
            state,
            finished: false,
        }
    }

    fn finish(mut self) {
        *self.state.lock() = ConnectionState::Connected;
        self.finished = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }
}

fn into_connect_error(e: Error) -> Error {
    match e {
        Error::ConnectionFailed(_) | Error::ConfigurationInvalid(_) => e,
        other => Error::connection(other.to_string()),
    }
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
}

fn streams_from(upstream: Option<&UpstreamPeer>, host: &str, port: u16) -> bool {
    upstream.map_or(false, |peer| {
        peer.status == "streaming"
            && peer.host.as_deref() == Some(host)
            && peer.port.unwrap_or(DEFAULT_PORT) == port
    })
}
