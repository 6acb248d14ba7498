//! Scripted in-memory engine used by the adapter tests.
//!
//! It understands exactly the statements in [`super::sql`] and counts opens, pings and
//! state-changing commands so tests can assert on side effects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::config::DatabaseConfig;
use super::pool::{Connector, PoolStats, SqlPool};
use super::sql;
use super::{Row, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Receiver {
    pub status: String,
    pub host: String,
    pub port: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Downstream {
    pub application_name: String,
    pub client_addr: String,
    pub state: String,
    pub sync_state: String,
    pub replay_lag_seconds: Option<f64>,
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub reachable: bool,
    pub generation: u64,
    pub in_recovery: Option<bool>,
    pub has_pg_promote: bool,
    pub promote_finishes: bool,
    pub conninfo_is_setting: bool,
    pub conninfo_context: String,
    pub primary_conninfo: String,
    pub receiver: Option<Receiver>,
    pub receiver_follows: bool,
    pub read_only: bool,
    pub lsn: Option<String>,
    pub replay_lag: Option<f64>,
    /// Replay position equals receive position
    pub caught_up: bool,
    pub downstream: Vec<Downstream>,
    pub connections_used: i64,
    pub max_connections: i64,
    pub fail_queries: bool,
    pub stall: Option<Duration>,
    pub close_delay: Option<Duration>,
    pub opens: usize,
    pub pings: usize,
    pub commands: usize,
    pending_read_only: Option<bool>,
    pending_conninfo: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            reachable: true,
            generation: 0,
            in_recovery: Some(false),
            has_pg_promote: true,
            promote_finishes: true,
            conninfo_is_setting: true,
            conninfo_context: "sighup".to_string(),
            primary_conninfo: String::new(),
            receiver: None,
            receiver_follows: true,
            read_only: false,
            lsn: Some("0/3000060".to_string()),
            replay_lag: None,
            caught_up: false,
            downstream: Vec::new(),
            connections_used: 5,
            max_connections: 100,
            fail_queries: false,
            stall: None,
            close_delay: None,
            opens: 0,
            pings: 0,
            commands: 0,
            pending_read_only: None,
            pending_conninfo: None,
        }
    }
}

/// Shared handle to the scripted engine
#[derive(Debug, Clone, Default)]
pub(crate) struct MockEngine(Arc<Mutex<EngineState>>);

impl MockEngine {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn standby(upstream_host: &str, upstream_port: u16) -> Self {
        let engine = Self::default();
        engine.with(|s| {
            s.in_recovery = Some(true);
            s.read_only = false;
            s.primary_conninfo = format!(
                "host={} port={} user=replicator",
                upstream_host, upstream_port
            );
            s.receiver = Some(Receiver {
                status: "streaming".to_string(),
                host: upstream_host.to_string(),
                port: upstream_port as i64,
            });
            s.lsn = Some("0/2FFFF00".to_string());
            s.replay_lag = Some(0.25);
        });
        engine
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn opens(&self) -> usize {
        self.with(|s| s.opens)
    }

    pub fn pings(&self) -> usize {
        self.with(|s| s.pings)
    }

    pub fn commands(&self) -> usize {
        self.with(|s| s.commands)
    }

    /// Breaks every pool opened so far, as a server restart would
    pub fn drop_connections(&self) {
        self.with(|s| s.generation += 1);
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            engine: self.clone(),
        }
    }

    async fn stall(&self) {
        if let Some(delay) = self.with(|s| s.stall) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    engine: MockEngine,
}

#[async_trait]
impl Connector for MockConnector {
    type Pool = MockPool;

    async fn open(&self, _config: &DatabaseConfig) -> Result<MockPool> {
        self.engine.stall().await;
        self.engine.with(|s| {
            if !s.reachable {
                return Err(Error::connection("connection refused"));
            }
            s.opens += 1;
            Ok(MockPool {
                engine: self.engine.clone(),
                generation: s.generation,
            })
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockPool {
    engine: MockEngine,
    generation: u64,
}

impl MockPool {
    fn check(&self, s: &EngineState) -> Result<()> {
        if !s.reachable || s.generation != self.generation {
            return Err(Error::connection("server closed the connection unexpectedly"));
        }
        if s.fail_queries {
            return Err(Error::query("scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlPool for MockPool {
    async fn ping(&self) -> Result<()> {
        self.engine.stall().await;
        self.engine.with(|s| {
            s.pings += 1;
            if !s.reachable || s.generation != self.generation {
                return Err(Error::connection("server closed the connection unexpectedly"));
            }
            Ok(())
        })
    }

    async fn query(&self, query: &str) -> Result<Vec<Row>> {
        self.engine.stall().await;
        self.engine.with(|s| {
            self.check(s)?;
            answer(s, query)
        })
    }

    async fn execute(&self, command: &str) -> Result<u64> {
        self.engine.stall().await;
        self.engine.with(|s| {
            self.check(s)?;
            apply(s, command)?;
            Ok(0)
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(delay) = self.engine.with(|s| s.close_delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connections: 1,
            idle_connections: 1,
            max_size: 10,
        }
    }
}

fn one(column: &str, value: Value) -> Vec<Row> {
    vec![Row::from_pairs([(column, value)])]
}

fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn float_or_null(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Float)
}

fn answer(s: &mut EngineState, query: &str) -> Result<Vec<Row>> {
    if query == sql::IS_IN_RECOVERY {
        return Ok(one("in_recovery", s.in_recovery.map_or(Value::Null, Value::Bool)));
    }
    if query == sql::HAS_PG_PROMOTE {
        return Ok(one("supported", Value::Bool(s.has_pg_promote)));
    }
    if query == sql::REPLICATION_POSITION {
        return Ok(one("lsn", text_or_null(s.lsn.as_deref())));
    }
    if query == sql::REPLAY_LAG {
        let lag = match s.in_recovery {
            Some(true) if s.caught_up => Some(0.0),
            Some(true) => s.replay_lag,
            _ => None,
        };
        return Ok(one("lag_seconds", float_or_null(lag)));
    }
    if query == sql::WAL_RECEIVER {
        return Ok(s
            .receiver
            .iter()
            .map(|r| {
                Row::from_pairs([
                    ("status", Value::Text(r.status.clone())),
                    ("sender_host", Value::Text(r.host.clone())),
                    ("sender_port", Value::Int(r.port)),
                ])
            })
            .collect());
    }
    if query == sql::DOWNSTREAM_PEERS {
        return Ok(s
            .downstream
            .iter()
            .map(|d| {
                Row::from_pairs([
                    ("application_name", Value::Text(d.application_name.clone())),
                    ("client_addr", Value::Text(d.client_addr.clone())),
                    ("state", Value::Text(d.state.clone())),
                    ("sync_state", Value::Text(d.sync_state.clone())),
                    ("replay_lag_seconds", float_or_null(d.replay_lag_seconds)),
                ])
            })
            .collect());
    }
    if query == sql::PRIMARY_CONNINFO_SETTING {
        if !s.conninfo_is_setting {
            return Ok(Vec::new());
        }
        return Ok(vec![Row::from_pairs([
            ("setting", Value::Text(s.primary_conninfo.clone())),
            ("context", Value::Text(s.conninfo_context.clone())),
        ])]);
    }
    if query == sql::SHOW_READ_ONLY {
        let value = if s.read_only { "on" } else { "off" };
        return Ok(one("default_transaction_read_only", Value::Text(value.into())));
    }
    if query == sql::CONNECTION_USAGE {
        return Ok(vec![Row::from_pairs([
            ("used", Value::Int(s.connections_used)),
            ("max", Value::Int(s.max_connections)),
        ])]);
    }
    if query == sql::RELOAD_CONF {
        s.commands += 1;
        reload(s);
        return Ok(one("pg_reload_conf", Value::Bool(true)));
    }
    if query.starts_with("SELECT pg_promote(") {
        if !s.has_pg_promote {
            return Err(Error::query("function pg_promote does not exist"));
        }
        s.commands += 1;
        if s.promote_finishes {
            s.in_recovery = Some(false);
            s.receiver = None;
        }
        // without waiting, pg_promote only reports that the signal was sent
        let waits = query.starts_with("SELECT pg_promote(true");
        return Ok(one("promoted", Value::Bool(!waits || s.promote_finishes)));
    }
    Err(Error::query(format!("unexpected statement: {}", query)))
}

fn apply(s: &mut EngineState, command: &str) -> Result<()> {
    if let Some(value) = command.strip_prefix("ALTER SYSTEM SET default_transaction_read_only = ") {
        s.commands += 1;
        s.pending_read_only = Some(value == "on");
        return Ok(());
    }
    if let Some(literal) = command.strip_prefix("ALTER SYSTEM SET primary_conninfo = ") {
        if !s.conninfo_is_setting {
            return Err(Error::query("unrecognized configuration parameter \"primary_conninfo\""));
        }
        s.commands += 1;
        s.pending_conninfo = Some(unquote(literal));
        return Ok(());
    }
    if command == sql::RESET_PRIMARY_CONNINFO {
        s.commands += 1;
        s.pending_conninfo = Some(String::new());
        return Ok(());
    }
    Err(Error::query(format!("unexpected command: {}", command)))
}

fn reload(s: &mut EngineState) {
    if let Some(read_only) = s.pending_read_only.take() {
        s.read_only = read_only;
    }
    if s.conninfo_context != "sighup" {
        return;
    }
    if let Some(conninfo) = s.pending_conninfo.take() {
        s.primary_conninfo = conninfo;
        if s.in_recovery == Some(true) && s.receiver_follows {
            s.receiver = match sql::conninfo_target(&s.primary_conninfo) {
                (Some(host), port) => Some(Receiver {
                    status: "streaming".to_string(),
                    host,
                    port: port.unwrap_or(5432) as i64,
                }),
                (None, _) => None,
            };
        }
    }
}

fn unquote(literal: &str) -> String {
    let (escaped, body) = match literal.strip_prefix('E') {
        Some(rest) => (true, rest),
        None => (false, literal),
    };
    let body = body
        .strip_prefix('\'')
        .and_then(|b| b.strip_suffix('\''))
        .unwrap_or(body)
        .replace("''", "'");
    if escaped {
        body.replace("\\\\", "\\")
    } else {
        body
    }
}
