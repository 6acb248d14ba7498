use std::fmt;

use async_trait::async_trait;
use bb8_postgres::bb8::{ErrorSink, Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use serde::{Deserialize, Serialize};
use tokio_postgres::SimpleQueryMessage;
use tracing::warn;

use super::config::DatabaseConfig;
use super::sql;
use super::tls::MakeRustlsConnect;
use super::{Row, Value};
use crate::error::{Error, Result};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total connections in pool
    pub connections: u32,
    /// Idle connections
    pub idle_connections: u32,
    /// Configured upper bound
    pub max_size: u32,
}

/// A pooled connection resource to one node.
///
/// Implementations must be safe for concurrent use; the adapter never serializes queries.
#[async_trait]
pub trait SqlPool: Send + Sync + fmt::Debug + 'static {
    /// Runs the liveness probe on a pooled connection
    async fn ping(&self) -> Result<()>;

    /// Executes a statement that returns rows
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Executes a statement that returns no rows
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Releases pooled connections
    async fn close(&self) -> Result<()>;

    /// Current pool statistics
    fn stats(&self) -> PoolStats;
}

/// Opens pool resources for a configuration
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Pool type produced by this connector
    type Pool: SqlPool;

    /// Creates a new pool. Liveness is checked by the caller.
    async fn open(&self, config: &DatabaseConfig) -> Result<Self::Pool>;
}

type Manager = PostgresConnectionManager<MakeRustlsConnect>;

/// bb8 pool of tokio-postgres clients
pub struct PgPool {
    pool: Pool<Manager>,
    max_size: u32,
}

impl fmt::Debug for PgPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPool").field("stats", &self.stats()).finish()
    }
}

impl PgPool {
    /// Runs the liveness statement on a fresh client outside the pool.
    ///
    /// bb8's `get` reports only `TimedOut` while the pool cannot be filled; a
    /// dedicated client returns the driver's own error.
    async fn ping_dedicated(&self) -> Result<()> {
        let client = self
            .pool
            .dedicated_connection()
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        client
            .execute(sql::PING, &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::connection(e.to_string()))
    }

    async fn get(&self) -> Result<PooledConnection<'_, Manager>> {
        self.pool.get().await.map_err(|e| match e {
            RunError::User(e) => Error::connection(e.to_string()),
            RunError::TimedOut => Error::connection("timed out waiting for a pooled connection"),
        })
    }
}

#[async_trait]
impl SqlPool for PgPool {
    async fn ping(&self) -> Result<()> {
        if self.pool.state().connections == 0 {
            return self.ping_dedicated().await;
        }
        let client = self.get().await?;
        client
            .execute(sql::PING, &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::connection(e.to_string()))
    }

    async fn query(&self, query: &str) -> Result<Vec<Row>> {
        let client = self.get().await?;
        let rows = client
            .query(query, &[])
            .await
            .map_err(|e| Error::query(e.to_string()))?;
        rows.iter().map(convert_row).collect()
    }

    // Commands are parameterless utility statements (ALTER SYSTEM); no need to prepare them.
    async fn execute(&self, command: &str) -> Result<u64> {
        let client = self.get().await?;
        let messages = client
            .simple_query(command)
            .await
            .map_err(|e| Error::query(e.to_string()))?;
        Ok(messages
            .iter()
            .map(|message| match message {
                SimpleQueryMessage::CommandComplete(rows) => *rows,
                _ => 0,
            })
            .sum())
    }

    // bb8 closes its connections once the last pool handle is dropped.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: self.max_size,
        }
    }
}

/// Opens [`PgPool`]s over TCP, with TLS as configured
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    type Pool = PgPool;

    async fn open(&self, config: &DatabaseConfig) -> Result<PgPool> {
        let tls = MakeRustlsConnect::from_config(config)?;
        let manager = PostgresConnectionManager::new(config.pg_config(), tls);
        let pool = Pool::builder()
            .max_size(config.max_open_conns)
            .min_idle(None)
            .max_lifetime(Some(config.conn_max_lifetime))
            .idle_timeout(Some(config.conn_max_idle_time))
            .connection_timeout(config.connect_timeout)
            .retry_connection(false)
            .error_sink(Box::new(LogErrorSink {
                node: config.address(),
            }))
            .build(manager)
            .await
            .map_err(|e| Error::connection(e.to_string()))?;

        Ok(PgPool {
            pool,
            max_size: config.max_open_conns,
        })
    }
}

/// Logs connection failures of bb8's background replenishment
#[derive(Debug, Clone)]
struct LogErrorSink {
    node: String,
}

impl ErrorSink<tokio_postgres::Error> for LogErrorSink {
    fn sink(&self, error: tokio_postgres::Error) {
        warn!(node = %self.node, error = %error, "pooled connection failed");
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<tokio_postgres::Error>> {
        Box::new(self.clone())
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (i, column) in row.columns().iter().enumerate() {
        let decoded = match column.type_().name() {
            "bool" => row.try_get::<_, Option<bool>>(i).map(|v| v.map(Value::Bool)),
            "int2" => row.try_get::<_, Option<i16>>(i).map(|v| v.map(|n| Value::Int(n as i64))),
            "int4" => row.try_get::<_, Option<i32>>(i).map(|v| v.map(|n| Value::Int(n as i64))),
            "int8" => row.try_get::<_, Option<i64>>(i).map(|v| v.map(Value::Int)),
            "oid" => row.try_get::<_, Option<u32>>(i).map(|v| v.map(|n| Value::Int(n as i64))),
            "float4" => row.try_get::<_, Option<f32>>(i).map(|v| v.map(|n| Value::Float(n as f64))),
            "float8" => row.try_get::<_, Option<f64>>(i).map(|v| v.map(Value::Float)),
            "bytea" => row.try_get::<_, Option<Vec<u8>>>(i).map(|v| v.map(Value::Bytes)),
            _ => row.try_get::<_, Option<String>>(i).map(|v| v.map(Value::Text)),
        }
        .map_err(|e| Error::query(format!("failed to decode column {}: {}", column.name(), e)))?;

        columns.push(column.name().to_string());
        values.push(decoded.unwrap_or(Value::Null));
    }

    Ok(Row::new(columns, values))
}
