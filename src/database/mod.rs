//! Database backend layer: the engine-agnostic contract and the PostgreSQL-family adapter.

pub mod backend;
pub mod config;
pub mod pool;
pub mod postgres;
pub mod sql;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{Error, Result};

pub use backend::{
    Backend, ConnectionState, DownstreamPeer, HealthReport, ReplicationPosition,
    ReplicationStatus, Role, SyncMode, Transition, UpstreamPeer,
};
pub use config::{DatabaseConfig, SslMode};
pub use pool::{Connector, PgConnector, PgPool, PoolStats, SqlPool};
pub use postgres::PostgresBackend;

/// Row represents a database row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from parallel column and value lists
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Builds a row from `(column, value)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(column, value)| (column.into(), value))
            .unzip();
        Self { columns, values }
    }

    /// Gets a column value by name
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
        T::from_value(&self.values[idx]).ok_or_else(|| Error::TypeMismatch {
            column: column.to_string(),
            expected: T::TYPE_NAME,
        })
    }

    /// Gets the first column's value
    pub fn first<T: FromValue>(&self) -> Result<T> {
        let column = self
            .columns
            .first()
            .ok_or_else(|| Error::ColumnNotFound("<first>".to_string()))?
            .clone();
        self.get(&column)
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Value represents a database value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer column, widened
    Int(i64),
    /// Any floating point column, widened
    Float(f64),
    /// Text and every type without a dedicated variant
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

/// Trait for converting SQL values to Rust types
pub trait FromValue: Sized {
    /// Name used in type mismatch errors
    const TYPE_NAME: &'static str;

    /// Returns `None` when the value has an incompatible type
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Text(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" | "t" | "yes" | "1" => Some(true),
                "off" | "false" | "f" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const TYPE_NAME: &'static str = "i64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    const TYPE_NAME: &'static str = "String";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Validates the configuration and creates an unconnected backend for it
pub fn create_backend(mut config: DatabaseConfig) -> Result<Box<dyn Backend>> {
    config.validate()?;
    Ok(Box::new(PostgresBackend::new(config)?))
}
