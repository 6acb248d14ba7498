//! rdbha is the database backend layer of a high-availability agent.
//!
//! It defines the [`Backend`] contract an orchestrator drives during failover
//! (connection lifecycle, role and health introspection, replication positions,
//! promotion, demotion, read-only fencing and replication rewiring) and ships a
//! PostgreSQL-family implementation built on a bb8 pool of tokio-postgres clients.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
/// Backend contract, configuration and the PostgreSQL adapter
pub mod database;

// Re-export common types
pub use database::{
    create_backend, Backend, ConnectionState, DatabaseConfig, HealthReport, PostgresBackend,
    ReplicationPosition, ReplicationStatus, Role, SslMode, Transition,
};
pub use error::{Error, ErrorKind, Result};

/// Version of the rdbha library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_factory_from_serialized_config() {
        let config: DatabaseConfig = serde_json::from_str(
            r#"{"host": "db1", "user": "m", "dbname": "x", "ssl_mode": "verify-full"}"#,
        )
        .unwrap();
        assert_eq!(config.ssl_mode, SslMode::VerifyFull);

        let backend = create_backend(config).unwrap();
        assert_eq!(backend.connection_state(), ConnectionState::Disconnected);
    }
}
