//! SQL text and value helpers for the PostgreSQL-family adapter.
//!
//! Statements that return values cast them to types the row decoder understands
//! (`pg_lsn` and `interval` are returned as text or seconds).

use super::config::{quote_value, MASKED_PASSWORD};
use crate::error::{Error, Result};

/// Liveness probe
pub const PING: &str = "SELECT 1";

/// Role derivation primitive
pub const IS_IN_RECOVERY: &str = "SELECT pg_is_in_recovery() AS in_recovery";

/// Whether the engine build ships `pg_promote`
pub const HAS_PG_PROMOTE: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_proc WHERE proname = 'pg_promote') AS supported";

/// Current log position for either role
pub const REPLICATION_POSITION: &str = "SELECT CASE WHEN pg_is_in_recovery() \
     THEN COALESCE(pg_last_wal_replay_lsn(), pg_last_wal_receive_lsn()) \
     ELSE pg_current_wal_lsn() END::text AS lsn";

/// Time since the last replayed transaction, NULL on a primary.
///
/// A standby whose replay position equals its receive position reports zero.
pub const REPLAY_LAG: &str = "SELECT CASE WHEN NOT pg_is_in_recovery() THEN NULL \
     WHEN pg_last_wal_receive_lsn() = pg_last_wal_replay_lsn() THEN 0::float8 \
     ELSE EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8 \
     END AS lag_seconds";

/// WAL receiver of a standby
pub const WAL_RECEIVER: &str =
    "SELECT status, sender_host, sender_port FROM pg_stat_wal_receiver";

/// Standbys streaming from this node
pub const DOWNSTREAM_PEERS: &str = "SELECT application_name, host(client_addr) AS client_addr, \
     state, sync_state, EXTRACT(EPOCH FROM replay_lag)::float8 AS replay_lag_seconds \
     FROM pg_stat_replication ORDER BY application_name";

/// Whether `primary_conninfo` is a server setting and how it can be changed
pub const PRIMARY_CONNINFO_SETTING: &str =
    "SELECT setting, context FROM pg_settings WHERE name = 'primary_conninfo'";

/// Read-only default for new transactions
pub const SHOW_READ_ONLY: &str = "SHOW default_transaction_read_only";

/// Connection usage against the server limit
pub const CONNECTION_USAGE: &str = "SELECT (SELECT count(*) FROM pg_stat_activity)::int8 AS used, \
     current_setting('max_connections')::int8 AS max";

/// Applies `ALTER SYSTEM` changes
pub const RELOAD_CONF: &str = "SELECT pg_reload_conf()";

/// Removes the replication source
pub const RESET_PRIMARY_CONNINFO: &str = "ALTER SYSTEM RESET primary_conninfo";

/// Promotes, optionally waiting up to `wait_seconds`
pub fn promote(wait: bool, wait_seconds: u64) -> String {
    format!("SELECT pg_promote({}, {}) AS promoted", wait, wait_seconds.max(1))
}

/// Durable read-only toggle
pub fn set_read_only(read_only: bool) -> String {
    format!(
        "ALTER SYSTEM SET default_transaction_read_only = {}",
        if read_only { "on" } else { "off" }
    )
}

/// Sets the replication source
pub fn set_primary_conninfo(conninfo: &str) -> String {
    format!("ALTER SYSTEM SET primary_conninfo = {}", quote_literal(conninfo))
}

/// Quotes a string as a SQL literal, doubling embedded quotes
pub fn quote_literal(value: &str) -> String {
    if value.contains('\\') {
        format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Replication source descriptor
#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryConnInfo {
    /// Source host
    pub host: String,
    /// Source port
    pub port: u16,
    /// Replication role
    pub user: String,
    /// Replication password, masked in logs
    pub password: String,
    /// Name this standby reports to its source
    pub application_name: String,
}

impl PrimaryConnInfo {
    /// Descriptor as written to `primary_conninfo`
    pub fn render(&self) -> String {
        self.render_with(Some(&self.password))
    }

    /// Descriptor safe for logs
    pub fn masked(&self) -> String {
        self.render_with(None)
    }

    fn render_with(&self, password: Option<&str>) -> String {
        let mut parts = vec![
            format!("host={}", quote_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_value(&self.user)),
        ];
        if !self.password.is_empty() {
            let pw = password.map(quote_value).unwrap_or_else(|| MASKED_PASSWORD.to_string());
            parts.push(format!("password={}", pw));
        }
        if !self.application_name.is_empty() {
            parts.push(format!("application_name={}", quote_value(&self.application_name)));
        }
        parts.join(" ")
    }
}

impl std::fmt::Debug for PrimaryConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Extracts `host` and `port` from a `primary_conninfo` value
pub fn conninfo_target(conninfo: &str) -> (Option<String>, Option<u16>) {
    let mut host = None;
    let mut port = None;
    for (key, value) in parse_conninfo(conninfo) {
        match key.as_str() {
            "host" => host = Some(value),
            "port" => port = value.parse().ok(),
            _ => {}
        }
    }
    (host, port)
}

/// Splits a key/value descriptor, honouring single quotes and backslash escapes
fn parse_conninfo(conninfo: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = conninfo.chars().peekable();
    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            break;
        }
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '\'' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        pairs.push((key, value));
    }
    pairs
}

/// Parses an `X/Y` log sequence number into its 64-bit offset
pub fn parse_lsn(lsn: &str) -> Result<u64> {
    let (high, low) = lsn
        .trim()
        .split_once('/')
        .ok_or_else(|| Error::query(format!("malformed LSN '{}'", lsn)))?;
    let high = u32::from_str_radix(high, 16)
        .map_err(|_| Error::query(format!("malformed LSN '{}'", lsn)))?;
    let low = u32::from_str_radix(low, 16)
        .map_err(|_| Error::query(format!("malformed LSN '{}'", lsn)))?;
    Ok(((high as u64) << 32) | low as u64)
}

/// Splits a `host:port` address; a bracketed IPv6 host is accepted
pub fn split_address(address: &str, default_port: u16) -> Result<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::config("leader address is empty"));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::config(format!("malformed address '{}'", address)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p, address)?,
            None if tail.is_empty() => default_port,
            None => return Err(Error::config(format!("malformed address '{}'", address))),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), default_port)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port, address)?)),
        Some(_) => Err(Error::config(format!("malformed address '{}'", address))),
        None => Ok((address.to_string(), default_port)),
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::config(format!("invalid port in address '{}'", address))),
    }
}
