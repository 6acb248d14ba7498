//! The capability set every supported database engine implements.
//!
//! An orchestrator holds one [`Backend`] per managed node. Read operations never mutate
//! engine state. Mutating operations fail with [`Error::ConnectionFailed`](crate::Error)
//! when no connection has been established and with [`Error::NotSupported`](crate::Error)
//! when the engine cannot perform the transition at all.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A node's position in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    /// Role could not be derived from the engine
    #[default]
    Unknown,
    /// Accepts writes
    Primary,
    /// Replays the log of a primary
    Secondary,
    /// Election candidate
    Candidate,
    /// Votes but holds no data
    Arbiter,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unknown => "Unknown",
            Role::Primary => "Primary",
            Role::Secondary => "Secondary",
            Role::Candidate => "Candidate",
            Role::Arbiter => "Arbiter",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a backend handle's connection resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No pool resource is held
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// A pool resource that passed a liveness check is held
    Connected,
}

/// Outcome of a state-changing operation.
///
/// `Completed` means the node is in the requested state when the call returns.
/// `Scheduled` means the change was written but only takes effect after an
/// out-of-band step such as a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// The node is in the requested state
    Completed,
    /// The change is pending
    Scheduled {
        /// What still has to happen
        reason: String,
    },
}

impl Transition {
    /// Creates a scheduled outcome
    pub fn scheduled(reason: impl Into<String>) -> Self {
        Transition::Scheduled { reason: reason.into() }
    }

    /// Whether the node already reached the requested state
    pub fn is_completed(&self) -> bool {
        matches!(self, Transition::Completed)
    }
}

/// Totally ordered progress token of a node's transaction log.
///
/// Positions only compare within one engine family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationPosition {
    family: String,
    raw: String,
    offset: u64,
}

impl ReplicationPosition {
    /// Creates a position from its engine-native text and numeric offset
    pub fn new(family: impl Into<String>, raw: impl Into<String>, offset: u64) -> Self {
        Self {
            family: family.into(),
            raw: raw.into(),
            offset,
        }
    }

    /// Engine family that produced this token
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Engine-native representation
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric offset used for ordering
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl PartialOrd for ReplicationPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.family != other.family {
            return None;
        }
        Some(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Synchronous replication mode of a downstream peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Commits do not wait for this peer
    Async,
    /// Would become synchronous if a current synchronous peer fails
    Potential,
    /// Commits wait for this peer
    Sync,
    /// Commits wait for a quorum this peer belongs to
    Quorum,
    /// Not reported by the engine
    Unknown,
}

impl SyncMode {
    /// Parses the engine's sync state text
    pub fn from_engine(state: &str) -> Self {
        match state {
            "async" => SyncMode::Async,
            "potential" => SyncMode::Potential,
            "sync" => SyncMode::Sync,
            "quorum" => SyncMode::Quorum,
            _ => SyncMode::Unknown,
        }
    }
}

/// The peer this node replicates from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamPeer {
    /// Host of the sending node, if reported
    pub host: Option<String>,
    /// Port of the sending node, if reported
    pub port: Option<u16>,
    /// Receiver state as reported by the engine (e.g. `streaming`)
    pub status: String,
}

/// A peer replicating from this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamPeer {
    /// Name the peer connected with
    pub application_name: String,
    /// Peer address
    pub address: Option<String>,
    /// Sender state (e.g. `streaming`, `catchup`)
    pub state: String,
    /// Synchronous replication mode
    pub sync_mode: SyncMode,
    /// How far the peer's replay trails this node
    pub replay_lag: Option<Duration>,
}

/// Structured replication facts of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Role at the time of the query
    pub role: Role,
    /// Source this node replicates from (secondaries)
    pub upstream: Option<UpstreamPeer>,
    /// Peers replicating from this node (primaries)
    pub downstream: Vec<DownstreamPeer>,
    /// Time since the last replayed transaction (secondaries)
    pub replay_lag: Option<Duration>,
    /// Current log position
    pub position: Option<ReplicationPosition>,
}

/// Point-in-time health assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether every check passed
    pub healthy: bool,
    /// Summary of the first failed check, or a success note
    pub message: String,
    /// When the checks ran
    pub timestamp: DateTime<Utc>,
    /// Individual check results
    pub details: BTreeMap<String, String>,
}

impl HealthReport {
    pub(crate) fn new() -> Self {
        Self {
            healthy: true,
            message: String::new(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub(crate) fn detail(&mut self, key: &str, value: impl ToString) {
        self.details.insert(key.to_string(), value.to_string());
    }

    /// Marks the report unhealthy, keeping the first failure as the message
    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        if self.healthy {
            self.message = reason.into();
        }
        self.healthy = false;
    }
}

/// Backend contract implemented by every supported engine
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Establishes the connection resource, or validates the existing one.
    ///
    /// A live resource is kept as is. A dead one is discarded and replaced.
    async fn connect(&self) -> Result<()>;

    /// Releases the connection resource. Always leaves the handle disconnected.
    async fn close(&self) -> Result<()>;

    /// Current lifecycle state of the handle
    fn connection_state(&self) -> ConnectionState;

    /// Cheap liveness probe
    async fn ping(&self) -> Result<()>;

    /// Derives the node's role from the engine
    async fn get_role(&self) -> Result<Role>;

    /// Runs all health checks and returns the full report
    async fn health_check(&self) -> Result<HealthReport>;

    /// `Ok(false)` for unhealthy-but-diagnosable nodes, `Err` when no diagnosis is possible
    async fn is_healthy(&self) -> Result<bool> {
        Ok(self.health_check().await?.healthy)
    }

    /// Promotes a secondary to primary and waits for it to finish.
    ///
    /// Already primary is a successful no-op.
    async fn promote_to_leader(&self) -> Result<()>;

    /// Starts a promotion without waiting for it to finish
    async fn start_failover_promotion(&self) -> Result<Transition>;

    /// Turns a primary into a secondary of `new_leader_address` (`host:port`)
    async fn demote_to_follower(&self, new_leader_address: &str) -> Result<Transition>;

    /// Current log position
    async fn get_replication_position(&self) -> Result<ReplicationPosition>;

    /// Structured replication facts
    async fn get_replication_status(&self) -> Result<ReplicationStatus>;

    /// Durably enables or disables read-only enforcement
    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    /// Whether read-only enforcement is enabled
    async fn is_read_only(&self) -> Result<bool>;

    /// Stops replicating. A node that does not replicate is a successful no-op.
    async fn stop_replication(&self) -> Result<Transition>;

    /// Replicates from the given source. Idempotent for an already matching source.
    async fn start_replication_with(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Transition>;

    /// Identifier that stays stable across reconnects
    async fn get_node_id(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Primary.to_string(), "Primary");
        assert_eq!(Role::default(), Role::Unknown);
    }

    #[test]
    fn test_position_ordering() {
        let a = ReplicationPosition::new("postgres", "0/3000060", 0x3000060);
        let b = ReplicationPosition::new("postgres", "1/0", 1 << 32);
        let other = ReplicationPosition::new("mysql", "1/0", 1 << 32);

        assert!(a < b);
        assert_eq!(b.partial_cmp(&other), None);
        assert_eq!(a.to_string(), "0/3000060");
    }

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!(SyncMode::from_engine("sync"), SyncMode::Sync);
        assert_eq!(SyncMode::from_engine("quorum"), SyncMode::Quorum);
        assert_eq!(SyncMode::from_engine(""), SyncMode::Unknown);
    }

    #[test]
    fn test_health_report_keeps_first_failure() {
        let mut report = HealthReport::new();
        report.fail("role undetermined");
        report.fail("lag too high");
        assert!(!report.healthy);
        assert_eq!(report.message, "role undetermined");
    }

    #[test]
    fn test_transition() {
        assert!(Transition::Completed.is_completed());
        let scheduled = Transition::scheduled("restart required");
        assert!(!scheduled.is_completed());
        assert_eq!(scheduled, Transition::Scheduled { reason: "restart required".into() });
    }
}
