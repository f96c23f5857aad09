//! The Node and Conductor rows.
//!
//! A node is one managed physical machine plus its lifecycle metadata.
//! A conductor row is the durable presence record for one worker
//! process; liveness is decided from its heartbeat age.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::states::ProvisionState;

/// Generate a new UUIDv7 for a node
pub fn new_node_id() -> Uuid {
    Uuid::now_v7()
}

/// A managed physical machine.
///
/// The row is the only shared mutable resource between conductors; all
/// writes go through the store's versioned compare-and-swap, with
/// `version` as the optimistic-concurrency counter. The `reservation`
/// field is the mutual-exclusion primitive guarding `provision_state`
/// and the engine's continuation data in `driver_internal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Primary key - UUIDv7
    pub id: Uuid,

    /// Optional human-assigned name
    pub name: Option<String>,

    /// Which registered driver operates this node
    pub driver: String,

    /// Current lifecycle state
    pub provision_state: ProvisionState,

    /// Goal state of the in-flight transition, if any
    pub target_provision_state: Option<ProvisionState>,

    /// Identity of the conductor holding the exclusive lock, if any
    pub reservation: Option<String>,

    /// Partition key restricting which conductors may own this node
    pub conductor_group: Option<String>,

    /// Operator-set maintenance flag; blocks provisioning verbs
    #[serde(default)]
    pub maintenance: bool,

    /// Human-readable description of the last failure
    pub last_error: Option<String>,

    /// Opaque driver/engine scratch space. The step engine keeps its
    /// continuation record here so any conductor can resume execution.
    #[serde(default)]
    pub driver_internal: HashMap<String, Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Last state-machine activity; drives the wait-timeout sweep
    pub provision_updated_at: DateTime<Utc>,

    /// Optimistic-concurrency counter, bumped by every successful write
    pub version: u64,
}

impl Node {
    /// Create a new node in the enroll state for the given driver.
    pub fn new(driver: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_node_id(),
            name: None,
            driver: driver.into(),
            provision_state: ProvisionState::Enroll,
            target_provision_state: None,
            reservation: None,
            conductor_group: None,
            maintenance: false,
            last_error: None,
            driver_internal: HashMap::new(),
            created_at: now,
            updated_at: now,
            provision_updated_at: now,
            version: 1,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.conductor_group = Some(group.into());
        self
    }

    pub fn with_state(mut self, state: ProvisionState) -> Self {
        self.provision_state = state;
        self
    }

    /// Whether the given conductor currently holds this node's lock
    pub fn is_reserved_by(&self, conductor: &str) -> bool {
        self.reservation.as_deref() == Some(conductor)
    }
}

/// Durable presence record for one conductor process.
///
/// Created or refreshed on process start and on every heartbeat tick.
/// A conductor is considered dead once its heartbeat age exceeds the
/// configured liveness window, at which point its nodes become
/// eligible for re-ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConductorRecord {
    /// Hostname, used as the conductor's identity everywhere
    pub hostname: String,

    /// Driver names this conductor can operate
    pub drivers: Vec<String>,

    /// Partition this conductor serves, if any
    pub group: Option<String>,

    /// Cleared on graceful shutdown so the fleet rebalances immediately
    pub online: bool,

    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl ConductorRecord {
    pub fn new(hostname: impl Into<String>, drivers: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            hostname: hostname.into(),
            drivers,
            group: None,
            online: true,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn supports_driver(&self, driver: &str) -> bool {
        self.drivers.iter().any(|d| d == driver)
    }

    /// Age of the last heartbeat relative to `now`
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }
}
